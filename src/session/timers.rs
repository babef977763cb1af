//! Supervisory timers: the per-session inactivity timer and the heartbeat
//! watchdog. Both are abortable spawned tasks whose handles live in the
//! session's `RuntimeState`, so re-arming one always replaces the previous
//! task.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, info, warn};

use super::{RuntimeState, SessionManager};

impl SessionManager {
    /// (Re)arm the inactivity timer. Called on every non-heartbeat sandbox
    /// event and on every prompt dispatch. Caller holds the session lock.
    pub(crate) fn reset_inactivity_locked(
        self: &Arc<Self>,
        st: &mut RuntimeState,
        session_id: &str,
    ) {
        if let Some(h) = st.inactivity.take() {
            h.abort();
        }
        let mgr = Arc::clone(self);
        let sid = session_id.to_string();
        let period = self.supervision.inactivity;
        st.inactivity = Some(tokio::spawn(async move {
            tokio::time::sleep(period).await;
            mgr.on_inactivity_expired(&sid).await;
        }));
    }

    /// Inactivity expiry: archived sessions are left alone; sessions with
    /// attached clients get an extension; otherwise the container is stopped
    /// (not removed) and the sandbox marked `stopped`.
    async fn on_inactivity_expired(self: Arc<Self>, session_id: &str) {
        let session = match self.storage().get_session(session_id).await {
            Ok(Some(s)) => s,
            Ok(None) => return,
            Err(e) => {
                error!(session = %session_id, err = %e, "inactivity check failed");
                return;
            }
        };
        if session.status == "archived" {
            return;
        }

        if self.registry().client_count(session_id).await > 0 {
            debug!(session = %session_id, "inactivity expiry with clients attached — extending");
            let rt = self.runtime(session_id).await;
            let mut st = rt.state.lock().await;
            self.reset_inactivity_locked(&mut st, session_id);
            return;
        }

        info!(session = %session_id, "session inactive — stopping sandbox");
        if let Some(cid) = &session.container_id {
            let timeout = self.supervision.driver_timeout;
            match tokio::time::timeout(
                timeout,
                self.driver().stop(cid, crate::sandbox::STOP_GRACE),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(session = %session_id, err = %e, "inactivity stop failed"),
                Err(_) => warn!(session = %session_id, "inactivity stop timed out"),
            }
        }
        if let Err(e) = self
            .storage()
            .update_sandbox_status(session_id, "stopped")
            .await
        {
            warn!(session = %session_id, err = %e, "failed to mark sandbox stopped");
        }
    }

    /// Arm (or re-arm) the heartbeat watchdog after a bridge registers.
    /// Ticks every `heartbeat_interval`; once `last_heartbeat` is older than
    /// `heartbeat_timeout` the sandbox is marked failed, clients are told,
    /// and the watchdog stops itself. The bridge socket, if still open, is
    /// left to its own close handler.
    pub(crate) fn start_watchdog_locked(
        self: &Arc<Self>,
        st: &mut RuntimeState,
        session_id: &str,
    ) {
        if let Some(h) = st.watchdog.take() {
            h.abort();
        }
        let mgr = Arc::clone(self);
        let sid = session_id.to_string();
        let interval = self.supervision.heartbeat_interval;
        let timeout = self.supervision.heartbeat_timeout;
        st.watchdog = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let session = match mgr.storage().get_session(&sid).await {
                    Ok(Some(s)) => s,
                    _ => break,
                };
                let stale = session
                    .last_heartbeat
                    .as_deref()
                    .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| {
                        chrono::Utc::now()
                            .signed_duration_since(t)
                            .to_std()
                            .unwrap_or_default()
                            > timeout
                    })
                    .unwrap_or(false);
                if stale {
                    warn!(session = %sid, "sandbox heartbeat lost");
                    if let Err(e) = mgr.storage().update_sandbox_status(&sid, "failed").await {
                        error!(session = %sid, err = %e, "failed to mark sandbox failed");
                    }
                    mgr.broadcast(
                        &sid,
                        json!({
                            "type": "sandbox_error",
                            "error": "Sandbox heartbeat lost. Container may have crashed.",
                        }),
                    )
                    .await;
                    break;
                }
            }
        }));
    }
}
