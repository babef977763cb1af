//! Per-session orchestration.
//!
//! The `SessionManager` coordinates, for each session: the FIFO prompt
//! queue, the lifecycle of its one sandbox container, fan-out to client
//! sockets, event persistence with tail replay, and the supervisory timers.
//!
//! Concurrency model: every session owns a `SessionRuntime` whose state
//! mutex serialises the queue pump, bridge-event ingestion, timer callbacks,
//! and archive/delete against each other. The `processing_message_id` slot
//! inside that state is both the "one message in flight" marker and the
//! pump's re-entrancy guard. Different sessions never contend.

pub mod events;
mod timers;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_MODEL;
use crate::ids::new_id;
use crate::registry::{ConnId, OutFrame, Outbound, SharedRegistry};
use crate::sandbox::{CreateSandbox, SandboxDriver, STOP_GRACE};
use crate::storage::{
    EventCursor, NewEvent, NewMessage, NewSession, SessionRow, Storage, MAX_EVENT_PAGE,
};
use crate::worktree::WorktreeManager;

use events::{event_json, persistence_for, Persistence, SandboxEvent};

// ─── Supervision parameters ──────────────────────────────────────────────────

/// Timer and backoff settings. Production values come from `Default`; tests
/// shrink them to milliseconds.
#[derive(Debug, Clone)]
pub struct SupervisionConfig {
    /// Idle period before an unwatched session's container is stopped.
    pub inactivity: Duration,
    /// Watchdog tick.
    pub heartbeat_interval: Duration,
    /// Staleness threshold — three missed 30-second heartbeats.
    pub heartbeat_timeout: Duration,
    /// Spawn circuit breaker: consecutive failures before backoff applies.
    pub spawn_failure_threshold: i64,
    pub spawn_backoff_base: Duration,
    pub spawn_backoff_max: Duration,
    /// Timeout on individual driver calls (container create/stop/remove).
    pub driver_timeout: Duration,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            inactivity: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            spawn_failure_threshold: 3,
            spawn_backoff_base: Duration::from_secs(5),
            spawn_backoff_max: Duration::from_secs(60),
            driver_timeout: Duration::from_secs(60),
        }
    }
}

// ─── Per-session runtime state ───────────────────────────────────────────────

pub(crate) struct RuntimeState {
    /// The one message currently dispatched to the sandbox. Doubles as the
    /// pump's re-entrancy guard.
    pub(crate) processing_message_id: Option<String>,
    pub(crate) inactivity: Option<JoinHandle<()>>,
    pub(crate) watchdog: Option<JoinHandle<()>>,
}

pub(crate) struct SessionRuntime {
    pub(crate) state: Mutex<RuntimeState>,
}

impl SessionRuntime {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RuntimeState {
                processing_message_id: None,
                inactivity: None,
                watchdog: None,
            }),
        })
    }
}

// ─── Requests ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    pub content: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub attachments: Option<Value>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub repo_path: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
}

// ─── Manager ─────────────────────────────────────────────────────────────────

pub struct SessionManager {
    storage: Arc<Storage>,
    registry: SharedRegistry,
    driver: Arc<dyn SandboxDriver>,
    worktrees: Arc<WorktreeManager>,
    /// Port the bridge dials back to.
    server_port: u16,
    /// LLM API keys from the daemon environment, merged under stored secrets.
    forwarded_env: Vec<(String, String)>,
    pub(crate) supervision: SupervisionConfig,
    runtimes: RwLock<HashMap<String, Arc<SessionRuntime>>>,
}

impl SessionManager {
    pub fn new(
        storage: Arc<Storage>,
        registry: SharedRegistry,
        driver: Arc<dyn SandboxDriver>,
        worktrees: Arc<WorktreeManager>,
        server_port: u16,
        forwarded_env: Vec<(String, String)>,
        supervision: SupervisionConfig,
    ) -> Self {
        Self {
            storage,
            registry,
            driver,
            worktrees,
            server_port,
            forwarded_env,
            supervision,
            runtimes: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn runtime(&self, session_id: &str) -> Arc<SessionRuntime> {
        if let Some(rt) = self.runtimes.read().await.get(session_id) {
            return rt.clone();
        }
        self.runtimes
            .write()
            .await
            .entry(session_id.to_string())
            .or_insert_with(SessionRuntime::new)
            .clone()
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    pub(crate) fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub(crate) fn driver(&self) -> &Arc<dyn SandboxDriver> {
        &self.driver
    }

    pub(crate) async fn broadcast(&self, session_id: &str, frame: Value) {
        self.registry.broadcast(session_id, &frame.to_string()).await;
    }

    // ─── Session CRUD ────────────────────────────────────────────────────────

    pub async fn create(&self, req: CreateSessionRequest) -> Result<SessionRow> {
        let row = self
            .storage
            .create_session(NewSession {
                title: req.title.unwrap_or_default(),
                repo_path: req.repo_path,
                display_name: req.display_name.unwrap_or_else(|| "Agent".to_string()),
                base_branch: req.base_branch.unwrap_or_else(|| "main".to_string()),
                model: req.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                reasoning_effort: req.reasoning_effort,
            })
            .await?;
        info!(session = %row.id, repo = %row.repo_path, "session created");
        Ok(row)
    }

    /// Archive: tear the container down (keep the worktree), mark the record.
    pub async fn archive(&self, session_id: &str) -> Result<()> {
        let rt = self.runtime(session_id).await;
        let mut st = rt.state.lock().await;

        let session = self
            .storage
            .get_session(session_id)
            .await?
            .context("SESSION_NOT_FOUND")?;

        if let Some(h) = st.inactivity.take() {
            h.abort();
        }
        if let Some(h) = st.watchdog.take() {
            h.abort();
        }

        if let Some(cid) = &session.container_id {
            self.stop_and_remove_container(session_id, cid).await;
        }
        self.storage
            .update_session_sandbox(session_id, None, None)
            .await?;
        self.storage
            .update_sandbox_status(session_id, "stopped")
            .await?;
        self.storage
            .update_session_status(session_id, "archived")
            .await?;
        self.broadcast(
            session_id,
            json!({"type": "session_status", "status": "archived"}),
        )
        .await;
        info!(session = %session_id, "session archived");
        Ok(())
    }

    /// Unarchive: mark active; the sandbox respawns lazily on the next prompt.
    pub async fn unarchive(&self, session_id: &str) -> Result<()> {
        self.storage
            .get_session(session_id)
            .await?
            .context("SESSION_NOT_FOUND")?;
        self.storage
            .update_session_status(session_id, "active")
            .await?;
        self.broadcast(
            session_id,
            json!({"type": "session_status", "status": "active"}),
        )
        .await;
        Ok(())
    }

    /// Delete the session and everything it owns: container, worktree,
    /// persisted record, live sockets, timers.
    pub async fn delete(&self, session_id: &str) -> Result<()> {
        let session = self
            .storage
            .get_session(session_id)
            .await?
            .context("SESSION_NOT_FOUND")?;

        if let Some(cid) = &session.container_id {
            self.stop_and_remove_container(session_id, cid).await;
        }
        if let Err(e) = self
            .worktrees
            .remove(session_id, Path::new(&session.repo_path))
            .await
        {
            warn!(session = %session_id, err = %e, "worktree removal failed during delete");
        }
        self.storage.delete_session(session_id).await?;
        self.cleanup_session(session_id).await;
        info!(session = %session_id, "session deleted");
        Ok(())
    }

    /// Post-deletion teardown of all transient state: timers, the processing
    /// slot, every live socket, and the registry entry.
    pub async fn cleanup_session(&self, session_id: &str) {
        if let Some(rt) = self.runtimes.write().await.remove(session_id) {
            let mut st = rt.state.lock().await;
            st.processing_message_id = None;
            if let Some(h) = st.inactivity.take() {
                h.abort();
            }
            if let Some(h) = st.watchdog.take() {
                h.abort();
            }
        }
        let farewell = json!({"type": "session_status", "status": "deleted"}).to_string();
        for tx in self.registry.drain_session(session_id).await {
            let _ = tx.send(OutFrame::Text(farewell.clone()));
            let _ = tx.send(OutFrame::Close {
                reason: "session deleted".to_string(),
            });
        }
    }

    async fn stop_and_remove_container(&self, session_id: &str, container_id: &str) {
        let timeout = self.supervision.driver_timeout;
        match tokio::time::timeout(timeout, self.driver.stop(container_id, STOP_GRACE)).await {
            Ok(Ok(())) => {
                debug!(session = %session_id, container = %container_id, "container stopped")
            }
            Ok(Err(e)) => warn!(session = %session_id, err = %e, "container stop failed"),
            Err(_) => warn!(session = %session_id, "container stop timed out"),
        }
        match tokio::time::timeout(timeout, self.driver.remove(container_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session = %session_id, err = %e, "container remove failed"),
            Err(_) => warn!(session = %session_id, "container remove timed out"),
        }
    }

    // ─── Client operations ───────────────────────────────────────────────────

    /// Register a client socket and send its `subscribed` envelope: session
    /// summary + the replay tail + a cursor for paging further into the past.
    ///
    /// Returns `None` for an unknown session; an error frame has already been
    /// queued and the caller should close the socket.
    pub async fn subscribe(&self, session_id: &str, tx: Outbound) -> Result<Option<ConnId>> {
        let Some(session) = self.storage.get_session(session_id).await? else {
            let _ = tx.send(OutFrame::Text(
                json!({"type": "error", "code": "not_found", "error": "session not found"})
                    .to_string(),
            ));
            return Ok(None);
        };

        let conn = self.registry.register_client(session_id, tx.clone()).await;

        let replay = self
            .storage
            .get_events_for_replay(session_id, MAX_EVENT_PAGE)
            .await?;
        let has_more = replay.len() as i64 == MAX_EVENT_PAGE;
        let cursor = replay
            .first()
            .map(|e| json!({"timestamp": e.created_at, "id": e.id}));
        let message_count = self.storage.count_messages(session_id).await?;
        let is_processing = self
            .storage
            .get_processing_message(session_id)
            .await?
            .is_some();

        let envelope = json!({
            "type": "subscribed",
            "session": session_summary(&session, message_count, is_processing),
            "replay": {
                "events": replay.iter().map(event_json).collect::<Vec<_>>(),
                "hasMore": has_more,
                "cursor": cursor,
            },
            "lastSpawnError": session.last_spawn_error,
        });
        let _ = tx.send(OutFrame::Text(envelope.to_string()));
        Ok(Some(conn))
    }

    /// One page of history strictly older than `cursor`, ascending.
    pub async fn fetch_history(
        &self,
        session_id: &str,
        cursor: EventCursor,
        limit: i64,
    ) -> Result<Value> {
        let page = self
            .storage
            .get_events_history_page(session_id, &cursor, limit)
            .await?;
        let next_cursor = page
            .items
            .first()
            .map(|e| json!({"timestamp": e.created_at, "id": e.id}));
        Ok(json!({
            "type": "history_page",
            "items": page.items.iter().map(event_json).collect::<Vec<_>>(),
            "hasMore": page.has_more,
            "cursor": next_cursor,
        }))
    }

    /// Queue a prompt. Unknown sessions are dropped silently — the client may
    /// already have seen a deletion.
    pub async fn prompt(self: &Arc<Self>, session_id: &str, req: PromptRequest) -> Result<()> {
        let Some(session) = self.storage.get_session(session_id).await? else {
            debug!(session = %session_id, "prompt for unknown session dropped");
            return Ok(());
        };

        let attachments = req
            .attachments
            .as_ref()
            .filter(|v| !v.is_null())
            .map(|v| v.to_string());
        let source = req.source.clone().unwrap_or_else(|| "web".to_string());
        let msg = self
            .storage
            .create_message(NewMessage {
                session_id: session_id.to_string(),
                content: req.content.clone(),
                source: source.clone(),
                model: req.model.clone(),
                reasoning_effort: req.reasoning_effort.clone(),
                attachments,
            })
            .await?;

        // The user's own prompt becomes part of the replayable stream.
        let user_event = self
            .storage
            .create_event(NewEvent {
                id: new_id(),
                session_id: session_id.to_string(),
                event_type: "user_message".to_string(),
                data: json!({"content": req.content, "source": source}).to_string(),
                message_id: Some(msg.id.clone()),
            })
            .await?;
        self.broadcast(
            session_id,
            json!({"type": "sandbox_event", "event": event_json(&user_event)}),
        )
        .await;
        self.broadcast(
            session_id,
            json!({"type": "prompt_queued", "messageId": msg.id, "position": 1}),
        )
        .await;

        if session.status == "created" {
            self.storage
                .update_session_status(session_id, "active")
                .await?;
        }
        if session.title.is_empty() {
            self.storage
                .update_session_title(session_id, &derive_title(&req.content))
                .await?;
        }
        if let Some(model) = &req.model {
            if self.model_allowed(model).await? {
                self.storage.update_session_model(session_id, model).await?;
            }
        }

        self.pump_session(session_id).await
    }

    /// Cancel the in-flight message, if any, and forward a stop to the
    /// sandbox. Idempotent when nothing is processing.
    pub async fn stop_execution(&self, session_id: &str) -> Result<()> {
        let rt = self.runtime(session_id).await;
        let mut st = rt.state.lock().await;

        let message_id = match st.processing_message_id.take() {
            Some(mid) => Some(mid),
            // Restart recovery: the slot is gone but the row may still say
            // `processing`; an explicit stop is how users clear it.
            None => self
                .storage
                .get_processing_message(session_id)
                .await?
                .map(|m| m.id),
        };
        let Some(mid) = message_id else {
            return Ok(());
        };

        self.storage.update_message_completion(&mid, "failed").await?;
        self.broadcast(
            session_id,
            json!({"type": "processing_status", "isProcessing": false}),
        )
        .await;
        let _ = self
            .registry
            .send_to_sandbox(session_id, &json!({"type": "stop"}).to_string())
            .await;
        info!(session = %session_id, message = %mid, "execution stopped");
        Ok(())
    }

    /// Model allow-list (`models.enabled` setting, JSON array). Absent or
    /// unparsable means everything is allowed.
    async fn model_allowed(&self, model: &str) -> Result<bool> {
        let Some(raw) = self.storage.get_setting("models.enabled").await? else {
            return Ok(true);
        };
        let Ok(enabled) = serde_json::from_str::<Vec<String>>(&raw) else {
            return Ok(true);
        };
        Ok(enabled.is_empty() || enabled.iter().any(|m| m == model))
    }

    // ─── Bridge socket lifecycle ─────────────────────────────────────────────

    /// The sandbox dialled back. Registers the bridge (displacing any
    /// previous one), baselines the heartbeat, and arms the watchdog.
    pub async fn bridge_connected(
        self: &Arc<Self>,
        session_id: &str,
        tx: Outbound,
    ) -> Result<Option<ConnId>> {
        if self.storage.get_session(session_id).await?.is_none() {
            return Ok(None);
        }
        let conn = self.registry.register_sandbox(session_id, tx).await;
        self.storage.update_session_heartbeat(session_id).await?;

        let rt = self.runtime(session_id).await;
        let mut st = rt.state.lock().await;
        self.start_watchdog_locked(&mut st, session_id);
        info!(session = %session_id, "sandbox bridge connected");
        Ok(Some(conn))
    }

    /// Bridge socket closed. Only clears the registry slot when this socket
    /// is still the current bridge; supervision is left to the watchdog.
    pub async fn bridge_disconnected(&self, session_id: &str, conn: ConnId) {
        if self.registry.unregister_sandbox(session_id, conn).await {
            info!(session = %session_id, "sandbox bridge disconnected");
        }
    }

    // ─── Event ingestion (§ the side-effect table) ───────────────────────────

    /// Apply one bridge event: persist (per the coalescing rule), run its
    /// side effects, fan it out. Serialised per session by the runtime lock;
    /// arrival order is persistence order is broadcast order.
    pub async fn ingest_sandbox_event(
        self: &Arc<Self>,
        session_id: &str,
        ev: SandboxEvent,
    ) -> Result<()> {
        if ev.is_heartbeat() {
            self.storage.update_session_heartbeat(session_id).await?;
            return Ok(());
        }

        let rt = self.runtime(session_id).await;
        let mut st = rt.state.lock().await;

        self.storage.update_session_activity(session_id).await?;
        self.reset_inactivity_locked(&mut st, session_id);

        match ev.event_type.as_str() {
            "ready" => {
                // A `ready` may race the socket registration; it only counts
                // once a registered bridge exists.
                if !self.registry.has_sandbox(session_id).await {
                    warn!(session = %session_id, "ready event without a registered bridge — ignored");
                    return Ok(());
                }
                self.storage
                    .update_sandbox_status(session_id, "ready")
                    .await?;
                if let Some(agent_id) = ev.metadata_str("opencodeSessionId") {
                    self.storage
                        .update_agent_session_id(session_id, agent_id)
                        .await?;
                }
                self.broadcast(session_id, json!({"type": "sandbox_ready"})).await;
                self.pump_locked(&mut st, session_id).await?;
            }
            "execution_complete" => {
                let row = self.persist_event(session_id, &ev).await?;
                if let Some(mid) = ev.message_id.clone() {
                    let outcome = if ev.success == Some(false) {
                        "failed"
                    } else {
                        "completed"
                    };
                    if st.processing_message_id.as_deref() == Some(mid.as_str()) {
                        st.processing_message_id = None;
                    }
                    let was_processing = self
                        .storage
                        .get_message(&mid)
                        .await?
                        .is_some_and(|m| m.status == "processing");
                    if was_processing {
                        self.storage.update_message_completion(&mid, outcome).await?;
                        self.broadcast(
                            session_id,
                            json!({"type": "processing_status", "isProcessing": false}),
                        )
                        .await;
                    }
                    // Dequeue the next prompt on a fresh task — yielding
                    // first keeps bridge-event handling shallow.
                    let mgr = Arc::clone(self);
                    let sid = session_id.to_string();
                    tokio::spawn(async move {
                        tokio::task::yield_now().await;
                        if let Err(e) = mgr.pump_session(&sid).await {
                            error!(session = %sid, err = %e, "pump after completion failed");
                        }
                    });
                }
                if let Some(row) = row {
                    self.broadcast(
                        session_id,
                        json!({"type": "sandbox_event", "event": event_json(&row)}),
                    )
                    .await;
                }
            }
            "push_complete" => {
                let row = self.persist_event(session_id, &ev).await?;
                if let Some(branch) = ev.metadata_str("branchName") {
                    self.storage
                        .update_session_branch(session_id, branch)
                        .await?;
                    self.storage
                        .create_artifact(
                            session_id,
                            "branch",
                            None,
                            Some(&json!({"name": branch}).to_string()),
                        )
                        .await?;
                }
                if let Some(row) = row {
                    self.broadcast(
                        session_id,
                        json!({"type": "sandbox_event", "event": event_json(&row)}),
                    )
                    .await;
                }
            }
            _ => {
                if let Some(row) = self.persist_event(session_id, &ev).await? {
                    self.broadcast(
                        session_id,
                        json!({"type": "sandbox_event", "event": event_json(&row)}),
                    )
                    .await;
                }
            }
        }
        Ok(())
    }

    async fn persist_event(
        &self,
        session_id: &str,
        ev: &SandboxEvent,
    ) -> Result<Option<crate::storage::EventRow>> {
        let make = |id: String| NewEvent {
            id,
            session_id: session_id.to_string(),
            event_type: ev.event_type.clone(),
            data: ev.raw.to_string(),
            message_id: ev.message_id.clone(),
        };
        match persistence_for(ev) {
            Persistence::Skip => Ok(None),
            Persistence::Upsert(key) => Ok(Some(self.storage.upsert_event(make(key)).await?)),
            Persistence::Insert(id) => Ok(Some(self.storage.create_event(make(id)).await?)),
        }
    }

    // ─── The queue pump ──────────────────────────────────────────────────────

    /// Public re-entry point; takes the session lock and runs one pump turn.
    pub async fn pump_session(self: &Arc<Self>, session_id: &str) -> Result<()> {
        let rt = self.runtime(session_id).await;
        let mut st = rt.state.lock().await;
        self.pump_locked(&mut st, session_id).await
    }

    /// Move the oldest `pending` message into `processing` and dispatch it.
    /// At most one message per session is in flight; the slot in `st` is the
    /// guard. Caller holds the session lock.
    async fn pump_locked(
        self: &Arc<Self>,
        st: &mut RuntimeState,
        session_id: &str,
    ) -> Result<()> {
        if st.processing_message_id.is_some() {
            return Ok(());
        }
        let Some(msg) = self.storage.get_next_pending_message(session_id).await? else {
            return Ok(());
        };

        if !self.registry.has_sandbox(session_id).await {
            self.broadcast(session_id, json!({"type": "sandbox_spawning"})).await;
            self.spawn_sandbox_locked(session_id).await?;
            // The pump re-enters when the bridge's `ready` event arrives.
            return Ok(());
        }

        let Some(session) = self.storage.get_session(session_id).await? else {
            return Ok(());
        };

        st.processing_message_id = Some(msg.id.clone());
        self.storage.update_message_to_processing(&msg.id).await?;
        self.broadcast(
            session_id,
            json!({"type": "processing_status", "isProcessing": true}),
        )
        .await;
        self.storage.update_session_activity(session_id).await?;
        self.reset_inactivity_locked(st, session_id);

        // Effective model: message override → session default → hard default.
        let model = msg
            .model
            .clone()
            .unwrap_or_else(|| session.model.clone());
        let effort = msg
            .reasoning_effort
            .clone()
            .or_else(|| session.reasoning_effort.clone());
        let attachments: Option<Value> = msg
            .attachments
            .as_deref()
            .and_then(|a| serde_json::from_str(a).ok());

        let frame = json!({
            "type": "prompt",
            "messageId": msg.id,
            "content": msg.content,
            "model": model,
            "reasoningEffort": effort,
            "author": {"name": session.display_name},
            "attachments": attachments,
        });

        if self
            .registry
            .send_to_sandbox(session_id, &frame.to_string())
            .await
        {
            self.storage
                .update_sandbox_status(session_id, "running")
                .await?;
            debug!(session = %session_id, message = %msg.id, "prompt dispatched");
        } else {
            // Bridge vanished between the check and the send. Revert and
            // respawn; the user may safely retry the same prompt.
            warn!(session = %session_id, message = %msg.id, "bridge not writable — reverting dispatch");
            st.processing_message_id = None;
            self.storage
                .update_message_completion(&msg.id, "failed")
                .await?;
            self.broadcast(
                session_id,
                json!({"type": "processing_status", "isProcessing": false}),
            )
            .await;
            self.spawn_sandbox_locked(session_id).await?;
        }
        Ok(())
    }

    // ─── Spawn procedure ─────────────────────────────────────────────────────

    /// Decide whether a spawn may proceed (circuit breaker, already-spawning,
    /// already-running) and, if so, mark the session `spawning` and kick off
    /// the actual creation in the background. Caller holds the session lock;
    /// the slow work never does.
    async fn spawn_sandbox_locked(self: &Arc<Self>, session_id: &str) -> Result<()> {
        let Some(session) = self.storage.get_session(session_id).await? else {
            return Ok(());
        };

        // Circuit breaker: after N consecutive failures, refuse to call the
        // driver until the cooldown has passed.
        if session.spawn_failure_count >= self.supervision.spawn_failure_threshold {
            let cooldown = self.spawn_cooldown(session.spawn_failure_count);
            if let Some(remaining) = remaining_cooldown(&session, cooldown) {
                let secs = remaining.as_secs().max(1);
                self.broadcast(
                    session_id,
                    json!({
                        "type": "sandbox_error",
                        "error": format!(
                            "Spawn failed {} times. Retrying in {}s.",
                            session.spawn_failure_count, secs
                        ),
                    }),
                )
                .await;
                return Ok(());
            }
        }

        if session.sandbox_status == "spawning" {
            return Ok(());
        }
        if let Some(cid) = &session.container_id {
            let running = tokio::time::timeout(
                self.supervision.driver_timeout,
                self.driver.is_running(cid),
            )
            .await
            .map(|r| r.unwrap_or(false))
            .unwrap_or(false);
            if running {
                return Ok(());
            }
        }

        self.storage
            .update_sandbox_status(session_id, "spawning")
            .await?;
        self.broadcast(session_id, json!({"type": "sandbox_spawning"})).await;

        let mgr = Arc::clone(self);
        let sid = session_id.to_string();
        tokio::spawn(async move {
            mgr.finish_spawn(sid, session).await;
        });
        Ok(())
    }

    /// The slow half of a spawn: worktree, secret overlay, container. Runs
    /// off the session lock; records success or failure on the session row.
    async fn finish_spawn(self: Arc<Self>, session_id: String, session: SessionRow) {
        match self.try_spawn(&session_id, &session).await {
            Ok((container_id, worktree_path)) => {
                // The session may have been archived or deleted while the
                // container was coming up.
                match self.storage.get_session(&session_id).await {
                    Ok(Some(row)) if row.status != "archived" => {
                        let record = async {
                            self.storage
                                .update_session_sandbox(
                                    &session_id,
                                    Some(&container_id),
                                    Some(&worktree_path),
                                )
                                .await?;
                            self.storage
                                .update_sandbox_status(&session_id, "ready")
                                .await?;
                            self.storage.reset_spawn_failures(&session_id).await
                        };
                        if let Err(e) = record.await {
                            error!(session = %session_id, err = %e, "failed to record spawn result");
                        } else {
                            info!(session = %session_id, container = %container_id, "sandbox spawned");
                        }
                    }
                    _ => {
                        info!(session = %session_id, "session went away mid-spawn — discarding container");
                        self.stop_and_remove_container(&session_id, &container_id)
                            .await;
                    }
                }
            }
            Err(e) => {
                let error = e.to_string();
                warn!(session = %session_id, err = %error, "sandbox spawn failed");
                if let Err(e) = self
                    .storage
                    .update_sandbox_status(&session_id, "failed")
                    .await
                {
                    error!(session = %session_id, err = %e, "failed to mark sandbox failed");
                }
                let _ = self.storage.record_spawn_failure(&session_id, &error).await;
                self.broadcast(
                    &session_id,
                    json!({"type": "sandbox_error", "error": error}),
                )
                .await;
            }
        }
    }

    async fn try_spawn(
        &self,
        session_id: &str,
        session: &SessionRow,
    ) -> Result<(String, String)> {
        let worktree_path = self
            .worktrees
            .create(
                session_id,
                Path::new(&session.repo_path),
                Some(&session.base_branch),
            )
            .await?;

        let env = self.sandbox_env(session).await?;
        let container_id = tokio::time::timeout(
            self.supervision.driver_timeout,
            self.driver.create_sandbox(CreateSandbox {
                session_id: session_id.to_string(),
                worktree_path: worktree_path.clone(),
                server_port: self.server_port,
                env,
            }),
        )
        .await
        .map_err(|_| anyhow::anyhow!("sandbox creation timed out"))??;

        Ok((container_id, worktree_path.to_string_lossy().into_owned()))
    }

    /// Environment injected into the sandbox: the daemon's forwarded LLM API
    /// keys, overridden by stored secrets (global, then repo scope).
    async fn sandbox_env(&self, session: &SessionRow) -> Result<Vec<(String, String)>> {
        let mut env: std::collections::BTreeMap<String, String> =
            self.forwarded_env.iter().cloned().collect();
        let scope = repo_scope(&session.repo_path);
        for (key, value) in self.storage.resolve_secrets(&scope).await? {
            env.insert(key, value);
        }
        Ok(env.into_iter().collect())
    }

    fn spawn_cooldown(&self, failure_count: i64) -> Duration {
        spawn_cooldown(&self.supervision, failure_count)
    }

    // ─── Shutdown ────────────────────────────────────────────────────────────

    /// Stop all supervision tasks. Containers are left running — persisted
    /// state reconciles them on the next boot.
    pub async fn drain(&self) {
        let runtimes: Vec<(String, Arc<SessionRuntime>)> = {
            let mut map = self.runtimes.write().await;
            map.drain().collect()
        };
        for (session_id, rt) in runtimes {
            let mut st = rt.state.lock().await;
            if let Some(h) = st.inactivity.take() {
                h.abort();
            }
            if let Some(h) = st.watchdog.take() {
                h.abort();
            }
            debug!(session = %session_id, "runtime drained");
        }
        info!("all session runtimes drained");
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// The session summary embedded in `subscribed` envelopes and REST reads.
pub fn session_summary(session: &SessionRow, message_count: i64, is_processing: bool) -> Value {
    json!({
        "id": session.id,
        "title": session.title,
        "displayName": session.display_name,
        "repoPath": session.repo_path,
        "baseBranch": session.base_branch,
        "branch": session.branch,
        "status": session.status,
        "sandboxStatus": session.sandbox_status,
        "messageCount": message_count,
        "model": session.model,
        "reasoningEffort": session.reasoning_effort,
        "isProcessing": is_processing,
        "createdAt": session.created_at,
        "updatedAt": session.updated_at,
    })
}

/// Untitled sessions take their title from the first prompt line.
fn derive_title(content: &str) -> String {
    let line = content.lines().next().unwrap_or("").trim();
    let mut title: String = line.chars().take(80).collect();
    if title.is_empty() {
        title = "Untitled session".to_string();
    }
    title
}

/// Secret scope for a host repo: its last two path components
/// (`~/code/acme/widgets` → `acme/widgets`).
fn repo_scope(repo_path: &str) -> String {
    let path = Path::new(repo_path);
    let name = path.file_name().and_then(|n| n.to_str());
    let owner = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str());
    match (owner, name) {
        (Some(o), Some(n)) => format!("{o}/{n}"),
        (None, Some(n)) => n.to_string(),
        _ => "global".to_string(),
    }
}

/// Breaker cooldown after `failure_count` consecutive spawn failures:
/// `min(max, base · 2^count)`.
fn spawn_cooldown(cfg: &SupervisionConfig, failure_count: i64) -> Duration {
    let exp = failure_count.clamp(0, 16) as u32;
    cfg.spawn_backoff_base
        .saturating_mul(2u32.saturating_pow(exp))
        .min(cfg.spawn_backoff_max)
}

/// Time left inside the breaker cooldown, or `None` once it has lapsed
/// (or when no failure has been stamped yet).
fn remaining_cooldown(session: &SessionRow, cooldown: Duration) -> Option<Duration> {
    let last = session.last_spawn_failure_at.as_deref()?;
    let last = chrono::DateTime::parse_from_rfc3339(last).ok()?;
    let elapsed = chrono::Utc::now().signed_duration_since(last);
    let elapsed = elapsed.to_std().unwrap_or_default();
    cooldown.checked_sub(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_title_takes_first_line_truncated() {
        assert_eq!(derive_title("fix the login bug\nand more"), "fix the login bug");
        let long = "x".repeat(200);
        assert_eq!(derive_title(&long).chars().count(), 80);
        assert_eq!(derive_title("   "), "Untitled session");
    }

    #[test]
    fn repo_scope_uses_last_two_components() {
        assert_eq!(repo_scope("/home/me/code/acme/widgets"), "acme/widgets");
        assert_eq!(repo_scope("widgets"), "widgets");
    }

    #[test]
    fn spawn_cooldown_is_capped_exponential() {
        let cfg = SupervisionConfig::default();
        assert_eq!(spawn_cooldown(&cfg, 3), Duration::from_secs(40));
        assert_eq!(spawn_cooldown(&cfg, 4), Duration::from_secs(60));
        assert_eq!(spawn_cooldown(&cfg, 10), Duration::from_secs(60));
    }
}
