use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};

use crate::ids::new_id;

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the daemon indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Hard cap on replay / history page sizes.
pub const MAX_EVENT_PAGE: i64 = 500;

/// Execute a future with the standard query timeout.
/// Returns an error if the operation takes longer than `QUERY_TIMEOUT`.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

/// RFC-3339 timestamp with fixed microsecond precision.
///
/// Fixed width matters: event pagination compares `(created_at, id)` pairs
/// lexicographically in SQL, which only equals chronological order when every
/// timestamp has the same number of fractional digits.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ─── Row types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub title: String,
    pub repo_path: String,
    pub display_name: String,
    pub base_branch: String,
    pub branch: Option<String>,
    pub model: String,
    pub reasoning_effort: Option<String>,
    /// Lifecycle status: created | active | completed | archived.
    pub status: String,
    /// Sandbox status: pending | spawning | warming | syncing | ready | running | stopped | failed.
    pub sandbox_status: String,
    pub container_id: Option<String>,
    pub worktree_path: Option<String>,
    /// The agent runtime's own session handle, reported by the bridge `ready` event.
    pub agent_session_id: Option<String>,
    pub last_heartbeat: Option<String>,
    pub last_activity: Option<String>,
    pub spawn_failure_count: i64,
    pub last_spawn_failure_at: Option<String>,
    pub last_spawn_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub session_id: String,
    pub content: String,
    pub source: String,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    /// JSON array of attachment descriptors, opaque to the core.
    pub attachments: Option<String>,
    /// pending | processing | completed | failed.
    pub status: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub id: String,
    pub session_id: String,
    #[sqlx(rename = "type")]
    pub event_type: String,
    /// Opaque JSON payload.
    pub data: String,
    pub message_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ArtifactRow {
    pub id: String,
    pub session_id: String,
    #[sqlx(rename = "type")]
    pub artifact_type: String,
    pub url: Option<String>,
    pub metadata: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SecretRow {
    pub key: String,
    pub scope: String,
    pub value: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Composite pagination cursor over the event timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCursor {
    pub timestamp: String,
    pub id: String,
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
}

/// Parameters for `create_session`.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub title: String,
    pub repo_path: String,
    pub display_name: String,
    pub base_branch: String,
    pub model: String,
    pub reasoning_effort: Option<String>,
}

/// Parameters for `create_message`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: String,
    pub content: String,
    pub source: String,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub attachments: Option<String>,
}

/// An event to persist. `id` carries the coalescing key for `token` /
/// `execution_complete` events (`token:<msg>` / `exec:<msg>`); every other
/// type gets a fresh id from the caller.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub id: String,
    pub session_id: String,
    pub event_type: String,
    pub data: String,
    pub message_id: Option<String>,
}

// ─── Storage ─────────────────────────────────────────────────────────────────

/// The only writer to the durable store.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("hived.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Sessions ───────────────────────────────────────────────────────────

    pub async fn create_session(&self, meta: NewSession) -> Result<SessionRow> {
        let id = new_id();
        let now = now_rfc3339();
        sqlx::query(
            "INSERT INTO sessions (id, title, repo_path, display_name, base_branch, model, \
             reasoning_effort, status, sandbox_status, spawn_failure_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'created', 'pending', 0, ?, ?)",
        )
        .bind(&id)
        .bind(&meta.title)
        .bind(&meta.repo_path)
        .bind(&meta.display_name)
        .bind(&meta.base_branch)
        .bind(&meta.model)
        .bind(&meta.reasoning_effort)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_session(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session not found after insert"))
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRow>> {
        Ok(sqlx::query_as("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// List sessions newest-first on `updated_at`, optionally filtered by
    /// lifecycle status. `cursor` is the `updated_at` of the last row of the
    /// previous page.
    pub async fn list_sessions(
        &self,
        status: Option<&str>,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<Page<SessionRow>> {
        with_timeout(async {
            // Fetch one extra row to learn whether another page exists.
            let rows: Vec<SessionRow> = match (status, cursor) {
                (Some(s), Some(c)) => {
                    sqlx::query_as(
                        "SELECT * FROM sessions WHERE status = ? AND updated_at < ?
                         ORDER BY updated_at DESC LIMIT ?",
                    )
                    .bind(s)
                    .bind(c)
                    .bind(limit + 1)
                    .fetch_all(&self.pool)
                    .await?
                }
                (Some(s), None) => {
                    sqlx::query_as(
                        "SELECT * FROM sessions WHERE status = ? ORDER BY updated_at DESC LIMIT ?",
                    )
                    .bind(s)
                    .bind(limit + 1)
                    .fetch_all(&self.pool)
                    .await?
                }
                (None, Some(c)) => {
                    sqlx::query_as(
                        "SELECT * FROM sessions WHERE updated_at < ?
                         ORDER BY updated_at DESC LIMIT ?",
                    )
                    .bind(c)
                    .bind(limit + 1)
                    .fetch_all(&self.pool)
                    .await?
                }
                (None, None) => {
                    sqlx::query_as("SELECT * FROM sessions ORDER BY updated_at DESC LIMIT ?")
                        .bind(limit + 1)
                        .fetch_all(&self.pool)
                        .await?
                }
            };
            let has_more = rows.len() as i64 > limit;
            let items = rows.into_iter().take(limit as usize).collect();
            Ok(Page { items, has_more })
        })
        .await
    }

    pub async fn update_session_status(&self, id: &str, status: &str) -> Result<()> {
        self.touch_single(id, "status", status).await
    }

    pub async fn update_sandbox_status(&self, id: &str, sandbox_status: &str) -> Result<()> {
        self.touch_single(id, "sandbox_status", sandbox_status).await
    }

    pub async fn update_session_title(&self, id: &str, title: &str) -> Result<()> {
        self.touch_single(id, "title", title).await
    }

    pub async fn update_session_model(&self, id: &str, model: &str) -> Result<()> {
        self.touch_single(id, "model", model).await
    }

    pub async fn update_session_branch(&self, id: &str, branch: &str) -> Result<()> {
        self.touch_single(id, "branch", branch).await
    }

    pub async fn update_agent_session_id(&self, id: &str, agent_session_id: &str) -> Result<()> {
        self.touch_single(id, "agent_session_id", agent_session_id)
            .await
    }

    async fn touch_single(&self, id: &str, column: &str, value: &str) -> Result<()> {
        // `column` is always a compile-time constant from the setters above,
        // never caller input.
        let now = now_rfc3339();
        let sql = format!("UPDATE sessions SET {column} = ?, updated_at = ? WHERE id = ?");
        let res = sqlx::query(&sql)
            .bind(value)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            anyhow::bail!("SESSION_NOT_FOUND: {id}");
        }
        Ok(())
    }

    /// Record the container + worktree pair attached to a session.
    pub async fn update_session_sandbox(
        &self,
        id: &str,
        container_id: Option<&str>,
        worktree_path: Option<&str>,
    ) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE sessions SET container_id = ?, worktree_path = ?, updated_at = ? WHERE id = ?",
        )
        .bind(container_id)
        .bind(worktree_path)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_session_heartbeat(&self, id: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query("UPDATE sessions SET last_heartbeat = ?, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_session_activity(&self, id: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query("UPDATE sessions SET last_activity = ?, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a spawn failure: bump the counter, stamp the failure time, and
    /// keep the error string for later `subscribed` envelopes.
    pub async fn record_spawn_failure(&self, id: &str, error: &str) -> Result<i64> {
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE sessions SET spawn_failure_count = spawn_failure_count + 1,
             last_spawn_failure_at = ?, last_spawn_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&now)
        .bind(error)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        let row: (i64,) =
            sqlx::query_as("SELECT spawn_failure_count FROM sessions WHERE id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    pub async fn reset_spawn_failures(&self, id: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE sessions SET spawn_failure_count = 0, last_spawn_failure_at = NULL,
             last_spawn_error = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a session and everything it owns in one logical unit.
    pub async fn delete_session(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM events WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM artifacts WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Boot-time reconciliation: sessions left in a transient sandbox state
    /// by a previous process are reset to `stopped` and their container
    /// handle cleared. `processing` messages are deliberately left alone —
    /// the user clears them with an explicit stop.
    pub async fn recover_stale_sandboxes(&self) -> Result<u64> {
        with_timeout(async {
            let now = now_rfc3339();
            let n = sqlx::query(
                "UPDATE sessions SET sandbox_status = 'stopped', container_id = NULL, updated_at = ?
                 WHERE sandbox_status IN ('spawning', 'warming', 'syncing', 'ready', 'running')",
            )
            .bind(&now)
            .execute(&self.pool)
            .await?
            .rows_affected();
            Ok(n)
        })
        .await
    }

    // ─── Messages ───────────────────────────────────────────────────────────

    pub async fn create_message(&self, msg: NewMessage) -> Result<MessageRow> {
        let id = new_id();
        let now = now_rfc3339();
        sqlx::query(
            "INSERT INTO messages (id, session_id, content, source, model, reasoning_effort, \
             attachments, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?)",
        )
        .bind(&id)
        .bind(&msg.session_id)
        .bind(&msg.content)
        .bind(&msg.source)
        .bind(&msg.model)
        .bind(&msg.reasoning_effort)
        .bind(&msg.attachments)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_message(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("message not found after insert"))
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        Ok(sqlx::query_as("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Oldest `pending` message for the session, if any.
    pub async fn get_next_pending_message(&self, session_id: &str) -> Result<Option<MessageRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM messages WHERE session_id = ? AND status = 'pending'
             ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// The unique `processing` message for the session, if any.
    pub async fn get_processing_message(&self, session_id: &str) -> Result<Option<MessageRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM messages WHERE session_id = ? AND status = 'processing'
             ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn update_message_to_processing(&self, id: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query("UPDATE messages SET status = 'processing', started_at = ? WHERE id = ?")
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Terminal transition: `completed` or `failed`, stamping `completed_at`.
    pub async fn update_message_completion(&self, id: &str, status: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query("UPDATE messages SET status = ?, completed_at = ? WHERE id = ?")
            .bind(status)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Messages in chronological order, paginated with a message-id cursor.
    /// The composite `(created_at, id)` comparison keeps pagination stable
    /// when several messages share a timestamp.
    pub async fn list_messages(
        &self,
        session_id: &str,
        limit: i64,
        before: Option<&str>,
    ) -> Result<Vec<MessageRow>> {
        let rows = if let Some(msg_id) = before {
            sqlx::query_as(
                "SELECT * FROM (
                     SELECT * FROM messages
                     WHERE session_id = ?
                       AND (
                           created_at < (SELECT created_at FROM messages WHERE id = ? AND session_id = ?)
                           OR (
                               created_at = (SELECT created_at FROM messages WHERE id = ? AND session_id = ?)
                               AND id < ?
                           )
                       )
                     ORDER BY created_at DESC, id DESC LIMIT ?
                 ) ORDER BY created_at ASC, id ASC",
            )
            .bind(session_id)
            .bind(msg_id).bind(session_id)
            .bind(msg_id).bind(session_id)
            .bind(msg_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                "SELECT * FROM (
                     SELECT * FROM messages WHERE session_id = ?
                     ORDER BY created_at DESC, id DESC LIMIT ?
                 ) ORDER BY created_at ASC, id ASC",
            )
            .bind(session_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };
        Ok(rows)
    }

    pub async fn count_messages(&self, session_id: &str) -> Result<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    // ─── Events ─────────────────────────────────────────────────────────────

    pub async fn create_event(&self, ev: NewEvent) -> Result<EventRow> {
        let now = now_rfc3339();
        sqlx::query(
            "INSERT INTO events (id, session_id, type, data, message_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&ev.id)
        .bind(&ev.session_id)
        .bind(&ev.event_type)
        .bind(&ev.data)
        .bind(&ev.message_id)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_event(&ev.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("event not found after insert"))
    }

    /// Insert-or-replace on the event's primary key. A replaced event takes a
    /// fresh `created_at`, so the coalesced row moves to the tail of the
    /// timeline — "latest wins" for `token:<msg>` / `exec:<msg>` keys.
    pub async fn upsert_event(&self, ev: NewEvent) -> Result<EventRow> {
        let now = now_rfc3339();
        sqlx::query(
            "INSERT INTO events (id, session_id, type, data, message_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               data = excluded.data,
               message_id = excluded.message_id,
               created_at = excluded.created_at",
        )
        .bind(&ev.id)
        .bind(&ev.session_id)
        .bind(&ev.event_type)
        .bind(&ev.data)
        .bind(&ev.message_id)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_event(&ev.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("event not found after upsert"))
    }

    pub async fn get_event(&self, id: &str) -> Result<Option<EventRow>> {
        Ok(sqlx::query_as("SELECT * FROM events WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// The tail of the session timeline: the most recent `limit` events
    /// excluding heartbeats, returned in ascending `(created_at, id)` order.
    /// This is a new subscriber's initial view.
    pub async fn get_events_for_replay(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<EventRow>> {
        let limit = limit.clamp(1, MAX_EVENT_PAGE);
        Ok(sqlx::query_as(
            "SELECT * FROM (
                 SELECT * FROM events
                 WHERE session_id = ? AND type != 'heartbeat'
                 ORDER BY created_at DESC, id DESC LIMIT ?
             ) ORDER BY created_at ASC, id ASC",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Events strictly older than the cursor, ascending, heartbeats excluded.
    pub async fn get_events_history_page(
        &self,
        session_id: &str,
        cursor: &EventCursor,
        limit: i64,
    ) -> Result<Page<EventRow>> {
        let limit = limit.clamp(1, MAX_EVENT_PAGE);
        // One extra row decides `has_more`.
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT * FROM (
                 SELECT * FROM events
                 WHERE session_id = ? AND type != 'heartbeat'
                   AND (created_at < ? OR (created_at = ? AND id < ?))
                 ORDER BY created_at DESC, id DESC LIMIT ?
             ) ORDER BY created_at ASC, id ASC",
        )
        .bind(session_id)
        .bind(&cursor.timestamp)
        .bind(&cursor.timestamp)
        .bind(&cursor.id)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await?;
        let has_more = rows.len() as i64 > limit;
        // The extra row is the *oldest* of the fetch; drop it from the front
        // so the returned page stays contiguous with the cursor.
        let items = if has_more {
            rows.into_iter().skip(1).collect()
        } else {
            rows
        };
        Ok(Page { items, has_more })
    }

    /// Filtered listing for the REST events endpoint (ascending, heartbeats
    /// excluded, optional type filter).
    pub async fn list_events(
        &self,
        session_id: &str,
        event_type: Option<&str>,
        limit: i64,
    ) -> Result<Vec<EventRow>> {
        let limit = limit.clamp(1, MAX_EVENT_PAGE);
        let rows = match event_type {
            Some(t) => {
                sqlx::query_as(
                    "SELECT * FROM events WHERE session_id = ? AND type = ?
                     ORDER BY created_at ASC, id ASC LIMIT ?",
                )
                .bind(session_id)
                .bind(t)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT * FROM events WHERE session_id = ? AND type != 'heartbeat'
                     ORDER BY created_at ASC, id ASC LIMIT ?",
                )
                .bind(session_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    // ─── Artifacts ──────────────────────────────────────────────────────────

    pub async fn create_artifact(
        &self,
        session_id: &str,
        artifact_type: &str,
        url: Option<&str>,
        metadata: Option<&str>,
    ) -> Result<ArtifactRow> {
        let id = new_id();
        let now = now_rfc3339();
        sqlx::query(
            "INSERT INTO artifacts (id, session_id, type, url, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(session_id)
        .bind(artifact_type)
        .bind(url)
        .bind(metadata)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        let row = sqlx::query_as("SELECT * FROM artifacts WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_artifacts(&self, session_id: &str) -> Result<Vec<ArtifactRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM artifacts WHERE session_id = ? ORDER BY created_at ASC")
                .bind(session_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    // ─── Settings ───────────────────────────────────────────────────────────

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_settings(&self) -> Result<Vec<(String, String)>> {
        Ok(sqlx::query_as("SELECT key, value FROM settings ORDER BY key ASC")
            .fetch_all(&self.pool)
            .await?)
    }

    // ─── Secrets ────────────────────────────────────────────────────────────

    pub async fn set_secret(&self, key: &str, scope: &str, value: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "INSERT INTO secrets (key, scope, value, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(key, scope) DO UPDATE SET
               value = excluded.value,
               updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(scope)
        .bind(value)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_secret(&self, key: &str, scope: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM secrets WHERE key = ? AND scope = ?")
            .bind(key)
            .bind(scope)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn list_secrets(&self, scope: &str) -> Result<Vec<SecretRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM secrets WHERE scope = ? ORDER BY key ASC")
                .bind(scope)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Effective secret set for a repo scope: globals first, then per-scope
    /// rows replacing any global with the same key.
    pub async fn resolve_secrets(&self, scope: &str) -> Result<Vec<(String, String)>> {
        let mut map: std::collections::BTreeMap<String, String> = std::collections::BTreeMap::new();
        for row in self.list_secrets("global").await? {
            map.insert(row.key, row.value);
        }
        if scope != "global" {
            for row in self.list_secrets(scope).await? {
                map.insert(row.key, row.value);
            }
        }
        Ok(map.into_iter().collect())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
