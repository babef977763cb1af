//! The thin REST surface.
//!
//! Every handler translates straight into storage reads or `SessionManager`
//! operations; list endpoints return `{items, hasMore, cursor?}`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

use crate::session::{session_summary, CreateSessionRequest, PromptRequest};
use crate::storage::{EventCursor, MAX_EVENT_PAGE};
use crate::AppContext;

// ─── Error mapping ───────────────────────────────────────────────────────────

/// Anyhow error carrying a sentinel marker, mapped to an HTTP status at the
/// boundary.
pub struct ApiError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let msg = self.0.to_string();
        let (status, code, public) = if msg.contains("SESSION_NOT_FOUND") {
            (StatusCode::NOT_FOUND, "not_found", "session not found".to_string())
        } else if msg.contains("BAD_CURSOR") {
            (StatusCode::BAD_REQUEST, "bad_request", "invalid cursor".to_string())
        } else if msg.contains("missing field") || msg.contains("invalid type") {
            (StatusCode::BAD_REQUEST, "bad_request", msg)
        } else {
            error!(err = %self.0, "internal error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "internal error".to_string(),
            )
        };
        (status, Json(json!({"error": public, "code": code}))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

// ─── Health ──────────────────────────────────────────────────────────────────

pub async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": ctx.started_at.elapsed().as_secs(),
        "activeSessions": ctx.registry.active_sessions().await.len(),
    }))
}

// ─── Sessions ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ListSessionsQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    cursor: Option<String>,
}

pub async fn list_sessions(
    State(ctx): State<Arc<AppContext>>,
    Query(q): Query<ListSessionsQuery>,
) -> ApiResult {
    let limit = q.limit.unwrap_or(50).clamp(1, 200);
    let page = ctx
        .storage
        .list_sessions(q.status.as_deref(), limit, q.cursor.as_deref())
        .await?;
    let mut items = Vec::with_capacity(page.items.len());
    for row in &page.items {
        let count = ctx.storage.count_messages(&row.id).await?;
        let is_processing = ctx.storage.get_processing_message(&row.id).await?.is_some();
        items.push(session_summary(row, count, is_processing));
    }
    let cursor = page
        .has_more
        .then(|| page.items.last().map(|r| r.updated_at.clone()))
        .flatten();
    Ok(Json(json!({"items": items, "hasMore": page.has_more, "cursor": cursor})))
}

pub async fn create_session(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let row = ctx.session_manager.create(req).await?;
    Ok((
        StatusCode::CREATED,
        Json(session_summary(&row, 0, false)),
    ))
}

pub async fn get_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult {
    let row = ctx
        .storage
        .get_session(&id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("SESSION_NOT_FOUND"))?;
    let count = ctx.storage.count_messages(&id).await?;
    let is_processing = ctx.storage.get_processing_message(&id).await?.is_some();
    Ok(Json(session_summary(&row, count, is_processing)))
}

pub async fn delete_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult {
    ctx.session_manager.delete(&id).await?;
    Ok(Json(json!({"deleted": true})))
}

pub async fn prompt_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(mut req): Json<PromptRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if req.source.is_none() {
        req.source = Some("api".to_string());
    }
    ctx.session_manager.prompt(&id, req).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({"queued": true}))))
}

pub async fn stop_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult {
    ctx.session_manager.stop_execution(&id).await?;
    Ok(Json(json!({"stopped": true})))
}

pub async fn archive_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult {
    ctx.session_manager.archive(&id).await?;
    Ok(Json(json!({"status": "archived"})))
}

pub async fn unarchive_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult {
    ctx.session_manager.unarchive(&id).await?;
    Ok(Json(json!({"status": "active"})))
}

// ─── Events & artifacts ──────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    cursor_timestamp: Option<String>,
    #[serde(default)]
    cursor_id: Option<String>,
    /// Optional type filter; incompatible with cursors.
    #[serde(default, rename = "type")]
    event_type: Option<String>,
}

pub async fn list_events(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Query(q): Query<EventsQuery>,
) -> ApiResult {
    ctx.storage
        .get_session(&id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("SESSION_NOT_FOUND"))?;
    let limit = q.limit.unwrap_or(100).clamp(1, MAX_EVENT_PAGE);

    if let Some(event_type) = &q.event_type {
        let items = ctx.storage.list_events(&id, Some(event_type), limit).await?;
        let items: Vec<Value> = items.iter().map(crate::session::events::event_json).collect();
        return Ok(Json(json!({"items": items, "hasMore": false})));
    }

    let (items, has_more) = match (q.cursor_timestamp, q.cursor_id) {
        (Some(timestamp), Some(cursor_id)) => {
            let cursor = EventCursor {
                timestamp,
                id: cursor_id,
            };
            let page = ctx
                .storage
                .get_events_history_page(&id, &cursor, limit)
                .await?;
            (page.items, page.has_more)
        }
        (None, None) => {
            let items = ctx.storage.get_events_for_replay(&id, limit).await?;
            let has_more = items.len() as i64 == limit;
            (items, has_more)
        }
        _ => return Err(anyhow::anyhow!("BAD_CURSOR: both timestamp and id are required").into()),
    };

    let cursor = items
        .first()
        .map(|e| json!({"timestamp": e.created_at, "id": e.id}));
    let items: Vec<Value> = items
        .iter()
        .map(crate::session::events::event_json)
        .collect();
    Ok(Json(json!({"items": items, "hasMore": has_more, "cursor": cursor})))
}

pub async fn list_artifacts(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult {
    ctx.storage
        .get_session(&id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("SESSION_NOT_FOUND"))?;
    let items: Vec<Value> = ctx
        .storage
        .list_artifacts(&id)
        .await?
        .iter()
        .map(|a| {
            json!({
                "id": a.id,
                "type": a.artifact_type,
                "url": a.url,
                "metadata": a.metadata.as_deref().and_then(|m| serde_json::from_str::<Value>(m).ok()),
                "createdAt": a.created_at,
            })
        })
        .collect();
    Ok(Json(json!({"items": items, "hasMore": false})))
}

#[derive(Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    limit: Option<i64>,
    /// Message-id cursor: return messages strictly older than this one.
    #[serde(default)]
    before: Option<String>,
}

pub async fn list_messages(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Query(q): Query<MessagesQuery>,
) -> ApiResult {
    ctx.storage
        .get_session(&id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("SESSION_NOT_FOUND"))?;
    let limit = q.limit.unwrap_or(100).clamp(1, 500);
    let rows = ctx
        .storage
        .list_messages(&id, limit, q.before.as_deref())
        .await?;
    let has_more = rows.len() as i64 == limit;
    let cursor = rows.first().map(|m| m.id.clone());
    let items: Vec<Value> = rows
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "content": m.content,
                "source": m.source,
                "model": m.model,
                "reasoningEffort": m.reasoning_effort,
                "status": m.status,
                "createdAt": m.created_at,
                "startedAt": m.started_at,
                "completedAt": m.completed_at,
            })
        })
        .collect();
    Ok(Json(json!({"items": items, "hasMore": has_more, "cursor": cursor})))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    tail: Option<usize>,
}

pub async fn sandbox_logs(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Query(q): Query<LogsQuery>,
) -> ApiResult {
    let session = ctx
        .storage
        .get_session(&id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("SESSION_NOT_FOUND"))?;
    let Some(container_id) = session.container_id else {
        return Ok(Json(json!({"logs": ""})));
    };
    let logs = ctx
        .driver
        .logs(&container_id, q.tail.unwrap_or(200))
        .await
        .unwrap_or_default();
    Ok(Json(json!({"logs": logs})))
}

// ─── Repos ───────────────────────────────────────────────────────────────────

pub async fn list_repos(State(ctx): State<Arc<AppContext>>) -> ApiResult {
    let Some(repos_dir) = ctx.config.repos_dir.clone() else {
        return Ok(Json(json!({"items": [], "hasMore": false})));
    };
    let items = tokio::task::spawn_blocking(move || scan_repos(&repos_dir))
        .await
        .map_err(|e| anyhow::anyhow!("repo scan panicked: {e}"))?;
    Ok(Json(json!({"items": items, "hasMore": false})))
}

fn scan_repos(repos_dir: &std::path::Path) -> Vec<Value> {
    let Ok(entries) = std::fs::read_dir(repos_dir) else {
        return Vec::new();
    };
    let mut repos = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.join(".git").exists() {
            continue;
        }
        let branch = git2::Repository::open(&path)
            .ok()
            .and_then(|repo| {
                repo.head()
                    .ok()
                    .and_then(|h| h.shorthand().map(str::to_string))
            });
        repos.push(json!({
            "name": entry.file_name().to_string_lossy(),
            "path": path.to_string_lossy(),
            "currentBranch": branch,
        }));
    }
    repos.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    repos
}

// ─── Settings ────────────────────────────────────────────────────────────────

pub async fn get_settings(State(ctx): State<Arc<AppContext>>) -> ApiResult {
    let mut out = serde_json::Map::new();
    for (key, value) in ctx.storage.list_settings().await? {
        // Values are stored as raw strings; JSON payloads come back as JSON.
        let parsed = serde_json::from_str::<Value>(&value).unwrap_or(Value::String(value));
        out.insert(key, parsed);
    }
    Ok(Json(Value::Object(out)))
}

pub async fn put_settings(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<serde_json::Map<String, Value>>,
) -> ApiResult {
    for (key, value) in &body {
        let stored = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        ctx.storage.set_setting(key, &stored).await?;
    }
    Ok(Json(json!({"updated": body.len()})))
}

// ─── Secrets ─────────────────────────────────────────────────────────────────

fn secret_item(row: &crate::storage::SecretRow) -> Value {
    // Values never leave the daemon; only key metadata is listed.
    json!({"key": row.key, "scope": row.scope, "updatedAt": row.updated_at})
}

#[derive(Deserialize)]
pub struct SecretBody {
    value: String,
}

pub async fn list_global_secrets(State(ctx): State<Arc<AppContext>>) -> ApiResult {
    let items: Vec<Value> = ctx
        .storage
        .list_secrets("global")
        .await?
        .iter()
        .map(secret_item)
        .collect();
    Ok(Json(json!({"items": items, "hasMore": false})))
}

pub async fn put_global_secret(
    State(ctx): State<Arc<AppContext>>,
    Path(key): Path<String>,
    Json(body): Json<SecretBody>,
) -> ApiResult {
    ctx.storage.set_secret(&key, "global", &body.value).await?;
    Ok(Json(json!({"key": key, "scope": "global"})))
}

pub async fn delete_global_secret(
    State(ctx): State<Arc<AppContext>>,
    Path(key): Path<String>,
) -> ApiResult {
    let deleted = ctx.storage.delete_secret(&key, "global").await?;
    Ok(Json(json!({"deleted": deleted})))
}

pub async fn list_repo_secrets(
    State(ctx): State<Arc<AppContext>>,
    Path((owner, name)): Path<(String, String)>,
) -> ApiResult {
    let scope = format!("{owner}/{name}");
    let items: Vec<Value> = ctx
        .storage
        .list_secrets(&scope)
        .await?
        .iter()
        .map(secret_item)
        .collect();
    Ok(Json(json!({"items": items, "hasMore": false})))
}

pub async fn put_repo_secret(
    State(ctx): State<Arc<AppContext>>,
    Path((owner, name, key)): Path<(String, String, String)>,
    Json(body): Json<SecretBody>,
) -> ApiResult {
    let scope = format!("{owner}/{name}");
    ctx.storage.set_secret(&key, &scope, &body.value).await?;
    Ok(Json(json!({"key": key, "scope": scope})))
}

pub async fn delete_repo_secret(
    State(ctx): State<Arc<AppContext>>,
    Path((owner, name, key)): Path<(String, String, String)>,
) -> ApiResult {
    let scope = format!("{owner}/{name}");
    let deleted = ctx.storage.delete_secret(&key, &scope).await?;
    Ok(Json(json!({"deleted": deleted})))
}
