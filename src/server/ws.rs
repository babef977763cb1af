//! The realtime channel: client sockets and the sandbox bridge.
//!
//! Both connect to `GET /sessions/{id}/ws`; the bridge distinguishes itself
//! with a `?type=sandbox` query parameter. Every connection gets an
//! unbounded outbound channel drained by a writer task, so nothing in the
//! core ever blocks on a slow socket.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::registry::{ConnId, OutFrame};
use crate::session::PromptRequest;
use crate::storage::EventCursor;
use crate::AppContext;

#[derive(Deserialize)]
pub struct WsQuery {
    /// `sandbox` marks the bridge; anything else is a client.
    #[serde(rename = "type")]
    kind: Option<String>,
}

pub async fn ws_handler(
    State(ctx): State<Arc<AppContext>>,
    Path(session_id): Path<String>,
    Query(query): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let is_bridge = query.kind.as_deref() == Some("sandbox");
    upgrade.on_upgrade(move |socket| async move {
        if is_bridge {
            run_bridge_connection(ctx, session_id, socket).await;
        } else {
            run_client_connection(ctx, session_id, socket).await;
        }
    })
}

/// Split the socket and pump the outbound channel into the sink. Returns the
/// channel sender; the writer task ends on `Close` or when every sender is
/// dropped.
fn spawn_writer(
    socket: WebSocket,
) -> (
    mpsc::UnboundedSender<OutFrame>,
    futures_util::stream::SplitStream<WebSocket>,
) {
    let (mut sink, stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutFrame>();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                OutFrame::Text(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                OutFrame::Close { reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: 1000,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });
    (tx, stream)
}

// ─── Client connections ──────────────────────────────────────────────────────

/// Frames a web/chat client may send.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Ping,
    Subscribe,
    #[serde(rename_all = "camelCase")]
    Prompt {
        content: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        reasoning_effort: Option<String>,
        #[serde(default)]
        attachments: Option<Value>,
    },
    Stop,
    #[serde(rename_all = "camelCase")]
    FetchHistory {
        cursor: WireCursor,
        #[serde(default)]
        limit: Option<i64>,
    },
    // Presence chatter is accepted and discarded.
    Typing,
    Presence,
}

#[derive(Deserialize)]
struct WireCursor {
    timestamp: String,
    id: String,
}

async fn run_client_connection(ctx: Arc<AppContext>, session_id: String, socket: WebSocket) {
    let (tx, mut stream) = spawn_writer(socket);
    let manager = &ctx.session_manager;
    let mut conn: Option<ConnId> = None;

    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };

        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(_) => {
                let _ = tx.send(OutFrame::Text(
                    json!({"type": "error", "code": "bad_request", "error": "unrecognised frame"})
                        .to_string(),
                ));
                continue;
            }
        };

        match frame {
            ClientFrame::Ping => {
                let _ = tx.send(OutFrame::Text(
                    json!({"type": "pong", "timestamp": crate::storage::now_rfc3339()})
                        .to_string(),
                ));
            }
            ClientFrame::Subscribe => {
                if conn.is_some() {
                    continue;
                }
                match manager.subscribe(&session_id, tx.clone()).await {
                    Ok(Some(id)) => conn = Some(id),
                    Ok(None) => {
                        // Error frame already queued; close with a
                        // session-not-found status.
                        let _ = tx.send(OutFrame::Close {
                            reason: "session not found".to_string(),
                        });
                        break;
                    }
                    Err(e) => {
                        warn!(session = %session_id, err = %e, "subscribe failed");
                        break;
                    }
                }
            }
            ClientFrame::Prompt {
                content,
                model,
                reasoning_effort,
                attachments,
            } => {
                let req = PromptRequest {
                    content,
                    model,
                    reasoning_effort,
                    attachments,
                    source: Some("web".to_string()),
                };
                if let Err(e) = manager.prompt(&session_id, req).await {
                    warn!(session = %session_id, err = %e, "prompt failed");
                }
            }
            ClientFrame::Stop => {
                if let Err(e) = manager.stop_execution(&session_id).await {
                    warn!(session = %session_id, err = %e, "stop failed");
                }
            }
            ClientFrame::FetchHistory { cursor, limit } => {
                let cursor = EventCursor {
                    timestamp: cursor.timestamp,
                    id: cursor.id,
                };
                match manager
                    .fetch_history(&session_id, cursor, limit.unwrap_or(100))
                    .await
                {
                    Ok(page) => {
                        let _ = tx.send(OutFrame::Text(page.to_string()));
                    }
                    Err(e) => {
                        warn!(session = %session_id, err = %e, "fetch_history failed");
                        let _ = tx.send(OutFrame::Text(
                            json!({"type": "error", "code": "bad_request", "error": "bad cursor"})
                                .to_string(),
                        ));
                    }
                }
            }
            ClientFrame::Typing | ClientFrame::Presence => {}
        }
    }

    if let Some(id) = conn {
        ctx.registry.unregister_client(&session_id, id).await;
    }
    debug!(session = %session_id, "client connection closed");
}

// ─── Bridge connections ──────────────────────────────────────────────────────

async fn run_bridge_connection(ctx: Arc<AppContext>, session_id: String, socket: WebSocket) {
    let (tx, mut stream) = spawn_writer(socket);
    let manager = &ctx.session_manager;

    let conn = match manager.bridge_connected(&session_id, tx.clone()).await {
        Ok(Some(id)) => id,
        Ok(None) => {
            let _ = tx.send(OutFrame::Close {
                reason: "session not found".to_string(),
            });
            return;
        }
        Err(e) => {
            warn!(session = %session_id, err = %e, "bridge registration failed");
            return;
        }
    };

    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };
        let Some(event) = crate::session::events::SandboxEvent::parse(&text) else {
            warn!(session = %session_id, "unparsable bridge frame dropped");
            continue;
        };
        // A persistence failure drops this event; a stalled stream would be
        // worse.
        if let Err(e) = manager.ingest_sandbox_event(&session_id, event).await {
            warn!(session = %session_id, err = %e, "event ingestion failed — continuing");
        }
    }

    manager.bridge_disconnected(&session_id, conn).await;
    debug!(session = %session_id, "bridge connection closed");
}
