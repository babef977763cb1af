//! Events arriving from the sandbox bridge.
//!
//! The bridge sends a flat JSON stream; each frame carries a `type`, an
//! optional `messageId` tying tokenized output back to its prompt, and an
//! otherwise opaque payload. Only the closed set below gets special
//! handling — everything else is persisted verbatim and fanned out.

use serde::Deserialize;
use serde_json::Value;

use crate::ids::new_id;
use crate::storage::EventRow;

/// A decoded bridge frame. The full original payload is retained in `raw`
/// so persistence never loses fields the core does not model.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub message_id: Option<String>,
    /// `execution_complete` outcome; absent means success.
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub metadata: Option<Value>,
    /// The frame as received.
    #[serde(skip)]
    pub raw: Value,
}

impl SandboxEvent {
    pub fn parse(text: &str) -> Option<Self> {
        let raw: Value = serde_json::from_str(text).ok()?;
        let mut ev: SandboxEvent = serde_json::from_value(raw.clone()).ok()?;
        ev.raw = raw;
        Some(ev)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.event_type == "heartbeat"
    }

    /// String field lookup inside `metadata`.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key)?.as_str()
    }
}

/// How an incoming event is written to the timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Persistence {
    /// Heartbeats never reach storage.
    Skip,
    /// Coalescable: upserted under a synthetic per-message key so that later
    /// arrivals overwrite earlier ones.
    Upsert(String),
    /// Everything else: inserted under a fresh id.
    Insert(String),
}

/// The coalescing rule: `token` and `execution_complete` events collapse to
/// one row per message; a coalescable event without a `messageId` cannot be
/// keyed and falls back to a plain insert.
pub fn persistence_for(event: &SandboxEvent) -> Persistence {
    match event.event_type.as_str() {
        "heartbeat" | "ready" => Persistence::Skip,
        "token" => match event.message_id.as_deref() {
            Some(mid) => Persistence::Upsert(format!("token:{mid}")),
            None => Persistence::Insert(new_id()),
        },
        "execution_complete" => match event.message_id.as_deref() {
            Some(mid) => Persistence::Upsert(format!("exec:{mid}")),
            None => Persistence::Insert(new_id()),
        },
        _ => Persistence::Insert(new_id()),
    }
}

/// Wire form of a persisted event, embedded in `sandbox_event` broadcasts,
/// replay blocks, and history pages.
pub fn event_json(row: &EventRow) -> Value {
    let data: Value = serde_json::from_str(&row.data).unwrap_or(Value::Null);
    serde_json::json!({
        "id": row.id,
        "type": row.event_type,
        "data": data,
        "messageId": row.message_id,
        "createdAt": row.created_at,
    })
}
