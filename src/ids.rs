//! Opaque identifiers for sessions, messages, events, and artifacts.
//!
//! IDs are 16 lowercase hex characters taken from a v4 UUID — short enough
//! for URLs and log lines, wide enough (64 bits) that collisions within a
//! single deployment are not a practical concern.

use uuid::Uuid;

pub const ID_LEN: usize = 16;

/// Generate a fresh 16-char lowercase-hex id.
pub fn new_id() -> String {
    let mut s = Uuid::new_v4().simple().to_string();
    s.truncate(ID_LEN);
    s
}
