//! Boot-time sweep of orphaned worktrees.
//!
//! Worktree directories whose owning session no longer exists (deleted
//! while the daemon was down, or left behind by a crash mid-delete) are
//! removed so stale checkouts do not accumulate under the worktrees dir.

use std::path::Path;

use anyhow::Result;
use tracing::{debug, warn};

use crate::storage::Storage;

/// Remove worktree directories with no matching session row. Returns how
/// many directories were removed.
pub async fn remove_orphan_worktrees(base_dir: &Path, storage: &Storage) -> Result<u32> {
    let mut entries = match tokio::fs::read_dir(base_dir).await {
        Ok(e) => e,
        // No worktrees dir yet — nothing to sweep.
        Err(_) => return Ok(0),
    };

    let mut removed = 0u32;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(session_id) = name.to_str() else {
            continue;
        };
        if storage.get_session(session_id).await?.is_some() {
            continue;
        }
        match tokio::fs::remove_dir_all(entry.path()).await {
            Ok(()) => {
                debug!(session = %session_id, "removed orphan worktree");
                removed += 1;
            }
            Err(e) => {
                warn!(session = %session_id, err = %e, "failed to remove orphan worktree")
            }
        }
    }
    Ok(removed)
}
