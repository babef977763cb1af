//! Session-scoped Git worktrees.
//!
//! Every session gets its own worktree isolated from the main checkout.
//! Worktrees live at `{worktrees_dir}/{session_id}/` on branch
//! `agent/<session-id>` derived from the session's base ref at creation
//! time. Creation is idempotent: an existing worktree (or branch) is reused.

pub mod cleanup;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

/// Branch namespace for session worktrees.
const BRANCH_PREFIX: &str = "agent/";

/// Gitignored files symlinked from the main checkout into a fresh worktree so
/// local tooling keeps working (`.env*`, editor dotfiles). Best-effort.
fn should_symlink(name: &str) -> bool {
    name.starts_with('.')
}

pub struct WorktreeManager {
    /// Base directory for all worktrees: `{data_dir}/worktrees` by default.
    base_dir: PathBuf,
}

impl WorktreeManager {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// The branch a session's worktree is checked out on.
    pub fn branch_name(session_id: &str) -> String {
        format!("{BRANCH_PREFIX}{session_id}")
    }

    /// Where the session's worktree lives (whether or not it exists yet).
    pub fn get_path(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(session_id)
    }

    /// Create (or reuse) the worktree for a session.
    ///
    /// Returns the worktree path. Idempotent: if the directory already holds
    /// a checkout it is returned as-is; if the branch already exists it is
    /// reused rather than recreated.
    pub async fn create(
        &self,
        session_id: &str,
        repo_path: &Path,
        base_ref: Option<&str>,
    ) -> Result<PathBuf> {
        let wt_path = self.get_path(session_id);
        if wt_path.join(".git").exists() {
            debug!(session = %session_id, path = %wt_path.display(), "worktree already exists — reusing");
            return Ok(wt_path);
        }

        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .context("failed to create worktree base directory")?;

        let branch = Self::branch_name(session_id);
        let repo_path_owned = repo_path.to_path_buf();
        let wt = wt_path.clone();
        let base = base_ref.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            create_worktree_blocking(&repo_path_owned, &branch, &wt, base.as_deref())
        })
        .await
        .context("worktree creation task panicked")??;

        link_ignored_files(repo_path, &wt_path).await;

        info!(session = %session_id, path = %wt_path.display(), "worktree created");
        Ok(wt_path)
    }

    /// Remove a session's worktree. Git-level removal first; if that fails,
    /// forcefully delete the directory and prune the stale registration.
    pub async fn remove(&self, session_id: &str, repo_path: &Path) -> Result<()> {
        let wt_path = self.get_path(session_id);
        if !wt_path.exists() {
            return Ok(());
        }

        let repo_path_owned = repo_path.to_path_buf();
        let wt = wt_path.clone();
        let result =
            tokio::task::spawn_blocking(move || remove_worktree_blocking(&repo_path_owned, &wt))
                .await
                .context("worktree removal task panicked")?;

        if let Err(e) = result {
            warn!(session = %session_id, err = %e, "git worktree removal failed — cleaning directory manually");
            if wt_path.exists() {
                tokio::fs::remove_dir_all(&wt_path).await.ok();
            }
            let repo_path_owned = repo_path.to_path_buf();
            tokio::task::spawn_blocking(move || prune_worktrees_blocking(&repo_path_owned))
                .await
                .ok();
        }

        debug!(session = %session_id, "worktree removed");
        Ok(())
    }

    /// Session ids with a worktree registered against `repo_path`.
    pub async fn list(&self, repo_path: &Path) -> Result<Vec<String>> {
        let repo_path_owned = repo_path.to_path_buf();
        let base = self.base_dir.clone();
        tokio::task::spawn_blocking(move || list_worktrees_blocking(&repo_path_owned, &base))
            .await
            .context("worktree list task panicked")?
    }
}

/// Symlink gitignored dotfiles and `.env*` from the main checkout into the
/// worktree. Best-effort: any failure is logged and skipped.
async fn link_ignored_files(repo_path: &Path, wt_path: &Path) {
    let mut entries = match tokio::fs::read_dir(repo_path).await {
        Ok(e) => e,
        Err(_) => return,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name == ".git" || !should_symlink(name) {
            continue;
        }
        let target = wt_path.join(name);
        if target.exists() {
            // Tracked dotfiles are already checked out in the worktree.
            continue;
        }
        #[cfg(unix)]
        {
            if let Err(e) = tokio::fs::symlink(entry.path(), &target).await {
                debug!(file = %name, err = %e, "dotfile symlink skipped");
            }
        }
    }
}

// ─── Blocking git2 helpers ───────────────────────────────────────────────────

fn create_worktree_blocking(
    repo_path: &Path,
    branch_name: &str,
    wt_path: &Path,
    base_ref: Option<&str>,
) -> Result<()> {
    let repo = git2::Repository::open(repo_path)
        .context("failed to open repository for worktree creation")?;

    // Resolve the base commit: the named ref when given, HEAD otherwise.
    let base_commit = match base_ref {
        Some(name) => repo
            .revparse_single(name)
            .with_context(|| format!("base ref '{name}' not found"))?
            .peel_to_commit()
            .context("base ref does not point to a commit")?,
        None => repo
            .head()
            .context("repository has no HEAD")?
            .peel_to_commit()
            .context("HEAD does not point to a commit")?,
    };

    // Create the session branch from the base, reusing it if already taken.
    let branch = match repo.branch(branch_name, &base_commit, false) {
        Ok(b) => b,
        Err(e) if e.code() == git2::ErrorCode::Exists => {
            debug!(branch = branch_name, "branch already exists — reusing");
            repo.find_branch(branch_name, git2::BranchType::Local)
                .context("failed to find existing branch")?
        }
        Err(e) => bail!("failed to create branch {}: {}", branch_name, e),
    };

    // `branch_name` contains '/', which git disallows in worktree names;
    // derive a safe name by replacing slashes.
    let wt_name = branch_name.replace('/', "--");
    let branch_ref = branch.get();
    let mut wt_opts = git2::WorktreeAddOptions::new();
    wt_opts.reference(Some(branch_ref));
    repo.worktree(&wt_name, wt_path, Some(&wt_opts))
        .context("failed to add git worktree")?;

    Ok(())
}

fn remove_worktree_blocking(repo_path: &Path, wt_path: &Path) -> Result<()> {
    let repo = git2::Repository::open(repo_path)
        .context("failed to open repository for worktree removal")?;

    let names = repo.worktrees().context("failed to list worktrees")?;
    for name in names.iter().flatten() {
        if let Ok(wt) = repo.find_worktree(name) {
            if wt.path() == wt_path {
                wt.prune(Some(
                    git2::WorktreePruneOptions::new().valid(true).working_tree(true),
                ))
                .context("failed to prune worktree")?;
                if wt_path.exists() {
                    std::fs::remove_dir_all(wt_path)
                        .context("failed to remove worktree directory")?;
                }
                return Ok(());
            }
        }
    }

    // Not registered — just clean up the directory.
    if wt_path.exists() {
        std::fs::remove_dir_all(wt_path).context("failed to remove orphaned worktree directory")?;
    }
    Ok(())
}

/// Drop stale worktree registrations whose directories are gone.
fn prune_worktrees_blocking(repo_path: &Path) -> Result<()> {
    let repo = git2::Repository::open(repo_path)?;
    let names = repo.worktrees()?;
    for name in names.iter().flatten() {
        if let Ok(wt) = repo.find_worktree(name) {
            if !wt.path().exists() {
                wt.prune(Some(git2::WorktreePruneOptions::new().valid(true)))
                    .ok();
            }
        }
    }
    Ok(())
}

fn list_worktrees_blocking(repo_path: &Path, base_dir: &Path) -> Result<Vec<String>> {
    let repo = git2::Repository::open(repo_path)?;
    let names = repo.worktrees()?;
    let mut sessions = Vec::new();
    for name in names.iter().flatten() {
        if let Ok(wt) = repo.find_worktree(name) {
            if wt.path().starts_with(base_dir) {
                if let Some(id) = wt.path().file_name().and_then(|n| n.to_str()) {
                    sessions.push(id.to_string());
                }
            }
        }
    }
    Ok(sessions)
}
