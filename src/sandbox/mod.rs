//! Sandbox container lifecycle.
//!
//! Each session runs its agent inside one Docker container. The daemon drives
//! the `docker` CLI directly — the same way it would drive any provider
//! binary — so there is no daemon-side Docker API dependency to version-match.
//!
//! Containers are labelled `hived.managed=true` and `hived.session=<id>` so
//! stale ones can be found and reaped in bulk after a crash.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Label attached to every container the daemon creates.
pub const MANAGED_LABEL: &str = "hived.managed=true";
/// Label key carrying the owning session id.
pub const SESSION_LABEL_KEY: &str = "hived.session";
/// Where the session worktree is mounted inside the sandbox.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Default grace period handed to `docker stop`.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox image '{0}' not found — pull or build it before starting sessions")]
    ImageMissing(String),
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("docker {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything the driver needs to start one sandbox.
#[derive(Debug, Clone)]
pub struct CreateSandbox {
    pub session_id: String,
    pub worktree_path: PathBuf,
    /// Port the control plane listens on; the bridge dials back to it.
    pub server_port: u16,
    /// Environment injected into the container (secret overlay + API keys).
    pub env: Vec<(String, String)>,
}

/// Summary of a container found by label.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub state: String,
    pub session_id: Option<String>,
}

/// Contract between the session core and the container runtime.
#[async_trait]
pub trait SandboxDriver: Send + Sync {
    async fn health_check(&self) -> Result<(), SandboxError>;
    /// Idempotent: an already-running sandbox for the session is reused; a
    /// stopped one is removed and recreated.
    async fn create_sandbox(&self, req: CreateSandbox) -> Result<String, SandboxError>;
    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), SandboxError>;
    async fn remove(&self, container_id: &str) -> Result<(), SandboxError>;
    async fn is_running(&self, container_id: &str) -> Result<bool, SandboxError>;
    async fn logs(&self, container_id: &str, tail: usize) -> Result<String, SandboxError>;
    async fn list_with_label(&self, label: &str) -> Result<Vec<ContainerInfo>, SandboxError>;
    /// Remove exited containers carrying `label`; returns how many went away.
    async fn reap_exited(&self, label: &str) -> Result<usize, SandboxError>;
}

// ─── Docker implementation ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub image: String,
    pub cpus: f64,
    pub memory_gb: u64,
    /// Host directories mounted read-only into the sandbox when they exist
    /// (agent CLI credentials, gh auth).
    pub credential_dirs: Vec<PathBuf>,
}

impl DockerConfig {
    pub fn new(image: String) -> Self {
        Self {
            image,
            cpus: 2.0,
            memory_gb: 4,
            credential_dirs: default_credential_dirs(),
        }
    }
}

fn default_credential_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(home) = std::env::var("HOME") {
        let home = PathBuf::from(home);
        dirs.push(home.join(".claude"));
        dirs.push(home.join(".config").join("gh"));
    }
    dirs
}

pub struct DockerDriver {
    config: DockerConfig,
}

impl DockerDriver {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    fn container_name(session_id: &str) -> String {
        format!("hived-{session_id}")
    }

    /// Run `docker <args>`, returning trimmed stdout or a typed error.
    async fn docker(&self, args: &[&str]) -> Result<String, SandboxError> {
        debug!(args = ?args, "docker");
        let output = Command::new("docker")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SandboxError::RuntimeUnavailable(e.to_string()))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(SandboxError::CommandFailed {
                command: args.first().copied().unwrap_or("?").to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn image_exists(&self) -> Result<bool, SandboxError> {
        match self.docker(&["image", "inspect", &self.config.image]).await {
            Ok(_) => Ok(true),
            Err(SandboxError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Inspect a container's running state by name or id.
    /// `Ok(None)` means the container does not exist.
    async fn inspect_state(&self, handle: &str) -> Result<Option<String>, SandboxError> {
        match self
            .docker(&["inspect", "--format", "{{.State.Status}}", handle])
            .await
        {
            Ok(state) => Ok(Some(state)),
            Err(SandboxError::CommandFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Build the full `docker run` argument vector for a create request.
    fn run_args(&self, req: &CreateSandbox) -> Vec<String> {
        let name = Self::container_name(&req.session_id);
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name,
            "--label".into(),
            MANAGED_LABEL.into(),
            "--label".into(),
            format!("{SESSION_LABEL_KEY}={}", req.session_id),
            "--cpus".into(),
            format!("{}", self.config.cpus),
            "--memory".into(),
            format!("{}g", self.config.memory_gb),
            // Let the bridge reach the control plane from inside the container.
            "--add-host".into(),
            "host.docker.internal:host-gateway".into(),
            "-v".into(),
            format!("{}:{WORKSPACE_MOUNT}", req.worktree_path.display()),
            "-w".into(),
            WORKSPACE_MOUNT.into(),
            "-e".into(),
            format!("HIVED_SESSION_ID={}", req.session_id),
            "-e".into(),
            format!(
                "HIVED_SERVER_URL=ws://host.docker.internal:{}/sessions/{}/ws?type=sandbox",
                req.server_port, req.session_id
            ),
        ];
        for dir in &self.config.credential_dirs {
            if dir.exists() {
                if let Some(base) = dir.file_name().and_then(|n| n.to_str()) {
                    args.push("-v".into());
                    args.push(format!("{}:/root/{base}:ro", dir.display()));
                }
            }
        }
        for (key, value) in &req.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(self.config.image.clone());
        args
    }
}

#[async_trait]
impl SandboxDriver for DockerDriver {
    async fn health_check(&self) -> Result<(), SandboxError> {
        self.docker(&["version", "--format", "{{.Server.Version}}"])
            .await
            .map(|v| debug!(version = %v, "docker available"))
            .map_err(|e| SandboxError::RuntimeUnavailable(e.to_string()))
    }

    async fn create_sandbox(&self, req: CreateSandbox) -> Result<String, SandboxError> {
        if !self.image_exists().await? {
            return Err(SandboxError::ImageMissing(self.config.image.clone()));
        }

        let name = Self::container_name(&req.session_id);
        match self.inspect_state(&name).await? {
            Some(state) if state == "running" => {
                info!(session = %req.session_id, "sandbox already running — reusing");
                return Ok(name);
            }
            Some(state) => {
                info!(session = %req.session_id, %state, "stale sandbox found — removing");
                self.docker(&["rm", "-f", &name]).await?;
            }
            None => {}
        }

        let args = self.run_args(&req);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.docker(&arg_refs).await?;
        info!(session = %req.session_id, container = %name, "sandbox created");
        Ok(name)
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), SandboxError> {
        let secs = grace.as_secs().to_string();
        self.docker(&["stop", "-t", &secs, container_id]).await?;
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), SandboxError> {
        self.docker(&["rm", "-f", container_id]).await?;
        Ok(())
    }

    async fn is_running(&self, container_id: &str) -> Result<bool, SandboxError> {
        Ok(self.inspect_state(container_id).await?.as_deref() == Some("running"))
    }

    async fn logs(&self, container_id: &str, tail: usize) -> Result<String, SandboxError> {
        let tail = tail.to_string();
        self.docker(&["logs", "--tail", &tail, container_id]).await
    }

    async fn list_with_label(&self, label: &str) -> Result<Vec<ContainerInfo>, SandboxError> {
        let filter = format!("label={label}");
        let out = self
            .docker(&[
                "ps",
                "-a",
                "--filter",
                &filter,
                "--format",
                "{{.ID}}\t{{.Names}}\t{{.State}}\t{{.Label \"hived.session\"}}",
            ])
            .await?;
        let mut infos = Vec::new();
        for line in out.lines().filter(|l| !l.is_empty()) {
            let mut parts = line.split('\t');
            let id = parts.next().unwrap_or_default().to_string();
            let name = parts.next().unwrap_or_default().to_string();
            let state = parts.next().unwrap_or_default().to_string();
            let session_id = parts
                .next()
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string());
            infos.push(ContainerInfo {
                id,
                name,
                state,
                session_id,
            });
        }
        Ok(infos)
    }

    async fn reap_exited(&self, label: &str) -> Result<usize, SandboxError> {
        let mut reaped = 0;
        for info in self.list_with_label(label).await? {
            if info.state == "exited" || info.state == "dead" || info.state == "created" {
                match self.remove(&info.id).await {
                    Ok(()) => reaped += 1,
                    Err(e) => warn!(container = %info.name, err = %e, "reap failed"),
                }
            }
        }
        if reaped > 0 {
            info!(count = reaped, "reaped stale sandboxes");
        }
        Ok(reaped)
    }
}
