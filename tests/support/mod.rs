//! Shared test harness: boots a real daemon on a free port with a fake
//! container driver and a throwaway data dir, plus WebSocket helpers.
//!
//! Not every test binary uses every helper.
#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use hived::config::DaemonConfig;
use hived::sandbox::{ContainerInfo, CreateSandbox, SandboxDriver, SandboxError};
use hived::session::SupervisionConfig;
use hived::storage::Storage;
use hived::AppContext;

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ─── Fake driver ─────────────────────────────────────────────────────────────

/// In-memory stand-in for the Docker CLI. Tracks created containers and can
/// be told to fail the next N spawns.
pub struct FakeDriver {
    pub create_calls: AtomicUsize,
    pub failures_remaining: AtomicUsize,
    running: Mutex<HashSet<String>>,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            create_calls: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(0),
            running: Mutex::new(HashSet::new()),
        })
    }

    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn create_count(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub async fn is_container_running(&self, id: &str) -> bool {
        self.running.lock().await.contains(id)
    }
}

#[async_trait]
impl SandboxDriver for FakeDriver {
    async fn health_check(&self) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn create_sandbox(&self, req: CreateSandbox) -> Result<String, SandboxError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(SandboxError::CommandFailed {
                command: "run".to_string(),
                stderr: "injected spawn failure".to_string(),
            });
        }
        let id = format!("fake-{}", req.session_id);
        self.running.lock().await.insert(id.clone());
        Ok(id)
    }

    async fn stop(&self, container_id: &str, _grace: Duration) -> Result<(), SandboxError> {
        self.running.lock().await.remove(container_id);
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), SandboxError> {
        self.running.lock().await.remove(container_id);
        Ok(())
    }

    async fn is_running(&self, container_id: &str) -> Result<bool, SandboxError> {
        Ok(self.running.lock().await.contains(container_id))
    }

    async fn logs(&self, _container_id: &str, _tail: usize) -> Result<String, SandboxError> {
        Ok(String::new())
    }

    async fn list_with_label(&self, _label: &str) -> Result<Vec<ContainerInfo>, SandboxError> {
        Ok(self
            .running
            .lock()
            .await
            .iter()
            .map(|id| ContainerInfo {
                id: id.clone(),
                name: id.clone(),
                state: "running".to_string(),
                session_id: None,
            })
            .collect())
    }

    async fn reap_exited(&self, _label: &str) -> Result<usize, SandboxError> {
        Ok(0)
    }
}

// ─── Daemon harness ──────────────────────────────────────────────────────────

pub struct Harness {
    pub ctx: Arc<AppContext>,
    pub driver: Arc<FakeDriver>,
    pub port: u16,
    /// Held so the data dir and repo dir outlive the test.
    _data_dir: tempfile::TempDir,
    pub repo_dir: tempfile::TempDir,
}

impl Harness {
    pub fn repo_path(&self) -> String {
        self.repo_dir.path().to_string_lossy().into_owned()
    }

    pub fn ws_url(&self, session_id: &str) -> String {
        format!("ws://127.0.0.1:{}/sessions/{session_id}/ws", self.port)
    }

    pub fn bridge_url(&self, session_id: &str) -> String {
        format!(
            "ws://127.0.0.1:{}/sessions/{session_id}/ws?type=sandbox",
            self.port
        )
    }

    pub async fn create_session(&self) -> String {
        let row = self
            .ctx
            .session_manager
            .create(serde_json::from_value(serde_json::json!({
                "repoPath": self.repo_path(),
                "title": "test session",
            })).unwrap())
            .await
            .unwrap();
        row.id
    }
}

/// Production-shaped supervision, but with timers far in the future so they
/// never fire mid-test.
pub fn quiet_supervision() -> SupervisionConfig {
    SupervisionConfig {
        inactivity: Duration::from_secs(3600),
        heartbeat_interval: Duration::from_secs(3600),
        heartbeat_timeout: Duration::from_secs(3600),
        ..SupervisionConfig::default()
    }
}

pub async fn start_daemon(supervision: SupervisionConfig) -> Harness {
    let data_dir = tempfile::tempdir().unwrap();
    let repo_dir = tempfile::tempdir().unwrap();
    init_git_repo(repo_dir.path());

    let port = free_port();
    let config = Arc::new(DaemonConfig::new(
        Some(port),
        Some("127.0.0.1".to_string()),
        Some(data_dir.path().to_path_buf()),
        None,
        None,
        Some("fake-image".to_string()),
        Some("warn".to_string()),
    ));
    let storage = Arc::new(Storage::new(data_dir.path()).await.unwrap());
    let driver = FakeDriver::new();
    let ctx = Arc::new(AppContext::new(
        config,
        storage,
        driver.clone(),
        supervision,
    ));

    let ctx_server = ctx.clone();
    tokio::spawn(async move {
        hived::server::run(ctx_server).await.ok();
    });

    // Give the server a moment to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Harness {
        ctx,
        driver,
        port,
        _data_dir: data_dir,
        repo_dir,
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// A repo with one commit on `main` so worktrees can branch from it.
pub fn init_git_repo(dir: &Path) {
    let run = |args: &[&str]| {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    };
    run(&["init", "-q", "-b", "main"]);
    run(&["config", "user.email", "test@example.com"]);
    run(&["config", "user.name", "test"]);
    std::fs::write(dir.join("README.md"), "hello\n").unwrap();
    run(&["add", "README.md"]);
    run(&["commit", "-q", "-m", "init"]);
}

// ─── WebSocket helpers ───────────────────────────────────────────────────────

pub async fn ws_connect(url: &str) -> Ws {
    let (ws, _) = connect_async(url).await.expect("ws connect failed");
    ws
}

pub async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Next JSON text frame, with a timeout so a missing broadcast fails the
/// test instead of hanging it.
pub async fn recv_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Read frames until one matches `pred`, failing after `secs` seconds.
pub async fn recv_until(ws: &mut Ws, secs: u64, pred: impl Fn(&Value) -> bool) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        assert!(!remaining.is_zero(), "timed out waiting for matching frame");
        let msg = tokio::time::timeout(remaining, ws.next())
            .await
            .expect("timed out waiting for matching frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            let value: Value = serde_json::from_str(&text).unwrap();
            if pred(&value) {
                return value;
            }
        }
    }
}

/// Subscribe a fresh client and return (socket, subscribed envelope).
pub async fn subscribe_client(h: &Harness, session_id: &str) -> (Ws, Value) {
    let mut ws = ws_connect(&h.ws_url(session_id)).await;
    send_json(&mut ws, serde_json::json!({"type": "subscribe"})).await;
    let envelope = recv_until(&mut ws, 5, |v| v["type"] == "subscribed").await;
    (ws, envelope)
}
