use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_PORT: u16 = 8720;
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_SANDBOX_IMAGE: &str = "hived-sandbox:latest";
const DEFAULT_SANDBOX_CPUS: f64 = 2.0;
const DEFAULT_SANDBOX_MEMORY_GB: u64 = 4;
/// Model used when neither the message nor the session names one.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// HTTP + WebSocket server port (default: 8720).
    port: Option<u16>,
    /// Bind address (default: 127.0.0.1).
    host: Option<String>,
    /// Directory holding session worktrees (default: {data_dir}/worktrees).
    worktrees_dir: Option<PathBuf>,
    /// Directory scanned for host repositories by GET /repos.
    repos_dir: Option<PathBuf>,
    /// Container image for session sandboxes.
    sandbox_image: Option<String>,
    /// CPU limit per sandbox (default: 2).
    sandbox_cpus: Option<f64>,
    /// Memory limit per sandbox in GiB (default: 4).
    sandbox_memory_gb: Option<u64>,
    /// Log level filter string, e.g. "debug", "info,hived=trace" (default: "info").
    log: Option<String>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            tracing::error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── DaemonConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub port: u16,
    pub host: String,
    pub data_dir: PathBuf,
    pub worktrees_dir: PathBuf,
    /// Optional root directory of host repositories, scanned by GET /repos.
    pub repos_dir: Option<PathBuf>,
    pub sandbox_image: String,
    pub sandbox_cpus: f64,
    pub sandbox_memory_gb: u64,
    pub log: String,
    /// LLM API keys lifted from the daemon's own environment, forwarded into
    /// every sandbox through the secret overlay.
    pub forwarded_env: Vec<(String, String)>,
}

impl DaemonConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        host: Option<String>,
        data_dir: Option<PathBuf>,
        worktrees_dir: Option<PathBuf>,
        repos_dir: Option<PathBuf>,
        sandbox_image: Option<String>,
        log: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let host = host
            .or(toml.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let worktrees_dir = worktrees_dir
            .or(toml.worktrees_dir)
            .unwrap_or_else(|| data_dir.join("worktrees"));
        let repos_dir = repos_dir.or(toml.repos_dir);
        let sandbox_image = sandbox_image
            .or(toml.sandbox_image)
            .unwrap_or_else(|| DEFAULT_SANDBOX_IMAGE.to_string());
        let sandbox_cpus = toml.sandbox_cpus.unwrap_or(DEFAULT_SANDBOX_CPUS);
        let sandbox_memory_gb = toml.sandbox_memory_gb.unwrap_or(DEFAULT_SANDBOX_MEMORY_GB);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        Self {
            port,
            host,
            data_dir,
            worktrees_dir,
            repos_dir,
            sandbox_image,
            sandbox_cpus,
            sandbox_memory_gb,
            log,
            forwarded_env: collect_forwarded_env(std::env::vars()),
        }
    }
}

/// Pick the LLM credential variables out of an environment snapshot.
///
/// Anything ending in `_API_KEY`, plus the well-known `ANTHROPIC_*` /
/// `OPENAI_*` auth variables, is forwarded into sandboxes.
fn collect_forwarded_env(vars: impl Iterator<Item = (String, String)>) -> Vec<(String, String)> {
    let mut keys: Vec<(String, String)> = vars
        .filter(|(k, v)| !v.is_empty() && is_forwarded_key(k))
        .collect();
    keys.sort();
    keys
}

fn is_forwarded_key(key: &str) -> bool {
    key.ends_with("_API_KEY")
        || key.starts_with("ANTHROPIC_")
        || key.starts_with("OPENAI_")
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("hived");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("hived");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("hived");
        }
    }
    // Fallback
    PathBuf::from(".hived")
}
