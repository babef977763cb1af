use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hived::{
    config::DaemonConfig,
    sandbox::{DockerConfig, DockerDriver, SandboxDriver, MANAGED_LABEL},
    session::SupervisionConfig,
    storage::Storage,
    AppContext,
};

#[derive(Parser)]
#[command(
    name = "hived",
    about = "hived — background coding-agent control plane daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// HTTP + WebSocket server port
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Data directory for the SQLite database and config file
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Directory holding per-session git worktrees
    #[arg(long, env = "WORKTREES_DIR")]
    worktrees_dir: Option<std::path::PathBuf>,

    /// Directory scanned for host repositories
    #[arg(long, env = "REPOS_DIR")]
    repos_dir: Option<std::path::PathBuf>,

    /// Container image for session sandboxes
    #[arg(long, env = "SANDBOX_IMAGE")]
    sandbox_image: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "HIVED_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "HIVED_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon server (default when no subcommand given).
    Serve,
    /// Run pre-flight diagnostic checks and exit.
    Doctor,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = Arc::new(DaemonConfig::new(
        args.port,
        args.host,
        args.data_dir,
        args.worktrees_dir,
        args.repos_dir,
        args.sandbox_image,
        args.log,
    ));

    // Keep the file-appender guard alive for the process lifetime.
    let _log_guard = init_tracing(&config.log, args.log_file.as_deref());

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(serve(config))
        }
        Command::Doctor => run_doctor(&config),
    }
}

fn run_doctor(config: &DaemonConfig) -> Result<()> {
    let results = hived::doctor::run_doctor(config);
    let mut all_passed = true;
    for check in &results {
        let marker = if check.passed { "ok" } else { "FAIL" };
        println!("[{marker:>4}] {} — {}", check.name, check.detail);
        all_passed &= check.passed;
    }
    if all_passed {
        Ok(())
    } else {
        std::process::exit(1)
    }
}

fn init_tracing(
    level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "hived.log".to_string());
            let appender = tracing_appender::rolling::daily(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

async fn serve(config: Arc<DaemonConfig>) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        "starting hived"
    );

    let storage = Arc::new(Storage::new(&config.data_dir).await?);

    // Reconcile persisted state with reality before accepting traffic: rows
    // left in transient sandbox states by a previous process go back to
    // `stopped`, and exited containers carrying our label are removed.
    let recovered = storage.recover_stale_sandboxes().await?;
    if recovered > 0 {
        info!(count = recovered, "recovered stale sandbox records");
    }
    match hived::worktree::cleanup::remove_orphan_worktrees(&config.worktrees_dir, &storage).await
    {
        Ok(0) => {}
        Ok(n) => info!(count = n, "removed orphan worktrees"),
        Err(e) => warn!(err = %e, "orphan worktree sweep failed"),
    }

    let mut sandbox_config = DockerConfig::new(config.sandbox_image.clone());
    sandbox_config.cpus = config.sandbox_cpus;
    sandbox_config.memory_gb = config.sandbox_memory_gb;
    let driver: Arc<dyn SandboxDriver> = Arc::new(DockerDriver::new(sandbox_config));

    match driver.health_check().await {
        Ok(()) => {
            if let Err(e) = driver.reap_exited(MANAGED_LABEL).await {
                warn!(err = %e, "sandbox reap failed");
            }
        }
        Err(e) => {
            // The daemon still serves reads and queues prompts; spawns will
            // fail with a clear error until the runtime comes back.
            warn!(err = %e, "container runtime unavailable at startup");
        }
    }

    let ctx = Arc::new(AppContext::new(
        config,
        storage,
        driver,
        SupervisionConfig::default(),
    ));

    hived::server::run(ctx).await
}
