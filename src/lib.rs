pub mod config;
pub mod doctor;
pub mod ids;
pub mod registry;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod storage;
pub mod worktree;

use std::sync::Arc;

use config::DaemonConfig;
use registry::{ConnectionRegistry, SharedRegistry};
use sandbox::SandboxDriver;
use session::SessionManager;
use storage::Storage;

/// Shared application state passed to every handler and background task.
///
/// Constructed once at start-up; the three singletons (storage, registry,
/// session manager) live for the process lifetime and are torn down in LIFO
/// order on shutdown.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub storage: Arc<Storage>,
    pub registry: SharedRegistry,
    pub driver: Arc<dyn SandboxDriver>,
    pub session_manager: Arc<SessionManager>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    /// Wire the singletons together for a given config and driver.
    pub fn new(
        config: Arc<DaemonConfig>,
        storage: Arc<Storage>,
        driver: Arc<dyn SandboxDriver>,
        supervision: session::SupervisionConfig,
    ) -> Self {
        let registry: SharedRegistry = Arc::new(ConnectionRegistry::new());
        let worktrees = Arc::new(worktree::WorktreeManager::new(
            config.worktrees_dir.clone(),
        ));
        let session_manager = Arc::new(SessionManager::new(
            storage.clone(),
            registry.clone(),
            driver.clone(),
            worktrees,
            config.port,
            config.forwarded_env.clone(),
            supervision,
        ));
        Self {
            config,
            storage,
            registry,
            driver,
            session_manager,
            started_at: std::time::Instant::now(),
        }
    }
}
