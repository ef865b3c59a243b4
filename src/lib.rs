//! Edge compute node scheduler: fair-share job admission, dispatch, and
//! lifecycle management over a container runtime (see `SPEC_FULL.md`).

pub mod config;
pub mod error;
pub mod handler;
pub mod host;
pub mod message;
pub mod monitor;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod tls;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use config::Config;
use handler::RequestHandler;
use host::HostProbe;
use monitor::Monitor;
use runtime::{BollardRuntime, RuntimeAdapter};
use scheduler::Scheduler;
use store::Store;

/// The three long-lived components (§5), each its own cooperative task
/// cancelled through a shared `CancellationToken` rather than the original's
/// `threading.Event`.
pub struct Node {
    token: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Node {
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let store = Store::open(&config.database_path).await?;
        let runtime: Arc<dyn RuntimeAdapter> = Arc::new(BollardRuntime::connect()?);
        let host = Arc::new(HostProbe::new());

        let token = CancellationToken::new();

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&config),
            store.clone(),
            Arc::clone(&runtime),
            Arc::clone(&host),
        ));
        let monitor = Arc::new(Monitor::new(Arc::clone(&config), store.clone(), Arc::clone(&runtime)));
        let handler = Arc::new(RequestHandler::new(Arc::clone(&config), store));

        let handles = vec![
            scheduler.start(token.clone()),
            monitor.start(token.clone()),
            handler.start(token.clone()),
        ];

        info!(
            max_jobs = config.max_jobs,
            strategy = ?config.strategy,
            "edge scheduler started"
        );

        Ok(Self { token, handles })
    }

    /// Signals every component to stop and waits for the scheduler's own
    /// shutdown sequence (stop all containers, prune) to complete.
    pub async fn shutdown(self) {
        self.token.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("edge scheduler stopped");
    }
}
