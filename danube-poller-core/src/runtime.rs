//! Process runtime: logging setup, signal handling and the scheduler
//! lifecycle.

use crate::scheduler::Scheduler;
use crate::ConnectorResult;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Initialize tracing/logging.
///
/// `RUST_LOG` wins over `default_filter`. Calling this twice is harmless.
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init();
}

/// Resolve once Ctrl-C or SIGTERM is received.
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Drives a [`Scheduler`] from start to signal-triggered stop.
pub struct PollerRuntime {
    scheduler: Arc<Scheduler>,
}

impl PollerRuntime {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Start the scheduler and run until a termination signal arrives.
    pub async fn run(&self) -> ConnectorResult<()> {
        self.run_until(wait_for_shutdown()).await
    }

    /// Start the scheduler and run until `shutdown` resolves, then stop it.
    ///
    /// Startup failures and stop failures are returned.
    pub async fn run_until<F>(&self, shutdown: F) -> ConnectorResult<()>
    where
        F: std::future::Future<Output = ()>,
    {
        info!("Starting poller runtime");
        self.scheduler.start().await?;

        shutdown.await;

        info!("Shutting down poller runtime");
        self.scheduler.stop().await?;
        info!("Poller runtime stopped");
        Ok(())
    }

    /// Process exit code for a finished run: 0 on clean stop, 1 otherwise.
    pub fn exit_code(result: &ConnectorResult<()>) -> i32 {
        match result {
            Ok(()) => 0,
            Err(e) => {
                error!("Poller runtime failed: {}", e);
                1
            }
        }
    }
}
