//! Server lifecycle: bind, serve, background maintenance, graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use gla_config::Config;
use gla_core::Orchestrator;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::coordinator::Coordinator;
use crate::routes::{create_router, AppState};

pub struct GlaServer {
    config: Config,
    coordinator: Arc<Coordinator>,
}

impl GlaServer {
    /// Build the server and everything it depends on from configuration.
    pub fn new(config: Config) -> Result<Self> {
        let orchestrator = Orchestrator::from_config(&config).context("Failed to initialize analysis engine")?;
        Ok(Self::with_orchestrator(config, Arc::new(orchestrator)))
    }

    pub fn with_orchestrator(config: Config, orchestrator: Arc<Orchestrator>) -> Self {
        let retention = Duration::from_secs(config.server.session_retention_secs);
        Self {
            coordinator: Arc::new(Coordinator::new(orchestrator, retention)),
            config,
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn router(&self) -> Router {
        let state = AppState::new(
            self.coordinator.clone(),
            Duration::from_secs(self.config.server.request_timeout_secs),
        );
        create_router(state, self.config.server.max_body_bytes)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        addr.parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen address {}", addr))
    }

    /// Bind the configured address and serve until Ctrl+C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let addr = self.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;

        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            signal_token.cancel();
        });

        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener until `shutdown` is cancelled.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local = listener.local_addr().context("Listener has no local address")?;
        info!("Server listening on http://{}", local);

        let cache = self.coordinator.orchestrator().cache().clone();
        let sweep_interval = Duration::from_secs(self.config.cache.sweep_interval_secs.max(1));
        let sweeper = cache.spawn_sweeper(sweep_interval, shutdown.child_token());
        let pruner = self.coordinator.spawn_pruner(sweep_interval, shutdown.child_token());

        let app = self.router();
        let graceful = shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { graceful.cancelled().await })
            .await
            .context("Server error")?;

        shutdown.cancel();
        let _ = tokio::join!(sweeper, pruner);
        info!("Server stopped");
        Ok(())
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
                info!("Received TERM signal");
            }
            Err(e) => {
                error!("Failed to install TERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
