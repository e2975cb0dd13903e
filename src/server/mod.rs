//! HTTP gateway server

pub mod router;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use router::{AppState, create_router};

use crate::auth::CallerAuthenticator;
use crate::config::{BackendKind, Config};
use crate::identity::{Backends, LifecycleManager, TokenBroker};
use crate::{Error, Result};

/// Identity broker server
pub struct Server {
    /// Configuration
    config: Config,
    /// Shared handler state
    state: Arc<AppState>,
}

impl Server {
    /// Create a server over already constructed adapters
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn new(config: Config, backends: Backends) -> Result<Self> {
        config.validate()?;

        let manager = Arc::new(LifecycleManager::new(
            Arc::clone(&backends.store),
            Arc::clone(&backends.provider),
            config.google.project_id.clone(),
        ));
        let state = Arc::new(AppState {
            authenticator: Arc::new(CallerAuthenticator::from_config(&config.auth)),
            manager,
            broker: Arc::new(TokenBroker::new(backends.provider)),
            reclaim_after: config.lifecycle.reclaim_after,
            max_body_size: config.server.max_body_size,
        });

        Ok(Self { config, state })
    }

    /// Run the server until a shutdown signal arrives
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address is invalid, the port cannot be
    /// bound, or the server fails while running.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        let app = create_router(Arc::clone(&self.state));
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("IDBROKER v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(project = %self.config.google.project_id, "Managing identities");
        info!(issuer = %self.config.auth.issuer, claim = %self.config.auth.claim, "Caller authentication");
        info!(
            reclaim_after = ?self.config.lifecycle.reclaim_after,
            "Identities are reclaimed after this much inactivity"
        );
        if self.config.backend == BackendKind::Memory {
            warn!("MEMORY backend - identities are not real and vanish on restart");
        }
        info!("============================================================");

        let reclaimer = self.config.lifecycle.reclaim_interval.map(|every| {
            info!(interval = ?every, "Periodic reclamation enabled");
            spawn_reclaimer(
                Arc::clone(&self.state.manager),
                self.config.lifecycle.reclaim_after,
                every,
                shutdown_tx.subscribe(),
            )
        });

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        if let Some(handle) = reclaimer {
            let _ = handle.await;
        }
        info!("Server stopped");

        Ok(())
    }
}

/// Sweep expired identities every `every` until `shutdown` fires.
///
/// The first sweep runs immediately.
pub fn spawn_reclaimer(
    manager: Arc<LifecycleManager>,
    ttl: Duration,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = manager.reclaim_expired(ttl).await {
                        warn!(error = %e, "Reclamation sweep failed");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Reclaimer shutting down");
                    break;
                }
            }
        }
    })
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
