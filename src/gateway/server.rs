//! Gateway server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, info, warn};

use super::auth::Authenticator;
use super::forwarder::{HttpUpstream, Upstream};
use super::pipeline::Pipeline;
use super::provider::build_authenticator;
use super::router::{AppState, create_router};
use super::session::SessionStore;
use crate::config::{Config, ServerOverrides};
use crate::config_reload::{ConfigWatcher, LiveConfig};
use crate::{Error, Result};

/// Route-service gateway server
pub struct Gateway {
    /// Live configuration
    live_config: Arc<LiveConfig>,
    /// Config file to watch, if any
    config_path: Option<PathBuf>,
    /// Command-line listener settings, re-applied on reload
    overrides: ServerOverrides,
    /// Authentication capability
    authenticator: Arc<dyn Authenticator>,
    /// Destination transport
    upstream: Arc<dyn Upstream>,
    /// Session storage
    sessions: Arc<SessionStore>,
}

impl Gateway {
    /// Create a gateway with the production authenticator and transport
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Result<Self> {
        config.validate()?;
        let authenticator = build_authenticator(&config)?;
        let upstream: Arc<dyn Upstream> = Arc::new(HttpUpstream::new(&config.upstream)?);
        Ok(Self::with_capabilities(config, config_path, authenticator, upstream))
    }

    /// Create a gateway over explicit capabilities
    pub fn with_capabilities(
        config: Config,
        config_path: Option<PathBuf>,
        authenticator: Arc<dyn Authenticator>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        Self {
            live_config: Arc::new(LiveConfig::new(config)),
            config_path,
            overrides: ServerOverrides::default(),
            authenticator,
            upstream,
            sessions: Arc::new(SessionStore::new()),
        }
    }

    /// Keep command-line listener settings across config reloads
    #[must_use]
    pub fn with_overrides(mut self, overrides: ServerOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Shared application state for the router
    #[must_use]
    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            pipeline: Pipeline::new(
                Arc::clone(&self.live_config),
                Arc::clone(&self.authenticator),
                Arc::clone(&self.upstream),
                Arc::clone(&self.sessions),
            ),
            live_config: Arc::clone(&self.live_config),
        })
    }

    /// Run the gateway until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let config = self.live_config.get();
        let addr = SocketAddr::new(
            config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let _config_watcher = match &self.config_path {
            Some(path) => match ConfigWatcher::start(
                path.clone(),
                self.overrides.clone(),
                Arc::clone(&self.live_config),
                Arc::clone(&self.authenticator),
                shutdown_tx.subscribe(),
            ) {
                Ok(w) => {
                    info!(path = %path.display(), "Config hot-reload enabled");
                    Some(w)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to start config watcher, hot-reload disabled");
                    None
                }
            },
            None => None,
        };

        // Session sweeper
        let sessions = Arc::clone(&self.sessions);
        let live_config = Arc::clone(&self.live_config);
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let idle = live_config.get().session.idle_timeout;
                        let evicted = sessions.evict_idle(idle);
                        if evicted > 0 {
                            debug!(evicted, "Evicted idle sessions");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        let app = create_router(self.app_state());
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("ROUTE AUTH GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %config.server.host, port = %config.server.port, "Listening");
        info!(provider = self.authenticator.name(), "Authentication provider");
        if config.bypass_enabled() {
            warn!("AUTHENTICATION BYPASSED - every request asserts the fallback identity");
        }
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
