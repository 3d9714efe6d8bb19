//! Bridge server bootstrap

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use super::router::{create_router, AppState, RegisteredApi};
use crate::bridge::{BridgeService, HostApi};
use crate::config::BridgeConfig;
use crate::openapi::Document;
use crate::store::RedisUtteranceStore;
use crate::{Error, Result};

/// The NL bridge server
pub struct Bridge {
    config: BridgeConfig,
    bridge: Arc<BridgeService>,
    apis: Vec<RegisteredApi>,
}

impl Bridge {
    /// Create a bridge: connect the utterance store and load every
    /// registered API document.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or a document fails to
    /// load.
    pub async fn new(config: BridgeConfig) -> Result<Self> {
        let store = Arc::new(RedisUtteranceStore::connect(&config.store.url).await?);
        let bridge = Arc::new(BridgeService::new(&config, store));

        let mut apis = Vec::with_capacity(config.apis.len());
        for (api_id, entry) in &config.apis {
            let document = Arc::new(Document::from_file(&entry.spec_path)?);
            let host = match HostApi::from_document(Arc::clone(&document)) {
                Ok(host) => host,
                // No extension in the document: identity comes from the entry
                Err(_) => HostApi {
                    api_id: api_id.clone(),
                    listen_path: entry.listen_path.clone(),
                    document,
                },
            };
            info!(api_id = %host.api_id, listen_path = %host.listen_path, "Registered API");
            apis.push(RegisteredApi {
                host,
                upstream_url: entry.upstream_url.clone(),
            });
        }

        Ok(Self {
            config,
            bridge,
            apis,
        })
    }

    /// Access the owning service (used by tests)
    #[must_use]
    pub fn service(&self) -> Arc<BridgeService> {
        Arc::clone(&self.bridge)
    }

    /// Run the server until shutdown
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind or the server fails.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let state = Arc::new(AppState {
            bridge: Arc::clone(&self.bridge),
            apis: self.apis.clone(),
            upstream: reqwest::Client::builder()
                .timeout(self.config.server.request_timeout)
                .build()
                .map_err(|e| Error::Internal(e.to_string()))?,
        });

        let app = create_router(state);
        let listener = TcpListener::bind(addr).await?;

        info!(
            host = %self.config.server.host,
            port = self.config.server.port,
            apis = self.apis.len(),
            "NL bridge listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Shutting down MCP clients...");
        self.bridge.mcp().teardown().await;

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
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
}
