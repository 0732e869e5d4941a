//! API Server
//!
//! Serves the RPC router on one listener until the shutdown token fires.

use crate::api::metrics::RpcMetrics;
use crate::api::rest::CsiRouter;
use crate::controlplane::controller::ControllerService;
use crate::error::{Error, Result};
use crate::node::agent::NodeAgent;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Listener address
    pub bind_addr: SocketAddr,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 10000)),
            request_timeout_secs: 120,
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

pub struct ApiServer {
    config: ApiServerConfig,
    controller: Option<Arc<ControllerService>>,
    node: Option<Arc<NodeAgent>>,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Self {
        Self {
            config,
            controller: None,
            node: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_controller(mut self, controller: Arc<ControllerService>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_node(mut self, node: Arc<NodeAgent>) -> Self {
        self.node = Some(node);
        self
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn router(&self) -> Result<axum::Router> {
        let metrics = Arc::new(RpcMetrics::new()?);
        let mut router = CsiRouter::new(metrics);
        if let Some(controller) = &self.controller {
            router = router.with_controller(controller.clone());
        }
        if let Some(node) = &self.node {
            router = router.with_node(node.clone());
        }

        Ok(router
            .build()
            .layer(TimeoutLayer::new(Duration::from_secs(
                self.config.request_timeout_secs,
            )))
            .layer(TraceLayer::new_for_http()))
    }

    /// Serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let app = self.router()?;
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| {
                Error::Configuration(format!("failed to bind {}: {}", self.config.bind_addr, e))
            })?;

        info!(
            addr = %self.config.bind_addr,
            controller = self.controller.is_some(),
            node = self.node.is_some(),
            "API server listening"
        );

        let shutdown = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("API server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("API server error: {}", e)))?;

        Ok(())
    }
}
