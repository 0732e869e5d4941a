//! RPC Router
//!
//! JSON-over-HTTP rendition of the storage plugin contract: every method is
//! `POST /csi.v1.<Service>/<Method>` with the request struct as body. Errors
//! come back as [`ApiErrorResponse`] with an HTTP status derived from the
//! error's [`RpcCode`].

use crate::api::metrics::RpcMetrics;
use crate::controlplane::controller::ControllerService;
use crate::domain::request::*;
use crate::error::{Error, Result, RpcCode};
use crate::node::agent::NodeAgent;
use axum::{
    extract::{Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

// =============================================================================
// Error Rendering
// =============================================================================

/// API error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub code: RpcCode,
    pub message: String,
}

/// HTTP status carrying each protocol status kind
pub fn http_status(code: RpcCode) -> StatusCode {
    match code {
        RpcCode::InvalidArgument | RpcCode::OutOfRange => StatusCode::BAD_REQUEST,
        RpcCode::NotFound => StatusCode::NOT_FOUND,
        RpcCode::AlreadyExists | RpcCode::Aborted => StatusCode::CONFLICT,
        RpcCode::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        RpcCode::ResourceExhausted => StatusCode::INSUFFICIENT_STORAGE,
        RpcCode::Unauthenticated => StatusCode::UNAUTHORIZED,
        RpcCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        RpcCode::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        RpcCode::Internal | RpcCode::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let body = ApiErrorResponse {
            code,
            message: self.0.to_string(),
        };
        (http_status(code), Json(body)).into_response()
    }
}

/// Body of methods that return nothing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Empty {}

// =============================================================================
// Router
// =============================================================================

/// Services behind one listener; a process serves the controller, the node or both
#[derive(Clone)]
pub struct AppState {
    controller: Option<Arc<ControllerService>>,
    node: Option<Arc<NodeAgent>>,
    metrics: Arc<RpcMetrics>,
}

impl AppState {
    fn controller(&self) -> Result<&ControllerService> {
        self.controller
            .as_deref()
            .ok_or_else(|| Error::Unimplemented("controller service is not served here".into()))
    }

    fn node(&self) -> Result<&NodeAgent> {
        self.node
            .as_deref()
            .ok_or_else(|| Error::Unimplemented("node service is not served here".into()))
    }
}

pub struct CsiRouter {
    state: AppState,
}

impl CsiRouter {
    pub fn new(metrics: Arc<RpcMetrics>) -> Self {
        Self {
            state: AppState {
                controller: None,
                node: None,
                metrics,
            },
        }
    }

    pub fn with_controller(mut self, controller: Arc<ControllerService>) -> Self {
        self.state.controller = Some(controller);
        self
    }

    pub fn with_node(mut self, node: Arc<NodeAgent>) -> Self {
        self.state.node = Some(node);
        self
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        Router::new()
            // Identity
            .route("/csi.v1.Identity/GetPluginInfo", post(get_plugin_info))
            .route("/csi.v1.Identity/GetPluginCapabilities", post(get_plugin_capabilities))
            .route("/csi.v1.Identity/Probe", post(probe))
            // Controller
            .route("/csi.v1.Controller/CreateVolume", post(create_volume))
            .route("/csi.v1.Controller/DeleteVolume", post(delete_volume))
            .route("/csi.v1.Controller/ControllerPublishVolume", post(controller_publish_volume))
            .route("/csi.v1.Controller/ControllerUnpublishVolume", post(controller_unpublish_volume))
            .route("/csi.v1.Controller/ControllerExpandVolume", post(controller_expand_volume))
            .route("/csi.v1.Controller/ValidateVolumeCapabilities", post(validate_volume_capabilities))
            .route("/csi.v1.Controller/CreateSnapshot", post(create_snapshot))
            .route("/csi.v1.Controller/DeleteSnapshot", post(delete_snapshot))
            .route("/csi.v1.Controller/ListSnapshots", post(list_snapshots))
            .route("/csi.v1.Controller/ControllerGetCapabilities", post(controller_get_capabilities))
            // Node
            .route("/csi.v1.Node/NodePublishVolume", post(node_publish_volume))
            .route("/csi.v1.Node/NodeUnpublishVolume", post(node_unpublish_volume))
            .route("/csi.v1.Node/NodeExpandVolume", post(node_expand_volume))
            .route("/csi.v1.Node/NodeGetInfo", post(node_get_info))
            .route("/csi.v1.Node/NodeGetCapabilities", post(node_get_capabilities))
            // Operations
            .route("/healthz", get(health_check))
            .route("/metrics", get(metrics))
            .with_state(self.state)
    }
}

/// Run one RPC with routine logging and metrics around it
async fn dispatch<T, F>(state: &AppState, endpoint: &'static str, call: F) -> Response
where
    T: Serialize,
    F: Future<Output = Result<T>>,
{
    info!(endpoint, "ROUTINE START");
    let started = Instant::now();
    let result = call.await;
    state.metrics.observe(endpoint, result.is_ok(), started.elapsed());

    match result {
        Ok(body) => {
            info!(endpoint, "ROUTINE END");
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            error!(endpoint, code = %e.code(), error = %e, "ROUTINE END");
            ApiError(e).into_response()
        }
    }
}

// =============================================================================
// Identity Handlers
// =============================================================================

async fn get_plugin_info(State(state): State<AppState>) -> Response {
    dispatch(&state, "GetPluginInfo", async {
        match (&state.controller, &state.node) {
            (Some(controller), _) => Ok(controller.plugin_info()),
            (None, Some(node)) => Ok(node.plugin_info()),
            (None, None) => Err(Error::Unimplemented("no service is served here".into())),
        }
    })
    .await
}

async fn get_plugin_capabilities(State(state): State<AppState>) -> Response {
    dispatch(&state, "GetPluginCapabilities", async {
        match (&state.controller, &state.node) {
            (Some(controller), _) => Ok(controller.plugin_capabilities()),
            (None, Some(node)) => Ok(node.plugin_capabilities()),
            (None, None) => Err(Error::Unimplemented("no service is served here".into())),
        }
    })
    .await
}

async fn probe(State(state): State<AppState>) -> Response {
    dispatch(&state, "Probe", async {
        if let Some(node) = &state.node {
            node.probe().await?;
        }
        match &state.controller {
            Some(controller) => Ok(controller.probe()),
            None => Ok(ProbeResponse { ready: true }),
        }
    })
    .await
}

// =============================================================================
// Controller Handlers
// =============================================================================

async fn create_volume(
    State(state): State<AppState>,
    Json(request): Json<CreateVolumeRequest>,
) -> Response {
    dispatch(&state, "CreateVolume", async {
        state.controller()?.create_volume(request).await
    })
    .await
}

async fn delete_volume(
    State(state): State<AppState>,
    Json(request): Json<DeleteVolumeRequest>,
) -> Response {
    dispatch(&state, "DeleteVolume", async {
        state.controller()?.delete_volume(request).await?;
        Ok(Empty {})
    })
    .await
}

async fn controller_publish_volume(
    State(state): State<AppState>,
    Json(request): Json<ControllerPublishVolumeRequest>,
) -> Response {
    dispatch(&state, "ControllerPublishVolume", async {
        state.controller()?.publish_volume(request).await
    })
    .await
}

async fn controller_unpublish_volume(
    State(state): State<AppState>,
    Json(request): Json<ControllerUnpublishVolumeRequest>,
) -> Response {
    dispatch(&state, "ControllerUnpublishVolume", async {
        state.controller()?.unpublish_volume(request).await?;
        Ok(Empty {})
    })
    .await
}

async fn controller_expand_volume(
    State(state): State<AppState>,
    Json(request): Json<ControllerExpandVolumeRequest>,
) -> Response {
    dispatch(&state, "ControllerExpandVolume", async {
        state.controller()?.expand_volume(request).await
    })
    .await
}

async fn validate_volume_capabilities(
    State(state): State<AppState>,
    Json(request): Json<ValidateVolumeCapabilitiesRequest>,
) -> Response {
    dispatch(&state, "ValidateVolumeCapabilities", async {
        state.controller()?.validate_volume_capabilities(request).await
    })
    .await
}

async fn create_snapshot(
    State(state): State<AppState>,
    Json(request): Json<CreateSnapshotRequest>,
) -> Response {
    dispatch(&state, "CreateSnapshot", async {
        state.controller()?.create_snapshot(request).await
    })
    .await
}

async fn delete_snapshot(
    State(state): State<AppState>,
    Json(request): Json<DeleteSnapshotRequest>,
) -> Response {
    dispatch(&state, "DeleteSnapshot", async {
        state.controller()?.delete_snapshot(request).await?;
        Ok(Empty {})
    })
    .await
}

async fn list_snapshots(
    State(state): State<AppState>,
    Json(request): Json<ListSnapshotsRequest>,
) -> Response {
    dispatch(&state, "ListSnapshots", async {
        state.controller()?.list_snapshots(request).await
    })
    .await
}

async fn controller_get_capabilities(State(state): State<AppState>) -> Response {
    dispatch(&state, "ControllerGetCapabilities", async {
        Ok(state.controller()?.capabilities())
    })
    .await
}

// =============================================================================
// Node Handlers
// =============================================================================

async fn node_publish_volume(
    State(state): State<AppState>,
    Json(request): Json<NodePublishVolumeRequest>,
) -> Response {
    dispatch(&state, "NodePublishVolume", async {
        state.node()?.publish_volume(request).await?;
        Ok(Empty {})
    })
    .await
}

async fn node_unpublish_volume(
    State(state): State<AppState>,
    Json(request): Json<NodeUnpublishVolumeRequest>,
) -> Response {
    dispatch(&state, "NodeUnpublishVolume", async {
        state.node()?.unpublish_volume(request).await?;
        Ok(Empty {})
    })
    .await
}

async fn node_expand_volume(
    State(state): State<AppState>,
    Json(request): Json<NodeExpandVolumeRequest>,
) -> Response {
    dispatch(&state, "NodeExpandVolume", async {
        state.node()?.expand_volume(request).await
    })
    .await
}

async fn node_get_info(State(state): State<AppState>) -> Response {
    dispatch(&state, "NodeGetInfo", async { state.node()?.get_info().await }).await
}

async fn node_get_capabilities(State(state): State<AppState>) -> Response {
    dispatch(&state, "NodeGetCapabilities", async {
        Ok(state.node()?.capabilities())
    })
    .await
}

// =============================================================================
// Operational Endpoints
// =============================================================================

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}
