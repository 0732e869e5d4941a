//! RPC metrics
//!
//! Two counters per endpoint, registered in a registry owned by the router so
//! several routers can live in one process (tests do this).

use crate::error::{Error, Result};
use prometheus::{CounterVec, Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

pub const RPC_CALL_METRIC: &str = "blockarray_csi_rpc_call";
pub const RPC_CALL_DURATION_METRIC: &str = "blockarray_csi_rpc_call_duration";

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

pub struct RpcMetrics {
    registry: Registry,
    calls: IntCounterVec,
    duration: CounterVec,
}

impl RpcMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let calls = IntCounterVec::new(
            Opts::new(RPC_CALL_METRIC, "Number of RPC calls by endpoint and outcome"),
            &["endpoint", "success"],
        )
        .map_err(metrics_error)?;
        let duration = CounterVec::new(
            Opts::new(
                RPC_CALL_DURATION_METRIC,
                "Total seconds spent serving RPC calls by endpoint",
            ),
            &["endpoint"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(calls.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(duration.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            calls,
            duration,
        })
    }

    pub fn observe(&self, endpoint: &str, success: bool, elapsed: Duration) {
        let success = if success { "true" } else { "false" };
        self.calls.with_label_values(&[endpoint, success]).inc();
        self.duration
            .with_label_values(&[endpoint])
            .inc_by(elapsed.as_secs_f64());
    }

    pub fn call_count(&self, endpoint: &str, success: bool) -> u64 {
        let success = if success { "true" } else { "false" };
        self.calls.with_label_values(&[endpoint, success]).get()
    }

    /// Text exposition format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics: {}", e)))
    }
}
