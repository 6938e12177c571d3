//! Prometheus metrics for the control plane

use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Counters and gauges exposed on the metrics endpoint
#[derive(Clone)]
pub struct ApiMetrics {
    registry: Registry,
    /// Handled requests by resource kind, operation and outcome
    pub requests: IntCounterVec,
    pub secret_rotations: IntCounter,
    pub apply_queue_depth: IntGauge,
    pub apply_retries: IntCounter,
    pub apply_failures: IntCounter,
}

impl ApiMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("dbaas".to_string()), None)
            .map_err(|e| Error::Internal(format!("metrics registry: {}", e)))?;

        let requests = IntCounterVec::new(
            Opts::new("api_requests_total", "API requests by kind, operation and outcome"),
            &["kind", "operation", "outcome"],
        )
        .map_err(metric_error)?;
        let secret_rotations = IntCounter::new(
            "secret_rotations_total",
            "Credentials replaced through backup storage updates",
        )
        .map_err(metric_error)?;
        let apply_queue_depth =
            IntGauge::new("apply_queue_depth", "Orchestrator commands waiting to run")
                .map_err(metric_error)?;
        let apply_retries =
            IntCounter::new("apply_retries_total", "Orchestrator command retries")
                .map_err(metric_error)?;
        let apply_failures = IntCounter::new(
            "apply_failures_total",
            "Orchestrator commands abandoned after retries",
        )
        .map_err(metric_error)?;

        registry
            .register(Box::new(requests.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(secret_rotations.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(apply_queue_depth.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(apply_retries.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(apply_failures.clone()))
            .map_err(metric_error)?;

        Ok(Self {
            registry,
            requests,
            secret_rotations,
            apply_queue_depth,
            apply_retries,
            apply_failures,
        })
    }

    /// Count a handled request
    pub fn observe(&self, kind: &str, operation: &str, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        self.requests
            .with_label_values(&[kind, operation, outcome])
            .inc();
    }

    /// Render every metric in the text exposition format
    pub fn render(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
