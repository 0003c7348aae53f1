//! Prometheus Metrics
//!
//! Collectors for provisioning calls, reconciliations and work queue
//! retries. Each [`Metrics`] owns its registry, which the metrics server
//! encodes on `/metrics`.

use crate::error::{Error, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

const NAMESPACE: &str = "localpv";

/// Provisioner metrics
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Controller calls by operation and result kind
    pub operations: IntCounterVec,
    /// Controller call latency by operation
    pub operation_duration: HistogramVec,
    /// Reconcile passes by record kind and result
    pub reconciles: IntCounterVec,
    /// Rate-limited requeues by record kind
    pub requeues: IntCounterVec,
}

impl Metrics {
    /// Create the collectors and register them
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new("operations_total", "Controller operations by result").namespace(NAMESPACE),
            &["operation", "result"],
        )
        .map_err(metrics_error)?;
        let operation_duration = HistogramVec::new(
            HistogramOpts::new("operation_duration_seconds", "Duration of controller operations")
                .namespace(NAMESPACE),
            &["operation"],
        )
        .map_err(metrics_error)?;
        let reconciles = IntCounterVec::new(
            Opts::new("reconciles_total", "Reconcile passes by result").namespace(NAMESPACE),
            &["kind", "result"],
        )
        .map_err(metrics_error)?;
        let requeues = IntCounterVec::new(
            Opts::new("requeues_total", "Rate-limited work queue requeues").namespace(NAMESPACE),
            &["kind"],
        )
        .map_err(metrics_error)?;

        registry.register(Box::new(operations.clone())).map_err(metrics_error)?;
        registry.register(Box::new(operation_duration.clone())).map_err(metrics_error)?;
        registry.register(Box::new(reconciles.clone())).map_err(metrics_error)?;
        registry.register(Box::new(requeues.clone())).map_err(metrics_error)?;

        Ok(Arc::new(Self {
            registry,
            operations,
            operation_duration,
            reconciles,
            requeues,
        }))
    }

    /// Record the outcome of a controller call
    pub fn record_operation<T>(&self, operation: &str, elapsed: Duration, result: &Result<T>) {
        let outcome = match result {
            Ok(_) => "ok".to_string(),
            Err(e) => format!("{:?}", e.kind()),
        };
        self.operations.with_label_values(&[operation, &outcome]).inc();
        self.operation_duration
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    /// Record one reconcile pass
    pub fn record_reconcile(&self, kind: &str, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.reconciles.with_label_values(&[kind, result]).inc();
    }

    /// Encode all collectors in the text exposition format
    pub fn encode(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok(buffer)
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_recorded_series() {
        let metrics = Metrics::new().unwrap();
        let ok: Result<()> = Ok(());
        let failed: Result<()> = Err(Error::not_found("LocalVolume", "pvc-1"));
        metrics.record_operation("CreateVolume", Duration::from_millis(3), &ok);
        metrics.record_operation("CreateVolume", Duration::from_millis(3), &failed);
        metrics.record_reconcile("LocalVolume", true);
        metrics.requeues.with_label_values(&["LocalVolume"]).inc();

        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains("localpv_operations_total{operation=\"CreateVolume\",result=\"ok\"} 1"));
        assert!(text.contains("result=\"NotFound\""));
        assert!(text.contains("localpv_reconciles_total"));
        assert!(text.contains("localpv_requeues_total"));
    }
}
