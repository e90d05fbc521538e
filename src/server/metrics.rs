//! Prometheus metrics for the controller
//!
//! Everything lives in one private `Registry` so tests can create as many
//! independent instances as they like.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

pub type SharedMetrics = Arc<ControllerMetrics>;

pub struct ControllerMetrics {
    registry: Registry,
    reconciliations_total: IntCounterVec,
    reconciliation_duration_seconds: HistogramVec,
    queue_depth: IntGauge,
    traffic_weight: IntGaugeVec,
    canary_samples_total: IntCounterVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("kulku".to_string()), None)?;

        let reconciliations_total = IntCounterVec::new(
            Opts::new("reconciliations_total", "Reconcile ticks by kind and result"),
            &["kind", "result"],
        )?;
        registry.register(Box::new(reconciliations_total.clone()))?;

        let reconciliation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "reconciliation_duration_seconds",
                "Wall time of one reconcile tick",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["kind"],
        )?;
        registry.register(Box::new(reconciliation_duration_seconds.clone()))?;

        let queue_depth = IntGauge::new("queue_depth", "Keys waiting in the work queue")?;
        registry.register(Box::new(queue_depth.clone()))?;

        let traffic_weight = IntGaugeVec::new(
            Opts::new("traffic_weight", "Percent of traffic routed to the canary revision"),
            &["workload"],
        )?;
        registry.register(Box::new(traffic_weight.clone()))?;

        let canary_samples_total = IntCounterVec::new(
            Opts::new("canary_samples_total", "Canary metric samples by outcome"),
            &["workload", "metric", "result"],
        )?;
        registry.register(Box::new(canary_samples_total.clone()))?;

        Ok(ControllerMetrics {
            registry,
            reconciliations_total,
            reconciliation_duration_seconds,
            queue_depth,
            traffic_weight,
            canary_samples_total,
        })
    }

    pub fn record_reconciliation_success(&self, kind: &str, duration_secs: f64) {
        self.record_reconciliation(kind, "success", duration_secs);
    }

    pub fn record_reconciliation_error(&self, kind: &str, duration_secs: f64) {
        self.record_reconciliation(kind, "error", duration_secs);
    }

    fn record_reconciliation(&self, kind: &str, result: &str, duration_secs: f64) {
        self.reconciliations_total
            .with_label_values(&[kind, result])
            .inc();
        self.reconciliation_duration_seconds
            .with_label_values(&[kind])
            .observe(duration_secs);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn set_traffic_weight(&self, workload: &str, weight: u32) {
        self.traffic_weight
            .with_label_values(&[workload])
            .set(i64::from(weight));
    }

    pub fn record_canary_sample(&self, workload: &str, metric: &str, passed: bool) {
        let result = if passed { "pass" } else { "fail" };
        self.canary_samples_total
            .with_label_values(&[workload, metric, result])
            .inc();
    }

    /// Render every metric in the Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_includes_recorded_series() {
        let metrics = create_metrics().unwrap();
        metrics.record_reconciliation_success("workload", 0.02);
        metrics.record_reconciliation_error("history", 0.5);
        metrics.set_traffic_weight("web", 20);
        metrics.record_canary_sample("web", "error-rate", false);
        metrics.set_queue_depth(3);

        let text = metrics.encode().unwrap();
        assert!(text.contains(r#"kulku_reconciliations_total{kind="workload",result="success"} 1"#));
        assert!(text.contains(r#"kulku_reconciliations_total{kind="history",result="error"} 1"#));
        assert!(text.contains(r#"kulku_traffic_weight{workload="web"} 20"#));
        let sample = text
            .lines()
            .find(|l| l.starts_with("kulku_canary_samples_total{"))
            .unwrap();
        assert!(sample.contains(r#"result="fail""#) && sample.ends_with(" 1"));
        assert!(text.contains("kulku_queue_depth 3"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = create_metrics().unwrap();
        let b = create_metrics().unwrap();
        a.set_traffic_weight("web", 50);
        assert!(!b.encode().unwrap().contains("web"));
    }
}
