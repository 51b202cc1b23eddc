// Prometheus metrics for host connection and telemetry monitoring
//
// - Host idle time per mille (gauge)
// - Connection state and reconnects (gauge, counters)
// - Sampler failures (counter)
//
// Nothing is persisted; `gather_metrics` renders the current values in the
// text exposition format.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    pub static ref HOST_IDLE_PER_MILLE: IntGauge = IntGauge::new(
        "host_idle_per_mille",
        "Share of host CPU time spent idle between the last two samples, in parts per thousand"
    ).expect("Failed to create host idle metric");

    pub static ref HOST_CONNECTION_OPEN: IntGauge = IntGauge::new(
        "host_connection_open",
        "Whether a host connection is currently held (1) or not (0)"
    ).expect("Failed to create host connection metric");

    pub static ref HOST_CONNECTIONS_OPENED_TOTAL: IntCounter = IntCounter::new(
        "host_connections_opened_total",
        "Total number of host connections opened"
    ).expect("Failed to create host connections opened metric");

    pub static ref HOST_PROBE_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "host_probe_failures_total",
        "Total number of failed connection liveness probes"
    ).expect("Failed to create host probe failures metric");

    pub static ref CPU_SAMPLE_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "cpu_sample_failures_total",
        "Total number of skipped CPU sampler ticks"
    ).expect("Failed to create CPU sample failures metric");
}

/// Register all metrics with the registry. Safe to call more than once.
pub fn init() -> prometheus::Result<()> {
    register(Box::new(HOST_IDLE_PER_MILLE.clone()))?;
    register(Box::new(HOST_CONNECTION_OPEN.clone()))?;
    register(Box::new(HOST_CONNECTIONS_OPENED_TOTAL.clone()))?;
    register(Box::new(HOST_PROBE_FAILURES_TOTAL.clone()))?;
    register(Box::new(CPU_SAMPLE_FAILURES_TOTAL.clone()))?;
    Ok(())
}

fn register(collector: Box<dyn prometheus::core::Collector>) -> prometheus::Result<()> {
    match REGISTRY.register(collector) {
        Ok(()) | Err(prometheus::Error::AlreadyReg) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init().unwrap();
        init().unwrap();
    }

    #[test]
    fn test_gather_contains_host_metrics() {
        init().unwrap();
        HOST_CONNECTIONS_OPENED_TOTAL.inc();
        let text = gather_metrics().unwrap();
        assert!(text.contains("host_connections_opened_total"));
        assert!(text.contains("host_idle_per_mille"));
    }
}
