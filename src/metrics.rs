//! Readiness and suspension gauges
//!
//! Exposed in Prometheus format on the metrics bind address. Gauge values
//! follow the convention used by GitOps toolkit controllers: readiness is
//! 1 for True, 0 for False and -1 for Unknown.

use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::crd::Konfiguration;

/// Gauge tracking each Konfiguration's Ready condition
pub const READY_GAUGE: &str = "konfig_ready_status";

/// Gauge tracking each Konfiguration's suspension flag
pub const SUSPEND_GAUGE: &str = "konfig_suspend_status";

/// Install the Prometheus recorder and return the handle rendering the
/// `/metrics` payload. Must be called once at startup.
pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record the Konfiguration's readiness gauge from its Ready condition
pub fn record_readiness(konfig: &Konfiguration) {
    let value = match konfig.ready_condition().map(|c| c.status.as_str()) {
        Some("True") => 1.0,
        Some("False") => 0.0,
        _ => -1.0,
    };
    gauge!(
        READY_GAUGE,
        "namespace" => konfig.metadata.namespace.clone().unwrap_or_default(),
        "name" => konfig.metadata.name.clone().unwrap_or_default(),
    )
    .set(value);
}

/// Record the Konfiguration's suspension gauge. A terminating
/// Konfiguration always records as not suspended.
pub fn record_suspension(konfig: &Konfiguration) {
    let suspended = konfig.metadata.deletion_timestamp.is_none() && konfig.is_suspended();
    gauge!(
        SUSPEND_GAUGE,
        "namespace" => konfig.metadata.namespace.clone().unwrap_or_default(),
        "name" => konfig.metadata.name.clone().unwrap_or_default(),
    )
    .set(if suspended { 1.0 } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::KonfigurationSpec;

    fn konfig(suspend: bool) -> Konfiguration {
        let mut spec: KonfigurationSpec = serde_yaml::from_str(
            "interval: 1m\npath: http://fixtures/hello.jsonnet\nprune: false\n",
        )
        .unwrap();
        spec.suspend = suspend;
        Konfiguration::new("web", spec)
    }

    #[test]
    fn test_recording_without_recorder_does_not_panic() {
        // The metrics macros no-op when no recorder is installed
        record_readiness(&konfig(false));
        record_suspension(&konfig(true));
    }
}
