//! Prometheus metrics for the forensics operator.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Counter families the reconciler increments. All counters are
/// concurrency-safe and cheap to clone label handles from.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Crashes detected, by source namespace and termination reason.
    pub crashes_total: IntCounterVec,
    /// Forensic replicas successfully created, by source namespace.
    pub pods_created_total: IntCounterVec,
    /// Hard-step failures during materialization, by source namespace and step.
    pub pod_creation_errors_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let crashes_total = IntCounterVec::new(
            Opts::new(
                "forensics_crashes_total",
                "Total number of crashes detected by the forensics operator",
            ),
            &["namespace", "reason"],
        )?;
        let pods_created_total = IntCounterVec::new(
            Opts::new(
                "forensics_pods_created_total",
                "Total number of forensic pods created",
            ),
            &["source_namespace"],
        )?;
        let pod_creation_errors_total = IntCounterVec::new(
            Opts::new(
                "forensics_pod_creation_errors_total",
                "Total number of errors encountered while creating forensic pods",
            ),
            &["source_namespace", "step"],
        )?;

        registry.register(Box::new(crashes_total.clone()))?;
        registry.register(Box::new(pods_created_total.clone()))?;
        registry.register(Box::new(pod_creation_errors_total.clone()))?;

        Ok(Self {
            registry,
            crashes_total,
            pods_created_total,
            pod_creation_errors_total,
        })
    }

    /// Renders the registry in Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_register_and_encode() {
        let metrics = Metrics::new().unwrap();
        metrics
            .crashes_total
            .with_label_values(&["prod", "OOMKilled"])
            .inc();
        metrics
            .pod_creation_errors_total
            .with_label_values(&["prod", "CloneDependencies"])
            .inc();

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("forensics_crashes_total"));
        assert!(text.contains("reason=\"OOMKilled\""));
        assert!(text.contains("step=\"CloneDependencies\""));
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let metrics = Metrics::new().unwrap();
        let dup = IntCounterVec::new(
            Opts::new("forensics_crashes_total", "dup"),
            &["namespace", "reason"],
        )
        .unwrap();
        assert!(metrics.registry.register(Box::new(dup)).is_err());
    }
}
