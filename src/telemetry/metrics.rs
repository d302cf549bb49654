//! Prometheus readiness gauge

use crate::domain::{ReadinessGauge, READY_UNKNOWN};
use crate::error::Result;
use prometheus::{IntGauge, Opts, Registry};

/// Gauge name scraped by the provisioner alerts
pub const READY_GAUGE_NAME: &str = "kubevirt_hpp_cr_ready";

/// `kubevirt_hpp_cr_ready`, registered into an injected registry
#[derive(Clone)]
pub struct PrometheusReadyGauge {
    gauge: IntGauge,
}

impl PrometheusReadyGauge {
    /// Register the gauge and park it at the boot-time sentinel
    pub fn new(registry: &Registry) -> Result<Self> {
        let gauge = IntGauge::with_opts(Opts::new(
            READY_GAUGE_NAME,
            "HPP CR Ready. 1 when ready, 0 when not ready and not progressing, -1 before the first reconcile",
        ))?;
        registry.register(Box::new(gauge.clone()))?;
        gauge.set(READY_UNKNOWN);
        Ok(Self { gauge })
    }

    pub fn get(&self) -> i64 {
        self.gauge.get()
    }
}

impl ReadinessGauge for PrometheusReadyGauge {
    fn set(&self, value: i64) {
        self.gauge.set(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::READY;

    #[test]
    fn test_gauge_starts_unknown() {
        let registry = Registry::new();
        let gauge = PrometheusReadyGauge::new(&registry).unwrap();
        assert_eq!(gauge.get(), READY_UNKNOWN);

        gauge.set(READY);
        let families = registry.gather();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_name(), READY_GAUGE_NAME);
        assert_eq!(families[0].get_metric()[0].get_gauge().get_value(), 1.0);
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        PrometheusReadyGauge::new(&registry).unwrap();
        assert!(PrometheusReadyGauge::new(&registry).is_err());
    }
}
