//! Telemetry adapters
//!
//! Concrete sinks behind the event and readiness ports.

pub mod events;
pub mod metrics;

pub use events::{reasons, KubeEventRecorder, NoopEventRecorder};
pub use metrics::PrometheusReadyGauge;
