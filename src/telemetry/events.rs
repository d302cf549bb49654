//! Kubernetes Event recording
//!
//! Events are fire-and-forget. A failed publish is logged and never breaks
//! reconciliation.

use crate::crd::HostPathProvisioner;
use crate::domain::{EventRecorder, EventSeverity};
use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::{debug, warn};

/// Event reasons emitted on the CR
pub mod reasons {
    pub const DEPLOY_STARTED: &str = "DeployStarted";
    pub const UPGRADE_STARTED: &str = "UpgradeStarted";
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    pub const PROVISIONER_HEALTHY: &str = "ProvisionerHealthy";
}

/// Recorder backed by `kube::runtime::events::Recorder`
pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    /// `controller` shows up as the reporting component on every event
    pub fn new(client: Client, controller: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.to_string(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(
        &self,
        cr: &HostPathProvisioner,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), cr.object_ref(&()));
        let type_ = match severity {
            EventSeverity::Normal => EventType::Normal,
            EventSeverity::Warning => EventType::Warning,
        };
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };

        match recorder.publish(event).await {
            Ok(()) => debug!(reason, %severity, "Published event"),
            Err(e) => warn!(reason, error = %e, "Failed to publish Kubernetes event"),
        }
    }
}

/// Discards every event
pub struct NoopEventRecorder;

#[async_trait]
impl EventRecorder for NoopEventRecorder {
    async fn publish(
        &self,
        _cr: &HostPathProvisioner,
        _severity: EventSeverity,
        _reason: &str,
        _message: &str,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::HostPathProvisionerSpec;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_recorders_are_send_sync() {
        assert_send_sync::<KubeEventRecorder>();
        assert_send_sync::<NoopEventRecorder>();
    }

    #[tokio::test]
    async fn test_noop_recorder_accepts_events() {
        let cr = HostPathProvisioner::new("hostpath-provisioner", HostPathProvisionerSpec::default());
        NoopEventRecorder
            .publish(&cr, EventSeverity::Warning, reasons::RECONCILE_FAILED, "boom")
            .await;
    }
}
