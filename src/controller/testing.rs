//! Shared fixtures for controller tests

use super::{ControllerConfig, Reconciler, ReconcileOutcome};
use crate::crd::{HostPathProvisioner, HostPathProvisionerSpec, PathConfig, StoragePool};
use crate::domain::{EventRecorder, EventSeverity, ReadinessGauge};
use crate::error::Result;
use crate::store::MemoryStore;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetStatus};
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaimSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::Mutex;
use std::sync::Arc;

pub const CR_NAME: &str = "hostpath-provisioner";

pub fn config() -> ControllerConfig {
    ControllerConfig {
        namespace: "hpp".to_string(),
        operator_version: "1.2.0".to_string(),
        ..Default::default()
    }
}

pub fn driver_only_cr(name: &str) -> HostPathProvisioner {
    HostPathProvisioner::new(name, HostPathProvisionerSpec::default())
}

pub fn legacy_cr(name: &str) -> HostPathProvisioner {
    HostPathProvisioner::new(
        name,
        HostPathProvisionerSpec {
            path_config: Some(PathConfig {
                path: "/var/hpvolumes".to_string(),
                use_naming_prefix: false,
            }),
            ..Default::default()
        },
    )
}

pub fn template_pool(name: &str) -> StoragePool {
    StoragePool {
        name: name.to_string(),
        path: format!("/var/hpp/{}", name),
        pvc_template: Some(PersistentVolumeClaimSpec::default()),
    }
}

pub fn node(name: &str, labels: &[(&str, &str)]) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Overwrite the rollout counters of a DaemonSet the operator created
pub fn set_daemonset_ready(store: &MemoryStore, name: &str, ready: i32, desired: i32) {
    let mut daemonset: DaemonSet = store.object("hpp", name).expect("daemonset exists");
    daemonset.status = Some(DaemonSetStatus {
        number_ready: ready,
        desired_number_scheduled: desired,
        ..Default::default()
    });
    store.insert(daemonset).expect("insert daemonset");
}

/// Records every published event
#[derive(Default)]
pub struct CapturingRecorder {
    events: Mutex<Vec<(EventSeverity, String, String)>>,
}

impl CapturingRecorder {
    pub fn recorded(&self) -> Vec<(EventSeverity, String, String)> {
        self.events.lock().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|(_, reason, _)| reason.clone()).collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventRecorder for CapturingRecorder {
    async fn publish(&self, _cr: &HostPathProvisioner, severity: EventSeverity, reason: &str, message: &str) {
        self.events
            .lock()
            .push((severity, reason.to_string(), message.to_string()));
    }
}

/// Records every value the gauge is set to
#[derive(Default)]
pub struct RecordingGauge {
    values: Mutex<Vec<i64>>,
}

impl RecordingGauge {
    pub fn values(&self) -> Vec<i64> {
        self.values.lock().clone()
    }

    pub fn clear(&self) {
        self.values.lock().clear();
    }
}

impl ReadinessGauge for RecordingGauge {
    fn set(&self, value: i64) {
        self.values.lock().push(value);
    }
}

/// A reconciler wired to an in-memory cluster
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub events: Arc<CapturingRecorder>,
    pub gauge: Arc<RecordingGauge>,
    pub reconciler: Reconciler<MemoryStore, CapturingRecorder, RecordingGauge>,
}

impl Harness {
    /// Plain Kubernetes: no security policy, monitoring or API server config kinds
    pub fn new() -> Self {
        let harness = Self::openshift();
        for kind in ["SecurityContextConstraints", "APIServer", "PrometheusRule", "ServiceMonitor"] {
            harness.store.unregister(kind);
        }
        harness
    }

    /// Every optional kind is served
    pub fn openshift() -> Self {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(CapturingRecorder::default());
        let gauge = Arc::new(RecordingGauge::default());
        let reconciler = Reconciler::new(store.clone(), events.clone(), gauge.clone(), config());
        Self {
            store,
            events,
            gauge,
            reconciler,
        }
    }

    pub fn with_cr(cr: HostPathProvisioner) -> Self {
        let harness = Self::new();
        harness.store.insert(cr).expect("insert cr");
        harness
    }

    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        self.reconciler.reconcile(CR_NAME).await
    }

    /// The CR as currently stored
    pub fn cr(&self) -> HostPathProvisioner {
        self.store.object("", CR_NAME).expect("cr exists")
    }
}
