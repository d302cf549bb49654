//! HostPathProvisioner CRD
//!
//! The single cluster-scoped resource that declares how the hostpath
//! provisioner should be deployed.

use crate::crd::condition::{is_condition_true, Condition, ConditionType};
use k8s_openapi::api::core::v1::{Affinity, PersistentVolumeClaimSpec, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Finalizer guarding cluster-scoped dependents of the CR
pub const HPP_FINALIZER: &str = "finalizer.delete.hostpath-provisioner";

/// Feature gate that adds the CSI snapshotter sidecar and its RBAC
pub const SNAPSHOT_FEATURE_GATE: &str = "Snapshotting";

// =============================================================================
// HostPathProvisioner CRD
// =============================================================================

/// HostPathProvisioner describes the desired hostpath provisioner deployment.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hostpathprovisioner.kubevirt.io",
    version = "v1beta1",
    kind = "HostPathProvisioner",
    plural = "hostpathprovisioners",
    shortname = "hpp",
    status = "HostPathProvisionerStatus",
    printcolumn = r#"{"name": "Observed", "type": "string", "jsonPath": ".status.observedVersion"}"#,
    printcolumn = r#"{"name": "Target", "type": "string", "jsonPath": ".status.targetVersion"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct HostPathProvisionerSpec {
    /// Pull policy for all provisioner containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Legacy single path configuration. Its presence selects legacy mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_config: Option<PathConfig>,

    /// Storage pools served by the CSI driver
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage_pools: Vec<StoragePool>,

    /// Where the provisioner workloads are scheduled
    #[serde(default)]
    pub workload: NodePlacement,

    /// Enabled feature gates. Unknown names are ignored.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feature_gates: Vec<String>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Location and layout of PV directories on the nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PathConfig {
    /// The path the directories for the PVs are created under
    pub path: String,

    /// Use the name of the PVC requesting the PV as part of the directory
    #[serde(default)]
    pub use_naming_prefix: bool,
}

/// A storage pool declaration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StoragePool {
    /// Pool name, unique within the CR
    pub name: String,

    /// Host path the pool lives under
    pub path: String,

    /// When set, every node backs the pool with a claim built from this template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_template: Option<PersistentVolumeClaimSpec>,
}

impl StoragePool {
    /// Whether this pool needs per-node deployments
    pub fn has_template(&self) -> bool {
        self.pvc_template.is_some()
    }
}

/// Node scheduling configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePlacement {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of the HostPathProvisioner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HostPathProvisionerStatus {
    /// Current conditions observed by the operator
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Version of the running operator
    #[serde(default)]
    pub operator_version: String,

    /// Version the deployment is converging towards
    #[serde(default)]
    pub target_version: String,

    /// Version the deployment has fully converged to
    #[serde(default)]
    pub observed_version: String,

    /// Per storage pool readiness
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage_pool_statuses: Vec<StoragePoolStatus>,
}

/// Readiness of a single storage pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StoragePoolStatus {
    pub name: String,
    pub phase: StoragePoolPhase,
    /// Number of per-node deployments the pool needs
    #[serde(default)]
    pub desired_ready: u32,
    /// Number of per-node deployments with an available replica
    #[serde(default)]
    pub current_ready: u32,
}

/// Storage pool phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum StoragePoolPhase {
    #[default]
    NotReady,
    Ready,
}

impl std::fmt::Display for StoragePoolPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoragePoolPhase::NotReady => write!(f, "NotReady"),
            StoragePoolPhase::Ready => write!(f, "Ready"),
        }
    }
}

// =============================================================================
// Deployment Mode
// =============================================================================

/// Which workloads the CR asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    /// Legacy path-based provisioner plus the CSI driver
    Legacy,
    /// CSI driver only
    DriverOnly,
}

impl std::fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentMode::Legacy => write!(f, "legacy"),
            DeploymentMode::DriverOnly => write!(f, "driver-only"),
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl HostPathProvisioner {
    /// Get the name of this CR
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Legacy mode is selected by the presence of a path configuration
    pub fn is_legacy(&self) -> bool {
        self.spec.path_config.is_some()
    }

    /// Deployment mode derived from the spec
    pub fn mode(&self) -> DeploymentMode {
        if self.is_legacy() {
            DeploymentMode::Legacy
        } else {
            DeploymentMode::DriverOnly
        }
    }

    /// Simple set membership on the feature gate list
    pub fn is_feature_gate_enabled(&self, feature: &str) -> bool {
        self.spec.feature_gates.iter().any(|gate| gate == feature)
    }

    /// Pull policy with the provisioner default applied
    pub fn image_pull_policy(&self) -> String {
        self.spec
            .image_pull_policy
            .clone()
            .unwrap_or_else(|| "IfNotPresent".to_string())
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|existing| existing == finalizer))
    }

    /// Add a finalizer; returns true when the list changed
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(finalizer.to_string());
        true
    }

    /// Remove a finalizer; returns true when the list changed
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        if !self.has_finalizer(finalizer) {
            return false;
        }
        if let Some(finalizers) = self.metadata.finalizers.as_mut() {
            finalizers.retain(|existing| existing != finalizer);
        }
        true
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// Available condition is True
    pub fn is_available(&self) -> bool {
        is_condition_true(self.conditions(), &ConditionType::Available)
    }

    /// Progressing condition is True
    pub fn is_progressing(&self) -> bool {
        is_condition_true(self.conditions(), &ConditionType::Progressing)
    }

    /// Degraded condition is True
    pub fn is_degraded(&self) -> bool {
        is_condition_true(self.conditions(), &ConditionType::Degraded)
    }

    /// Version the deployment has converged to, empty before the first rollout
    pub fn observed_version(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.observed_version.as_str())
            .unwrap_or_default()
    }
}
