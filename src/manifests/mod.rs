//! Desired-object builders
//!
//! One builder per owned kind. Each returns the full object the operator
//! wants to exist for the given CR; the controller decides which fields of
//! it are authoritative when converging a live object.
//!
//! - [`workloads`]: legacy and CSI DaemonSets
//! - [`pools`]: per-node storage pool claims, deployments and cleanup jobs
//! - [`rbac`]: service accounts, roles and bindings
//! - [`driver`]: CSIDriver registration
//! - [`security`]: SecurityContextConstraints
//! - [`monitoring`]: PrometheusRule, ServiceMonitor and their RBAC

pub mod driver;
pub mod monitoring;
pub mod pools;
pub mod rbac;
pub mod security;
pub mod workloads;

use crate::crd::HostPathProvisioner;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use std::collections::BTreeMap;

// =============================================================================
// Well-known Names
// =============================================================================

/// Legacy DaemonSet, SCC and the shared app label value
pub const MULTI_PURPOSE_NAME: &str = "hostpath-provisioner";
/// CSI DaemonSet and SCC
pub const CSI_NAME: &str = "hostpath-provisioner-csi";
/// Legacy provisioner service account and its cluster RBAC
pub const PROVISIONER_SERVICE_ACCOUNT: &str = "hostpath-provisioner-admin";
/// CSI service account and its RBAC
pub const CSI_SERVICE_ACCOUNT: &str = "hostpath-provisioner-admin-csi";
/// Name the CSI driver registers under
pub const CSI_DRIVER_NAME: &str = "kubevirt.io.hostpath-provisioner";

pub const APP_LABEL_KEY: &str = "k8s-app";
/// Label selector matching every object the operator creates
pub const APP_SELECTOR: &str = "k8s-app=hostpath-provisioner";

/// Every name an RBAC object of this operator may carry
pub const RBAC_NAMES: [&str; 3] = [PROVISIONER_SERVICE_ACCOUNT, CSI_SERVICE_ACCOUNT, MULTI_PURPOSE_NAME];

// =============================================================================
// Images
// =============================================================================

/// Container images for the provisioner workloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageConfig {
    /// Legacy path provisioner
    pub provisioner: String,
    /// CSI plugin
    pub csi_provisioner: String,
    /// external-provisioner sidecar
    pub external_provisioner: String,
    pub node_driver_registrar: String,
    pub liveness_probe: String,
    /// external-snapshotter sidecar, only used with the snapshot gate
    pub snapshotter: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            provisioner: "quay.io/kubevirt/hostpath-provisioner:latest".to_string(),
            csi_provisioner: "quay.io/kubevirt/hostpath-csi-driver:latest".to_string(),
            external_provisioner: "registry.k8s.io/sig-storage/csi-provisioner:v4.0.0".to_string(),
            node_driver_registrar: "registry.k8s.io/sig-storage/csi-node-driver-registrar:v2.10.0"
                .to_string(),
            liveness_probe: "registry.k8s.io/sig-storage/livenessprobe:v2.12.0".to_string(),
            snapshotter: "registry.k8s.io/sig-storage/csi-snapshotter:v7.0.1".to_string(),
        }
    }
}

// =============================================================================
// Metadata Helpers
// =============================================================================

/// Labels carried by every owned object
pub fn app_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL_KEY.to_string(), MULTI_PURPOSE_NAME.to_string())])
}

/// Controller owner reference to the CR, absent until the CR has a uid
pub fn owner_references(cr: &HostPathProvisioner) -> Option<Vec<OwnerReference>> {
    cr.controller_owner_ref(&()).map(|owner| vec![owner])
}

/// Metadata for a namespaced object garbage collected with the CR
pub fn owned_meta(cr: &HostPathProvisioner, name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(app_labels()),
        owner_references: owner_references(cr),
        ..Default::default()
    }
}

/// Metadata for a cluster-scoped object removed explicitly on CR deletion
pub fn cluster_meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(app_labels()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::HostPathProvisionerSpec;

    #[test]
    fn test_owner_reference_requires_uid() {
        let mut cr = HostPathProvisioner::new("hostpath-provisioner", HostPathProvisionerSpec::default());
        assert!(owner_references(&cr).is_none());

        cr.metadata.uid = Some("1234".into());
        let owners = owner_references(&cr).unwrap();
        assert_eq!(owners[0].kind, "HostPathProvisioner");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn test_owned_meta_carries_app_label() {
        let cr = HostPathProvisioner::new("hostpath-provisioner", HostPathProvisionerSpec::default());
        let meta = owned_meta(&cr, CSI_NAME, "hpp");
        assert_eq!(meta.namespace.as_deref(), Some("hpp"));
        assert_eq!(meta.labels.unwrap()[APP_LABEL_KEY], MULTI_PURPOSE_NAME);
    }
}
