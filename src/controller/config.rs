//! Controller configuration

use crate::manifests::ImageConfig;
use std::time::Duration;

/// Configuration shared by the control loop and the manifest builders
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace the provisioner workloads are installed into
    pub namespace: String,
    /// Version of the running operator, stamped into the CR status
    pub operator_version: String,
    /// Interval between polls while waiting for pool cleanup to converge
    pub cleanup_poll_interval: Duration,
    /// Namespace of the cluster monitoring stack
    pub monitoring_namespace: String,
    /// Log verbosity passed to the provisioner containers
    pub verbosity: String,
    pub images: ImageConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: "hostpath-provisioner".to_string(),
            operator_version: crate::VERSION.to_string(),
            cleanup_poll_interval: Duration::from_secs(1),
            monitoring_namespace: "openshift-monitoring".to_string(),
            verbosity: "1".to_string(),
            images: ImageConfig::default(),
        }
    }
}
