//! SecurityContextConstraints for the provisioner service accounts

use super::{cluster_meta, CSI_NAME, CSI_SERVICE_ACCOUNT, MULTI_PURPOSE_NAME, PROVISIONER_SERVICE_ACCOUNT};
use crate::controller::ControllerConfig;
use crate::crd::{HostPathProvisioner, SecurityContextConstraints, StrategyOptions};

fn constraints(name: &str, service_account: &str, namespace: &str) -> SecurityContextConstraints {
    SecurityContextConstraints {
        metadata: cluster_meta(name),
        allow_privileged_container: true,
        allow_host_dir_volume_plugin: true,
        required_drop_capabilities: ["KILL", "MKNOD", "SETUID", "SETGID"]
            .iter()
            .map(|c| c.to_string())
            .collect(),
        run_as_user: StrategyOptions::of("RunAsAny"),
        se_linux_context: StrategyOptions::of("RunAsAny"),
        fs_group: StrategyOptions::of("RunAsAny"),
        supplemental_groups: StrategyOptions::of("RunAsAny"),
        users: vec![format!("system:serviceaccount:{}:{}", namespace, service_account)],
        volumes: ["hostPath", "secret", "configMap", "emptyDir", "projected", "persistentVolumeClaim"]
            .iter()
            .map(|v| v.to_string())
            .collect(),
        ..Default::default()
    }
}

/// Constraints for the CSI service account, plus the legacy one in legacy mode
pub fn security_context_constraints(
    cr: &HostPathProvisioner,
    config: &ControllerConfig,
) -> Vec<SecurityContextConstraints> {
    let mut sccs = vec![constraints(CSI_NAME, CSI_SERVICE_ACCOUNT, &config.namespace)];
    if cr.is_legacy() {
        sccs.push(constraints(MULTI_PURPOSE_NAME, PROVISIONER_SERVICE_ACCOUNT, &config.namespace));
    }
    sccs
}
