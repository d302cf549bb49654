//! Service accounts and RBAC

use super::{cluster_meta, owned_meta, CSI_SERVICE_ACCOUNT, PROVISIONER_SERVICE_ACCOUNT};
use crate::controller::ControllerConfig;
use crate::crd::{HostPathProvisioner, SNAPSHOT_FEATURE_GATE};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject};

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

pub(crate) fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(groups.iter().map(|g| g.to_string()).collect()),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

pub(crate) fn service_account_subject(name: &str, namespace: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: Some(namespace.to_string()),
        api_group: None,
    }
}

pub(crate) fn role_ref(kind: &str, name: &str) -> RoleRef {
    RoleRef {
        api_group: RBAC_GROUP.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

/// Service accounts for the legacy and CSI workloads
pub fn service_accounts(cr: &HostPathProvisioner, config: &ControllerConfig) -> Vec<ServiceAccount> {
    [PROVISIONER_SERVICE_ACCOUNT, CSI_SERVICE_ACCOUNT]
        .into_iter()
        .map(|name| ServiceAccount {
            metadata: owned_meta(cr, name, &config.namespace),
            ..Default::default()
        })
        .collect()
}

fn provisioner_rules() -> Vec<PolicyRule> {
    vec![
        rule(&[""], &["persistentvolumes"], &["get", "list", "watch", "create", "delete"]),
        rule(&[""], &["persistentvolumeclaims"], &["get", "list", "watch", "update"]),
        rule(&["storage.k8s.io"], &["storageclasses"], &["get", "list", "watch"]),
        rule(&[""], &["events"], &["list", "watch", "create", "update", "patch"]),
        rule(&[""], &["nodes"], &["get"]),
    ]
}

fn csi_rules(snapshots: bool) -> Vec<PolicyRule> {
    let mut rules = vec![
        rule(&[""], &["persistentvolumes"], &["get", "list", "watch", "create", "delete", "patch"]),
        rule(&[""], &["persistentvolumeclaims"], &["get", "list", "watch", "update"]),
        rule(&[""], &["persistentvolumeclaims/status"], &["update", "patch"]),
        rule(&["storage.k8s.io"], &["storageclasses"], &["get", "list", "watch"]),
        rule(&[""], &["events"], &["list", "watch", "create", "update", "patch"]),
        rule(&[""], &["nodes"], &["get", "list", "watch"]),
        rule(&["storage.k8s.io"], &["csinodes"], &["get", "list", "watch"]),
        rule(&["storage.k8s.io"], &["volumeattachments"], &["get", "list", "watch"]),
    ];
    if snapshots {
        rules.extend([
            rule(&["snapshot.storage.k8s.io"], &["volumesnapshotclasses"], &["get", "list", "watch"]),
            rule(
                &["snapshot.storage.k8s.io"],
                &["volumesnapshotcontents"],
                &["create", "get", "list", "watch", "update", "delete", "patch"],
            ),
            rule(&["snapshot.storage.k8s.io"], &["volumesnapshotcontents/status"], &["update", "patch"]),
            rule(&["snapshot.storage.k8s.io"], &["volumesnapshots"], &["get", "list", "watch", "update"]),
        ]);
    }
    rules
}

/// Cluster roles for both service accounts
pub fn cluster_roles(cr: &HostPathProvisioner) -> Vec<ClusterRole> {
    let snapshots = cr.is_feature_gate_enabled(SNAPSHOT_FEATURE_GATE);
    vec![
        ClusterRole {
            metadata: cluster_meta(PROVISIONER_SERVICE_ACCOUNT),
            rules: Some(provisioner_rules()),
            aggregation_rule: None,
        },
        ClusterRole {
            metadata: cluster_meta(CSI_SERVICE_ACCOUNT),
            rules: Some(csi_rules(snapshots)),
            aggregation_rule: None,
        },
    ]
}

/// Bind each cluster role to the service account of the same name
pub fn cluster_role_bindings(config: &ControllerConfig) -> Vec<ClusterRoleBinding> {
    [PROVISIONER_SERVICE_ACCOUNT, CSI_SERVICE_ACCOUNT]
        .into_iter()
        .map(|name| ClusterRoleBinding {
            metadata: cluster_meta(name),
            role_ref: role_ref("ClusterRole", name),
            subjects: Some(vec![service_account_subject(name, &config.namespace)]),
        })
        .collect()
}

/// Namespaced role for leader election and storage capacity tracking
pub fn csi_role(cr: &HostPathProvisioner, config: &ControllerConfig) -> Role {
    Role {
        metadata: owned_meta(cr, CSI_SERVICE_ACCOUNT, &config.namespace),
        rules: Some(vec![
            rule(
                &["coordination.k8s.io"],
                &["leases"],
                &["get", "watch", "list", "delete", "update", "create"],
            ),
            rule(
                &["storage.k8s.io"],
                &["csistoragecapacities"],
                &["get", "list", "watch", "create", "update", "patch", "delete"],
            ),
            rule(&[""], &["pods"], &["get"]),
            rule(&["apps"], &["daemonsets", "replicasets"], &["get"]),
        ]),
    }
}

pub fn csi_role_binding(cr: &HostPathProvisioner, config: &ControllerConfig) -> RoleBinding {
    RoleBinding {
        metadata: owned_meta(cr, CSI_SERVICE_ACCOUNT, &config.namespace),
        role_ref: role_ref("Role", CSI_SERVICE_ACCOUNT),
        subjects: Some(vec![service_account_subject(CSI_SERVICE_ACCOUNT, &config.namespace)]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::HostPathProvisionerSpec;

    #[test]
    fn test_snapshot_rules_follow_feature_gate() {
        let mut cr = HostPathProvisioner::new("hostpath-provisioner", HostPathProvisionerSpec::default());
        let plain = cluster_roles(&cr)[1].rules.clone().unwrap().len();

        cr.spec.feature_gates.push(SNAPSHOT_FEATURE_GATE.into());
        let with_snapshots = cluster_roles(&cr)[1].rules.clone().unwrap().len();
        assert_eq!(with_snapshots, plain + 4);
    }

    #[test]
    fn test_bindings_target_installer_namespace() {
        let config = ControllerConfig {
            namespace: "hpp-system".into(),
            ..Default::default()
        };
        for binding in cluster_role_bindings(&config) {
            let subject = &binding.subjects.unwrap()[0];
            assert_eq!(subject.namespace.as_deref(), Some("hpp-system"));
            assert_eq!(Some(subject.name.clone()), binding.metadata.name);
        }
    }
}
