//! Provisioner DaemonSets

use super::{owned_meta, APP_LABEL_KEY, CSI_DRIVER_NAME, CSI_NAME, CSI_SERVICE_ACCOUNT, MULTI_PURPOSE_NAME, PROVISIONER_SERVICE_ACCOUNT};
use crate::controller::ControllerConfig;
use crate::crd::{HostPathProvisioner, SNAPSHOT_FEATURE_GATE};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, HostPathVolumeSource, ObjectFieldSelector, PodSpec,
    PodTemplateSpec, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;

const SOCKET_DIR: &str = "/csi";
const CSI_ENDPOINT: &str = "unix:///csi/csi.sock";
const CSI_ADDRESS: &str = "/csi/csi.sock";
const KUBELET_PLUGIN_DIR: &str = "/var/lib/kubelet/plugins/csi-hostpath";
const HEALTH_PORT: &str = "9898";

/// Name of the storage pool the legacy path is served under by the CSI driver
pub const LEGACY_POOL_NAME: &str = "legacy";

// =============================================================================
// Legacy DaemonSet
// =============================================================================

/// DaemonSet running the legacy path provisioner; only meaningful in legacy mode
pub fn legacy_daemonset(cr: &HostPathProvisioner, config: &ControllerConfig) -> DaemonSet {
    let path = cr
        .spec
        .path_config
        .as_ref()
        .map(|p| p.path.clone())
        .unwrap_or_default();
    let use_naming_prefix = cr
        .spec
        .path_config
        .as_ref()
        .is_some_and(|p| p.use_naming_prefix);

    let container = Container {
        name: MULTI_PURPOSE_NAME.to_string(),
        image: Some(config.images.provisioner.clone()),
        image_pull_policy: Some(cr.image_pull_policy()),
        env: Some(vec![
            env_value("USE_NAMING_PREFIX", &use_naming_prefix.to_string()),
            env_field("NODE_NAME", "spec.nodeName"),
            env_value("PV_DIR", &path),
        ]),
        volume_mounts: Some(vec![mount("pv-volume", &path)]),
        security_context: Some(privileged()),
        ..Default::default()
    };

    daemonset(
        cr,
        config,
        MULTI_PURPOSE_NAME,
        PROVISIONER_SERVICE_ACCOUNT,
        vec![container],
        vec![host_path_volume("pv-volume", &path, Some("DirectoryOrCreate"))],
    )
}

// =============================================================================
// CSI DaemonSet
// =============================================================================

/// Storage pools the CSI driver serves, as (name, host path)
pub fn data_dirs(cr: &HostPathProvisioner) -> Vec<(String, String)> {
    let legacy = cr
        .spec
        .path_config
        .iter()
        .map(|p| (LEGACY_POOL_NAME.to_string(), p.path.clone()));
    let pools = cr
        .spec
        .storage_pools
        .iter()
        .map(|p| (p.name.clone(), p.path.clone()));
    legacy.chain(pools).collect()
}

fn data_dir_mount_path(pool: &str) -> String {
    format!("/{}-data-dir", pool)
}

/// DaemonSet running the CSI plugin and its sidecars
pub fn csi_daemonset(cr: &HostPathProvisioner, config: &ControllerConfig) -> DaemonSet {
    let dirs = data_dirs(cr);
    let datadir = serde_json::Value::Array(
        dirs.iter()
            .map(|(name, _)| serde_json::json!({"name": name, "path": data_dir_mount_path(name)}))
            .collect(),
    );
    let pull_policy = cr.image_pull_policy();
    let verbosity = format!("--v={}", config.verbosity);

    let mut plugin_mounts = vec![
        mount("socket-dir", SOCKET_DIR),
        VolumeMount {
            mount_propagation: Some("Bidirectional".to_string()),
            ..mount("mountpoint-dir", "/var/lib/kubelet/pods")
        },
        VolumeMount {
            mount_propagation: Some("Bidirectional".to_string()),
            ..mount("plugins-dir", "/var/lib/kubelet/plugins")
        },
    ];
    plugin_mounts.extend(dirs.iter().map(|(name, _)| mount(&format!("{}-data-dir", name), &data_dir_mount_path(name))));

    let mut containers = vec![
        Container {
            name: "hostpath-provisioner".to_string(),
            image: Some(config.images.csi_provisioner.clone()),
            image_pull_policy: Some(pull_policy.clone()),
            args: Some(vec![
                format!("--drivername={}", CSI_DRIVER_NAME),
                verbosity.clone(),
                "--endpoint=$(CSI_ENDPOINT)".to_string(),
                "--nodeid=$(NODE_NAME)".to_string(),
                format!("--version={}", config.operator_version),
                format!("--datadir={}", datadir),
            ]),
            env: Some(vec![
                env_value("CSI_ENDPOINT", CSI_ENDPOINT),
                env_field("NODE_NAME", "spec.nodeName"),
                env_field("POD_NAMESPACE", "metadata.namespace"),
            ]),
            volume_mounts: Some(plugin_mounts),
            security_context: Some(privileged()),
            ..Default::default()
        },
        Container {
            name: "node-driver-registrar".to_string(),
            image: Some(config.images.node_driver_registrar.clone()),
            image_pull_policy: Some(pull_policy.clone()),
            args: Some(vec![
                verbosity.clone(),
                format!("--csi-address={}", CSI_ADDRESS),
                format!("--kubelet-registration-path={}/csi.sock", KUBELET_PLUGIN_DIR),
            ]),
            volume_mounts: Some(vec![
                mount("socket-dir", SOCKET_DIR),
                mount("registration-dir", "/registration"),
            ]),
            security_context: Some(privileged()),
            ..Default::default()
        },
        Container {
            name: "liveness-probe".to_string(),
            image: Some(config.images.liveness_probe.clone()),
            image_pull_policy: Some(pull_policy.clone()),
            args: Some(vec![
                format!("--csi-address={}", CSI_ADDRESS),
                format!("--health-port={}", HEALTH_PORT),
            ]),
            volume_mounts: Some(vec![mount("socket-dir", SOCKET_DIR)]),
            ..Default::default()
        },
        Container {
            name: "csi-provisioner".to_string(),
            image: Some(config.images.external_provisioner.clone()),
            image_pull_policy: Some(pull_policy.clone()),
            args: Some(vec![
                verbosity.clone(),
                "--csi-address=$(ADDRESS)".to_string(),
                "--feature-gates=Topology=true".to_string(),
                "--enable-capacity=true".to_string(),
                "--capacity-ownerref-level=2".to_string(),
                "--node-deployment=true".to_string(),
                "--default-fstype=xfs".to_string(),
            ]),
            env: Some(vec![
                env_value("ADDRESS", CSI_ADDRESS),
                env_field("NODE_NAME", "spec.nodeName"),
                env_field("NAMESPACE", "metadata.namespace"),
                env_field("POD_NAME", "metadata.name"),
            ]),
            volume_mounts: Some(vec![mount("socket-dir", SOCKET_DIR)]),
            ..Default::default()
        },
    ];

    if cr.is_feature_gate_enabled(SNAPSHOT_FEATURE_GATE) {
        containers.push(Container {
            name: "csi-snapshotter".to_string(),
            image: Some(config.images.snapshotter.clone()),
            image_pull_policy: Some(pull_policy),
            args: Some(vec![
                verbosity,
                format!("--csi-address={}", CSI_ADDRESS),
                "--node-deployment=true".to_string(),
            ]),
            env: Some(vec![env_field("NODE_NAME", "spec.nodeName")]),
            volume_mounts: Some(vec![mount("socket-dir", SOCKET_DIR)]),
            ..Default::default()
        });
    }

    let mut volumes = vec![
        host_path_volume("socket-dir", KUBELET_PLUGIN_DIR, Some("DirectoryOrCreate")),
        host_path_volume("mountpoint-dir", "/var/lib/kubelet/pods", Some("DirectoryOrCreate")),
        host_path_volume("registration-dir", "/var/lib/kubelet/plugins_registry", Some("Directory")),
        host_path_volume("plugins-dir", "/var/lib/kubelet/plugins", Some("Directory")),
    ];
    volumes.extend(dirs.iter().map(|(name, path)| {
        host_path_volume(&format!("{}-data-dir", name), path, Some("DirectoryOrCreate"))
    }));

    daemonset(cr, config, CSI_NAME, CSI_SERVICE_ACCOUNT, containers, volumes)
}

// =============================================================================
// Helpers
// =============================================================================

fn daemonset(
    cr: &HostPathProvisioner,
    config: &ControllerConfig,
    name: &str,
    service_account: &str,
    containers: Vec<Container>,
    volumes: Vec<Volume>,
) -> DaemonSet {
    let selector = BTreeMap::from([(APP_LABEL_KEY.to_string(), name.to_string())]);
    let workload = &cr.spec.workload;

    DaemonSet {
        metadata: owned_meta(cr, name, &config.namespace),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(service_account.to_string()),
                    containers,
                    volumes: Some(volumes),
                    node_selector: (!workload.node_selector.is_empty())
                        .then(|| workload.node_selector.clone()),
                    affinity: workload.affinity.clone(),
                    tolerations: (!workload.tolerations.is_empty())
                        .then(|| workload.tolerations.clone()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

pub(crate) fn privileged() -> SecurityContext {
    SecurityContext {
        privileged: Some(true),
        ..Default::default()
    }
}

pub(crate) fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

pub(crate) fn host_path_volume(name: &str, path: &str, type_: Option<&str>) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: type_.map(str::to_string),
        }),
        ..Default::default()
    }
}

pub(crate) fn env_value(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

pub(crate) fn env_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                api_version: Some("v1".to_string()),
            }),
            ..Default::default()
        }),
    }
}
