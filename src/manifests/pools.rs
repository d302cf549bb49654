//! Storage pool objects
//!
//! A pool with a `pvcTemplate` is backed, on every matching node, by a claim
//! built from the template and a single-replica deployment pinned to that
//! node which mounts the claim over the pool path. When the pair is no
//! longer wanted a cleanup job undoes the mount.

use super::workloads::{mount, privileged};
use super::{app_labels, owned_meta, CSI_SERVICE_ACCOUNT};
use crate::controller::ControllerConfig;
use crate::crd::{HostPathProvisioner, StoragePool};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource,
    PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;

pub const COMPONENT_LABEL: &str = "hpp.kubevirt.io/component";
pub const POOL_LABEL: &str = "hpp.kubevirt.io/pool";
pub const NODE_LABEL: &str = "hpp.kubevirt.io/node";
/// Host path a pool deployment mounts over, needed to clean up after it
pub const POOL_PATH_ANNOTATION: &str = "hpp.kubevirt.io/pool-path";

pub const STORAGE_POOL_COMPONENT: &str = "storagepool";
pub const CLEANUP_COMPONENT: &str = "cleanup";

/// Selects every per-node pool deployment and claim
pub const POOL_SELECTOR: &str = "hpp.kubevirt.io/component=storagepool";
/// Selects every cleanup job
pub const CLEANUP_SELECTOR: &str = "hpp.kubevirt.io/component=cleanup";

const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
const SOURCE_PATH: &str = "/source";
const HOST_ROOT: &str = "/host";

/// Name shared by a pool's claim and deployment on one node
pub fn pool_resource_name(pool: &str, node: &str) -> String {
    format!("hpp-pool-{}-{}", pool, node)
}

pub fn cleanup_job_name(pool: &str, node: &str) -> String {
    format!("cleanup-pool-{}-{}", pool, node)
}

fn labels(component: &str, pool: &str, node: &str) -> BTreeMap<String, String> {
    let mut labels = app_labels();
    labels.insert(COMPONENT_LABEL.to_string(), component.to_string());
    labels.insert(POOL_LABEL.to_string(), pool.to_string());
    labels.insert(NODE_LABEL.to_string(), node.to_string());
    labels
}

fn pool_meta(cr: &HostPathProvisioner, config: &ControllerConfig, name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        labels: Some(labels),
        ..owned_meta(cr, name, &config.namespace)
    }
}

/// Claim backing `pool` on `node`; `None` when the pool has no template
pub fn pool_claim(
    cr: &HostPathProvisioner,
    config: &ControllerConfig,
    pool: &StoragePool,
    node: &str,
) -> Option<PersistentVolumeClaim> {
    let template = pool.pvc_template.clone()?;
    let name = pool_resource_name(&pool.name, node);
    Some(PersistentVolumeClaim {
        metadata: pool_meta(cr, config, &name, labels(STORAGE_POOL_COMPONENT, &pool.name, node)),
        spec: Some(template),
        status: None,
    })
}

fn mounter(config: &ControllerConfig, cr: &HostPathProvisioner, pool: &StoragePool, unmount: bool) -> Container {
    let mut command = vec![
        "/usr/bin/mounter".to_string(),
        "--storagePoolPath".to_string(),
        SOURCE_PATH.to_string(),
        "--mountPath".to_string(),
        pool.path.clone(),
        "--hostPath".to_string(),
        HOST_ROOT.to_string(),
    ];
    if unmount {
        command.push("--unmount".to_string());
    }

    let mut mounts = vec![VolumeMount {
        mount_propagation: Some("Bidirectional".to_string()),
        ..mount("host-root", HOST_ROOT)
    }];
    if !unmount {
        mounts.push(mount("data", SOURCE_PATH));
    }

    Container {
        name: "mounter".to_string(),
        image: Some(config.images.csi_provisioner.clone()),
        image_pull_policy: Some(cr.image_pull_policy()),
        command: Some(command),
        volume_mounts: Some(mounts),
        security_context: Some(privileged()),
        ..Default::default()
    }
}

fn host_root() -> Volume {
    Volume {
        name: "host-root".to_string(),
        host_path: Some(HostPathVolumeSource {
            path: "/".to_string(),
            type_: Some("Directory".to_string()),
        }),
        ..Default::default()
    }
}

fn pinned_pod(cr: &HostPathProvisioner, node: &str, container: Container, volumes: Vec<Volume>) -> PodSpec {
    PodSpec {
        service_account_name: Some(CSI_SERVICE_ACCOUNT.to_string()),
        containers: vec![container],
        volumes: Some(volumes),
        node_selector: Some(BTreeMap::from([(HOSTNAME_LABEL.to_string(), node.to_string())])),
        tolerations: (!cr.spec.workload.tolerations.is_empty())
            .then(|| cr.spec.workload.tolerations.clone()),
        ..Default::default()
    }
}

/// Deployment mounting the pool claim on `node`; `None` when the pool has no template
pub fn pool_deployment(
    cr: &HostPathProvisioner,
    config: &ControllerConfig,
    pool: &StoragePool,
    node: &str,
) -> Option<Deployment> {
    if !pool.has_template() {
        return None;
    }
    let name = pool_resource_name(&pool.name, node);
    let labels = labels(STORAGE_POOL_COMPONENT, &pool.name, node);
    let data = Volume {
        name: "data".to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: name.clone(),
            read_only: None,
        }),
        ..Default::default()
    };

    let mut metadata = pool_meta(cr, config, &name, labels.clone());
    metadata.annotations = Some(BTreeMap::from([(POOL_PATH_ANNOTATION.to_string(), pool.path.clone())]));

    Some(Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                rolling_update: None,
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pinned_pod(cr, node, mounter(config, cr, pool, false), vec![data, host_root()])),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// Job unmounting the pool path on `node` after its deployment is gone
pub fn cleanup_job(cr: &HostPathProvisioner, config: &ControllerConfig, pool: &StoragePool, node: &str) -> Job {
    let name = cleanup_job_name(&pool.name, node);
    let labels = labels(CLEANUP_COMPONENT, &pool.name, node);
    let mut pod = pinned_pod(cr, node, mounter(config, cr, pool, true), vec![host_root()]);
    pod.restart_policy = Some("OnFailure".to_string());

    Job {
        metadata: pool_meta(cr, config, &name, labels.clone()),
        spec: Some(JobSpec {
            backoff_limit: Some(6),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::HostPathProvisionerSpec;
    use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;

    fn pool(template: bool) -> StoragePool {
        StoragePool {
            name: "local".into(),
            path: "/var/hpp".into(),
            pvc_template: template.then(PersistentVolumeClaimSpec::default),
        }
    }

    #[test]
    fn test_plain_pool_has_no_node_objects() {
        let cr = HostPathProvisioner::new("hostpath-provisioner", HostPathProvisionerSpec::default());
        let config = ControllerConfig::default();
        assert!(pool_claim(&cr, &config, &pool(false), "node-1").is_none());
        assert!(pool_deployment(&cr, &config, &pool(false), "node-1").is_none());
    }

    #[test]
    fn test_pool_deployment_is_pinned() {
        let cr = HostPathProvisioner::new("hostpath-provisioner", HostPathProvisionerSpec::default());
        let config = ControllerConfig::default();
        let deployment = pool_deployment(&cr, &config, &pool(true), "node-1").unwrap();

        assert_eq!(deployment.metadata.name.as_deref(), Some("hpp-pool-local-node-1"));
        let labels = deployment.metadata.labels.clone().unwrap();
        assert_eq!(labels[COMPONENT_LABEL], STORAGE_POOL_COMPONENT);
        assert_eq!(labels[NODE_LABEL], "node-1");

        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.node_selector.unwrap()[HOSTNAME_LABEL], "node-1");
    }

    #[test]
    fn test_cleanup_job_unmounts() {
        let cr = HostPathProvisioner::new("hostpath-provisioner", HostPathProvisionerSpec::default());
        let job = cleanup_job(&cr, &ControllerConfig::default(), &pool(true), "node-1");
        assert_eq!(job.metadata.name.as_deref(), Some("cleanup-pool-local-node-1"));
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert!(pod.containers[0]
            .command
            .as_ref()
            .unwrap()
            .contains(&"--unmount".to_string()));
        assert_eq!(pod.restart_policy.as_deref(), Some("OnFailure"));
    }
}
