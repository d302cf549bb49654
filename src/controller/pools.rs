//! Storage pool reconciliation and cleanup convergence

use super::resources::apply;
use super::ControllerConfig;
use crate::crd::{
    HostPathProvisioner, HostPathProvisionerStatus, StoragePool, StoragePoolPhase, StoragePoolStatus,
};
use crate::domain::ObjectStore;
use crate::error::{Error, Result};
use crate::manifests::pools::{
    cleanup_job, cleanup_job_name, pool_claim, pool_deployment, pool_resource_name, CLEANUP_SELECTOR,
    NODE_LABEL, POOL_LABEL, POOL_PATH_ANNOTATION, POOL_SELECTOR,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, error, info};

/// Names of the nodes matching the workload node selector
pub async fn matching_nodes<S: ObjectStore + ?Sized>(store: &S, cr: &HostPathProvisioner) -> Result<Vec<String>> {
    let selector = cr
        .spec
        .workload
        .node_selector
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",");
    let nodes: Vec<Node> = store
        .list("", (!selector.is_empty()).then_some(selector.as_str()))
        .await?;
    Ok(nodes.into_iter().filter_map(|n| n.metadata.name).collect())
}

fn template_pools(cr: &HostPathProvisioner) -> impl Iterator<Item = &StoragePool> {
    cr.spec.storage_pools.iter().filter(|p| p.has_template())
}

/// Converge per-node claims and deployments for every template pool.
///
/// Deployments no longer desired are removed. Returns how many pool
/// deployments are desired.
pub async fn reconcile_pools<S: ObjectStore + ?Sized>(
    store: &S,
    cr: &HostPathProvisioner,
    config: &ControllerConfig,
) -> Result<usize> {
    let mut desired = BTreeSet::new();
    if template_pools(cr).next().is_some() {
        let nodes = matching_nodes(store, cr).await?;
        for pool in template_pools(cr) {
            for node in &nodes {
                if let Some(claim) = pool_claim(cr, config, pool, node) {
                    apply(store, claim).await?;
                }
                if let Some(deployment) = pool_deployment(cr, config, pool, node) {
                    apply(store, deployment).await?;
                }
                desired.insert(pool_resource_name(&pool.name, node));
            }
        }
    }

    clean_deployments(store, cr, config, &desired).await?;
    Ok(desired.len())
}

/// Delete pool deployments not in `keep` together with their claims, and
/// start a cleanup job for each
pub async fn clean_deployments<S: ObjectStore + ?Sized>(
    store: &S,
    cr: &HostPathProvisioner,
    config: &ControllerConfig,
    keep: &BTreeSet<String>,
) -> Result<()> {
    let namespace = config.namespace.as_str();
    let live: Vec<Deployment> = store.list(namespace, Some(POOL_SELECTOR)).await?;

    for deployment in live {
        let Some(name) = deployment.metadata.name.clone() else {
            continue;
        };
        if keep.contains(&name) {
            continue;
        }

        let labels = deployment.metadata.labels.clone().unwrap_or_default();
        let pool = StoragePool {
            name: labels.get(POOL_LABEL).cloned().unwrap_or_default(),
            path: deployment
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(POOL_PATH_ANNOTATION))
                .cloned()
                .unwrap_or_default(),
            pvc_template: None,
        };
        let node = labels.get(NODE_LABEL).cloned().unwrap_or_default();

        info!(deployment = %name, pool = %pool.name, node = %node, "Removing storage pool deployment");
        store.delete::<Deployment>(namespace, &name).await?;
        store.delete::<PersistentVolumeClaim>(namespace, &name).await?;

        let job_name = cleanup_job_name(&pool.name, &node);
        if store.get::<Job>(namespace, &job_name).await?.is_none() {
            info!(job = %job_name, "Starting storage pool cleanup");
            store.create(&cleanup_job(cr, config, &pool, &node)).await?;
        }
    }
    Ok(())
}

fn job_finished(job: &Job) -> bool {
    job.status
        .as_ref()
        .is_some_and(|s| s.succeeded.unwrap_or(0) > 0 || s.completion_time.is_some())
}

/// Out of retries: a `Failed` condition, or failed pods and none left running
fn job_failed(job: &Job) -> bool {
    job.status.as_ref().is_some_and(|s| {
        let failed_condition = s
            .conditions
            .iter()
            .flatten()
            .any(|c| c.type_ == "Failed" && c.status == "True");
        failed_condition || (s.failed.unwrap_or(0) > 0 && s.active.unwrap_or(0) == 0 && !job_finished(job))
    })
}

/// Wait until exactly `target` pool deployments remain and every cleanup
/// job finished, then delete the jobs.
///
/// Returns the poll interval while still converging. A failed cleanup job is
/// an error and stays in place until removed by hand, since the node may
/// still hold the pool's data.
pub async fn await_cleanup<S: ObjectStore + ?Sized>(
    store: &S,
    config: &ControllerConfig,
    target: usize,
) -> Result<Option<Duration>> {
    let namespace = config.namespace.as_str();
    let active: Vec<Deployment> = store.list(namespace, Some(POOL_SELECTOR)).await?;
    let jobs: Vec<Job> = store.list(namespace, Some(CLEANUP_SELECTOR)).await?;
    if let Some(failed) = jobs.iter().find(|job| job_failed(job)) {
        let job = failed.metadata.name.clone().unwrap_or_default();
        error!(job = %job, "Storage pool cleanup job failed");
        return Err(Error::CleanupFailed { job });
    }
    let finished = jobs.iter().all(job_finished);

    info!(
        active = active.len(),
        target,
        cleanup_jobs = jobs.len(),
        finished,
        "Storage pool deployments still active"
    );
    if active.len() != target || !finished {
        return Ok(Some(config.cleanup_poll_interval));
    }

    for job in jobs {
        if let Some(name) = job.metadata.name.as_deref() {
            debug!(job = %name, "Removing finished cleanup job");
            store.delete::<Job>(namespace, name).await?;
        }
    }
    Ok(None)
}

/// Compute per-pool readiness into the status
pub async fn reconcile_pool_status<S: ObjectStore + ?Sized>(
    store: &S,
    cr: &HostPathProvisioner,
    config: &ControllerConfig,
    status: &mut HostPathProvisionerStatus,
) -> Result<()> {
    let deployments: Vec<Deployment> = if template_pools(cr).next().is_some() {
        store.list(&config.namespace, Some(POOL_SELECTOR)).await?
    } else {
        Vec::new()
    };
    let nodes = if template_pools(cr).next().is_some() {
        matching_nodes(store, cr).await?
    } else {
        Vec::new()
    };

    status.storage_pool_statuses = cr
        .spec
        .storage_pools
        .iter()
        .map(|pool| {
            if !pool.has_template() {
                return StoragePoolStatus {
                    name: pool.name.clone(),
                    phase: StoragePoolPhase::Ready,
                    desired_ready: 0,
                    current_ready: 0,
                };
            }
            let wanted: BTreeSet<String> = nodes
                .iter()
                .map(|node| pool_resource_name(&pool.name, node))
                .collect();
            let current = deployments
                .iter()
                .filter(|d| d.metadata.name.as_ref().is_some_and(|n| wanted.contains(n)))
                .filter(|d| {
                    d.status
                        .as_ref()
                        .and_then(|s| s.available_replicas)
                        .unwrap_or(0)
                        > 0
                })
                .count();
            let desired = wanted.len();
            StoragePoolStatus {
                name: pool.name.clone(),
                phase: if desired > 0 && current >= desired {
                    StoragePoolPhase::Ready
                } else {
                    StoragePoolPhase::NotReady
                },
                desired_ready: desired as u32,
                current_ready: current as u32,
            }
        })
        .collect();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{config, node, template_pool};
    use crate::crd::HostPathProvisionerSpec;
    use crate::store::MemoryStore;
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use k8s_openapi::api::batch::v1::JobStatus;

    fn cr_with_pools(pools: Vec<StoragePool>) -> HostPathProvisioner {
        let mut cr = HostPathProvisioner::new(
            "hostpath-provisioner",
            HostPathProvisionerSpec {
                storage_pools: pools,
                ..Default::default()
            },
        );
        cr.metadata.uid = Some("cr-uid".into());
        cr
    }

    #[tokio::test]
    async fn test_pool_objects_per_matching_node() {
        let store = MemoryStore::new();
        store.insert(node("node-1", &[("kubernetes.io/os", "linux")])).unwrap();
        store.insert(node("node-2", &[("kubernetes.io/os", "linux")])).unwrap();
        store.insert(node("node-3", &[("kubernetes.io/os", "windows")])).unwrap();

        let mut cr = cr_with_pools(vec![template_pool("local")]);
        cr.spec.workload.node_selector.insert("kubernetes.io/os".into(), "linux".into());

        let desired = reconcile_pools(&store, &cr, &config()).await.unwrap();
        assert_eq!(desired, 2);
        assert_eq!(store.objects::<Deployment>().len(), 2);
        assert_eq!(store.objects::<PersistentVolumeClaim>().len(), 2);
        assert!(store.object::<Deployment>("hpp", "hpp-pool-local-node-3").is_none());
    }

    #[tokio::test]
    async fn test_removed_pool_gets_cleanup_job() {
        let store = MemoryStore::new();
        store.insert(node("node-1", &[])).unwrap();
        let cr = cr_with_pools(vec![template_pool("local")]);
        reconcile_pools(&store, &cr, &config()).await.unwrap();

        let cr = cr_with_pools(vec![]);
        assert_eq!(reconcile_pools(&store, &cr, &config()).await.unwrap(), 0);
        assert!(store.objects::<Deployment>().is_empty());
        assert!(store.objects::<PersistentVolumeClaim>().is_empty());

        let job: Job = store.object("hpp", "cleanup-pool-local-node-1").unwrap();
        let command = job.spec.unwrap().template.spec.unwrap().containers[0].command.clone().unwrap();
        assert!(command.contains(&"/var/hpp/local".to_string()));
    }

    #[tokio::test]
    async fn test_await_cleanup_waits_for_jobs() {
        let store = MemoryStore::new();
        store.insert(node("node-1", &[])).unwrap();
        reconcile_pools(&store, &cr_with_pools(vec![template_pool("local")]), &config()).await.unwrap();
        reconcile_pools(&store, &cr_with_pools(vec![]), &config()).await.unwrap();

        let poll = await_cleanup(&store, &config(), 0).await.unwrap();
        assert_eq!(poll, Some(Duration::from_secs(1)));

        let mut job: Job = store.object("hpp", "cleanup-pool-local-node-1").unwrap();
        job.status = Some(JobStatus {
            succeeded: Some(1),
            ..Default::default()
        });
        store.insert(job).unwrap();

        assert_eq!(await_cleanup(&store, &config(), 0).await.unwrap(), None);
        assert!(store.objects::<Job>().is_empty());
    }

    #[tokio::test]
    async fn test_failed_cleanup_job_is_reported() {
        let store = MemoryStore::new();
        store.insert(node("node-1", &[])).unwrap();
        reconcile_pools(&store, &cr_with_pools(vec![template_pool("local")]), &config()).await.unwrap();
        reconcile_pools(&store, &cr_with_pools(vec![]), &config()).await.unwrap();

        let mut job: Job = store.object("hpp", "cleanup-pool-local-node-1").unwrap();
        job.status = Some(JobStatus {
            failed: Some(6),
            ..Default::default()
        });
        store.insert(job).unwrap();

        let err = await_cleanup(&store, &config(), 0).await.unwrap_err();
        assert!(matches!(err, Error::CleanupFailed { job } if job == "cleanup-pool-local-node-1"));
        assert_eq!(store.objects::<Job>().len(), 1);
    }

    #[test]
    fn test_job_failure_detection() {
        use k8s_openapi::api::batch::v1::JobCondition;

        let job = |status: JobStatus| Job {
            status: Some(status),
            ..Default::default()
        };
        assert!(!job_failed(&Job::default()));
        assert!(!job_failed(&job(JobStatus {
            failed: Some(2),
            active: Some(1),
            ..Default::default()
        })));
        assert!(!job_failed(&job(JobStatus {
            failed: Some(2),
            succeeded: Some(1),
            ..Default::default()
        })));
        assert!(job_failed(&job(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Failed".into(),
                status: "True".into(),
                reason: Some("BackoffLimitExceeded".into()),
                ..Default::default()
            }]),
            ..Default::default()
        })));
    }

    #[tokio::test]
    async fn test_pool_status() {
        let store = MemoryStore::new();
        store.insert(node("node-1", &[])).unwrap();
        store.insert(node("node-2", &[])).unwrap();
        let mut plain = template_pool("plain");
        plain.pvc_template = None;
        let cr = cr_with_pools(vec![template_pool("local"), plain]);
        reconcile_pools(&store, &cr, &config()).await.unwrap();

        let mut deployment: Deployment = store.object("hpp", "hpp-pool-local-node-1").unwrap();
        deployment.status = Some(DeploymentStatus {
            available_replicas: Some(1),
            ..Default::default()
        });
        store.insert(deployment).unwrap();

        let mut status = HostPathProvisionerStatus::default();
        reconcile_pool_status(&store, &cr, &config(), &mut status).await.unwrap();
        let local = &status.storage_pool_statuses[0];
        assert_eq!((local.phase, local.desired_ready, local.current_ready), (StoragePoolPhase::NotReady, 2, 1));
        assert_eq!(status.storage_pool_statuses[1].phase, StoragePoolPhase::Ready);
    }
}
