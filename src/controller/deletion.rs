//! Teardown of cluster-scoped dependents before the CR goes away

use super::pools;
use super::reconciler::{ReconcileOutcome, Reconciler};
use crate::crd::{HostPathProvisioner, PrometheusRule, SecurityContextConstraints, ServiceMonitor, HPP_FINALIZER};
use crate::domain::{EventRecorder, ManagedObject, ObjectStore, ReadinessGauge};
use crate::error::Result;
use crate::manifests::monitoring::{METRICS_SERVICE_NAME, MONITORING_RBAC_NAME, RULE_NAME, SERVICE_MONITOR_NAME};
use crate::manifests::{CSI_DRIVER_NAME, CSI_NAME, MULTI_PURPOSE_NAME, RBAC_NAMES};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::api::storage::v1::CSIDriver;
use std::collections::BTreeSet;
use tracing::{error, info};

impl<S, E, G> Reconciler<S, E, G>
where
    S: ObjectStore,
    E: EventRecorder + ?Sized,
    G: ReadinessGauge + ?Sized,
{
    /// Remove every dependent, then release the finalizer.
    ///
    /// Any failed delete aborts the sequence with the finalizer still in
    /// place, so teardown is retried until it completes.
    pub(crate) async fn finalize(&self, mut cr: HostPathProvisioner) -> Result<ReconcileOutcome> {
        let store = self.store.as_ref();
        let namespace = self.config.namespace.as_str();

        pools::clean_deployments(store, &cr, &self.config, &BTreeSet::new()).await?;
        if let Some(delay) = pools::await_cleanup(store, &self.config, 0).await? {
            return Ok(ReconcileOutcome::RequeueAfter(delay));
        }

        for name in [MULTI_PURPOSE_NAME, CSI_NAME] {
            self.remove::<SecurityContextConstraints>("", name).await?;
        }

        self.remove::<PrometheusRule>(namespace, RULE_NAME).await?;
        self.remove::<ServiceMonitor>(namespace, SERVICE_MONITOR_NAME).await?;
        self.remove::<Service>(namespace, METRICS_SERVICE_NAME).await?;
        self.remove::<RoleBinding>(namespace, MONITORING_RBAC_NAME).await?;
        self.remove::<Role>(namespace, MONITORING_RBAC_NAME).await?;

        for name in RBAC_NAMES {
            self.remove::<ClusterRoleBinding>("", name).await?;
            self.remove::<ClusterRole>("", name).await?;
            self.remove::<RoleBinding>(namespace, name).await?;
            self.remove::<Role>(namespace, name).await?;
        }

        self.remove::<CSIDriver>("", CSI_DRIVER_NAME).await?;

        if cr.remove_finalizer(HPP_FINALIZER) {
            if let Err(err) = store.update(&cr).await {
                error!(error = %err, "Unable to remove finalizer from CR");
                return Err(err);
            }
            info!(name = %cr.name(), "Released deletion finalizer");
        }
        Ok(ReconcileOutcome::Done)
    }

    async fn remove<K: ManagedObject>(&self, namespace: &str, name: &str) -> Result<()> {
        let kind = K::kind(&());
        match self.store.delete::<K>(namespace, name).await {
            Ok(true) => {
                info!(kind = %kind, name, "Deleted object");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(err) => {
                error!(kind = %kind, name, error = %err, "Unable to delete object");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{driver_only_cr, node, set_daemonset_ready, template_pool, Harness, CR_NAME};
    use crate::error::Error;
    use crate::store::WriteOp;
    use crate::telemetry::reasons;
    use assert_matches::assert_matches;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::batch::v1::{Job, JobStatus};
    use std::time::Duration;

    /// Deployed CR with one template pool on one node, marked for deletion
    async fn deleting_harness() -> Harness {
        let mut cr = driver_only_cr(CR_NAME);
        cr.spec.storage_pools = vec![template_pool("local")];
        let harness = Harness::openshift();
        harness.store.insert(cr).unwrap();
        harness.store.insert(node("node-1", &[])).unwrap();
        harness.reconcile().await.unwrap();
        set_daemonset_ready(&harness.store, CSI_NAME, 1, 1);
        harness.reconcile().await.unwrap();

        harness.store.delete::<HostPathProvisioner>("", CR_NAME).await.unwrap();
        harness.store.clear_writes();
        harness
    }

    fn finish_cleanup_jobs(harness: &Harness) {
        for mut job in harness.store.objects::<Job>() {
            job.status = Some(JobStatus {
                succeeded: Some(1),
                ..Default::default()
            });
            harness.store.insert(job).unwrap();
        }
    }

    #[tokio::test]
    async fn test_finalizer_held_until_cleanup_converges() {
        let harness = deleting_harness().await;

        // Pool deployment carries a finalizer of its own: it lingers terminating
        let mut deployment: Deployment = harness.store.object("hpp", "hpp-pool-local-node-1").unwrap();
        deployment.metadata.finalizers = Some(vec!["foregroundDeletion".into()]);
        harness.store.insert(deployment).unwrap();

        let poll = ReconcileOutcome::RequeueAfter(Duration::from_secs(1));
        assert_eq!(harness.reconcile().await.unwrap(), poll);
        assert!(harness.cr().has_finalizer(HPP_FINALIZER));

        harness.store.remove_finalizers::<Deployment>("hpp", "hpp-pool-local-node-1").unwrap();
        assert_eq!(harness.reconcile().await.unwrap(), poll);
        assert!(harness.cr().has_finalizer(HPP_FINALIZER));

        finish_cleanup_jobs(&harness);
        assert_eq!(harness.reconcile().await.unwrap(), ReconcileOutcome::Done);

        assert!(harness.store.object::<HostPathProvisioner>("", CR_NAME).is_none());
        assert!(harness.store.objects::<Job>().is_empty());
        assert!(harness.store.objects::<CSIDriver>().is_empty());
        assert!(harness.store.objects::<ClusterRole>().is_empty());
        assert!(harness.store.objects::<ClusterRoleBinding>().is_empty());
        assert!(harness.store.objects::<SecurityContextConstraints>().is_empty());
        assert!(harness.store.objects::<PrometheusRule>().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_order() {
        let harness = deleting_harness().await;
        finish_cleanup_jobs(&harness);
        assert_eq!(harness.reconcile().await.unwrap(), ReconcileOutcome::RequeueAfter(Duration::from_secs(1)));
        finish_cleanup_jobs(&harness);
        harness.store.clear_writes();
        assert_eq!(harness.reconcile().await.unwrap(), ReconcileOutcome::Done);

        let kinds: Vec<String> = harness
            .store
            .writes()
            .into_iter()
            .filter(|w| w.op == WriteOp::Delete)
            .map(|w| w.kind)
            .collect();
        let position = |kind: &str| kinds.iter().position(|k| k == kind).unwrap();
        assert!(position("Job") < position("SecurityContextConstraints"));
        assert!(position("SecurityContextConstraints") < position("PrometheusRule"));
        assert!(position("PrometheusRule") < position("ClusterRoleBinding"));
        assert!(position("ClusterRoleBinding") < position("ClusterRole"));
        assert!(position("ClusterRole") < position("CSIDriver"));

        let last = harness.store.writes().pop().unwrap();
        assert_eq!((last.op, last.kind.as_str()), (WriteOp::Update, "HostPathProvisioner"));
    }

    #[tokio::test]
    async fn test_failed_cleanup_job_blocks_teardown_visibly() {
        let harness = deleting_harness().await;
        assert_eq!(harness.reconcile().await.unwrap(), ReconcileOutcome::RequeueAfter(Duration::from_secs(1)));

        for mut job in harness.store.objects::<Job>() {
            job.status = Some(JobStatus {
                failed: Some(6),
                ..Default::default()
            });
            harness.store.insert(job).unwrap();
        }
        harness.events.clear();

        let err = harness.reconcile().await.unwrap_err();
        assert_matches!(err, Error::CleanupFailed { .. });
        let cr = harness.cr();
        assert!(cr.has_finalizer(HPP_FINALIZER));
        assert!(cr.is_degraded());
        assert_eq!(harness.events.reasons(), vec![reasons::RECONCILE_FAILED]);
        assert_eq!(harness.store.objects::<CSIDriver>().len(), 1);

        // Removing the failed job by hand lets teardown finish
        harness.store.delete::<Job>("hpp", "cleanup-pool-local-node-1").await.unwrap();
        assert_eq!(harness.reconcile().await.unwrap(), ReconcileOutcome::Done);
        assert!(harness.store.object::<HostPathProvisioner>("", CR_NAME).is_none());
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_finalizer() {
        let harness = deleting_harness().await;
        finish_cleanup_jobs(&harness);
        harness.reconcile().await.unwrap();
        finish_cleanup_jobs(&harness);

        harness.store.fail_next(WriteOp::Delete, "CSIDriver");
        let err = harness.reconcile().await.unwrap_err();
        assert_matches!(err, Error::Kube(_));
        assert!(harness.cr().has_finalizer(HPP_FINALIZER));
        assert_eq!(harness.store.objects::<CSIDriver>().len(), 1);

        assert_eq!(harness.reconcile().await.unwrap(), ReconcileOutcome::Done);
        assert!(harness.store.objects::<CSIDriver>().is_empty());
    }
}
