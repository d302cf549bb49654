//! The reconcile loop for the HostPathProvisioner CR
//!
//! One pass reads the CR, converges every owned object and persists the
//! resulting status. Steps short-circuit on error. Delayed retries are
//! returned as [`ReconcileOutcome::RequeueAfter`], never slept on.

use super::status::{self, StatusChange};
use super::{pools, version, ControllerConfig};
use crate::crd::{HostPathProvisioner, HostPathProvisionerStatus, Utc, HPP_FINALIZER};
use crate::domain::{EventRecorder, EventSeverity, ObjectStore, ReadinessGauge};
use crate::error::{Error, Result};
use crate::telemetry::reasons;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What the work queue should do with the CR key after a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Wait for the next watch event
    Done,
    /// Run again after the delay
    RequeueAfter(Duration),
}

impl From<Option<Duration>> for ReconcileOutcome {
    fn from(delay: Option<Duration>) -> Self {
        delay.map_or(ReconcileOutcome::Done, ReconcileOutcome::RequeueAfter)
    }
}

/// Drives the CR towards its desired state
pub struct Reconciler<S, E: ?Sized, G: ?Sized> {
    pub(crate) store: Arc<S>,
    pub(crate) events: Arc<E>,
    pub(crate) gauge: Arc<G>,
    pub(crate) config: ControllerConfig,
}

impl<S, E, G> Reconciler<S, E, G>
where
    S: ObjectStore,
    E: EventRecorder + ?Sized,
    G: ReadinessGauge + ?Sized,
{
    pub fn new(store: Arc<S>, events: Arc<E>, gauge: Arc<G>, config: ControllerConfig) -> Self {
        Self {
            store,
            events,
            gauge,
            config,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Reconcile the CR called `name`
    pub async fn reconcile(&self, name: &str) -> Result<ReconcileOutcome> {
        let instances: Vec<HostPathProvisioner> = self.store.list("", None).await?;
        if instances.len() > 1 {
            error!(count = instances.len(), "More than one HostPathProvisioner, refusing to reconcile");
            return Err(Error::MultipleInstances {
                count: instances.len(),
            });
        }

        let Some(mut cr) = self.store.get::<HostPathProvisioner>("", name).await? else {
            debug!(name, "HostPathProvisioner not found, assuming it was deleted");
            return Ok(ReconcileOutcome::Done);
        };
        let before = cr.status.clone();
        info!(name, mode = %cr.mode(), "Reconciling HostPathProvisioner");

        status::report_readiness(&cr, self.gauge.as_ref());

        if cr.is_being_deleted() {
            return match self.finalize(cr.clone()).await {
                Ok(outcome) => Ok(outcome),
                Err(err) => {
                    error!(error = %err, "Teardown failed");
                    self.report_failure(&mut cr, &err).await;
                    self.persist_status(&mut cr, before.as_ref(), Err(err)).await
                }
            };
        }

        if cr.add_finalizer(HPP_FINALIZER) {
            debug!(name, "Adding deletion finalizer");
            cr = self.store.update(&cr).await?;
        }

        let result = self.converge(&mut cr).await;
        self.persist_status(&mut cr, before.as_ref(), result).await
    }

    /// Version gate, resource pass and status pass, all on the in-memory CR
    async fn converge(&self, cr: &mut HostPathProvisioner) -> Result<Option<Duration>> {
        let now = Utc::now();
        let target = self.config.operator_version.clone();
        {
            let status = cr.status.get_or_insert_with(Default::default);
            status.operator_version = target.clone();
            status.target_version = target.clone();
        }

        let upgrade = version::can_upgrade(cr.observed_version(), &target)?;
        let deploying = status::is_deploying(cr);
        let upgrading = upgrade && status::is_upgrading(cr);

        if deploying {
            let status = cr.status.get_or_insert_with(Default::default);
            if status::mark_deploying(status, reasons::DEPLOY_STARTED, status::DEPLOY_STARTED_MESSAGE, now) {
                info!("Started deploying");
                self.events
                    .publish(cr, EventSeverity::Normal, reasons::DEPLOY_STARTED, status::DEPLOY_STARTED_MESSAGE)
                    .await;
            }
        }
        if upgrading {
            let message = format!("Started upgrade to version {}", target);
            let status = cr.status.get_or_insert_with(Default::default);
            if status::mark_upgrading(status, reasons::UPGRADE_STARTED, &message, now) {
                info!(from = %cr.observed_version(), to = %target, "Started upgrading");
                self.events
                    .publish(cr, EventSeverity::Warning, reasons::UPGRADE_STARTED, &message)
                    .await;
            }
        }

        match self.reconcile_resources(cr, now).await {
            Ok(requeue) => {
                self.reconcile_status(cr).await?;
                Ok(requeue)
            }
            Err(err) => {
                error!(error = %err, "Resource pass failed");
                self.report_failure(cr, &err).await;
                Err(err)
            }
        }
    }

    /// Mark the CR failed and raise a warning event for an aborted pass
    async fn report_failure(&self, cr: &mut HostPathProvisioner, err: &Error) {
        let message = format!("Unable to successfully reconcile: {}", err);
        let status = cr.status.get_or_insert_with(Default::default);
        status::mark_failed_healing(status, reasons::RECONCILE_FAILED, &message, Utc::now());
        self.events
            .publish(cr, EventSeverity::Warning, reasons::RECONCILE_FAILED, &message)
            .await;
    }

    /// Degraded check, pool readiness and observed version
    async fn reconcile_status(&self, cr: &mut HostPathProvisioner) -> Result<()> {
        let degraded = !self.workload_readiness(cr).await?.ready();
        debug!(degraded, "Degraded check");

        let deploying = status::is_deploying(cr);
        let mut status = cr.status.take().unwrap_or_default();
        if degraded && !deploying {
            status::mark_failed(&mut status, status::DEGRADED_REASON, status::DEGRADED_MESSAGE, Utc::now());
        }

        let pools = pools::reconcile_pool_status(self.store.as_ref(), cr, &self.config, &mut status).await;
        if let Err(err) = pools {
            status::mark_failed_healing(&mut status, status::POOL_NOT_READY_REASON, &err.to_string(), Utc::now());
            cr.status = Some(status);
            return Err(err);
        }

        if !degraded && status.observed_version != self.config.operator_version {
            info!(version = %self.config.operator_version, "Observed version advanced");
            status.observed_version = self.config.operator_version.clone();
        }
        cr.status = Some(status);
        Ok(())
    }

    /// Write the status when it changed and fold the write into the pass result.
    ///
    /// A failed write replaces a successful result; an earlier error wins
    /// over a failed write.
    async fn persist_status(
        &self,
        cr: &mut HostPathProvisioner,
        before: Option<&HostPathProvisionerStatus>,
        result: Result<Option<Duration>>,
    ) -> Result<ReconcileOutcome> {
        if let Err(Error::Downgrade { .. }) = &result {
            return result.map(ReconcileOutcome::from);
        }

        if let Some(after) = cr.status.as_mut() {
            status::settle(before, after);
        }
        let changes: Vec<StatusChange> = status::changes(before, cr.status.as_ref());
        if !changes.is_empty() {
            info!(?changes, "Persisting status");
            if let Err(write_err) = self.store.update_status(&*cr).await {
                warn!(error = %write_err, "Unable to persist status");
                if result.is_ok() {
                    return Err(write_err);
                }
            }
        }
        result.map(ReconcileOutcome::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{
        driver_only_cr, legacy_cr, node, set_daemonset_ready, template_pool, Harness,
    };
    use crate::crd::{find_condition, ConditionStatus, ConditionType, StoragePoolPhase};
    use crate::domain::{NOT_READY, READY};
    use crate::manifests::{CSI_NAME, MULTI_PURPOSE_NAME};
    use crate::store::WriteOp;
    use assert_matches::assert_matches;
    use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
    use k8s_openapi::api::core::v1::ServiceAccount;
    use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
    use k8s_openapi::api::storage::v1::CSIDriver;

    fn condition(cr: &HostPathProvisioner, r#type: ConditionType) -> bool {
        match r#type {
            ConditionType::Available => cr.is_available(),
            ConditionType::Progressing => cr.is_progressing(),
            ConditionType::Degraded => cr.is_degraded(),
            ConditionType::Other(_) => false,
        }
    }

    #[tokio::test]
    async fn test_multiple_instances_refused_without_writes() {
        let harness = Harness::new();
        harness.store.insert(driver_only_cr("first")).unwrap();
        harness.store.insert(driver_only_cr("second")).unwrap();

        let err = harness.reconciler.reconcile("first").await.unwrap_err();
        assert_matches!(err, Error::MultipleInstances { count: 2 });
        assert!(harness.store.writes().is_empty());
        assert!(harness.events.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_missing_cr_is_done() {
        let harness = Harness::new();
        let outcome = harness.reconcile().await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);
        assert!(harness.store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_first_pass_deploys() {
        let harness = Harness::with_cr(driver_only_cr("hostpath-provisioner"));

        let outcome = harness.reconcile().await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);

        let store = &harness.store;
        assert!(store.object::<DaemonSet>("hpp", CSI_NAME).is_some());
        assert!(store.object::<DaemonSet>("hpp", MULTI_PURPOSE_NAME).is_none());
        assert_eq!(store.objects::<ServiceAccount>().len(), 2);
        assert_eq!(store.objects::<ClusterRole>().len(), 2);
        assert_eq!(store.objects::<ClusterRoleBinding>().len(), 2);
        assert!(store.object::<Role>("hpp", "hostpath-provisioner-admin-csi").is_some());
        assert!(store.object::<RoleBinding>("hpp", "hostpath-provisioner-admin-csi").is_some());
        assert_eq!(store.objects::<CSIDriver>().len(), 1);

        let cr = harness.cr();
        assert!(cr.has_finalizer(HPP_FINALIZER));
        assert!(condition(&cr, ConditionType::Progressing));
        assert!(!condition(&cr, ConditionType::Available));
        assert!(!condition(&cr, ConditionType::Degraded));
        assert_eq!(cr.observed_version(), "");
        assert_eq!(harness.events.reasons(), vec![reasons::DEPLOY_STARTED]);
    }

    #[tokio::test]
    async fn test_foreign_condition_is_kept() {
        let mut cr = driver_only_cr("hostpath-provisioner");
        cr.status = Some(
            serde_json::from_value(serde_json::json!({
                "conditions": [{
                    "type": "Upgradeable",
                    "status": "False",
                    "reason": "Pinned",
                    "message": "pinned by admin"
                }]
            }))
            .unwrap(),
        );
        let harness = Harness::with_cr(cr);

        harness.reconcile().await.unwrap();
        set_daemonset_ready(&harness.store, CSI_NAME, 3, 3);
        harness.reconcile().await.unwrap();

        let cr = harness.cr();
        assert!(condition(&cr, ConditionType::Available));
        let upgradeable = find_condition(cr.conditions(), &ConditionType::Other("Upgradeable".into())).unwrap();
        assert_eq!(upgradeable.status, ConditionStatus::False);
        assert_eq!(upgradeable.reason, "Pinned");
        assert_eq!(upgradeable.message, "pinned by admin");
    }

    #[tokio::test]
    async fn test_rollout_completes_deploy() {
        let harness = Harness::with_cr(driver_only_cr("hostpath-provisioner"));
        harness.reconcile().await.unwrap();

        // Deploying never reports Degraded, however long the rollout takes
        set_daemonset_ready(&harness.store, CSI_NAME, 0, 3);
        harness.reconcile().await.unwrap();
        let cr = harness.cr();
        assert!(!condition(&cr, ConditionType::Degraded));
        assert!(condition(&cr, ConditionType::Progressing));

        set_daemonset_ready(&harness.store, CSI_NAME, 3, 3);
        let outcome = harness.reconcile().await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);

        let cr = harness.cr();
        assert!(condition(&cr, ConditionType::Available));
        assert!(!condition(&cr, ConditionType::Progressing));
        assert!(!condition(&cr, ConditionType::Degraded));
        assert_eq!(cr.observed_version(), "1.2.0");
        assert!(harness.events.reasons().iter().any(|r| r == reasons::PROVISIONER_HEALTHY));
    }

    #[tokio::test]
    async fn test_steady_state_is_idempotent() {
        let harness = Harness::with_cr(driver_only_cr("hostpath-provisioner"));
        harness.reconcile().await.unwrap();
        set_daemonset_ready(&harness.store, CSI_NAME, 3, 3);
        harness.reconcile().await.unwrap();

        harness.store.clear_writes();
        harness.events.clear();
        harness.reconcile().await.unwrap();
        assert!(harness.store.writes().is_empty(), "{:?}", harness.store.writes());
        assert!(harness.events.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_unready_workload_degrades_deployed_cr() {
        let harness = Harness::with_cr(driver_only_cr("hostpath-provisioner"));
        harness.reconcile().await.unwrap();
        set_daemonset_ready(&harness.store, CSI_NAME, 3, 3);
        harness.reconcile().await.unwrap();

        set_daemonset_ready(&harness.store, CSI_NAME, 2, 3);
        harness.reconcile().await.unwrap();
        let cr = harness.cr();
        assert!(condition(&cr, ConditionType::Degraded));
        assert!(!condition(&cr, ConditionType::Available));
        assert_eq!(cr.observed_version(), "1.2.0");
    }

    #[tokio::test]
    async fn test_legacy_mode_needs_both_daemonsets() {
        let harness = Harness::with_cr(legacy_cr("hostpath-provisioner"));
        harness.reconcile().await.unwrap();
        assert!(harness.store.object::<DaemonSet>("hpp", MULTI_PURPOSE_NAME).is_some());

        set_daemonset_ready(&harness.store, CSI_NAME, 3, 3);
        set_daemonset_ready(&harness.store, MULTI_PURPOSE_NAME, 0, 3);
        harness.reconcile().await.unwrap();
        assert!(!harness.cr().is_available());

        set_daemonset_ready(&harness.store, MULTI_PURPOSE_NAME, 3, 3);
        harness.reconcile().await.unwrap();
        assert!(harness.cr().is_available());

        // Switching to driver-only removes the legacy DaemonSet
        let mut cr = harness.cr();
        cr.spec.path_config = None;
        harness.store.insert(cr).unwrap();
        harness.reconcile().await.unwrap();
        assert!(harness.store.object::<DaemonSet>("hpp", MULTI_PURPOSE_NAME).is_none());
        assert!(harness.cr().is_available());
    }

    #[tokio::test]
    async fn test_upgrade_emits_warning_once() {
        let harness = Harness::with_cr(driver_only_cr("hostpath-provisioner"));
        harness.reconcile().await.unwrap();
        set_daemonset_ready(&harness.store, CSI_NAME, 3, 3);
        let mut cr = harness.cr();
        let status = cr.status.get_or_insert_with(Default::default);
        status.observed_version = "1.1.0".into();
        harness.store.insert(cr).unwrap();
        harness.events.clear();

        harness.reconcile().await.unwrap();
        let cr = harness.cr();
        assert!(cr.is_available());
        assert_eq!(cr.observed_version(), "1.2.0");
        assert_eq!(
            harness.events.reasons(),
            vec![reasons::UPGRADE_STARTED, reasons::PROVISIONER_HEALTHY]
        );
        assert_eq!(harness.events.recorded()[0].0, EventSeverity::Warning);

        harness.reconcile().await.unwrap();
        assert_eq!(harness.events.recorded().len(), 2);
    }

    #[tokio::test]
    async fn test_downgrade_blocks_everything() {
        let harness = Harness::new();
        let mut cr = driver_only_cr("hostpath-provisioner");
        cr.metadata.finalizers = Some(vec![HPP_FINALIZER.to_string()]);
        cr.status = Some(HostPathProvisionerStatus {
            observed_version: "1.3.0".into(),
            ..Default::default()
        });
        harness.store.insert(cr).unwrap();

        let err = harness.reconcile().await.unwrap_err();
        assert_matches!(err, Error::Downgrade { .. });
        assert!(harness.store.writes().is_empty());
        assert!(harness.store.objects::<DaemonSet>().is_empty());
    }

    #[tokio::test]
    async fn test_failed_step_marks_cr_and_warns() {
        let harness = Harness::with_cr(driver_only_cr("hostpath-provisioner"));
        harness.reconcile().await.unwrap();
        set_daemonset_ready(&harness.store, CSI_NAME, 3, 3);
        harness.reconcile().await.unwrap();
        harness.events.clear();

        let mut role: ClusterRole = harness.store.object("", "hostpath-provisioner-admin-csi").unwrap();
        role.rules = None;
        harness.store.insert(role).unwrap();
        harness.store.fail_next(WriteOp::Update, "ClusterRole");

        let err = harness.reconcile().await.unwrap_err();
        assert_matches!(err, Error::Kube(_));

        let cr = harness.cr();
        assert!(cr.is_degraded());
        assert!(cr.is_progressing());
        assert!(!cr.is_available());
        let (severity, reason, message) = harness.events.recorded().remove(0);
        assert_eq!(severity, EventSeverity::Warning);
        assert_eq!(reason, reasons::RECONCILE_FAILED);
        assert!(message.starts_with("Unable to successfully reconcile: "));
    }

    #[tokio::test]
    async fn test_heartbeat_only_change_is_not_written() {
        let harness = Harness::with_cr(driver_only_cr("hostpath-provisioner"));
        harness.reconcile().await.unwrap();
        set_daemonset_ready(&harness.store, CSI_NAME, 3, 3);
        harness.reconcile().await.unwrap();
        harness.store.clear_writes();

        // A later pass stamps fresh heartbeats on identical conditions
        tokio::time::sleep(Duration::from_millis(5)).await;
        harness.reconcile().await.unwrap();
        assert!(harness.store.writes_of("HostPathProvisioner").is_empty());
    }

    #[tokio::test]
    async fn test_readiness_gauge() {
        let harness = Harness::with_cr(driver_only_cr("hostpath-provisioner"));
        harness.reconcile().await.unwrap();
        assert_eq!(harness.gauge.values(), vec![NOT_READY]);

        // Progressing keeps the gauge untouched
        harness.gauge.clear();
        harness.reconcile().await.unwrap();
        assert!(harness.gauge.values().is_empty());

        set_daemonset_ready(&harness.store, CSI_NAME, 3, 3);
        harness.reconcile().await.unwrap();
        harness.reconcile().await.unwrap();
        assert_eq!(harness.gauge.values().last(), Some(&READY));

        set_daemonset_ready(&harness.store, CSI_NAME, 0, 3);
        harness.reconcile().await.unwrap();
        harness.reconcile().await.unwrap();
        assert_eq!(harness.gauge.values().last(), Some(&NOT_READY));
    }

    #[tokio::test]
    async fn test_pool_status_reported() {
        let mut cr = driver_only_cr("hostpath-provisioner");
        cr.spec.storage_pools = vec![template_pool("local")];
        let harness = Harness::with_cr(cr);
        harness.store.insert(node("node-1", &[])).unwrap();
        harness.reconcile().await.unwrap();
        set_daemonset_ready(&harness.store, CSI_NAME, 1, 1);

        harness.reconcile().await.unwrap();
        assert!(harness.store.object::<Deployment>("hpp", "hpp-pool-local-node-1").is_some());
        let status = harness.cr().status.unwrap();
        assert_eq!(status.storage_pool_statuses.len(), 1);
        assert_eq!(status.storage_pool_statuses[0].phase, StoragePoolPhase::NotReady);
    }
}
