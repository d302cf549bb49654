//! Desired-state reconciler
//!
//! [`apply`] fetches an object, creates it when missing and otherwise folds
//! the operator-owned fields of the desired object into the live one,
//! writing only when something moved. [`Converge`] defines which fields the
//! operator owns for each kind; everything else on the live object is left
//! as the cluster set it.

use super::capabilities::probe;
use super::pools;
use super::reconciler::Reconciler;
use super::status::{self, WorkloadReadiness};
use crate::crd::{
    DateTime, HostPathProvisioner, PrometheusRule, SecurityContextConstraints, ServiceMonitor, Utc,
};
use crate::domain::{EventRecorder, EventSeverity, ManagedObject, ObjectStore, ReadinessGauge};
use crate::error::{Error, Result};
use crate::manifests::{self, CSI_NAME, MULTI_PURPOSE_NAME};
use crate::telemetry::reasons;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Container, PersistentVolumeClaim, PodTemplateSpec, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::api::storage::v1::CSIDriver;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Convergence
// =============================================================================

/// Fold the operator-owned fields of `desired` into a live object
pub trait Converge {
    /// Returns true when the live object changed
    fn converge(&mut self, desired: &Self) -> bool;
}

/// Overwrite `live` with `desired` when they differ
fn assign<T: PartialEq + Clone>(live: &mut T, desired: &T) -> bool {
    if live == desired {
        false
    } else {
        *live = desired.clone();
        true
    }
}

/// Merge labels and owner references; foreign entries are kept
fn converge_meta(live: &mut ObjectMeta, desired: &ObjectMeta) -> bool {
    let mut changed = false;

    if let Some(labels) = &desired.labels {
        let live_labels = live.labels.get_or_insert_with(Default::default);
        for (key, value) in labels {
            if live_labels.get(key) != Some(value) {
                live_labels.insert(key.clone(), value.clone());
                changed = true;
            }
        }
    }

    if let Some(owners) = &desired.owner_references {
        let live_owners = live.owner_references.get_or_insert_with(Vec::new);
        for owner in owners {
            if !live_owners.iter().any(|o| o.uid == owner.uid) {
                live_owners.push(owner.clone());
                changed = true;
            }
        }
    }

    changed
}

fn converge_container(live: &mut Container, desired: &Container) -> bool {
    let mut changed = false;
    changed |= assign(&mut live.image, &desired.image);
    changed |= assign(&mut live.image_pull_policy, &desired.image_pull_policy);
    changed |= assign(&mut live.command, &desired.command);
    changed |= assign(&mut live.args, &desired.args);
    changed |= assign(&mut live.env, &desired.env);
    changed |= assign(&mut live.volume_mounts, &desired.volume_mounts);
    changed |= assign(&mut live.security_context, &desired.security_context);
    changed
}

fn converge_pod_template(live: &mut PodTemplateSpec, desired: &PodTemplateSpec) -> bool {
    let mut changed = false;

    if let Some(desired_meta) = &desired.metadata {
        changed |= converge_meta(live.metadata.get_or_insert_with(Default::default), desired_meta);
    }

    let Some(desired_spec) = &desired.spec else {
        return changed;
    };
    let Some(live_spec) = live.spec.as_mut() else {
        live.spec = Some(desired_spec.clone());
        return true;
    };

    let same_containers = live_spec.containers.len() == desired_spec.containers.len()
        && live_spec
            .containers
            .iter()
            .zip(&desired_spec.containers)
            .all(|(l, d)| l.name == d.name);
    if same_containers {
        for (live_container, desired_container) in live_spec.containers.iter_mut().zip(&desired_spec.containers) {
            changed |= converge_container(live_container, desired_container);
        }
    } else {
        live_spec.containers = desired_spec.containers.clone();
        changed = true;
    }

    changed |= assign(&mut live_spec.volumes, &desired_spec.volumes);
    changed |= assign(&mut live_spec.service_account_name, &desired_spec.service_account_name);
    changed |= assign(&mut live_spec.node_selector, &desired_spec.node_selector);
    changed |= assign(&mut live_spec.affinity, &desired_spec.affinity);
    changed |= assign(&mut live_spec.tolerations, &desired_spec.tolerations);
    changed |= assign(&mut live_spec.restart_policy, &desired_spec.restart_policy);
    changed
}

impl Converge for DaemonSet {
    fn converge(&mut self, desired: &Self) -> bool {
        let mut changed = converge_meta(&mut self.metadata, &desired.metadata);
        match (self.spec.as_mut(), desired.spec.as_ref()) {
            (Some(live), Some(desired)) => {
                changed |= converge_pod_template(&mut live.template, &desired.template);
            }
            (None, Some(desired)) => {
                self.spec = Some(desired.clone());
                changed = true;
            }
            _ => {}
        }
        changed
    }
}

impl Converge for Deployment {
    fn converge(&mut self, desired: &Self) -> bool {
        let mut changed = converge_meta(&mut self.metadata, &desired.metadata);
        match (self.spec.as_mut(), desired.spec.as_ref()) {
            (Some(live), Some(desired)) => {
                changed |= assign(&mut live.replicas, &desired.replicas);
                changed |= converge_pod_template(&mut live.template, &desired.template);
            }
            (None, Some(desired)) => {
                self.spec = Some(desired.clone());
                changed = true;
            }
            _ => {}
        }
        changed
    }
}

impl Converge for ClusterRole {
    fn converge(&mut self, desired: &Self) -> bool {
        converge_meta(&mut self.metadata, &desired.metadata) | assign(&mut self.rules, &desired.rules)
    }
}

impl Converge for Role {
    fn converge(&mut self, desired: &Self) -> bool {
        converge_meta(&mut self.metadata, &desired.metadata) | assign(&mut self.rules, &desired.rules)
    }
}

// roleRef is immutable once a binding exists
impl Converge for ClusterRoleBinding {
    fn converge(&mut self, desired: &Self) -> bool {
        converge_meta(&mut self.metadata, &desired.metadata) | assign(&mut self.subjects, &desired.subjects)
    }
}

impl Converge for RoleBinding {
    fn converge(&mut self, desired: &Self) -> bool {
        converge_meta(&mut self.metadata, &desired.metadata) | assign(&mut self.subjects, &desired.subjects)
    }
}

impl Converge for Service {
    fn converge(&mut self, desired: &Self) -> bool {
        let mut changed = converge_meta(&mut self.metadata, &desired.metadata);
        match (self.spec.as_mut(), desired.spec.as_ref()) {
            (Some(live), Some(desired)) => {
                changed |= assign(&mut live.ports, &desired.ports);
                changed |= assign(&mut live.selector, &desired.selector);
            }
            (None, Some(desired)) => {
                self.spec = Some(desired.clone());
                changed = true;
            }
            _ => {}
        }
        changed
    }
}

impl Converge for SecurityContextConstraints {
    fn converge(&mut self, desired: &Self) -> bool {
        let mut changed = converge_meta(&mut self.metadata, &desired.metadata);
        changed |= assign(&mut self.allow_privileged_container, &desired.allow_privileged_container);
        changed |= assign(&mut self.allow_host_dir_volume_plugin, &desired.allow_host_dir_volume_plugin);
        changed |= assign(&mut self.allow_host_ipc, &desired.allow_host_ipc);
        changed |= assign(&mut self.allow_host_network, &desired.allow_host_network);
        changed |= assign(&mut self.allow_host_pid, &desired.allow_host_pid);
        changed |= assign(&mut self.allow_host_ports, &desired.allow_host_ports);
        changed |= assign(&mut self.read_only_root_filesystem, &desired.read_only_root_filesystem);
        changed |= assign(&mut self.required_drop_capabilities, &desired.required_drop_capabilities);
        changed |= assign(&mut self.run_as_user, &desired.run_as_user);
        changed |= assign(&mut self.se_linux_context, &desired.se_linux_context);
        changed |= assign(&mut self.fs_group, &desired.fs_group);
        changed |= assign(&mut self.supplemental_groups, &desired.supplemental_groups);
        changed |= assign(&mut self.volumes, &desired.volumes);
        // Other components may grant the same constraints to their own users
        for user in &desired.users {
            if !self.users.contains(user) {
                self.users.push(user.clone());
                changed = true;
            }
        }
        changed
    }
}

impl Converge for PrometheusRule {
    fn converge(&mut self, desired: &Self) -> bool {
        converge_meta(&mut self.metadata, &desired.metadata) | assign(&mut self.spec, &desired.spec)
    }
}

impl Converge for ServiceMonitor {
    fn converge(&mut self, desired: &Self) -> bool {
        converge_meta(&mut self.metadata, &desired.metadata) | assign(&mut self.spec, &desired.spec)
    }
}

macro_rules! converge_metadata_only {
    ($($kind:ty),* $(,)?) => {
        $(
            impl Converge for $kind {
                fn converge(&mut self, desired: &Self) -> bool {
                    converge_meta(&mut self.metadata, &desired.metadata)
                }
            }
        )*
    };
}

// Immutable specs, or nothing but metadata to own
converge_metadata_only!(ServiceAccount, CSIDriver, PersistentVolumeClaim, Job);

/// Create `desired` or converge the live object towards it
pub async fn apply<K, S>(store: &S, desired: K) -> Result<K>
where
    K: ManagedObject + Converge,
    S: ObjectStore + ?Sized,
{
    let kind = K::kind(&()).to_string();
    let name = desired.meta().name.clone().unwrap_or_default();
    let namespace = desired.meta().namespace.clone().unwrap_or_default();

    match store.get::<K>(&namespace, &name).await? {
        None => {
            info!(kind = %kind, name = %name, "Creating object");
            store.create(&desired).await
        }
        Some(mut live) => {
            if live.converge(&desired) {
                info!(kind = %kind, name = %name, "Updating object");
                store.update(&live).await
            } else {
                debug!(kind = %kind, name = %name, "Object up to date");
                Ok(live)
            }
        }
    }
}

// =============================================================================
// Resource Pass
// =============================================================================

impl<S, E, G> Reconciler<S, E, G>
where
    S: ObjectStore,
    E: EventRecorder + ?Sized,
    G: ReadinessGauge + ?Sized,
{
    /// Converge every owned kind in order.
    ///
    /// Marks the CR healthy once the required workloads are ready. Returns a
    /// requeue delay while pool cleanup is still converging.
    pub(crate) async fn reconcile_resources(
        &self,
        cr: &mut HostPathProvisioner,
        now: DateTime<Utc>,
    ) -> Result<Option<Duration>> {
        let store = self.store.as_ref();
        let config = &self.config;

        self.reconcile_workloads(cr).await?;
        let pool_deployments = pools::reconcile_pools(store, cr, config).await?;

        for sa in manifests::rbac::service_accounts(cr, config) {
            apply(store, sa).await?;
        }
        for role in manifests::rbac::cluster_roles(cr) {
            apply(store, role).await?;
        }
        for binding in manifests::rbac::cluster_role_bindings(config) {
            apply(store, binding).await?;
        }
        apply(store, manifests::rbac::csi_role(cr, config)).await?;
        apply(store, manifests::rbac::csi_role_binding(cr, config)).await?;
        apply(store, manifests::driver::csi_driver()).await?;
        self.reconcile_security_policy(cr).await?;
        self.reconcile_monitoring(cr).await?;

        if self.workload_readiness(cr).await?.ready() {
            let status = cr.status.get_or_insert_with(Default::default);
            if status::mark_healthy(status, now) {
                self.events
                    .publish(
                        cr,
                        EventSeverity::Normal,
                        reasons::PROVISIONER_HEALTHY,
                        "Provisioner Healthy",
                    )
                    .await;
            }
        }

        pools::await_cleanup(store, config, pool_deployments).await
    }

    async fn reconcile_workloads(&self, cr: &HostPathProvisioner) -> Result<()> {
        let store = self.store.as_ref();
        if cr.is_legacy() {
            apply(store, manifests::workloads::legacy_daemonset(cr, &self.config)).await?;
        } else if store
            .delete::<DaemonSet>(&self.config.namespace, MULTI_PURPOSE_NAME)
            .await?
        {
            info!(name = MULTI_PURPOSE_NAME, "Removed legacy DaemonSet in driver-only mode");
        }
        apply(store, manifests::workloads::csi_daemonset(cr, &self.config)).await?;
        Ok(())
    }

    async fn reconcile_security_policy(&self, cr: &HostPathProvisioner) -> Result<()> {
        let store = self.store.as_ref();
        if !probe::<SecurityContextConstraints, _>(store).await.is_served() {
            debug!("SecurityContextConstraints not served, skipping");
            return Ok(());
        }
        for scc in manifests::security::security_context_constraints(cr, &self.config) {
            apply(store, scc).await?;
        }
        if !cr.is_legacy() {
            store
                .delete::<SecurityContextConstraints>("", MULTI_PURPOSE_NAME)
                .await?;
        }
        Ok(())
    }

    /// The rule and the service monitor are applied each when its kind is
    /// served; their shared RBAC and metrics service when either is.
    async fn reconcile_monitoring(&self, cr: &HostPathProvisioner) -> Result<()> {
        let store = self.store.as_ref();
        let rules = probe::<PrometheusRule, _>(store).await.is_served();
        let monitors = probe::<ServiceMonitor, _>(store).await.is_served();
        if !rules && !monitors {
            debug!("Monitoring kinds not served, skipping");
            return Ok(());
        }
        let config = &self.config;
        if rules {
            apply(store, manifests::monitoring::prometheus_rule(cr, config)).await?;
        }
        apply(store, manifests::monitoring::monitoring_role(cr, config)).await?;
        apply(store, manifests::monitoring::monitoring_role_binding(cr, config)).await?;
        apply(store, manifests::monitoring::metrics_service(cr, config)).await?;
        if monitors {
            apply(store, manifests::monitoring::service_monitor(cr, config)).await?;
        }
        Ok(())
    }

    /// Readiness of the DaemonSets the current mode requires
    pub(crate) async fn workload_readiness(&self, cr: &HostPathProvisioner) -> Result<WorkloadReadiness> {
        let legacy = if cr.is_legacy() {
            Some(status::daemonset_ready(&self.daemonset(MULTI_PURPOSE_NAME).await?))
        } else {
            None
        };
        let csi = status::daemonset_ready(&self.daemonset(CSI_NAME).await?);
        Ok(WorkloadReadiness { legacy, csi })
    }

    async fn daemonset(&self, name: &str) -> Result<DaemonSet> {
        self.store
            .get::<DaemonSet>(&self.config.namespace, name)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "DaemonSet".to_string(),
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, WriteOp};
    use k8s_openapi::api::core::v1::PodSpec;
    use std::collections::BTreeMap;

    fn meta(labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some("hostpath-provisioner-admin".into()),
            namespace: Some("hpp".into()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_foreign_labels_survive() {
        let mut live = meta(&[("team", "storage")]);
        let desired = meta(&[("k8s-app", "hostpath-provisioner")]);
        assert!(converge_meta(&mut live, &desired));
        assert!(!converge_meta(&mut live, &desired));

        let labels = live.labels.unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["team"], "storage");
    }

    #[test]
    fn test_container_rename_replaces_list() {
        let container = |name: &str, image: &str| Container {
            name: name.into(),
            image: Some(image.into()),
            ..Default::default()
        };
        let template = |containers: Vec<Container>| PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers,
                ..Default::default()
            }),
        };

        let mut live = template(vec![container("a", "img:1")]);
        assert!(converge_pod_template(&mut live, &template(vec![container("a", "img:2")])));
        assert_eq!(live.spec.as_ref().unwrap().containers[0].image.as_deref(), Some("img:2"));

        assert!(converge_pod_template(&mut live, &template(vec![container("b", "img:2")])));
        assert_eq!(live.spec.as_ref().unwrap().containers[0].name, "b");
    }

    #[test]
    fn test_scc_users_are_merged() {
        let mut live = SecurityContextConstraints {
            users: vec!["system:serviceaccount:other:sa".into()],
            ..Default::default()
        };
        let desired = SecurityContextConstraints {
            users: vec!["system:serviceaccount:hpp:hostpath-provisioner-admin-csi".into()],
            ..Default::default()
        };
        assert!(live.converge(&desired));
        assert_eq!(live.users.len(), 2);
        assert!(!live.converge(&desired));
    }

    #[tokio::test]
    async fn test_apply_creates_then_is_idempotent() {
        let store = MemoryStore::new();
        let desired = ServiceAccount {
            metadata: meta(&[("k8s-app", "hostpath-provisioner")]),
            ..Default::default()
        };

        apply(&store, desired.clone()).await.unwrap();
        apply(&store, desired.clone()).await.unwrap();
        assert_eq!(store.writes().len(), 1);
        assert_eq!(store.writes()[0].op, WriteOp::Create);

        // An external edit to an owned label is reverted
        let mut live: ServiceAccount = store.object("hpp", "hostpath-provisioner-admin").unwrap();
        live.metadata.labels = Some(BTreeMap::from([("k8s-app".to_string(), "other".to_string())]));
        store.insert(live).unwrap();
        apply(&store, desired).await.unwrap();
        assert_eq!(store.writes().last().unwrap().op, WriteOp::Update);
    }

    #[tokio::test]
    async fn test_monitoring_kinds_applied_independently() {
        use crate::controller::testing::{driver_only_cr, Harness, CR_NAME};
        use crate::manifests::monitoring::METRICS_SERVICE_NAME;

        let harness = Harness::openshift();
        harness.store.unregister("ServiceMonitor");
        harness.store.insert(driver_only_cr(CR_NAME)).unwrap();

        harness.reconcile().await.unwrap();
        assert!(!harness.cr().is_degraded());
        assert_eq!(harness.store.objects::<PrometheusRule>().len(), 1);
        assert!(harness.store.objects::<ServiceMonitor>().is_empty());
        assert!(harness.store.object::<Service>("hpp", METRICS_SERVICE_NAME).is_some());

        let harness = Harness::openshift();
        harness.store.unregister("PrometheusRule");
        harness.store.insert(driver_only_cr(CR_NAME)).unwrap();

        harness.reconcile().await.unwrap();
        assert!(harness.store.objects::<PrometheusRule>().is_empty());
        assert_eq!(harness.store.objects::<ServiceMonitor>().len(), 1);
    }
}
