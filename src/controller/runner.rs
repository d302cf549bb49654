//! kube runtime wiring
//!
//! Builds the controller around the single HostPathProvisioner CR: owned
//! and labelled watches map back to the one CR, optional kinds are watched
//! only when [`Capabilities`] says they are in use, and reconcile results
//! are turned into requeue actions.

use super::capabilities::Capabilities;
use super::reconciler::{ReconcileOutcome, Reconciler};
use super::{tls, ControllerConfig};
use crate::crd::{APIServer, HostPathProvisioner, PrometheusRule, SecurityContextConstraints, ServiceMonitor};
use crate::domain::{EventRecorder, ReadinessGauge};
use crate::error::{Error, ErrorAction, Result};
use crate::manifests::APP_SELECTOR;
use crate::store::KubeStore;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::api::storage::v1::CSIDriver;
use kube::runtime::controller::Action;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, ResourceExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Name reported on events and logs
pub const CONTROLLER_NAME: &str = "hostpath-provisioner-operator";

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Retry delays for failed reconciles; unbounded in count
pub fn retry_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(BACKOFF_INITIAL)
        .with_max_interval(BACKOFF_MAX)
        .with_max_elapsed_time(None)
        .build()
}

type ClusterReconciler = Reconciler<KubeStore, dyn EventRecorder, dyn ReadinessGauge>;

/// Shared state handed to every reconcile
pub struct Context {
    reconciler: ClusterReconciler,
    backoff: Mutex<ExponentialBackoff>,
}

impl Context {
    pub fn new(reconciler: ClusterReconciler) -> Self {
        Self {
            reconciler,
            backoff: Mutex::new(retry_backoff()),
        }
    }
}

/// Requeue action for a finished pass
pub fn outcome_action(outcome: ReconcileOutcome) -> Action {
    match outcome {
        ReconcileOutcome::Done => Action::await_change(),
        ReconcileOutcome::RequeueAfter(delay) => Action::requeue(delay),
    }
}

/// Requeue action for a failed pass; backoff delays grow until a pass succeeds
pub fn failure_action(err: &Error, backoff: &Mutex<ExponentialBackoff>) -> Action {
    match err.action() {
        ErrorAction::RequeueWithBackoff => {
            let delay = backoff.lock().next_backoff().unwrap_or(BACKOFF_MAX);
            Action::requeue(delay)
        }
        ErrorAction::RequeueAfter(delay) => Action::requeue(delay),
        ErrorAction::NoRequeue => Action::await_change(),
    }
}

async fn reconcile(cr: Arc<HostPathProvisioner>, ctx: Arc<Context>) -> Result<Action> {
    let outcome = ctx.reconciler.reconcile(&cr.name_any()).await?;
    ctx.backoff.lock().reset();
    Ok(outcome_action(outcome))
}

fn error_policy(cr: Arc<HostPathProvisioner>, err: &Error, ctx: Arc<Context>) -> Action {
    let action = failure_action(err, &ctx.backoff);
    error!(name = %cr.name_any(), error = %err, ?action, "Reconcile failed");
    action
}

/// Map any watched object to the CR, but only while exactly one exists
fn to_singleton<T: 'static>(
    cache: Store<HostPathProvisioner>,
) -> impl Fn(T) -> Option<ObjectRef<HostPathProvisioner>> + Send + Sync + 'static {
    move |_| match cache.state().as_slice() {
        [only] => Some(ObjectRef::from_obj(only.as_ref())),
        _ => None,
    }
}

/// Run the controller until a shutdown signal arrives
pub async fn run(
    client: Client,
    events: Arc<dyn EventRecorder>,
    gauge: Arc<dyn ReadinessGauge>,
    config: ControllerConfig,
) -> Result<()> {
    let store = Arc::new(KubeStore::new(client.clone()));
    let capabilities = Capabilities::detect(store.as_ref()).await;
    let namespace = config.namespace.clone();

    let owned = watcher::Config::default();
    let labelled = watcher::Config::default().labels(APP_SELECTOR);

    let crs: Api<HostPathProvisioner> = Api::all(client.clone());
    let mut controller = Controller::new(crs, watcher::Config::default())
        .owns(Api::<DaemonSet>::namespaced(client.clone(), &namespace), owned.clone())
        .owns(Api::<Deployment>::namespaced(client.clone(), &namespace), owned.clone())
        .owns(Api::<ServiceAccount>::namespaced(client.clone(), &namespace), owned.clone())
        .owns(Api::<Role>::namespaced(client.clone(), &namespace), owned.clone())
        .owns(Api::<RoleBinding>::namespaced(client.clone(), &namespace), owned);

    let cache = controller.store();
    controller = controller
        .watches(Api::<CSIDriver>::all(client.clone()), labelled.clone(), to_singleton(cache.clone()))
        .watches(Api::<ClusterRole>::all(client.clone()), labelled.clone(), to_singleton(cache.clone()))
        .watches(
            Api::<ClusterRoleBinding>::all(client.clone()),
            labelled.clone(),
            to_singleton(cache.clone()),
        )
        .watches(
            Api::<Role>::namespaced(client.clone(), &namespace),
            labelled.clone(),
            to_singleton(cache.clone()),
        )
        .watches(
            Api::<RoleBinding>::namespaced(client.clone(), &namespace),
            labelled.clone(),
            to_singleton(cache.clone()),
        )
        .watches(
            Api::<Service>::namespaced(client.clone(), &namespace),
            labelled.clone(),
            to_singleton(cache.clone()),
        );

    if capabilities.security_policy.should_watch() {
        info!("Watching SecurityContextConstraints");
        controller = controller.watches(
            Api::<SecurityContextConstraints>::all(client.clone()),
            labelled.clone(),
            to_singleton(cache.clone()),
        );
    }
    if capabilities.watch_api_server() {
        info!("Watching APIServer TLS policy");
        controller = controller.watches(
            Api::<APIServer>::all(client.clone()),
            watcher::Config::default(),
            |api_server: APIServer| {
                tls::mirror(&api_server);
                None::<ObjectRef<HostPathProvisioner>>
            },
        );
    }
    if capabilities.prometheus_rule.should_watch() {
        info!("Watching PrometheusRule");
        controller = controller.watches(
            Api::<PrometheusRule>::namespaced(client.clone(), &namespace),
            labelled.clone(),
            to_singleton(cache.clone()),
        );
    }
    if capabilities.service_monitor.should_watch() {
        info!("Watching ServiceMonitor");
        controller = controller.watches(
            Api::<ServiceMonitor>::namespaced(client.clone(), &namespace),
            labelled,
            to_singleton(cache),
        );
    }

    let reconciler = Reconciler::new(store, events, gauge, config);
    let ctx = Arc::new(Context::new(reconciler));

    info!(namespace = %namespace, "Starting HostPathProvisioner controller");
    controller
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            match result {
                Ok((object, action)) => debug!(object = %object, ?action, "Reconciled"),
                Err(e) => debug!(error = %e, "Controller reported an error"),
            }
            futures::future::ready(())
        })
        .await;

    info!("Controller stopped");
    Ok(())
}
