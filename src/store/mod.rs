//! Object Store Adapters
//!
//! Implementations of the [`ObjectStore`](crate::domain::ObjectStore) port:
//! - KubeStore: the live cluster through kube `Api<K>` handles
//! - MemoryStore: an in-process object graph for tests and benches

mod cluster;
mod memory;

pub use cluster::KubeStore;
pub use memory::{MemoryStore, WriteOp, WriteRecord};

use crate::crd::{
    APIServer, HostPathProvisioner, PrometheusRule, SecurityContextConstraints, ServiceMonitor,
};
use crate::domain::ManagedObject;
use ::kube::{Api, Client};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::api::storage::v1::CSIDriver;

macro_rules! namespaced {
    ($($kind:ty),* $(,)?) => {
        $(
            impl ManagedObject for $kind {
                const NAMESPACED: bool = true;

                fn api(client: Client, namespace: &str) -> Api<Self> {
                    Api::namespaced(client, namespace)
                }
            }
        )*
    };
}

macro_rules! cluster_scoped {
    ($($kind:ty),* $(,)?) => {
        $(
            impl ManagedObject for $kind {
                const NAMESPACED: bool = false;

                fn api(client: Client, _namespace: &str) -> Api<Self> {
                    Api::all(client)
                }
            }
        )*
    };
}

namespaced!(
    DaemonSet,
    Deployment,
    Job,
    PersistentVolumeClaim,
    Service,
    ServiceAccount,
    Role,
    RoleBinding,
    PrometheusRule,
    ServiceMonitor,
);

cluster_scoped!(
    HostPathProvisioner,
    APIServer,
    ClusterRole,
    ClusterRoleBinding,
    CSIDriver,
    Node,
    SecurityContextConstraints,
);
