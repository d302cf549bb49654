//! Domain Ports - Core trait definitions for the operator
//!
//! These traits define the boundaries between the control loop and the
//! systems it talks to. Adapters implement these traits to provide concrete
//! functionality: the Kubernetes API, the event stream and the metrics sink.

use crate::crd::HostPathProvisioner;
use crate::error::Result;
use async_trait::async_trait;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

// =============================================================================
// Managed Objects
// =============================================================================

/// A typed cluster object the operator reads or writes.
///
/// Implemented once per kind so the store can build a correctly scoped API
/// handle without a scope bound on every generic call.
pub trait ManagedObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Whether objects of this kind live inside a namespace
    const NAMESPACED: bool;

    /// API handle for this kind. `namespace` is ignored for cluster-scoped kinds.
    fn api(client: Client, namespace: &str) -> Api<Self>;
}

// =============================================================================
// Object Store Port
// =============================================================================

/// Typed access to the cluster object graph.
///
/// Reads may be served from a cache and can be stale. Writes are strongly
/// consistent requests that can conflict or fail transiently.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get an object by name, `None` when it does not exist
    async fn get<K: ManagedObject>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List objects, optionally filtered by an equality label selector (`a=b,c=d`)
    async fn list<K: ManagedObject>(&self, namespace: &str, selector: Option<&str>) -> Result<Vec<K>>;

    /// Create an object
    async fn create<K: ManagedObject>(&self, obj: &K) -> Result<K>;

    /// Replace an object, subject to resource version checks
    async fn update<K: ManagedObject>(&self, obj: &K) -> Result<K>;

    /// Replace only the status of an object
    async fn update_status<K: ManagedObject>(&self, obj: &K) -> Result<K>;

    /// Delete an object. Returns false when it did not exist.
    async fn delete<K: ManagedObject>(&self, namespace: &str, name: &str) -> Result<bool>;
}

// =============================================================================
// Event Recorder Port
// =============================================================================

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

impl std::fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSeverity::Normal => write!(f, "Normal"),
            EventSeverity::Warning => write!(f, "Warning"),
        }
    }
}

/// Publishes events about the CR.
///
/// Fire-and-forget: failures are logged by the implementation and never
/// reach the control loop.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(
        &self,
        cr: &HostPathProvisioner,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    );
}

// =============================================================================
// Readiness Gauge Port
// =============================================================================

/// Gauge value while the provisioner is ready
pub const READY: i64 = 1;
/// Gauge value while the provisioner is neither ready nor progressing
pub const NOT_READY: i64 = 0;
/// Boot-time value; alerting fires if it persists
pub const READY_UNKNOWN: i64 = -1;

/// Sink for the single readiness signal
pub trait ReadinessGauge: Send + Sync {
    fn set(&self, value: i64);
}
