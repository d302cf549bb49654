//! HostPath Provisioner Operator
//!
//! A Kubernetes operator that keeps a hostpath volume provisioner deployment
//! converged with a single cluster-scoped `HostPathProvisioner` resource.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                  kube runtime Controller (runner)                    │
//! │   CR watch · owned watches · label-mapped watches · gated watches    │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                            Reconciler                                │
//! │  ┌─────────────┐  ┌──────────────────┐  ┌────────────────────────┐   │
//! │  │ Version gate│  │ Resource pass    │  │ Status machine and     │   │
//! │  │             │  │ (ordered apply)  │  │ field change set       │   │
//! │  └─────────────┘  └──────────────────┘  └────────────────────────┘   │
//! │  ┌─────────────────────────┐  ┌─────────────────────────────────┐    │
//! │  │ Storage pools / cleanup │  │ Finalizer-guarded teardown      │    │
//! │  └─────────────────────────┘  └─────────────────────────────────┘    │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                              Ports                                   │
//! │     ObjectStore (KubeStore, MemoryStore) · EventRecorder · Gauge     │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: reconcile loop, status machine and runtime wiring
//! - [`manifests`]: desired-object builders for every owned kind
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: port traits
//! - [`store`]: object store adapters
//! - [`telemetry`]: event and readiness gauge adapters
//! - [`error`]: Error types and handling

pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod manifests;
pub mod store;
pub mod telemetry;

// Re-export commonly used types
pub use controller::{ControllerConfig, ReconcileOutcome, Reconciler};

pub use crd::{
    DeploymentMode, HostPathProvisioner, HostPathProvisionerSpec, HostPathProvisionerStatus,
    StoragePool, StoragePoolPhase,
};

pub use domain::ports::{EventRecorder, EventSeverity, ManagedObject, ObjectStore, ReadinessGauge};

pub use error::{Error, ErrorAction, Result};

pub use manifests::ImageConfig;

pub use store::{KubeStore, MemoryStore};

pub use telemetry::{KubeEventRecorder, NoopEventRecorder, PrometheusReadyGauge};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
