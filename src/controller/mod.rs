//! HostPathProvisioner controller
//!
//! The reconcile loop and everything it drives:
//! - [`reconciler`]: the per-CR pass and status persistence
//! - [`resources`]: ordered convergence of every owned object
//! - [`pools`]: per-node storage pool objects and cleanup convergence
//! - [`deletion`]: finalizer-guarded teardown
//! - [`status`]: condition state machine and status change set
//! - [`version`]: upgrade admission
//! - [`capabilities`]: optional API detection for watch setup
//! - [`tls`]: cluster TLS policy mirror
//! - [`runner`]: kube runtime wiring

pub mod capabilities;
pub mod config;
pub mod deletion;
pub mod pools;
pub mod reconciler;
pub mod resources;
pub mod runner;
pub mod status;
pub mod tls;
pub mod version;

#[cfg(test)]
pub(crate) mod testing;

pub use capabilities::{Capabilities, Capability};
pub use config::ControllerConfig;
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use runner::{run, CONTROLLER_NAME};
