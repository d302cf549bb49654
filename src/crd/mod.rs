//! Custom Resource Definitions
//!
//! This module contains the operator's own CRD and the third-party kinds it
//! writes or watches:
//! - HostPathProvisioner: the singleton configuration object
//! - SecurityContextConstraints: optional OpenShift security policy
//! - PrometheusRule / ServiceMonitor: optional monitoring objects
//! - APIServer: cluster TLS policy source

pub mod condition;
pub mod config;
pub mod hostpath_provisioner;
pub mod monitoring;
pub mod security;

pub use condition::*;
pub use config::*;
pub use hostpath_provisioner::*;
pub use monitoring::*;
pub use security::*;

// Re-export common types for convenience
pub use chrono::{DateTime, Utc};
pub use std::collections::BTreeMap;
