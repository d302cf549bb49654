//! Error types for the hostpath provisioner operator
//!
//! Provides structured error types for the control loop, the object store
//! adapters and the process plumbing around them.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Conflicting update of {kind}/{name}: the object has been modified")]
    Conflict { kind: String, name: String },

    #[error("Kind not registered with the API server: {kind}")]
    KindNotRegistered { kind: String },

    #[error("Object cache has not completed its initial sync")]
    CacheNotSynced,

    // =========================================================================
    // Control Loop Errors
    // =========================================================================
    #[error("there should be a single hostpath provisioner, {count} items found")]
    MultipleInstances { count: usize },

    #[error("operator downgraded from {observed} to {target}, will not reconcile")]
    Downgrade { observed: String, target: String },

    #[error("storage pool cleanup job {job} failed, delete it to retry")]
    CleanupFailed { job: String },

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::Conflict { .. }
            | Error::CacheNotSynced
            | Error::ResourceExists { .. } => ErrorAction::RequeueWithBackoff,

            // Waiting on an admin to fix the cluster; any change re-triggers us
            Error::MultipleInstances { .. } | Error::Downgrade { .. } => ErrorAction::NoRequeue,

            // A workload we just applied may not be visible yet
            Error::ResourceNotFound { .. } => ErrorAction::RequeueAfter(Duration::from_secs(5)),

            // Configuration errors - don't retry automatically
            Error::Configuration(_) | Error::Manifest(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::Conflict { .. } | Error::CacheNotSynced
        )
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
