//! Optional API detection
//!
//! The security policy, monitoring and API server config kinds only exist on
//! some clusters. Detection produces a [`Capabilities`] value consumed by the
//! fixed watch setup in the runner and by the resource pass.
//!
//! `KubeStore` reads go straight to the API server, so against a live cluster
//! there is no unsynced-cache window and [`Capability::AssumedInUse`] is not
//! produced; it covers stores that answer from a cache still warming up.

use crate::crd::{APIServer, PrometheusRule, SecurityContextConstraints, ServiceMonitor};
use crate::domain::{ManagedObject, ObjectStore};
use crate::error::Error;
use tracing::{info, warn};

/// What a probe learned about one optional kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// At least one object of the kind exists
    InUse,
    /// The kind is served but no object exists
    Unused,
    /// The cache has not synced yet; assume the kind is used
    AssumedInUse,
    /// The API server has no mapping for the kind
    Unrecognized,
}

impl Capability {
    /// Whether to register a watch for the kind
    pub fn should_watch(self) -> bool {
        matches!(self, Capability::InUse | Capability::AssumedInUse)
    }

    /// Whether objects of the kind can be written at all
    pub fn is_served(self) -> bool {
        !matches!(self, Capability::Unrecognized)
    }
}

/// Probe a single kind
pub async fn probe<K: ManagedObject, S: ObjectStore>(store: &S) -> Capability {
    let kind = K::kind(&());
    match store.list::<K>("", None).await {
        Ok(items) if !items.is_empty() => Capability::InUse,
        Ok(_) => Capability::Unused,
        Err(Error::CacheNotSynced) => Capability::AssumedInUse,
        Err(Error::KindNotRegistered { .. }) => {
            info!(kind = %kind, "Kind not served by this cluster");
            Capability::Unrecognized
        }
        Err(e) => {
            warn!(kind = %kind, error = %e, "Capability probe failed, treating kind as unused");
            Capability::Unused
        }
    }
}

/// Detected optional capabilities of the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub security_policy: Capability,
    pub prometheus_rule: Capability,
    pub service_monitor: Capability,
    pub api_server: Capability,
}

impl Capabilities {
    pub async fn detect<S: ObjectStore>(store: &S) -> Self {
        let capabilities = Self {
            security_policy: probe::<SecurityContextConstraints, _>(store).await,
            prometheus_rule: probe::<PrometheusRule, _>(store).await,
            service_monitor: probe::<ServiceMonitor, _>(store).await,
            api_server: probe::<APIServer, _>(store).await,
        };
        info!(
            security_policy = ?capabilities.security_policy,
            prometheus_rule = ?capabilities.prometheus_rule,
            service_monitor = ?capabilities.service_monitor,
            api_server = ?capabilities.api_server,
            "Detected cluster capabilities"
        );
        capabilities
    }

    /// The API server config watch rides along with the security policy one
    pub fn watch_api_server(&self) -> bool {
        self.security_policy.should_watch() && self.api_server.is_served()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_probe_states() {
        let store = MemoryStore::new();
        assert_eq!(probe::<PrometheusRule, _>(&store).await, Capability::Unused);

        store.insert(SecurityContextConstraints {
            metadata: kube::api::ObjectMeta {
                name: Some("restricted".into()),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        assert_eq!(probe::<SecurityContextConstraints, _>(&store).await, Capability::InUse);

        store.unregister("APIServer");
        assert_eq!(probe::<APIServer, _>(&store).await, Capability::Unrecognized);

        store.set_synced(false);
        assert_eq!(probe::<PrometheusRule, _>(&store).await, Capability::AssumedInUse);
    }

    #[tokio::test]
    async fn test_detect_on_plain_cluster() {
        let store = MemoryStore::new();
        store.unregister("SecurityContextConstraints");
        store.unregister("APIServer");
        store.unregister("PrometheusRule");

        let capabilities = Capabilities::detect(&store).await;
        assert!(!capabilities.security_policy.should_watch());
        assert!(!capabilities.prometheus_rule.is_served());
        assert!(capabilities.service_monitor.is_served());
        assert!(!capabilities.watch_api_server());
    }

    #[test]
    fn test_unsynced_cache_is_watched() {
        assert!(Capability::AssumedInUse.should_watch());
        assert!(!Capability::Unused.should_watch());
        assert!(Capability::Unused.is_served());
    }
}
