//! In-Memory Object Store
//!
//! A small object graph with the API server behaviours the control loop
//! depends on: resource version conflicts, finalizer-aware deletion, label
//! selectors and a journal of every write. Failures, unsynced caches and
//! unregistered kinds can be injected.

use crate::domain::{ManagedObject, ObjectStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::ErrorResponse;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

// =============================================================================
// Write Journal
// =============================================================================

/// Kind of write performed against the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Update,
    UpdateStatus,
    Delete,
}

/// A single journaled write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub op: WriteOp,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ObjectKey {
    kind: String,
    namespace: String,
    name: String,
}

impl ObjectKey {
    fn of<K: ManagedObject>(namespace: &str, name: &str) -> Self {
        Self {
            kind: K::kind(&()).to_string(),
            namespace: if K::NAMESPACED {
                namespace.to_string()
            } else {
                String::new()
            },
            name: name.to_string(),
        }
    }

    fn for_object<K: ManagedObject>(obj: &K) -> Self {
        let meta = obj.meta();
        Self::of::<K>(
            meta.namespace.as_deref().unwrap_or_default(),
            meta.name.as_deref().unwrap_or_default(),
        )
    }
}

// =============================================================================
// Memory Store
// =============================================================================

/// In-process implementation of [`ObjectStore`]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<ObjectKey, Value>>,
    resource_version: AtomicU64,
    journal: Mutex<Vec<WriteRecord>>,
    failures: Mutex<Vec<(WriteOp, String)>>,
    unregistered: RwLock<BTreeSet<String>>,
    synced: AtomicBool,
}

impl MemoryStore {
    /// Create an empty, synced store
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            resource_version: AtomicU64::new(0),
            journal: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            unregistered: RwLock::new(BTreeSet::new()),
            synced: AtomicBool::new(true),
        }
    }

    /// Insert or overwrite an object without journaling the write
    pub fn insert<K: ManagedObject>(&self, mut obj: K) -> Result<K> {
        let key = ObjectKey::for_object(&obj);
        let version = self.next_version();
        let meta = obj.meta_mut();
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", version));
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Time(chrono::Utc::now()));
        }
        meta.resource_version = Some(version);
        self.objects.write().insert(key, serde_json::to_value(&obj)?);
        Ok(obj)
    }

    /// Read an object directly
    pub fn object<K: ManagedObject>(&self, namespace: &str, name: &str) -> Option<K> {
        let objects = self.objects.read();
        objects
            .get(&ObjectKey::of::<K>(namespace, name))
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// All stored objects of a kind
    pub fn objects<K: ManagedObject>(&self) -> Vec<K> {
        let kind = K::kind(&()).to_string();
        self.objects
            .read()
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .filter_map(|(_, value)| serde_json::from_value(value.clone()).ok())
            .collect()
    }

    /// Strip all finalizers, completing a pending deletion the way the API server would
    pub fn remove_finalizers<K: ManagedObject>(&self, namespace: &str, name: &str) -> Result<()> {
        let key = ObjectKey::of::<K>(namespace, name);
        let mut objects = self.objects.write();
        let Some(value) = objects.get(&key) else {
            return Ok(());
        };
        let mut obj: K = serde_json::from_value(value.clone())?;
        obj.meta_mut().finalizers = None;
        if obj.meta().deletion_timestamp.is_some() {
            objects.remove(&key);
        } else {
            obj.meta_mut().resource_version = Some(self.next_version());
            objects.insert(key, serde_json::to_value(&obj)?);
        }
        Ok(())
    }

    /// Every write performed through the [`ObjectStore`] interface
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.journal.lock().clone()
    }

    /// Writes touching a single kind
    pub fn writes_of(&self, kind: &str) -> Vec<WriteRecord> {
        self.journal
            .lock()
            .iter()
            .filter(|w| w.kind == kind)
            .cloned()
            .collect()
    }

    pub fn clear_writes(&self) {
        self.journal.lock().clear();
    }

    /// Make the next `op` on `kind` fail with a server error
    pub fn fail_next(&self, op: WriteOp, kind: &str) {
        self.failures.lock().push((op, kind.to_string()));
    }

    /// Pretend the API server has no mapping for `kind`
    pub fn unregister(&self, kind: &str) {
        self.unregistered.write().insert(kind.to_string());
    }

    /// Toggle whether list calls are served or fail with [`Error::CacheNotSynced`]
    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    fn next_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn is_registered<K: ManagedObject>(&self) -> bool {
        !self.unregistered.read().contains(K::kind(&()).as_ref())
    }

    fn ensure_registered<K: ManagedObject>(&self) -> Result<()> {
        if self.is_registered::<K>() {
            Ok(())
        } else {
            Err(Error::KindNotRegistered {
                kind: K::kind(&()).to_string(),
            })
        }
    }

    fn take_failure<K: ManagedObject>(&self, op: WriteOp) -> Result<()> {
        let kind = K::kind(&()).to_string();
        let mut failures = self.failures.lock();
        if let Some(index) = failures.iter().position(|(o, k)| *o == op && *k == kind) {
            failures.remove(index);
            return Err(Error::Kube(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: format!("injected {:?} failure for {}", op, kind),
                reason: "InternalError".to_string(),
                code: 500,
            })));
        }
        Ok(())
    }

    fn record(&self, op: WriteOp, key: &ObjectKey) {
        self.journal.lock().push(WriteRecord {
            op,
            kind: key.kind.clone(),
            namespace: key.namespace.clone(),
            name: key.name.clone(),
        });
    }

    fn check_version<K: ManagedObject>(incoming: &K, stored: &K) -> Result<()> {
        match (&incoming.meta().resource_version, &stored.meta().resource_version) {
            (Some(incoming_rv), Some(stored_rv)) if incoming_rv != stored_rv => Err(Error::Conflict {
                kind: K::kind(&()).to_string(),
                name: incoming.meta().name.clone().unwrap_or_default(),
            }),
            _ => Ok(()),
        }
    }

    fn stored<K: ManagedObject>(&self, key: &ObjectKey) -> Result<K> {
        let objects = self.objects.read();
        let value = objects.get(key).ok_or_else(|| Error::ResourceNotFound {
            kind: key.kind.clone(),
            name: key.name.clone(),
        })?;
        Ok(serde_json::from_value(value.clone())?)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Equality-only label selector matching (`a=b,c=d`, bare keys test presence)
fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels
                .and_then(|l| l.get(key.trim()))
                .is_some_and(|v| v == value.trim()),
            None => labels.is_some_and(|l| l.contains_key(term)),
        })
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: ManagedObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        self.ensure_registered::<K>()?;
        let objects = self.objects.read();
        match objects.get(&ObjectKey::of::<K>(namespace, name)) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    async fn list<K: ManagedObject>(&self, namespace: &str, selector: Option<&str>) -> Result<Vec<K>> {
        self.ensure_registered::<K>()?;
        if !self.synced.load(Ordering::SeqCst) {
            return Err(Error::CacheNotSynced);
        }

        let kind = K::kind(&()).to_string();
        let objects = self.objects.read();
        let mut items = Vec::new();
        for (key, value) in objects.iter() {
            if key.kind != kind {
                continue;
            }
            if K::NAMESPACED && !namespace.is_empty() && key.namespace != namespace {
                continue;
            }
            let obj: K = serde_json::from_value(value.clone())?;
            if let Some(selector) = selector {
                if !matches_selector(obj.meta().labels.as_ref(), selector) {
                    continue;
                }
            }
            items.push(obj);
        }
        Ok(items)
    }

    async fn create<K: ManagedObject>(&self, obj: &K) -> Result<K> {
        self.ensure_registered::<K>()?;
        self.take_failure::<K>(WriteOp::Create)?;

        let key = ObjectKey::for_object(obj);
        if self.objects.read().contains_key(&key) {
            return Err(Error::ResourceExists {
                kind: key.kind,
                name: key.name,
            });
        }

        let mut created = obj.clone();
        let version = self.next_version();
        let meta = created.meta_mut();
        meta.uid = Some(format!("uid-{}", version));
        meta.creation_timestamp = Some(Time(chrono::Utc::now()));
        meta.deletion_timestamp = None;
        meta.resource_version = Some(version);

        self.objects.write().insert(key.clone(), serde_json::to_value(&created)?);
        self.record(WriteOp::Create, &key);
        Ok(created)
    }

    async fn update<K: ManagedObject>(&self, obj: &K) -> Result<K> {
        self.ensure_registered::<K>()?;
        self.take_failure::<K>(WriteOp::Update)?;

        let key = ObjectKey::for_object(obj);
        let stored: K = self.stored(&key)?;
        Self::check_version(obj, &stored)?;

        let mut updated = obj.clone();
        let meta = updated.meta_mut();
        meta.uid = stored.meta().uid.clone();
        meta.creation_timestamp = stored.meta().creation_timestamp.clone();
        meta.deletion_timestamp = stored.meta().deletion_timestamp.clone();
        meta.resource_version = Some(self.next_version());

        let released = meta.deletion_timestamp.is_some()
            && meta.finalizers.as_ref().map_or(true, |f| f.is_empty());
        if released {
            self.objects.write().remove(&key);
        } else {
            self.objects.write().insert(key.clone(), serde_json::to_value(&updated)?);
        }
        self.record(WriteOp::Update, &key);
        Ok(updated)
    }

    async fn update_status<K: ManagedObject>(&self, obj: &K) -> Result<K> {
        self.ensure_registered::<K>()?;
        self.take_failure::<K>(WriteOp::UpdateStatus)?;

        let key = ObjectKey::for_object(obj);
        let stored: K = self.stored(&key)?;
        Self::check_version(obj, &stored)?;

        let mut value = serde_json::to_value(&stored)?;
        let status = serde_json::to_value(obj)?
            .get("status")
            .cloned()
            .unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.insert("status".to_string(), status);
        }
        let mut updated: K = serde_json::from_value(value)?;
        updated.meta_mut().resource_version = Some(self.next_version());

        self.objects.write().insert(key.clone(), serde_json::to_value(&updated)?);
        self.record(WriteOp::UpdateStatus, &key);
        Ok(updated)
    }

    async fn delete<K: ManagedObject>(&self, namespace: &str, name: &str) -> Result<bool> {
        if !self.is_registered::<K>() {
            return Ok(false);
        }
        self.take_failure::<K>(WriteOp::Delete)?;

        let key = ObjectKey::of::<K>(namespace, name);
        let stored: K = match self.stored(&key) {
            Ok(stored) => stored,
            Err(Error::ResourceNotFound { .. }) => return Ok(false),
            Err(err) => return Err(err),
        };

        let has_finalizers = stored.meta().finalizers.as_ref().is_some_and(|f| !f.is_empty());
        if has_finalizers {
            let mut terminating = stored;
            let meta = terminating.meta_mut();
            if meta.deletion_timestamp.is_none() {
                meta.deletion_timestamp = Some(Time(chrono::Utc::now()));
            }
            meta.resource_version = Some(self.next_version());
            self.objects.write().insert(key.clone(), serde_json::to_value(&terminating)?);
        } else {
            self.objects.write().remove(&key);
        }
        self.record(WriteOp::Delete, &key);
        Ok(true)
    }
}
