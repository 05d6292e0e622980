//! In-memory collaborators for tests, dry runs and the CLI.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use kube::ResourceExt;
use rudder_core::manifest::manifest_key;
use rudder_core::{
    keys, ApplicationRevision, AuditStore, Manifest, PolicyDefinition, ReconcileError, Result, TraitDefinition,
};
use serde_json::Value as Json;

use crate::{DefinitionSource, HealthEvaluator, HealthStatus, ResourceKeeper, RevisionStore};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

type NsName = (String, String);

fn ns_name<K: ResourceExt>(o: &K) -> NsName {
    (o.namespace().unwrap_or_default(), o.name_any())
}

/// Definitions, policies and revisions held in maps.
pub struct MemoryCluster {
    system_namespace: String,
    traits: Mutex<BTreeMap<NsName, TraitDefinition>>,
    policies: Mutex<BTreeMap<NsName, PolicyDefinition>>,
    revisions: Mutex<BTreeMap<NsName, ApplicationRevision>>,
    pub trait_lookups: AtomicUsize,
    pub revision_writes: AtomicUsize,
}

impl MemoryCluster {
    pub fn new(system_namespace: impl Into<String>) -> Self {
        Self {
            system_namespace: system_namespace.into(),
            traits: Mutex::new(BTreeMap::new()),
            policies: Mutex::new(BTreeMap::new()),
            revisions: Mutex::new(BTreeMap::new()),
            trait_lookups: AtomicUsize::new(0),
            revision_writes: AtomicUsize::new(0),
        }
    }

    pub fn add_trait(&self, td: TraitDefinition) {
        lock(&self.traits).insert(ns_name(&td), td);
    }

    pub fn add_policy(&self, pd: PolicyDefinition) {
        lock(&self.policies).insert(ns_name(&pd), pd);
    }

    pub fn remove_policy(&self, namespace: &str, name: &str) {
        lock(&self.policies).remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn revisions(&self) -> Vec<ApplicationRevision> {
        lock(&self.revisions).values().cloned().collect()
    }
}

#[async_trait::async_trait]
impl DefinitionSource for MemoryCluster {
    async fn trait_definition(&self, name: &str, app_namespace: &str) -> Result<TraitDefinition> {
        self.trait_lookups.fetch_add(1, Ordering::Relaxed);
        let traits = lock(&self.traits);
        [app_namespace, self.system_namespace.as_str()]
            .iter()
            .find_map(|ns| traits.get(&(ns.to_string(), name.to_string())).cloned())
            .ok_or_else(|| ReconcileError::not_found("TraitDefinition", "", name))
    }

    async fn policy_definition(&self, namespace: &str, name: &str) -> Result<Option<PolicyDefinition>> {
        Ok(lock(&self.policies).get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn list_policy_definitions(&self, namespace: &str) -> Result<Vec<PolicyDefinition>> {
        Ok(lock(&self.policies).iter().filter(|((ns, _), _)| ns == namespace).map(|(_, p)| p.clone()).collect())
    }
}

#[async_trait::async_trait]
impl RevisionStore for MemoryCluster {
    async fn get_revision(&self, namespace: &str, name: &str) -> Result<Option<ApplicationRevision>> {
        Ok(lock(&self.revisions).get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn list_revisions(&self, namespace: &str, app: &str) -> Result<Vec<ApplicationRevision>> {
        Ok(lock(&self.revisions)
            .iter()
            .filter(|((ns, _), r)| ns == namespace && r.labels().get(keys::LABEL_APP_NAME).map(String::as_str) == Some(app))
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn create_revision(&self, rev: &ApplicationRevision) -> Result<ApplicationRevision> {
        let key = ns_name(rev);
        let mut revs = lock(&self.revisions);
        if revs.contains_key(&key) {
            return Err(ReconcileError::Apply(format!("applicationrevision {}/{} already exists", key.0, key.1)));
        }
        self.revision_writes.fetch_add(1, Ordering::Relaxed);
        revs.insert(key, rev.clone());
        Ok(rev.clone())
    }

    async fn update_revision(&self, rev: &ApplicationRevision) -> Result<ApplicationRevision> {
        let key = ns_name(rev);
        let mut revs = lock(&self.revisions);
        let cur = revs.get_mut(&key).ok_or_else(|| ReconcileError::not_found("ApplicationRevision", &key.0, &key.1))?;
        self.revision_writes.fetch_add(1, Ordering::Relaxed);
        let status = cur.status.clone();
        *cur = rev.clone();
        cur.status = status;
        Ok(cur.clone())
    }

    async fn update_revision_status(&self, rev: &ApplicationRevision) -> Result<()> {
        let key = ns_name(rev);
        let mut revs = lock(&self.revisions);
        let cur = revs.get_mut(&key).ok_or_else(|| ReconcileError::not_found("ApplicationRevision", &key.0, &key.1))?;
        cur.status = rev.status.clone();
        Ok(())
    }
}

/// Tracks dispatched manifests by key; never touches a cluster.
#[derive(Default)]
pub struct MemoryResourceKeeper {
    applied: Mutex<BTreeSet<String>>,
    log: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl MemoryResourceKeeper {
    pub fn new() -> Self { Self::default() }

    /// Make subsequent dispatches fail.
    pub fn set_failing(&self, fail: bool) { self.fail.store(fail, Ordering::Relaxed); }

    /// Keys of every dispatch call, in order.
    pub fn dispatch_log(&self) -> Vec<String> { lock(&self.log).clone() }

    pub fn applied(&self) -> BTreeSet<String> { lock(&self.applied).clone() }
}

#[async_trait::async_trait]
impl ResourceKeeper for MemoryResourceKeeper {
    async fn dispatch(&self, manifests: &[Manifest]) -> Result<()> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(ReconcileError::Apply("dispatch refused".into()));
        }
        let mut applied = lock(&self.applied);
        let mut log = lock(&self.log);
        for m in manifests {
            let k = manifest_key(m);
            log.push(k.clone());
            applied.insert(k);
        }
        Ok(())
    }

    async fn delete(&self, manifests: &[Manifest]) -> Result<()> {
        let mut applied = lock(&self.applied);
        for m in manifests {
            applied.remove(&manifest_key(m));
        }
        Ok(())
    }

    fn contains_resources(&self, manifests: &[Manifest]) -> bool {
        let applied = lock(&self.applied);
        manifests.iter().all(|m| applied.contains(&manifest_key(m)))
    }
}

/// Health keyed by manifest key; unknown manifests are healthy.
#[derive(Default)]
pub struct StaticHealthEvaluator {
    statuses: Mutex<BTreeMap<String, HealthStatus>>,
    pub evaluations: AtomicUsize,
}

impl StaticHealthEvaluator {
    pub fn new() -> Self { Self::default() }

    pub fn set(&self, manifest: &Manifest, status: HealthStatus) {
        lock(&self.statuses).insert(manifest_key(manifest), status);
    }
}

#[async_trait::async_trait]
impl HealthEvaluator for StaticHealthEvaluator {
    async fn evaluate(&self, _component: &str, manifest: &Manifest) -> Result<HealthStatus> {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        Ok(lock(&self.statuses).get(&manifest_key(manifest)).cloned().unwrap_or_else(HealthStatus::healthy))
    }
}

#[derive(Default)]
pub struct MemoryAuditStore {
    records: Mutex<BTreeMap<String, BTreeMap<String, Json>>>,
    fail: AtomicBool,
}

impl MemoryAuditStore {
    pub fn new() -> Self { Self::default() }
    pub fn set_failing(&self, fail: bool) { self.fail.store(fail, Ordering::Relaxed); }
}

#[async_trait::async_trait]
impl AuditStore for MemoryAuditStore {
    async fn replace_all(&self, handle: &str, records: &BTreeMap<String, Json>) -> Result<()> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(ReconcileError::Store("audit store unavailable".into()));
        }
        lock(&self.records).insert(handle.to_string(), records.clone());
        Ok(())
    }

    async fn get_all(&self, handle: &str) -> Result<BTreeMap<String, Json>> {
        Ok(lock(&self.records).get(handle).cloned().unwrap_or_default())
    }
}
