//! Process-wide rendered-policy cache partitioned by application.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use rudder_core::{compute_spec_hash, AppKey, Application, Result};
use tracing::debug;

use crate::result::RenderedPolicyResult;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub spec_hash: String,
    pub policy_set_hash: String,
    pub results: Vec<RenderedPolicyResult>,
    pub written_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct PolicyCache {
    entries: DashMap<AppKey, CacheEntry>,
}

static GLOBAL: Lazy<Arc<PolicyCache>> = Lazy::new(|| Arc::new(PolicyCache::new()));

impl PolicyCache {
    pub fn new() -> Self { Self::default() }

    /// Shared instance for every handler in the process.
    pub fn global() -> Arc<PolicyCache> { GLOBAL.clone() }

    /// Hash of the inputs policies see: spec and labels.
    pub fn app_hash(app: &Application) -> Result<String> {
        compute_spec_hash(&(&app.spec, app.label_map()))
    }

    pub fn get(&self, app: &Application, policy_set_hash: &str) -> Result<Option<Vec<RenderedPolicyResult>>> {
        Ok(self.get_keyed(&app.app_key(), &Self::app_hash(app)?, policy_set_hash))
    }

    pub fn set(&self, app: &Application, policy_set_hash: &str, results: Vec<RenderedPolicyResult>) -> Result<()> {
        self.set_keyed(app.app_key(), Self::app_hash(app)?, policy_set_hash.to_string(), results);
        Ok(())
    }

    /// Hit only when both hashes match exactly.
    pub fn get_keyed(&self, key: &AppKey, spec_hash: &str, policy_set_hash: &str) -> Option<Vec<RenderedPolicyResult>> {
        let e = self.entries.get(key)?;
        if e.spec_hash != spec_hash || e.policy_set_hash != policy_set_hash {
            debug!(app = %key, "policy cache entry stale");
            return None;
        }
        Some(e.results.clone())
    }

    pub fn set_keyed(&self, key: AppKey, spec_hash: String, policy_set_hash: String, results: Vec<RenderedPolicyResult>) {
        self.entries.insert(key, CacheEntry { spec_hash, policy_set_hash, results, written_at: Utc::now() });
    }

    /// Last stored results regardless of hashes; feeds `context.prior`.
    pub fn previous(&self, key: &AppKey) -> Option<Vec<RenderedPolicyResult>> {
        self.entries.get(key).map(|e| e.results.clone())
    }

    pub fn size(&self) -> usize { self.entries.len() }

    pub fn invalidate_all(&self) { self.entries.clear(); }

    pub fn invalidate_for_namespace(&self, namespace: &str) {
        self.entries.retain(|k, _| k.namespace != namespace);
    }

    pub fn invalidate_application(&self, namespace: &str, name: &str) {
        self.entries.remove(&AppKey::new(namespace, name));
    }

    /// Drop entries written more than `max_age` ago; returns how many were removed.
    pub fn purge_older_than(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let before = self.entries.len();
        self.entries.retain(|_, e| e.written_at >= cutoff);
        before - self.entries.len()
    }
}
