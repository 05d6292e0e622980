use std::collections::BTreeMap;

use crate::Result;

/// Durable per-application key/value record store.
///
/// `handle` names one application's record set (e.g. a ConfigMap name); keys
/// are `"{sequence:03}-{policy}"` so lexical order is replay order.
#[async_trait::async_trait]
pub trait AuditStore: Send + Sync {
    /// Swap the whole record set of `handle` for `records`. Keys absent from
    /// `records` are gone afterwards; a failed call leaves the old set intact.
    async fn replace_all(&self, handle: &str, records: &BTreeMap<String, serde_json::Value>) -> Result<()>;
    async fn get_all(&self, handle: &str) -> Result<BTreeMap<String, serde_json::Value>>;
}

/// Audit handle name for one application.
pub fn audit_handle(namespace: &str, name: &str) -> String {
    format!("application-policies-{namespace}-{name}")
}

/// Record key for one applied policy.
pub fn audit_key(sequence: u32, policy: &str) -> String {
    format!("{sequence:03}-{policy}")
}
