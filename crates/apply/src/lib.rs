//! Rudder apply: server-side apply resource keeper and YAML document parsing.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client, ResourceExt,
};
use metrics::{counter, histogram};
use rudder_core::manifest::manifest_key;
use rudder_core::{Manifest, ReconcileError, Result};
use rudder_kubehub::{find_api_resource, gvk_of, ResourceKeeper};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

/// Parse a (possibly multi-document) YAML string into JSON objects. Empty
/// documents are skipped; anything that is not a mapping is rejected.
pub fn parse_yaml_documents(yaml: &str) -> Result<Vec<Json>> {
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).map_err(|e| ReconcileError::Validation(format!("document {i}: {e}")))?;
        match serde_json::to_value(val)? {
            Json::Null => continue,
            obj @ Json::Object(_) => out.push(obj),
            other => return Err(ReconcileError::Validation(format!("document {i}: expected a mapping, got {other}"))),
        }
    }
    Ok(out)
}

/// Resource keeper applying manifests with server-side apply.
pub struct KubeResourceKeeper {
    client: Client,
    field_manager: String,
    applied: Mutex<BTreeSet<String>>,
    resources: Mutex<FxHashMap<String, (ApiResource, bool)>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|p| p.into_inner()) }

impl KubeResourceKeeper {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            field_manager: "rudder".to_string(),
            applied: Mutex::new(BTreeSet::new()),
            resources: Mutex::new(FxHashMap::default()),
        }
    }

    async fn api_for(&self, m: &Manifest) -> Result<Api<DynamicObject>> {
        let types = m.types.as_ref().ok_or_else(|| ReconcileError::Apply(format!("{} has no apiVersion/kind", m.name_any())))?;
        let gvk: GroupVersionKind = gvk_of(&types.api_version, &types.kind);
        let cache_key = format!("{}/{}", types.api_version, types.kind);
        let cached = lock(&self.resources).get(&cache_key).cloned();
        let (ar, namespaced) = match cached {
            Some(hit) => hit,
            None => {
                let found = find_api_resource(self.client.clone(), &gvk).await?;
                lock(&self.resources).insert(cache_key, found.clone());
                found
            }
        };
        Ok(if namespaced {
            let ns = m.namespace().ok_or_else(|| ReconcileError::Apply(format!("namespace required for {}", types.kind)))?;
            Api::namespaced_with(self.client.clone(), &ns, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        })
    }
}

#[async_trait::async_trait]
impl ResourceKeeper for KubeResourceKeeper {
    async fn dispatch(&self, manifests: &[Manifest]) -> Result<()> {
        let t0 = std::time::Instant::now();
        let pp = PatchParams::apply(&self.field_manager).force();
        for m in manifests {
            let api = self.api_for(m).await?;
            let name = m.name_any();
            if let Err(e) = api.patch(&name, &pp, &Patch::Apply(m)).await {
                counter!("apply_err", 1u64);
                return Err(ReconcileError::Apply(format!("server-side apply {} failed: {e}", manifest_key(m))));
            }
            lock(&self.applied).insert(manifest_key(m));
            debug!(key = %manifest_key(m), "applied");
        }
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("apply_ok", manifests.len() as u64);
        info!(count = manifests.len(), took_ms = %t0.elapsed().as_millis(), "dispatched manifests");
        Ok(())
    }

    async fn delete(&self, manifests: &[Manifest]) -> Result<()> {
        for m in manifests {
            let api = self.api_for(m).await?;
            match api.delete(&m.name_any(), &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => warn!(key = %manifest_key(m), "already deleted"),
                Err(e) => return Err(ReconcileError::Apply(format!("delete {} failed: {e}", manifest_key(m)))),
            }
            lock(&self.applied).remove(&manifest_key(m));
        }
        Ok(())
    }

    fn contains_resources(&self, manifests: &[Manifest]) -> bool {
        let applied = lock(&self.applied);
        manifests.iter().all(|m| applied.contains(&manifest_key(m)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn documents_skip_empty_and_reject_scalars() {
        let y = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\n---\nkind: PolicyDefinition\nmetadata:\n  name: b\n";
        let docs = parse_yaml_documents(y).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1], json!({"kind": "PolicyDefinition", "metadata": {"name": "b"}}));
        assert!(parse_yaml_documents("").unwrap().is_empty());

        let e = parse_yaml_documents("kind: A\n---\n- 1\n- 2\n").unwrap_err();
        assert!(matches!(e, ReconcileError::Validation(ref m) if m.starts_with("document 1")), "{e}");
        assert!(parse_yaml_documents("a: [1\n").is_err());
    }
}
