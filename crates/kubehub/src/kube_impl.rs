//! kube-backed collaborators.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    Client, ResourceExt,
};
use metrics::{counter, histogram};
use rudder_core::{keys, ApplicationRevision, AuditStore, PolicyDefinition, ReconcileError, Result, TraitDefinition};
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::{DefinitionSource, RevisionStore};

const FIELD_MANAGER: &str = "rudder";

/// Cluster client over the `core.oam.dev` resources.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    system_namespace: String,
}

impl KubeClusterClient {
    pub fn new(client: Client, system_namespace: impl Into<String>) -> Self {
        Self { client, system_namespace: system_namespace.into() }
    }

    fn revisions(&self, namespace: &str) -> Api<ApplicationRevision> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl DefinitionSource for KubeClusterClient {
    async fn trait_definition(&self, name: &str, app_namespace: &str) -> Result<TraitDefinition> {
        for ns in [app_namespace, self.system_namespace.as_str()] {
            let api: Api<TraitDefinition> = Api::namespaced(self.client.clone(), ns);
            if let Some(td) = api.get_opt(name).await? {
                debug!(name, ns, "trait definition resolved");
                return Ok(td);
            }
        }
        Err(ReconcileError::not_found("TraitDefinition", "", name))
    }

    async fn policy_definition(&self, namespace: &str, name: &str) -> Result<Option<PolicyDefinition>> {
        let api: Api<PolicyDefinition> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_policy_definitions(&self, namespace: &str) -> Result<Vec<PolicyDefinition>> {
        let t0 = std::time::Instant::now();
        let api: Api<PolicyDefinition> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        histogram!("kube_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(list.items)
    }
}

#[async_trait::async_trait]
impl RevisionStore for KubeClusterClient {
    async fn get_revision(&self, namespace: &str, name: &str) -> Result<Option<ApplicationRevision>> {
        Ok(self.revisions(namespace).get_opt(name).await?)
    }

    async fn list_revisions(&self, namespace: &str, app: &str) -> Result<Vec<ApplicationRevision>> {
        let lp = ListParams::default().labels(&format!("{}={}", keys::LABEL_APP_NAME, app));
        Ok(self.revisions(namespace).list(&lp).await?.items)
    }

    async fn create_revision(&self, rev: &ApplicationRevision) -> Result<ApplicationRevision> {
        let ns = rev.namespace().unwrap_or_default();
        let out = self.revisions(&ns).create(&PostParams::default(), rev).await?;
        counter!("kube_revision_create_total", 1u64);
        info!(ns = %ns, name = %rev.name_any(), "revision created");
        Ok(out)
    }

    async fn update_revision(&self, rev: &ApplicationRevision) -> Result<ApplicationRevision> {
        let ns = rev.namespace().unwrap_or_default();
        Ok(self.revisions(&ns).replace(&rev.name_any(), &PostParams::default(), rev).await?)
    }

    async fn update_revision_status(&self, rev: &ApplicationRevision) -> Result<()> {
        let ns = rev.namespace().unwrap_or_default();
        let patch = serde_json::json!({ "status": rev.status });
        self.revisions(&ns)
            .patch_status(&rev.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Audit records stored as JSON strings in one ConfigMap per application.
#[derive(Clone)]
pub struct ConfigMapAuditStore {
    client: Client,
    namespace: String,
}

impl ConfigMapAuditStore {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self { client, namespace: namespace.into() }
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait::async_trait]
impl AuditStore for ConfigMapAuditStore {
    /// One server-side apply carrying the full `data` map; keys this field
    /// manager wrote earlier and no longer sends are pruned by the apiserver.
    async fn replace_all(&self, handle: &str, records: &BTreeMap<String, Json>) -> Result<()> {
        let mut data = BTreeMap::new();
        for (k, v) in records {
            data.insert(k.clone(), serde_json::to_string(v)?);
        }
        let patch = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": handle, "namespace": self.namespace },
            "data": data,
        });
        self.api()
            .patch(handle, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&patch))
            .await
            .map_err(|e| ReconcileError::Store(format!("configmap {handle}: {e}")))?;
        counter!("audit_replace_total", 1u64);
        debug!(handle, records = records.len(), "audit records replaced");
        Ok(())
    }

    async fn get_all(&self, handle: &str) -> Result<BTreeMap<String, Json>> {
        let cm = self.api().get_opt(handle).await.map_err(|e| ReconcileError::Store(e.to_string()))?;
        let data = cm.and_then(|c| c.data).unwrap_or_default();
        let mut out = BTreeMap::new();
        for (k, v) in data {
            let parsed: Json = serde_json::from_str(&v)?;
            out.insert(k, parsed);
        }
        Ok(out)
    }
}
