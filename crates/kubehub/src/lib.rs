//! Rudder kubehub: the collaborator interfaces the reconcile core calls into,
//! kube-backed implementations and in-memory fakes.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use kube::{
    core::GroupVersionKind,
    discovery::{Discovery, Scope},
    Client,
};
use rudder_core::{ApplicationRevision, Manifest, PolicyDefinition, ReconcileError, Result, TraitDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::OnceCell;

pub mod kube_impl;
pub mod memory;
pub mod render;

pub use kube_impl::{ConfigMapAuditStore, KubeClusterClient};
pub use render::{FieldKind, LiteralRenderer, ParameterField, RenderError, TemplateRenderer, TemplateShape};

/// Definition and policy lookups.
#[async_trait::async_trait]
pub trait DefinitionSource: Send + Sync {
    /// Resolve a trait definition for an application namespace, falling back
    /// to the system namespace. Missing definitions are `NotFound`.
    async fn trait_definition(&self, name: &str, app_namespace: &str) -> Result<TraitDefinition>;
    async fn policy_definition(&self, namespace: &str, name: &str) -> Result<Option<PolicyDefinition>>;
    async fn list_policy_definitions(&self, namespace: &str) -> Result<Vec<PolicyDefinition>>;
}

/// ApplicationRevision persistence.
#[async_trait::async_trait]
pub trait RevisionStore: Send + Sync {
    async fn get_revision(&self, namespace: &str, name: &str) -> Result<Option<ApplicationRevision>>;
    /// All revisions labelled with `app.oam.dev/name=<app>`.
    async fn list_revisions(&self, namespace: &str, app: &str) -> Result<Vec<ApplicationRevision>>;
    async fn create_revision(&self, rev: &ApplicationRevision) -> Result<ApplicationRevision>;
    async fn update_revision(&self, rev: &ApplicationRevision) -> Result<ApplicationRevision>;
    async fn update_revision_status(&self, rev: &ApplicationRevision) -> Result<()>;
}

/// Applies and tracks rendered manifests.
#[async_trait::async_trait]
pub trait ResourceKeeper: Send + Sync {
    async fn dispatch(&self, manifests: &[Manifest]) -> Result<()>;
    async fn delete(&self, manifests: &[Manifest]) -> Result<()>;
    /// True when every manifest is already tracked as applied.
    fn contains_resources(&self, manifests: &[Manifest]) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: BTreeMap<String, Json>,
}

impl HealthStatus {
    pub fn healthy() -> Self { Self { healthy: true, ..Default::default() } }
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self { healthy: false, message: message.into(), details: BTreeMap::new() }
    }
}

/// Evaluates the health of one applied workload or trait manifest.
#[async_trait::async_trait]
pub trait HealthEvaluator: Send + Sync {
    async fn evaluate(&self, component: &str, manifest: &Manifest) -> Result<HealthStatus>;
}

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Shared kube client, built once from the default kubeconfig/in-cluster env.
pub async fn get_kube_client() -> Result<Client> {
    let c = CLIENT
        .get_or_try_init(|| async { Client::try_default().await })
        .await
        .map_err(|e| ReconcileError::Internal(format!("kube client: {e}")))?;
    Ok(c.clone())
}

/// Split `apiVersion` + `kind` into a GVK.
pub fn gvk_of(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    GroupVersionKind { group, version, kind: kind.to_string() }
}

/// Find the served resource for a GVK and whether it is namespaced.
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(ReconcileError::NotFound(format!("GVK {}/{}/{}", gvk.group, gvk.version, gvk.kind)))
}
