//! X-Definition resources: component, workload, trait, policy and workflow-step.

use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{ReconcileError, Result};

/// Opaque template body; only the renderer interprets it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schematic {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cue: Option<TemplateBody>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateBody {
    pub template: String,
}

impl Schematic {
    pub fn template(&self) -> Option<&str> {
        self.cue.as_ref().map(|c| c.template.as_str()).filter(|t| !t.trim().is_empty())
    }

    pub fn from_template(template: impl Into<String>) -> Self {
        Self { cue: Some(TemplateBody { template: template.into() }) }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadTypeDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    pub workload_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<WorkloadGvk>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadGvk {
    pub api_version: String,
    pub kind: String,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(group = "core.oam.dev", version = "v1beta1", kind = "ComponentDefinition", namespaced, derive = "PartialEq", derive = "Default", schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct ComponentDefinitionSpec {
    #[serde(default)]
    pub workload: WorkloadTypeDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schematic: Option<Schematic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Json>,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(group = "core.oam.dev", version = "v1beta1", kind = "WorkloadDefinition", namespaced, derive = "PartialEq", derive = "Default", schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct WorkloadDefinitionSpec {
    #[serde(default)]
    pub definition_ref: DefinitionReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schematic: Option<Schematic>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefinitionReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(group = "core.oam.dev", version = "v1beta1", kind = "TraitDefinition", namespaced, derive = "PartialEq", derive = "Default", schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct TraitDefinitionSpec {
    /// `PreDispatch`, `DefaultDispatch` or `PostDispatch`; absent means default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applies_to_workloads: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schematic: Option<Schematic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Json>,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(group = "core.oam.dev", version = "v1beta1", kind = "WorkflowStepDefinition", namespaced, derive = "PartialEq", derive = "Default", schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStepDefinitionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schematic: Option<Schematic>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyScope {
    /// Mutates the Application before manifest generation.
    Application,
    /// Generates output resources; ignored by the policy pipeline.
    #[default]
    Output,
}

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[kube(group = "core.oam.dev", version = "v1beta1", kind = "PolicyDefinition", namespaced, derive = "PartialEq", derive = "Default", schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct PolicyDefinitionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<PolicyScope>,
    #[serde(default)]
    pub global: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// -1 never expires by time, 0 always re-renders, N seconds otherwise.
    #[serde(default = "default_cache_ttl", rename = "cacheTTLSeconds")]
    pub cache_ttl_seconds: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schematic: Option<Schematic>,
}

fn default_cache_ttl() -> i32 { -1 }

impl Default for PolicyDefinitionSpec {
    fn default() -> Self {
        Self { scope: None, global: false, priority: None, cache_ttl_seconds: default_cache_ttl(), schematic: None }
    }
}

impl PolicyDefinitionSpec {
    pub fn is_application_scoped(&self) -> bool { self.scope == Some(PolicyScope::Application) }
    pub fn effective_priority(&self) -> i32 { self.priority.unwrap_or(0) }
    pub fn template(&self) -> Option<&str> { self.schematic.as_ref().and_then(Schematic::template) }
}

impl TraitDefinition {
    pub fn stage(&self) -> Option<&str> { self.spec.stage.as_deref().filter(|s| !s.is_empty()) }
}

/// Parse a definition from a YAML/JSON value, checking its `kind`.
pub fn definition_from_value<K>(kind: &str, v: Json) -> Result<K>
where
    K: serde::de::DeserializeOwned + ResourceExt,
{
    let got = v.get("kind").and_then(Json::as_str).unwrap_or_default().to_string();
    if got != kind {
        return Err(ReconcileError::Validation(format!("expected kind {kind}, got {got:?}")));
    }
    serde_json::from_value(v).map_err(|e| ReconcileError::Validation(format!("{kind}: {e}")))
}
