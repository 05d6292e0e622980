//! ApplicationRevision: an immutable snapshot of a resolved Application.

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::application::{Application, WorkflowStatus, WorkflowStep};
use crate::definition::{ComponentDefinition, PolicyDefinition, TraitDefinition, WorkflowStepDefinition, WorkloadDefinition};

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "core.oam.dev",
    version = "v1beta1",
    kind = "ApplicationRevision",
    namespaced,
    status = "ApplicationRevisionStatus",
    derive = "PartialEq",
    derive = "Default",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRevisionSpec {
    /// The application at revision time, status stripped.
    pub application: Application,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub component_definitions: BTreeMap<String, ComponentDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub workload_definitions: BTreeMap<String, WorkloadDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub trait_definitions: BTreeMap<String, TraitDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub policy_definitions: BTreeMap<String, PolicyDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub workflow_step_definitions: BTreeMap<String, WorkflowStepDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub policies: BTreeMap<String, ExternalPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<ExternalWorkflow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referred_objects: Vec<Json>,
}

/// Workflow-outcome fields; the only mutable part of a revision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRevisionStatus {
    #[serde(default)]
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowStatus>,
}

/// A standalone Policy object referenced by the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalPolicy {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(rename = "type")]
    pub policy_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Json>,
}

/// A standalone Workflow object referenced by the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalWorkflow {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

impl ApplicationRevisionSpec {
    /// Workflow steps in effect: the external workflow wins over the inline one.
    pub fn workflow_steps(&self) -> &[WorkflowStep] {
        if let Some(wf) = &self.workflow {
            return &wf.steps;
        }
        self.application.spec.workflow.as_ref().map(|w| w.steps.as_slice()).unwrap_or(&[])
    }
}
