//! The Application custom resource and the status fields the reconcile core owns.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{keys, AppKey};

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "core.oam.dev",
    version = "v1beta1",
    kind = "Application",
    namespaced,
    status = "AppStatus",
    derive = "PartialEq",
    derive = "Default",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    #[serde(default)]
    pub components: Vec<ApplicationComponent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<AppPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<Workflow>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationComponent {
    pub name: String,
    #[serde(rename = "type")]
    pub component_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Json>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traits: Vec<ApplicationTrait>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationTrait {
    #[serde(rename = "type")]
    pub trait_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Json>,
}

/// A policy referenced by type from `spec.policies`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppPolicy {
    pub name: String,
    #[serde(rename = "type")]
    pub policy_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Json>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ApplicationComponentStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_application_policies: Vec<AppliedApplicationPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_policies_config_map: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_revision: Option<Revision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_restart_scheduled_at: Option<DateTime<Utc>>,
}

/// Pointer to the latest ApplicationRevision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub name: String,
    pub revision: i64,
    pub revision_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    #[serde(default)]
    pub app_revision: String,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub terminated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationComponentStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traits: Vec<ApplicationTraitStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationTraitStatus {
    #[serde(rename = "type")]
    pub trait_type: String,
    pub healthy: bool,
    #[serde(default)]
    pub pending: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stage: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Summary of one policy application. Full bodies live in the audit store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedApplicationPolicy {
    pub name: String,
    pub namespace: String,
    /// `global` or `explicit`.
    pub source: String,
    pub sequence: u32,
    pub priority: i32,
    pub applied: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default)]
    pub labels_count: usize,
    #[serde(default)]
    pub annotations_count: usize,
    #[serde(default)]
    pub spec_modified: bool,
    #[serde(default)]
    pub has_context: bool,
}

impl Application {
    pub fn app_key(&self) -> AppKey {
        AppKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn status_mut(&mut self) -> &mut AppStatus {
        self.status.get_or_insert_with(AppStatus::default)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.as_ref().and_then(|a| a.get(key)).map(String::as_str)
    }

    pub fn publish_version(&self) -> Option<&str> {
        self.annotation(keys::ANNOTATION_PUBLISH_VERSION).filter(|v| !v.is_empty())
    }

    pub fn auto_update(&self) -> bool {
        self.annotation(keys::ANNOTATION_AUTO_UPDATE) == Some("true")
    }

    pub fn latest_revision(&self) -> Option<&Revision> {
        self.status.as_ref().and_then(|s| s.latest_revision.as_ref())
    }

    /// Labels, defaulting to an empty map.
    pub fn label_map(&self) -> BTreeMap<String, String> {
        self.metadata.labels.clone().unwrap_or_default()
    }

    pub fn annotation_map(&self) -> BTreeMap<String, String> {
        self.metadata.annotations.clone().unwrap_or_default()
    }
}
