//! Rudder core types: the Application resource, definitions, revisions,
//! reconcile errors and spec hashing shared by every other crate.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod application;
pub mod audit;
pub mod config;
pub mod definition;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod revision;

pub use application::{
    AppPolicy, AppStatus, Application, ApplicationComponent, ApplicationComponentStatus,
    ApplicationSpec, ApplicationTrait, ApplicationTraitStatus, AppliedApplicationPolicy, Revision,
    Workflow, WorkflowStatus, WorkflowStep,
};
pub use audit::{audit_handle, audit_key, AuditStore};
pub use config::Settings;
pub use definition::{
    ComponentDefinition, ComponentDefinitionSpec, PolicyDefinition, PolicyDefinitionSpec,
    PolicyScope, Schematic, TemplateBody, TraitDefinition, TraitDefinitionSpec, WorkflowStepDefinition,
    WorkflowStepDefinitionSpec, WorkloadDefinition, WorkloadDefinitionSpec,
};
pub use error::{ReconcileError, Result};
pub use hash::compute_spec_hash;
pub use manifest::Manifest;
pub use revision::{
    ApplicationRevision, ApplicationRevisionSpec, ApplicationRevisionStatus, ExternalPolicy, ExternalWorkflow,
};

/// Well-known label and annotation keys.
pub mod keys {
    pub const LABEL_APP_NAME: &str = "app.oam.dev/name";
    pub const LABEL_APP_REVISION_HASH: &str = "app.oam.dev/app-revision-hash";
    pub const LABEL_TRAIT_TYPE: &str = "trait.oam.dev/type";
    pub const LABEL_TRAIT_RESOURCE: &str = "trait.oam.dev/resource";

    pub const ANNOTATION_AUTO_UPDATE: &str = "app.oam.dev/autoUpdate";
    pub const ANNOTATION_PUBLISH_VERSION: &str = "app.oam.dev/publishVersion";
    pub const ANNOTATION_KUBEVELA_VERSION: &str = "oam.dev/kubevela-version";
    pub const ANNOTATION_WORKFLOW_RESTART: &str = "app.oam.dev/restart-workflow";
    pub const ANNOTATION_SKIP_GLOBAL_POLICIES: &str = "policy.oam.dev/skip-global";
    pub const ANNOTATION_LAST_APPLIED: &str = "app.oam.dev/last-applied-configuration";
    pub const ANNOTATION_KUBECTL_LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";

    /// Trait type that is folded into the workload's stage.
    pub const AUXILIARY_WORKLOAD: &str = "AuxiliaryWorkload";

    /// Key prefixes hidden from policy templates.
    pub const INTERNAL_METADATA_PREFIXES: &[&str] = &[
        "app.oam.dev/",
        "oam.dev/",
        "kubectl.kubernetes.io/",
        "kubernetes.io/",
        "k8s.io/",
        "helm.sh/",
        "app.kubernetes.io/",
    ];
}

/// Namespace/name pair identifying one Application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppKey {
    pub namespace: String,
    pub name: String,
}

impl AppKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for AppKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub mod prelude {
    pub use super::{
        keys, AppKey, Application, ApplicationRevision, Manifest, PolicyDefinition, ReconcileError,
        Result, Settings, TraitDefinition,
    };
}
