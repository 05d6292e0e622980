use std::collections::BTreeMap;

use rudder_core::{
    compute_spec_hash, Application, ApplicationRevision, ApplicationRevisionSpec, ComponentDefinition, ExternalPolicy,
    ExternalWorkflow, PolicyDefinition, Result, TraitDefinition, WorkflowStepDefinition, WorkloadDefinition,
};
use serde::Serialize;
use serde_json::Value as Json;

/// Everything referenced while rendering one application.
#[derive(Debug, Clone, Default)]
pub struct RenderedArtifacts {
    pub component_definitions: BTreeMap<String, ComponentDefinition>,
    pub workload_definitions: BTreeMap<String, WorkloadDefinition>,
    pub trait_definitions: BTreeMap<String, TraitDefinition>,
    pub policy_definitions: BTreeMap<String, PolicyDefinition>,
    pub workflow_step_definitions: BTreeMap<String, WorkflowStepDefinition>,
    pub external_policies: BTreeMap<String, ExternalPolicy>,
    pub external_workflow: Option<ExternalWorkflow>,
    pub referred_objects: Vec<Json>,
}

/// Build the bare revision (no name yet) and its hash.
pub fn gather_revision_spec(app: &Application, artifacts: &RenderedArtifacts) -> Result<(ApplicationRevision, String)> {
    let mut copied = app.clone();
    copied.status = None;
    copied.metadata.resource_version = None;
    copied.metadata.managed_fields = None;
    let spec = ApplicationRevisionSpec {
        application: copied,
        component_definitions: artifacts.component_definitions.clone(),
        workload_definitions: artifacts.workload_definitions.clone(),
        trait_definitions: artifacts.trait_definitions.clone(),
        policy_definitions: artifacts.policy_definitions.clone(),
        workflow_step_definitions: artifacts.workflow_step_definitions.clone(),
        policies: artifacts.external_policies.clone(),
        workflow: artifacts.external_workflow.clone(),
        referred_objects: artifacts.referred_objects.clone(),
    };
    let rev = ApplicationRevision::new("", spec);
    let hash = compute_app_revision_hash(&rev)?;
    Ok((rev, hash))
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct RevisionHashParts {
    application_spec_hash: String,
    workload_definition_hash: BTreeMap<String, String>,
    component_definition_hash: BTreeMap<String, String>,
    trait_definition_hash: BTreeMap<String, String>,
    policy_definition_hash: BTreeMap<String, String>,
    workflow_step_definition_hash: BTreeMap<String, String>,
    policy_hash: BTreeMap<String, String>,
    workflow_hash: String,
    referred_objects_hash: String,
}

fn hash_each<T, S: Serialize>(defs: &BTreeMap<String, T>, spec: impl Fn(&T) -> &S) -> Result<BTreeMap<String, String>> {
    defs.iter().map(|(k, d)| Ok((k.clone(), compute_spec_hash(spec(d))?))).collect()
}

/// Hash every part independently, then hash the aggregate.
pub fn compute_app_revision_hash(rev: &ApplicationRevision) -> Result<String> {
    let s = &rev.spec;
    let mut parts = RevisionHashParts {
        application_spec_hash: compute_spec_hash(&s.application.spec)?,
        workload_definition_hash: hash_each(&s.workload_definitions, |d| &d.spec)?,
        component_definition_hash: hash_each(&s.component_definitions, |d| &d.spec)?,
        trait_definition_hash: hash_each(&s.trait_definitions, |d| &d.spec)?,
        policy_definition_hash: hash_each(&s.policy_definitions, |d| &d.spec)?,
        workflow_step_definition_hash: hash_each(&s.workflow_step_definitions, |d| &d.spec)?,
        referred_objects_hash: compute_spec_hash(&s.referred_objects)?,
        ..Default::default()
    };
    for (k, p) in &s.policies {
        parts.policy_hash.insert(k.clone(), format!("{}{}", compute_spec_hash(&p.properties)?, p.policy_type));
    }
    if let Some(wf) = &s.workflow {
        parts.workflow_hash = compute_spec_hash(&wf.steps)?;
    }
    compute_spec_hash(&parts)
}
