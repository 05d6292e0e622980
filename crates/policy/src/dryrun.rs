//! Side-effect-free preview of policy application.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use kube::ResourceExt;
use rudder_core::{AppliedApplicationPolicy, Application, ReconcileError, Result, Settings};
use rudder_kubehub::{DefinitionSource, TemplateRenderer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};

use crate::discovery::{discover_global_policies, resolve_policy_definition, sort_policies};
use crate::render::render_policy;
use crate::result::{PolicySource, ResolvedPolicy};
use crate::transforms::{apply_result, changed_entries, deep_merge_map};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DryRunMode {
    /// Only the named policies.
    Isolated,
    /// Globals plus the named policies.
    Additive,
    /// Globals, optionally the app's own policies, plus any named ones.
    #[default]
    Full,
}

impl FromStr for DryRunMode {
    type Err = ReconcileError;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "isolated" => Ok(Self::Isolated),
            "additive" => Ok(Self::Additive),
            "full" => Ok(Self::Full),
            other => Err(ReconcileError::Validation(format!("unknown dry-run mode: {other}"))),
        }
    }
}

impl fmt::Display for DryRunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Isolated => "isolated",
            Self::Additive => "additive",
            Self::Full => "full",
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct DryRunOptions {
    pub mode: DryRunMode,
    pub policies: Vec<String>,
    pub include_app_policies: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub sequence: u32,
    pub policy_name: String,
    pub policy_namespace: String,
    pub priority: i32,
    pub source: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyOutcome {
    pub sequence: u32,
    pub policy_name: String,
    pub enabled: bool,
    pub applied: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub skip_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub labels_added: BTreeMap<String, String>,
    pub annotations_added: BTreeMap<String, String>,
    pub spec_modified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<Map<String, Json>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DryRunResult {
    pub mode: DryRunMode,
    pub application: Application,
    pub execution_plan: Vec<PlanStep>,
    pub policy_results: Vec<PolicyOutcome>,
    pub diffs: BTreeMap<String, json_patch::Patch>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

struct Candidate {
    policy: ResolvedPolicy,
    label: &'static str,
}

async fn named(
    defs: &dyn DefinitionSource,
    settings: &Settings,
    ns: &str,
    names: &[String],
    out: &mut Vec<Candidate>,
    errors: &mut Vec<String>,
) -> Result<()> {
    for name in names {
        match resolve_policy_definition(defs, &settings.system_namespace, ns, name).await? {
            Some(pd) => out.push(Candidate {
                policy: ResolvedPolicy {
                    name: name.clone(),
                    namespace: pd.namespace().unwrap_or_default(),
                    source: PolicySource::Explicit,
                    priority: pd.spec.effective_priority(),
                    cache_ttl_seconds: pd.spec.cache_ttl_seconds,
                    parameters: json!({}),
                    definition: pd,
                },
                label: "specified",
            }),
            None => errors.push(format!("policy {name} not found in {} or {ns}", settings.system_namespace)),
        }
    }
    Ok(())
}

/// Simulate policy application on a copy of `app`. Nothing is cached,
/// audited or written back.
pub async fn simulate(
    defs: &dyn DefinitionSource,
    renderer: &dyn TemplateRenderer,
    settings: &Settings,
    app: &Application,
    opts: &DryRunOptions,
) -> Result<DryRunResult> {
    if opts.mode == DryRunMode::Isolated && opts.policies.is_empty() {
        return Err(ReconcileError::Validation("isolated mode requires at least one policy".into()));
    }
    let ns = app.namespace().unwrap_or_default();
    let mut sim = app.clone();
    sim.status_mut().applied_application_policies.clear();
    let (mut warnings, mut errors) = (Vec::new(), Vec::new());
    if !settings.enable_application_scoped_policies {
        warnings.push("application-scoped policy execution is disabled; showing what would apply if enabled".into());
    }

    let mut candidates = Vec::new();
    let skip_global = sim.annotation(rudder_core::keys::ANNOTATION_SKIP_GLOBAL_POLICIES) == Some("true");
    if opts.mode != DryRunMode::Isolated && settings.enable_global_policies && !skip_global {
        match discover_global_policies(defs, &settings.system_namespace, &ns).await {
            Ok(globals) => candidates.extend(globals.into_iter().map(|policy| Candidate { policy, label: "global" })),
            Err(e) => warnings.push(format!("failed to discover global policies: {e}")),
        }
    }
    if opts.mode == DryRunMode::Full && opts.include_app_policies {
        for p in &sim.spec.policies {
            match resolve_policy_definition(defs, &settings.system_namespace, &ns, &p.policy_type).await? {
                None => errors.push(format!("policy {} not found", p.policy_type)),
                Some(pd) if pd.spec.global => errors.push(format!(
                    "policy '{}' is marked as Global and cannot be explicitly referenced in Application spec",
                    p.policy_type
                )),
                Some(pd) if !pd.spec.is_application_scoped() => {
                    warnings.push(format!("policy {} is not Application-scoped; skipped", p.name))
                }
                Some(pd) => candidates.push(Candidate {
                    policy: ResolvedPolicy {
                        name: p.name.clone(),
                        namespace: pd.namespace().unwrap_or_default(),
                        source: PolicySource::Explicit,
                        priority: pd.spec.effective_priority(),
                        cache_ttl_seconds: pd.spec.cache_ttl_seconds,
                        parameters: p.properties.clone().unwrap_or_else(|| json!({})),
                        definition: pd,
                    },
                    label: "app-spec",
                }),
            }
        }
    }
    named(defs, settings, &ns, &opts.policies, &mut candidates, &mut errors).await?;

    let mut order: Vec<ResolvedPolicy> = candidates.iter().map(|c| c.policy.clone()).collect();
    sort_policies(&mut order);
    let label_of = |p: &ResolvedPolicy| {
        candidates.iter().find(|c| c.policy.name == p.name && c.policy.namespace == p.namespace).map(|c| c.label).unwrap_or("specified")
    };
    let execution_plan = order
        .iter()
        .zip(1u32..)
        .map(|(p, sequence)| PlanStep {
            sequence,
            policy_name: p.name.clone(),
            policy_namespace: p.namespace.clone(),
            priority: p.priority,
            source: label_of(p),
        })
        .collect();

    let now = Utc::now();
    let mut custom = Map::new();
    let mut policy_results = Vec::new();
    let mut diffs = BTreeMap::new();
    let mut sequence = 1u32;
    for policy in &order {
        let result = render_policy(renderer, policy, &sim, None, &custom, now).await;
        let mut outcome = PolicyOutcome {
            sequence,
            policy_name: policy.name.clone(),
            enabled: result.enabled,
            skip_reason: result.skip_reason.clone(),
            error: result.error.clone(),
            additional_context: result.additional_context.clone(),
            ..Default::default()
        };
        if let Some(e) = &result.error {
            errors.push(format!("policy {}: {e}", policy.name));
        }
        let mut entry = AppliedApplicationPolicy {
            name: policy.name.clone(),
            namespace: policy.namespace.clone(),
            source: policy.source.to_string(),
            sequence,
            priority: policy.priority,
            reason: result.skip_reason.clone(),
            ..Default::default()
        };
        if result.enabled {
            let before = serde_json::to_value(&sim)?;
            let (labels, annotations) = (sim.label_map(), sim.annotation_map());
            match apply_result(&mut sim, &result) {
                Ok(c) => {
                    if let Some(extra) = &result.additional_context {
                        deep_merge_map(&mut custom, extra);
                    }
                    outcome.applied = true;
                    outcome.labels_added = changed_entries(&labels, &sim.label_map());
                    outcome.annotations_added = changed_entries(&annotations, &sim.annotation_map());
                    outcome.spec_modified = c.spec_modified;
                    diffs.insert(policy.name.clone(), json_patch::diff(&before, &serde_json::to_value(&sim)?));
                    entry = AppliedApplicationPolicy {
                        applied: true,
                        labels_count: c.labels_count,
                        annotations_count: c.annotations_count,
                        spec_modified: c.spec_modified,
                        has_context: c.has_context,
                        ..entry
                    };
                    sequence += 1;
                }
                Err(e) => {
                    errors.push(format!("policy {}: {e}", policy.name));
                    outcome.error = Some(e.to_string());
                    entry.reason = format!("apply error: {e}");
                }
            }
        }
        sim.status_mut().applied_application_policies.push(entry);
        policy_results.push(outcome);
    }

    Ok(DryRunResult { mode: opts.mode, application: sim, execution_plan, policy_results, diffs, warnings, errors })
}
