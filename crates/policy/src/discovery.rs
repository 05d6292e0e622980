//! Global and explicit policy discovery and ordering.

use std::collections::BTreeSet;

use kube::ResourceExt;
use rudder_core::{compute_spec_hash, keys, Application, PolicyDefinition, ReconcileError, Result, Settings};
use rudder_kubehub::DefinitionSource;
use serde::Serialize;
use serde_json::{json, Value as Json};
use tracing::{debug, warn};

use crate::result::{PolicySource, ResolvedPolicy};

/// Priority descending, then name ascending.
pub fn sort_policies(policies: &mut [ResolvedPolicy]) {
    policies.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
}

fn resolved(pd: PolicyDefinition, name: String, source: PolicySource, parameters: Json) -> ResolvedPolicy {
    ResolvedPolicy {
        namespace: pd.namespace().unwrap_or_default(),
        priority: pd.spec.effective_priority(),
        cache_ttl_seconds: pd.spec.cache_ttl_seconds,
        name,
        source,
        parameters,
        definition: pd,
    }
}

/// Global Application-scoped policies visible to `app_namespace`; a copy in
/// the app namespace shadows the system one of the same name.
pub async fn discover_global_policies(
    defs: &dyn DefinitionSource,
    system_namespace: &str,
    app_namespace: &str,
) -> Result<Vec<ResolvedPolicy>> {
    let mut namespaces = vec![app_namespace];
    if app_namespace != system_namespace {
        namespaces.push(system_namespace);
    }
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for ns in namespaces {
        for pd in defs.list_policy_definitions(ns).await? {
            if !(pd.spec.global && pd.spec.is_application_scoped()) {
                continue;
            }
            let name = pd.name_any();
            if !seen.insert(name.clone()) {
                debug!(policy = %name, namespace = ns, "shadowed by namespace policy");
                continue;
            }
            out.push(resolved(pd, name, PolicySource::Global, json!({})));
        }
    }
    sort_policies(&mut out);
    Ok(out)
}

/// Definition for an explicitly referenced type: system namespace first.
pub async fn resolve_policy_definition(
    defs: &dyn DefinitionSource,
    system_namespace: &str,
    app_namespace: &str,
    name: &str,
) -> Result<Option<PolicyDefinition>> {
    if let Some(pd) = defs.policy_definition(system_namespace, name).await? {
        return Ok(Some(pd));
    }
    if app_namespace == system_namespace {
        return Ok(None);
    }
    defs.policy_definition(app_namespace, name).await
}

/// Referencing a global policy from `spec.policies` is rejected.
pub async fn validate_explicit_references(defs: &dyn DefinitionSource, settings: &Settings, app: &Application) -> Result<()> {
    let ns = app.namespace().unwrap_or_default();
    for p in &app.spec.policies {
        match resolve_policy_definition(defs, &settings.system_namespace, &ns, &p.policy_type).await {
            Ok(Some(pd)) if pd.spec.global => {
                return Err(ReconcileError::Validation(format!(
                    "policy '{}' is marked as Global and cannot be explicitly referenced in Application spec",
                    p.policy_type
                )));
            }
            Ok(_) => {}
            Err(e) => debug!(policy = %p.policy_type, error = %e, "definition lookup failed during reference check"),
        }
    }
    Ok(())
}

/// Application-scoped policies named in `spec.policies`, in spec order.
pub async fn resolve_explicit_policies(
    defs: &dyn DefinitionSource,
    settings: &Settings,
    app: &Application,
) -> Result<Vec<ResolvedPolicy>> {
    let ns = app.namespace().unwrap_or_default();
    let mut out = Vec::new();
    for p in &app.spec.policies {
        let Some(pd) = resolve_policy_definition(defs, &settings.system_namespace, &ns, &p.policy_type).await? else {
            warn!(policy = %p.name, policy_type = %p.policy_type, "policy definition not found");
            continue;
        };
        if !pd.spec.is_application_scoped() {
            continue;
        }
        let params = p.properties.clone().unwrap_or_else(|| json!({}));
        out.push(resolved(pd, p.name.clone(), PolicySource::Explicit, params));
    }
    Ok(out)
}

/// Globals unless disabled or opted out, plus explicit policies, ordered.
pub async fn resolve_policies(defs: &dyn DefinitionSource, settings: &Settings, app: &Application) -> Result<Vec<ResolvedPolicy>> {
    let ns = app.namespace().unwrap_or_default();
    let skip_global = app.annotation(keys::ANNOTATION_SKIP_GLOBAL_POLICIES) == Some("true");
    let mut all = if settings.enable_global_policies && !skip_global {
        discover_global_policies(defs, &settings.system_namespace, &ns).await?
    } else {
        Vec::new()
    };
    all.extend(resolve_explicit_policies(defs, settings, app).await?);
    sort_policies(&mut all);
    Ok(all)
}

#[derive(Serialize)]
struct PolicyFingerprint<'a> {
    name: &'a str,
    namespace: &'a str,
    source: PolicySource,
    parameters: &'a Json,
    spec: &'a rudder_core::PolicyDefinitionSpec,
}

/// Hash of the ordered policy set; any definition change alters it.
pub fn policy_set_hash(policies: &[ResolvedPolicy]) -> Result<String> {
    let prints: Vec<_> = policies
        .iter()
        .map(|p| PolicyFingerprint {
            name: &p.name,
            namespace: &p.namespace,
            source: p.source,
            parameters: &p.parameters,
            spec: &p.definition.spec,
        })
        .collect();
    compute_spec_hash(&prints)
}
