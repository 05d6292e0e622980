//! Application-scoped policy pipeline: resolve, render (cached), transform, audit.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use rudder_core::{
    audit_handle, audit_key, compute_spec_hash, AppliedApplicationPolicy, Application, AuditStore, Result, Settings,
};
use rudder_kubehub::{DefinitionSource, TemplateRenderer};
use serde_json::{json, Map, Value as Json};
use tracing::{debug, info, warn};

use crate::cache::PolicyCache;
use crate::discovery::{policy_set_hash, resolve_policies, validate_explicit_references};
use crate::render::render_policy;
use crate::result::{RenderedPolicyResult, ResolvedPolicy};
use crate::transforms::{apply_result, deep_merge_map, PolicyChanges};

/// State threaded through one reconcile's policy fold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyContext {
    /// Accumulated `additionalContext`, visible to templates as `context.custom`.
    pub custom: Map<String, Json>,
    /// Every policy selected for the app, in execution order.
    pub discovered: Vec<String>,
    pub applied: Vec<String>,
    /// True when no policy needed rendering.
    pub cache_hit: bool,
}

pub struct PolicyPipeline {
    defs: Arc<dyn DefinitionSource>,
    renderer: Arc<dyn TemplateRenderer>,
    audit: Arc<dyn AuditStore>,
    cache: Arc<PolicyCache>,
    settings: Settings,
}

impl PolicyPipeline {
    pub fn new(
        defs: Arc<dyn DefinitionSource>,
        renderer: Arc<dyn TemplateRenderer>,
        audit: Arc<dyn AuditStore>,
        settings: Settings,
    ) -> Self {
        Self { defs, renderer, audit, cache: PolicyCache::global(), settings }
    }

    pub fn with_cache(mut self, cache: Arc<PolicyCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &Arc<PolicyCache> { &self.cache }

    /// Ordered policies for `app` after the explicit-reference guard.
    pub async fn resolve(&self, app: &Application) -> Result<Vec<ResolvedPolicy>> {
        validate_explicit_references(self.defs.as_ref(), &self.settings, app).await?;
        resolve_policies(self.defs.as_ref(), &self.settings, app).await
    }

    /// Run every selected policy against `app`, mutating it in place.
    pub async fn apply_scope_transforms(&self, mut ctx: PolicyContext, app: &mut Application) -> Result<PolicyContext> {
        let key = app.app_key();
        app.status_mut().applied_application_policies.clear();
        let spec_hash = PolicyCache::app_hash(app)?;
        let application_hash = compute_spec_hash(&app.spec)?;

        let policies = self.resolve(app).await?;
        ctx.discovered = policies.iter().map(|p| p.name.clone()).collect();
        if !self.settings.enable_application_scoped_policies {
            info!(app = %key, discovered = policies.len(), "application-scoped policy execution disabled");
            return Ok(ctx);
        }
        if policies.is_empty() {
            return Ok(ctx);
        }

        let set_hash = policy_set_hash(&policies)?;
        let cached = self.cache.get_keyed(&key, &spec_hash, &set_hash);
        if cached.is_some() {
            counter!("policy_cache_hit", 1u64);
        } else {
            counter!("policy_cache_miss", 1u64);
        }
        let previous = match self.cache.previous(&key) {
            Some(p) => p,
            None => self.previous_from_audit(&key.namespace, &key.name).await,
        };

        let now = Utc::now();
        let mut sequence: u32 = 1;
        let mut rendered_any = false;
        let mut results = Vec::with_capacity(policies.len());
        let mut records = Vec::new();
        for (i, policy) in policies.iter().enumerate() {
            let reuse = cached
                .as_ref()
                .and_then(|c| c.get(i))
                .filter(|r| r.policy_name == policy.name && r.policy_namespace == policy.namespace && r.is_fresh(now));
            let result = match reuse {
                Some(r) => r.clone(),
                None => {
                    rendered_any = true;
                    let prior = previous
                        .iter()
                        .find(|r| r.policy_name == policy.name && r.policy_namespace == policy.namespace)
                        .map(RenderedPolicyResult::prior_view);
                    render_policy(self.renderer.as_ref(), policy, app, prior, &ctx.custom, now).await
                }
            };

            let status = if !result.enabled {
                debug!(policy = %policy.name, reason = %result.skip_reason, "policy skipped");
                status_entry(policy, &result, sequence, false, result.skip_reason.clone(), PolicyChanges::default())
            } else {
                let before = serde_json::to_value(&*app)?;
                match apply_result(app, &result) {
                    Ok(changes) => {
                        if let Some(extra) = &result.additional_context {
                            deep_merge_map(&mut ctx.custom, extra);
                        }
                        let diff = json_patch::diff(&before, &serde_json::to_value(&*app)?);
                        let entry = status_entry(policy, &result, sequence, true, String::new(), changes);
                        records.push((audit_key(sequence, &policy.name), audit_record(&entry, &result, &application_hash, &diff)));
                        ctx.applied.push(policy.name.clone());
                        info!(policy = %policy.name, sequence, labels = entry.labels_count, annotations = entry.annotations_count, spec_modified = entry.spec_modified, "policy applied");
                        sequence += 1;
                        entry
                    }
                    Err(e) => {
                        warn!(policy = %policy.name, error = %e, "policy transforms rejected");
                        status_entry(policy, &result, sequence, false, format!("apply error: {e}"), PolicyChanges::default())
                    }
                }
            };
            app.status_mut().applied_application_policies.push(status);
            results.push(result);
        }

        ctx.cache_hit = !rendered_any;
        if rendered_any {
            self.cache.set_keyed(key.clone(), spec_hash, set_hash, results);
        }
        self.write_audit(app, &key.namespace, &key.name, records).await;
        Ok(ctx)
    }

    async fn previous_from_audit(&self, namespace: &str, name: &str) -> Vec<RenderedPolicyResult> {
        match self.audit.get_all(&audit_handle(namespace, name)).await {
            Ok(records) => records
                .into_values()
                .filter_map(|r| r.get("result").cloned())
                .filter_map(|r| serde_json::from_value(r).ok())
                .collect(),
            Err(e) => {
                debug!(namespace, app = name, error = %e, "no prior audit records");
                Vec::new()
            }
        }
    }

    async fn write_audit(&self, app: &mut Application, namespace: &str, name: &str, records: Vec<(String, Json)>) {
        if records.is_empty() {
            return;
        }
        let handle = audit_handle(namespace, name);
        let records: BTreeMap<String, Json> = records.into_iter().collect();
        match self.audit.replace_all(&handle, &records).await {
            Ok(()) => app.status_mut().application_policies_config_map = Some(handle),
            Err(e) => warn!(handle = %handle, records = records.len(), error = %e, "policy audit write failed"),
        }
    }
}

fn status_entry(
    policy: &ResolvedPolicy,
    result: &RenderedPolicyResult,
    sequence: u32,
    applied: bool,
    reason: String,
    changes: PolicyChanges,
) -> AppliedApplicationPolicy {
    AppliedApplicationPolicy {
        name: policy.name.clone(),
        namespace: policy.namespace.clone(),
        source: policy.source.to_string(),
        sequence,
        priority: result.priority,
        applied,
        reason,
        labels_count: changes.labels_count,
        annotations_count: changes.annotations_count,
        spec_modified: changes.spec_modified,
        has_context: changes.has_context,
    }
}

fn audit_record(entry: &AppliedApplicationPolicy, result: &RenderedPolicyResult, application_hash: &str, diff: &json_patch::Patch) -> Json {
    json!({
        "policy": entry.name,
        "namespace": entry.namespace,
        "source": entry.source,
        "sequence": entry.sequence,
        "priority": entry.priority,
        "renderedAt": result.rendered_at,
        "ttlSeconds": result.cache_ttl_seconds,
        "enabled": result.enabled,
        "applicationHash": application_hash,
        "result": result,
        "diff": diff,
        "summary": {
            "labelsAdded": entry.labels_count,
            "annotationsAdded": entry.annotations_count,
            "specModified": entry.spec_modified,
            "hasContext": entry.has_context,
        },
    })
}

/// Audit records for one application, keyed and ordered by sequence.
pub async fn audit_records(audit: &dyn AuditStore, namespace: &str, name: &str) -> Result<BTreeMap<String, Json>> {
    audit.get_all(&audit_handle(namespace, name)).await
}
