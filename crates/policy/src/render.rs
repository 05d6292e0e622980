use std::time::Instant;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use metrics::histogram;
use rudder_core::Application;
use rudder_kubehub::TemplateRenderer;
use serde_json::{json, Map, Value as Json};
use tracing::warn;

use crate::result::{RenderedPolicyResult, ResolvedPolicy};
use crate::transforms::filter_user_metadata;

/// Read-only view of the application handed to policy templates.
pub fn render_context(app: &Application, prior: Option<Json>, custom: &Map<String, Json>) -> Json {
    json!({
        "appName": app.name_any(),
        "namespace": app.namespace().unwrap_or_default(),
        "appRevision": app.latest_revision().map(|r| r.name.clone()).unwrap_or_default(),
        "appLabels": filter_user_metadata(&app.label_map()),
        "appAnnotations": filter_user_metadata(&app.annotation_map()),
        "appComponents": app.spec.components,
        "appWorkflow": app.spec.workflow,
        "appPolicies": app.spec.policies,
        "prior": prior.unwrap_or(Json::Null),
        "custom": custom,
    })
}

/// Render one policy. Failures become a disabled result carrying the error.
pub async fn render_policy(
    renderer: &dyn TemplateRenderer,
    policy: &ResolvedPolicy,
    app: &Application,
    prior: Option<Json>,
    custom: &Map<String, Json>,
    now: DateTime<Utc>,
) -> RenderedPolicyResult {
    let Some(template) = policy.definition.spec.template() else {
        return RenderedPolicyResult::failed(policy, "policy definition has no template", now);
    };
    let started = Instant::now();
    let ctx = render_context(app, prior, custom);
    let rendered = renderer.render(template, &policy.parameters, &ctx).await;
    histogram!("policy_render_ms", started.elapsed().as_secs_f64() * 1000.0);
    let outcome = rendered
        .map_err(|e| e.to_string())
        .and_then(|out| RenderedPolicyResult::from_output(policy, &out, now));
    match outcome {
        Ok(r) => r,
        Err(e) => {
            warn!(policy = %policy.name, namespace = %policy.namespace, error = %e, "policy render failed");
            RenderedPolicyResult::failed(policy, e, now)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_core::{keys, ApplicationSpec, PolicyDefinition, PolicyDefinitionSpec, Schematic};
    use rudder_kubehub::LiteralRenderer;

    use crate::result::PolicySource;

    fn policy(template: Option<&str>) -> ResolvedPolicy {
        ResolvedPolicy {
            name: "ctx".into(),
            namespace: "vela-system".into(),
            source: PolicySource::Global,
            priority: 0,
            cache_ttl_seconds: -1,
            parameters: json!({}),
            definition: PolicyDefinition::new(
                "ctx",
                PolicyDefinitionSpec { schematic: template.map(Schematic::from_template), ..Default::default() },
            ),
        }
    }

    fn app() -> Application {
        let mut a = Application::new("web", ApplicationSpec::default());
        a.metadata.namespace = Some("default".into());
        a.metadata.labels = Some(
            [(keys::LABEL_APP_NAME.to_string(), "web".to_string()), ("team".to_string(), "a".to_string())].into(),
        );
        a
    }

    #[test]
    fn context_hides_internal_labels() {
        let ctx = render_context(&app(), None, &Map::new());
        assert_eq!(ctx["appLabels"], json!({"team": "a"}));
        assert_eq!(ctx["appName"], "web");
        assert!(ctx["prior"].is_null());
    }

    #[tokio::test]
    async fn prior_and_custom_reach_the_template() {
        let tpl = "additionalContext:\n  seen: \"{{ context.custom.tier }}\"\n  before: \"{{ context.prior.enabled }}\"\n";
        let mut custom = Map::new();
        custom.insert("tier".into(), json!("gold"));
        let r = render_policy(&LiteralRenderer, &policy(Some(tpl)), &app(), Some(json!({"enabled": true})), &custom, Utc::now()).await;
        assert!(r.enabled, "{:?}", r.error);
        let ctx = r.additional_context.unwrap();
        assert_eq!(ctx["seen"], "gold");
        assert_eq!(ctx["before"], true);
    }

    #[tokio::test]
    async fn failures_are_disabled_results() {
        let r = render_policy(&LiteralRenderer, &policy(None), &app(), None, &Map::new(), Utc::now()).await;
        assert!(!r.enabled);
        assert!(r.skip_reason.starts_with("render error: "));

        let r = render_policy(&LiteralRenderer, &policy(Some("x: \"{{ context.nope }}\"")), &app(), None, &Map::new(), Utc::now()).await;
        assert!(!r.enabled);
        assert!(r.error.is_some());
        assert!(r.transforms.is_none());
    }
}
