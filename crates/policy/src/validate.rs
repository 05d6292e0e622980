//! Admission-time PolicyDefinition checks.

use kube::ResourceExt;
use rudder_core::{PolicyDefinition, PolicyScope, ReconcileError, Result, Settings};
use rudder_kubehub::{FieldKind, TemplateRenderer};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PolicyValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl PolicyValidation {
    pub fn is_ok(&self) -> bool { self.errors.is_empty() }
}

pub fn validate_policy_definition(pd: &PolicyDefinition, renderer: &dyn TemplateRenderer, settings: &Settings) -> PolicyValidation {
    let mut v = PolicyValidation::default();
    let spec = &pd.spec;
    if spec.global && spec.scope != Some(PolicyScope::Application) {
        v.errors.push("global policies must have scope Application".into());
    }
    match spec.template() {
        None => v.errors.push("schematic template is required".into()),
        Some(t) => match renderer.inspect(t) {
            Err(e) => v.errors.push(format!("template: {e}")),
            Ok(shape) => {
                if spec.global {
                    for p in shape.parameters.iter().filter(|p| !p.has_default) {
                        v.errors.push(format!("global policy parameter '{}' must have a default", p.name));
                    }
                }
                if let Some(kind) = shape.enabled {
                    if !matches!(kind, FieldKind::Bool | FieldKind::Expr) {
                        v.errors.push(format!("enabled must be a boolean, got {kind:?}"));
                    }
                }
            }
        },
    }
    match spec.priority {
        Some(p) if p > settings.policy_priority_warn => {
            v.warnings.push(format!("priority {p} exceeds {}; consider a smaller value", settings.policy_priority_warn))
        }
        None if spec.global => v.warnings.push("global policy without explicit priority defaults to 0".into()),
        _ => {}
    }
    v
}

/// Validate and turn errors into an admission rejection.
pub fn admit_policy_definition(pd: &PolicyDefinition, renderer: &dyn TemplateRenderer, settings: &Settings) -> Result<PolicyValidation> {
    let v = validate_policy_definition(pd, renderer, settings);
    for w in &v.warnings {
        tracing::warn!(policy = %pd.name_any(), warning = %w, "policy definition admitted with warning");
    }
    if !v.is_ok() {
        return Err(ReconcileError::Validation(format!("PolicyDefinition {}: {}", pd.name_any(), v.errors.join("; "))));
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_core::{PolicyDefinitionSpec, Schematic};
    use rudder_kubehub::LiteralRenderer;

    fn def(global: bool, scope: Option<PolicyScope>, priority: Option<i32>, template: Option<&str>) -> PolicyDefinition {
        PolicyDefinition::new(
            "p",
            PolicyDefinitionSpec { global, scope, priority, schematic: template.map(Schematic::from_template), ..Default::default() },
        )
    }

    #[test]
    fn well_formed_global_passes() {
        let pd = def(true, Some(PolicyScope::Application), Some(10), Some("parameter:\n  team: a\nenabled: true\n"));
        let v = validate_policy_definition(&pd, &LiteralRenderer, &Settings::default());
        assert!(v.is_ok(), "{v:?}");
        assert!(v.warnings.is_empty());
    }

    #[test]
    fn global_rules() {
        let s = Settings::default();
        let v = validate_policy_definition(&def(true, Some(PolicyScope::Output), None, Some("parameter:\n  team: null\n")), &LiteralRenderer, &s);
        assert_eq!(v.errors.len(), 2, "{v:?}");
        assert_eq!(v.warnings.len(), 1);

        let v = validate_policy_definition(&def(false, Some(PolicyScope::Application), None, Some("parameter:\n  team: null\n")), &LiteralRenderer, &s);
        assert!(v.is_ok());
    }

    #[test]
    fn template_and_enabled_checks() {
        let s = Settings::default();
        let v = validate_policy_definition(&def(false, Some(PolicyScope::Application), None, None), &LiteralRenderer, &s);
        assert!(!v.is_ok());
        let v = validate_policy_definition(&def(false, Some(PolicyScope::Application), None, Some("enabled: \"yes\"")), &LiteralRenderer, &s);
        assert!(v.errors.iter().any(|e| e.starts_with("enabled")));
        let v = validate_policy_definition(&def(false, Some(PolicyScope::Application), None, Some("a: [")), &LiteralRenderer, &s);
        assert!(v.errors.iter().any(|e| e.starts_with("template")));
    }

    #[test]
    fn high_priority_warns_and_admission_rejects_errors() {
        let s = Settings::default();
        let pd = def(false, Some(PolicyScope::Application), Some(5000), Some("enabled: true"));
        let v = admit_policy_definition(&pd, &LiteralRenderer, &s).unwrap();
        assert_eq!(v.warnings.len(), 1);
        let bad = def(true, None, Some(1), Some("enabled: true"));
        assert!(matches!(admit_policy_definition(&bad, &LiteralRenderer, &s), Err(ReconcileError::Validation(_))));
    }
}
