//! Label, annotation and spec transforms.

use std::collections::BTreeMap;

use rudder_core::{keys, Application, ApplicationSpec, ReconcileError, Result};
use serde_json::{Map, Value as Json};

use crate::result::{RenderedPolicyResult, Transform, TransformType};

/// Recursive merge; for objects `src` keys win, anything else is replaced.
pub fn deep_merge(dst: &mut Json, src: &Json) {
    match (dst, src) {
        (Json::Object(d), Json::Object(s)) => deep_merge_map(d, s),
        (d, s) => *d = s.clone(),
    }
}

pub fn deep_merge_map(dst: &mut Map<String, Json>, src: &Map<String, Json>) {
    for (k, v) in src {
        match dst.get_mut(k) {
            Some(existing) => deep_merge(existing, v),
            None => {
                dst.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Drop keys under internal prefixes (`app.oam.dev/...` and friends).
pub fn filter_user_metadata(m: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    m.iter()
        .filter(|(k, _)| match k.split_once('/') {
            Some((prefix, _)) => !keys::INTERNAL_METADATA_PREFIXES.iter().any(|p| p.strip_suffix('/') == Some(prefix)),
            None => true,
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// What one applied result changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyChanges {
    pub labels_count: usize,
    pub annotations_count: usize,
    pub spec_modified: bool,
    pub has_context: bool,
}

fn string_map(t: &Transform) -> Result<BTreeMap<String, String>> {
    let m = t.value.as_object().ok_or_else(|| ReconcileError::Validation("metadata transform value must be an object".into()))?;
    m.iter()
        .map(|(k, v)| match v {
            Json::String(s) => Ok((k.clone(), s.clone())),
            other => Err(ReconcileError::Validation(format!("metadata value for {k} must be a string, got {other}"))),
        })
        .collect()
}

/// Entries of `after` that are new or carry a different value than in `before`.
pub fn changed_entries(before: &BTreeMap<String, String>, after: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    after.iter().filter(|(k, v)| before.get(*k) != Some(*v)).map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Returns how many keys were added or changed.
fn apply_metadata(target: &mut Option<BTreeMap<String, String>>, t: &Transform) -> Result<usize> {
    let incoming = string_map(t)?;
    let before = target.clone().unwrap_or_default();
    match t.kind {
        TransformType::Merge => target.get_or_insert_with(BTreeMap::new).extend(incoming),
        TransformType::Replace => *target = Some(incoming),
    }
    Ok(changed_entries(&before, target.as_ref().unwrap_or(&before)).len())
}

fn apply_spec(spec: &mut ApplicationSpec, t: &Transform) -> Result<bool> {
    let next: ApplicationSpec = match t.kind {
        TransformType::Replace => serde_json::from_value(t.value.clone())?,
        TransformType::Merge => {
            let mut current = serde_json::to_value(&*spec)?;
            deep_merge(&mut current, &t.value);
            serde_json::from_value(current)?
        }
    };
    let changed = next != *spec;
    *spec = next;
    Ok(changed)
}

/// Apply an enabled result's transforms to `app`. The app is left untouched on error.
pub fn apply_result(app: &mut Application, result: &RenderedPolicyResult) -> Result<PolicyChanges> {
    let mut changes = PolicyChanges { has_context: result.has_context(), ..Default::default() };
    let Some(t) = result.transforms.as_ref() else { return Ok(changes) };
    let mut next = app.clone();
    if let Some(l) = &t.labels {
        changes.labels_count = apply_metadata(&mut next.metadata.labels, l)?;
    }
    if let Some(a) = &t.annotations {
        changes.annotations_count = apply_metadata(&mut next.metadata.annotations, a)?;
    }
    if let Some(s) = &t.spec {
        changes.spec_modified = apply_spec(&mut next.spec, s)?;
    }
    *app = next;
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rudder_core::ApplicationComponent;
    use serde_json::json;

    use crate::result::{PolicySource, Transforms};

    fn app() -> Application {
        let mut a = Application::new(
            "web",
            ApplicationSpec {
                components: vec![ApplicationComponent {
                    name: "web".into(),
                    component_type: "webservice".into(),
                    properties: Some(json!({"image": "nginx", "ports": [80]})),
                    traits: vec![],
                }],
                ..Default::default()
            },
        );
        a.metadata.labels = Some([("keep".to_string(), "1".to_string())].into());
        a
    }

    fn result(t: Transforms) -> RenderedPolicyResult {
        RenderedPolicyResult {
            policy_name: "p".into(),
            policy_namespace: "vela-system".into(),
            priority: 0,
            cache_ttl_seconds: -1,
            source: PolicySource::Global,
            enabled: true,
            skip_reason: String::new(),
            transforms: Some(t),
            additional_context: None,
            rendered_at: Utc::now(),
            error: None,
        }
    }

    #[test]
    fn deep_merge_nested_source_wins() {
        let mut a = json!({"a": {"b": 1, "c": [1, 2]}, "x": 1});
        deep_merge(&mut a, &json!({"a": {"b": 2, "c": [3], "d": true}}));
        assert_eq!(a, json!({"a": {"b": 2, "c": [3], "d": true}, "x": 1}));
    }

    #[test]
    fn label_merge_and_replace() {
        let mut a = app();
        let c = apply_result(&mut a, &result(Transforms { labels: Some(Transform::merge(json!({"team": "x", "keep": "2"}))), ..Default::default() })).unwrap();
        assert_eq!(c.labels_count, 2);
        assert_eq!(a.label_map(), [("keep".to_string(), "2".to_string()), ("team".to_string(), "x".to_string())].into());

        apply_result(&mut a, &result(Transforms { labels: Some(Transform::replace(json!({"only": "y"}))), ..Default::default() })).unwrap();
        assert_eq!(a.label_map(), [("only".to_string(), "y".to_string())].into());

        apply_result(&mut a, &result(Transforms { annotations: Some(Transform::merge(json!({"note": "n"}))), ..Default::default() })).unwrap();
        assert_eq!(a.annotation("note"), Some("n"));
    }

    #[test]
    fn unchanged_metadata_is_not_counted() {
        let mut a = app();
        let c = apply_result(&mut a, &result(Transforms { labels: Some(Transform::merge(json!({"keep": "1", "team": "x"}))), ..Default::default() })).unwrap();
        assert_eq!(c.labels_count, 1);

        let c = apply_result(&mut a, &result(Transforms { labels: Some(Transform::merge(json!({"keep": "1", "team": "x"}))), ..Default::default() })).unwrap();
        assert_eq!(c.labels_count, 0);

        let c = apply_result(&mut a, &result(Transforms { labels: Some(Transform::replace(json!({"team": "x"}))), ..Default::default() })).unwrap();
        assert_eq!(c.labels_count, 0);
        assert_eq!(a.label_map().len(), 1);
    }

    #[test]
    fn spec_merge_is_deep_and_replace_is_total() {
        let mut a = app();
        let patch = json!({"components": [{"name": "web", "type": "webservice", "properties": {"image": "nginx:1.25"}}]});
        let c = apply_result(&mut a, &result(Transforms { spec: Some(Transform::merge(patch)), ..Default::default() })).unwrap();
        assert!(c.spec_modified);
        assert_eq!(a.spec.components[0].properties, Some(json!({"image": "nginx:1.25"})));

        let mut b = app();
        let c = apply_result(&mut b, &result(Transforms { spec: Some(Transform::merge(json!({"policies": []}))), ..Default::default() })).unwrap();
        assert!(!c.spec_modified);

        let mut r = app();
        apply_result(&mut r, &result(Transforms { spec: Some(Transform::replace(json!({"components": []}))), ..Default::default() })).unwrap();
        assert!(r.spec.components.is_empty());
    }

    #[test]
    fn failed_transform_leaves_app_untouched() {
        let mut a = app();
        let bad = Transforms {
            labels: Some(Transform::merge(json!({"team": "x"}))),
            annotations: Some(Transform::merge(json!({"n": 1}))),
            ..Default::default()
        };
        assert!(apply_result(&mut a, &result(bad)).is_err());
        assert_eq!(a, app());
    }

    #[test]
    fn internal_metadata_is_hidden() {
        let m: BTreeMap<String, String> = [
            ("app.oam.dev/name", "web"),
            ("kubectl.kubernetes.io/last-applied-configuration", "{}"),
            ("team", "a"),
            ("example.com/owner", "b"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let f = filter_user_metadata(&m);
        assert_eq!(f.keys().map(String::as_str).collect::<Vec<_>>(), ["example.com/owner", "team"]);
    }
}
