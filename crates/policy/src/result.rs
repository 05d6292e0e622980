//! Rendered policy output and the transforms it carries.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rudder_core::{ApplicationSpec, PolicyDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformType {
    Merge,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    #[serde(rename = "type")]
    pub kind: TransformType,
    #[serde(default)]
    pub value: Json,
}

impl Transform {
    pub fn merge(value: Json) -> Self { Self { kind: TransformType::Merge, value } }
    pub fn replace(value: Json) -> Self { Self { kind: TransformType::Replace, value } }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transforms {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Transform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Transform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Transform>,
}

impl Transforms {
    pub fn is_empty(&self) -> bool {
        self.labels.is_none() && self.annotations.is_none() && self.spec.is_none()
    }

    fn check(&self) -> Result<(), String> {
        for (field, t) in [("labels", &self.labels), ("annotations", &self.annotations)] {
            let Some(t) = t else { continue };
            let m = t.value.as_object().ok_or_else(|| format!("transforms.{field}.value must be an object"))?;
            if let Some((k, _)) = m.iter().find(|(_, v)| !v.is_string()) {
                return Err(format!("transforms.{field}.value.{k} must be a string"));
            }
        }
        if let Some(t) = &self.spec {
            if !t.value.is_object() {
                return Err("transforms.spec.value must be an object".into());
            }
            if t.kind == TransformType::Replace {
                serde_json::from_value::<ApplicationSpec>(t.value.clone())
                    .map_err(|e| format!("transforms.spec.value is not an application spec: {e}"))?;
            }
        }
        Ok(())
    }
}

/// Where a policy entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicySource {
    Global,
    Explicit,
}

impl fmt::Display for PolicySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PolicySource::Global => "global",
            PolicySource::Explicit => "explicit",
        })
    }
}

/// A policy selected for this application, ready to render.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPolicy {
    pub name: String,
    pub namespace: String,
    pub source: PolicySource,
    pub priority: i32,
    #[serde(rename = "cacheTTLSeconds")]
    pub cache_ttl_seconds: i32,
    pub parameters: Json,
    pub definition: PolicyDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedPolicyResult {
    pub policy_name: String,
    pub policy_namespace: String,
    pub priority: i32,
    #[serde(rename = "cacheTTLSeconds")]
    pub cache_ttl_seconds: i32,
    pub source: PolicySource,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub skip_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transforms: Option<Transforms>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<Map<String, Json>>,
    pub rendered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RenderedPolicyResult {
    fn base(p: &ResolvedPolicy, now: DateTime<Utc>) -> Self {
        Self {
            policy_name: p.name.clone(),
            policy_namespace: p.namespace.clone(),
            priority: p.priority,
            cache_ttl_seconds: p.cache_ttl_seconds,
            source: p.source,
            enabled: true,
            skip_reason: String::new(),
            transforms: None,
            additional_context: None,
            rendered_at: now,
            error: None,
        }
    }

    /// Interpret a renderer output document (`enabled`, `transforms`, `additionalContext`).
    pub fn from_output(p: &ResolvedPolicy, output: &Json, now: DateTime<Utc>) -> Result<Self, String> {
        let mut r = Self::base(p, now);
        r.enabled = match output.get("enabled") {
            None | Some(Json::Null) => true,
            Some(Json::Bool(b)) => *b,
            Some(_) => return Err("enabled must be a boolean".into()),
        };
        if !r.enabled {
            r.skip_reason = "enabled=false".into();
            return Ok(r);
        }
        r.transforms = match output.get("transforms") {
            None | Some(Json::Null) => None,
            Some(v) => {
                let t: Transforms = serde_json::from_value(v.clone()).map_err(|e| format!("invalid transforms: {e}"))?;
                t.check()?;
                Some(t).filter(|t| !t.is_empty())
            }
        };
        r.additional_context = match output.get("additionalContext") {
            None | Some(Json::Null) => None,
            Some(Json::Object(m)) => Some(m.clone()).filter(|m| !m.is_empty()),
            Some(_) => return Err("additionalContext must be an object".into()),
        };
        Ok(r)
    }

    /// Disabled result standing in for a failed render.
    pub fn failed(p: &ResolvedPolicy, error: impl Into<String>, now: DateTime<Utc>) -> Self {
        let error = error.into();
        let mut r = Self::base(p, now);
        r.enabled = false;
        r.skip_reason = format!("render error: {error}");
        r.error = Some(error);
        r
    }

    /// Usable without re-rendering at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        if self.error.is_some() {
            return false;
        }
        match self.cache_ttl_seconds {
            t if t < 0 => true,
            0 => false,
            t => now - self.rendered_at < Duration::seconds(i64::from(t)),
        }
    }

    pub fn has_context(&self) -> bool {
        self.additional_context.as_ref().map(|m| !m.is_empty()).unwrap_or(false)
    }

    /// The document exposed to the next render of this policy as `context.prior`.
    pub fn prior_view(&self) -> Json {
        json!({
            "enabled": self.enabled,
            "transforms": self.transforms,
            "additionalContext": self.additional_context,
            "renderedAt": self.rendered_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(ttl: i32) -> ResolvedPolicy {
        ResolvedPolicy {
            name: "team-labels".into(),
            namespace: "vela-system".into(),
            source: PolicySource::Global,
            priority: 10,
            cache_ttl_seconds: ttl,
            parameters: json!({}),
            definition: PolicyDefinition::new("team-labels", Default::default()),
        }
    }

    #[test]
    fn parses_output() {
        let now = Utc::now();
        let out = json!({
            "transforms": {"labels": {"type": "merge", "value": {"team": "a"}}},
            "additionalContext": {"tier": "gold"}
        });
        let r = RenderedPolicyResult::from_output(&policy(-1), &out, now).unwrap();
        assert!(r.enabled);
        assert_eq!(r.transforms.unwrap().labels.unwrap().value, json!({"team": "a"}));
        assert_eq!(r.additional_context.unwrap()["tier"], "gold");

        let off = RenderedPolicyResult::from_output(&policy(-1), &json!({"enabled": false}), now).unwrap();
        assert!(!off.enabled);
        assert_eq!(off.skip_reason, "enabled=false");
    }

    #[test]
    fn rejects_malformed_output() {
        let now = Utc::now();
        for bad in [
            json!({"enabled": "yes"}),
            json!({"transforms": {"labels": {"type": "merge", "value": {"n": 1}}}}),
            json!({"transforms": {"spec": {"type": "upsert", "value": {}}}}),
            json!({"transforms": {"spec": {"type": "replace", "value": {"components": 3}}}}),
            json!({"additionalContext": [1]}),
        ] {
            assert!(RenderedPolicyResult::from_output(&policy(-1), &bad, now).is_err(), "{bad}");
        }
    }

    #[test]
    fn ttl_freshness() {
        let now = Utc::now();
        let mut r = RenderedPolicyResult::from_output(&policy(-1), &json!({}), now - Duration::days(30)).unwrap();
        assert!(r.is_fresh(now));
        r.cache_ttl_seconds = 0;
        assert!(!r.is_fresh(now));
        r.cache_ttl_seconds = 60;
        assert!(!r.is_fresh(now));
        r.rendered_at = now - Duration::seconds(10);
        assert!(r.is_fresh(now));
        let failed = RenderedPolicyResult::failed(&policy(-1), "boom", now);
        assert!(!failed.is_fresh(now));
        assert_eq!(failed.skip_reason, "render error: boom");
    }
}
