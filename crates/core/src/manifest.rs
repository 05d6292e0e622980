//! Rendered manifests as untyped kube objects.

use kube::core::DynamicObject;
use kube::ResourceExt;

use crate::keys;

pub type Manifest = DynamicObject;

/// Value of the `trait.oam.dev/type` label, if any.
pub fn trait_type(m: &Manifest) -> Option<&str> {
    m.labels().get(keys::LABEL_TRAIT_TYPE).map(String::as_str)
}

/// Stable identity `apiVersion/kind/namespace/name` used for tracking.
pub fn manifest_key(m: &Manifest) -> String {
    let (api_version, kind) = m
        .types
        .as_ref()
        .map(|t| (t.api_version.as_str(), t.kind.as_str()))
        .unwrap_or(("", ""));
    format!("{}/{}/{}/{}", api_version, kind, m.namespace().unwrap_or_default(), m.name_any())
}

/// Build a manifest from a JSON object.
pub fn manifest_from_json(v: serde_json::Value) -> crate::Result<Manifest> {
    Ok(serde_json::from_value(v)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_and_trait_type() {
        let m = manifest_from_json(json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": {"name": "web", "namespace": "default", "labels": {"trait.oam.dev/type": "expose"}}
        }))
        .unwrap();
        assert_eq!(manifest_key(&m), "v1/Service/default/web");
        assert_eq!(trait_type(&m), Some("expose"));
    }
}
