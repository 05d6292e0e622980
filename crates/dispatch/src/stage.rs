//! Trait dispatch stages and classification.

use std::fmt;
use std::str::FromStr;

use rudder_core::manifest::trait_type;
use rudder_core::{keys, ApplicationRevision, Manifest, ReconcileError, Result};
use rudder_kubehub::DefinitionSource;
use tracing::warn;

/// When a trait is applied relative to its workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageType {
    PreDispatch = 0,
    DefaultDispatch = 1,
    PostDispatch = 2,
}

impl StageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreDispatch => "PreDispatch",
            Self::DefaultDispatch => "DefaultDispatch",
            Self::PostDispatch => "PostDispatch",
        }
    }
}

impl fmt::Display for StageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for StageType {
    type Err = ReconcileError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PreDispatch" => Ok(Self::PreDispatch),
            "DefaultDispatch" => Ok(Self::DefaultDispatch),
            "PostDispatch" => Ok(Self::PostDispatch),
            other => Err(ReconcileError::Validation(format!("unknown stage type: {other}"))),
        }
    }
}

/// `x-aux` resolves to `x` when only `x` is a known definition.
fn definition_name<'a>(trait_type: &'a str, revision: &ApplicationRevision) -> &'a str {
    let defs = &revision.spec.trait_definitions;
    if defs.contains_key(trait_type) {
        return trait_type;
    }
    match trait_type.rsplit_once('-') {
        Some((prefix, _)) if defs.contains_key(prefix) => prefix,
        _ => trait_type,
    }
}

fn parse_declared(stage: Option<&str>) -> Result<StageType> {
    stage.filter(|s| !s.is_empty()).map(StageType::from_str).unwrap_or(Ok(StageType::DefaultDispatch))
}

/// Stage of one trait manifest. Unknown definitions fall back to a live
/// lookup; a failed lookup is Default, an unparsable declared stage is an error.
pub async fn classify_stage(
    manifest: &Manifest,
    revision: &ApplicationRevision,
    defs: &dyn DefinitionSource,
    app_namespace: &str,
) -> Result<StageType> {
    let Some(ty) = trait_type(manifest).filter(|t| !t.is_empty()) else {
        return Ok(StageType::DefaultDispatch);
    };
    if ty == keys::AUXILIARY_WORKLOAD {
        return Ok(StageType::DefaultDispatch);
    }
    let name = definition_name(ty, revision);
    if let Some(td) = revision.spec.trait_definitions.get(name) {
        return parse_declared(td.stage());
    }
    match defs.trait_definition(name, app_namespace).await {
        Ok(td) => parse_declared(td.stage()),
        Err(e) => {
            warn!(trait_type = name, error = %e, "trait definition lookup failed, using DefaultDispatch");
            Ok(StageType::DefaultDispatch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_core::manifest::manifest_from_json;
    use rudder_core::{ApplicationRevisionSpec, TraitDefinition, TraitDefinitionSpec};
    use rudder_kubehub::memory::MemoryCluster;
    use serde_json::json;

    fn trait_manifest(ty: &str) -> Manifest {
        manifest_from_json(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": ty, "namespace": "default", "labels": {"trait.oam.dev/type": ty}}
        }))
        .unwrap()
    }

    fn td(name: &str, stage: Option<&str>) -> TraitDefinition {
        let mut t = TraitDefinition::new(name, TraitDefinitionSpec { stage: stage.map(str::to_string), ..Default::default() });
        t.metadata.namespace = Some("vela-system".into());
        t
    }

    fn revision(defs: &[TraitDefinition]) -> ApplicationRevision {
        let mut spec = ApplicationRevisionSpec::default();
        for d in defs {
            spec.trait_definitions.insert(d.metadata.name.clone().unwrap_or_default(), d.clone());
        }
        ApplicationRevision::new("app-v1", spec)
    }

    #[test]
    fn parse_and_order() {
        assert_eq!("PostDispatch".parse::<StageType>().unwrap(), StageType::PostDispatch);
        assert!("Later".parse::<StageType>().is_err());
        assert!(StageType::PreDispatch < StageType::DefaultDispatch && StageType::DefaultDispatch < StageType::PostDispatch);
        assert_eq!(StageType::PreDispatch.to_string(), "PreDispatch");
    }

    #[tokio::test]
    async fn revision_definitions_and_hyphen_variants() {
        let c = MemoryCluster::new("vela-system");
        let rev = revision(&[td("gateway", Some("PostDispatch")), td("sidecar", Some("PreDispatch")), td("sidecar-v2", None)]);
        assert_eq!(classify_stage(&trait_manifest("gateway"), &rev, &c, "default").await.unwrap(), StageType::PostDispatch);
        assert_eq!(classify_stage(&trait_manifest("gateway-aux"), &rev, &c, "default").await.unwrap(), StageType::PostDispatch);
        assert_eq!(classify_stage(&trait_manifest("sidecar-v2"), &rev, &c, "default").await.unwrap(), StageType::DefaultDispatch);
        assert_eq!(classify_stage(&trait_manifest(keys::AUXILIARY_WORKLOAD), &rev, &c, "default").await.unwrap(), StageType::DefaultDispatch);
        assert_eq!(c.trait_lookups.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn live_lookup_fallbacks() {
        let c = MemoryCluster::new("vela-system");
        c.add_trait(td("scaler", Some("PreDispatch")));
        c.add_trait(td("weird", Some("Whenever")));
        let rev = revision(&[]);
        assert_eq!(classify_stage(&trait_manifest("scaler"), &rev, &c, "default").await.unwrap(), StageType::PreDispatch);
        assert_eq!(classify_stage(&trait_manifest("ghost"), &rev, &c, "default").await.unwrap(), StageType::DefaultDispatch);
        assert!(classify_stage(&trait_manifest("weird"), &rev, &c, "default").await.is_err());
    }
}
