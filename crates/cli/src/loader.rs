//! YAML inputs for offline commands.

use std::path::Path;

use anyhow::{bail, Context, Result};
use kube::ResourceExt;
use rudder_apply::parse_yaml_documents;
use rudder_core::definition::definition_from_value;
use rudder_core::{Application, Manifest, PolicyDefinition, TraitDefinition};
use rudder_kubehub::memory::MemoryCluster;
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{debug, warn};

/// Every document in a (possibly multi-document) YAML file, as JSON.
pub fn read_documents(path: &Path) -> Result<Vec<Json>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_yaml_documents(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn read_one<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let mut docs = read_documents(path)?;
    if docs.len() != 1 {
        bail!("{}: expected one document, found {}", path.display(), docs.len());
    }
    Ok(serde_json::from_value(docs.remove(0)).with_context(|| format!("decoding {}", path.display()))?)
}

pub fn read_application(path: &Path) -> Result<Application> {
    let mut app: Application = read_one(path)?;
    if app.metadata.namespace.is_none() {
        app.metadata.namespace = Some("default".into());
    }
    Ok(app)
}

/// Load Trait and Policy definitions from a file or every `.yaml`/`.yml`
/// file in a directory. Definitions without a namespace land in `system_ns`.
pub fn load_definitions(path: &Path, system_ns: &str) -> Result<MemoryCluster> {
    let cluster = MemoryCluster::new(system_ns);
    let files = if path.is_dir() {
        let mut v: Vec<_> = std::fs::read_dir(path)
            .with_context(|| format!("listing {}", path.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")))
            .collect();
        v.sort();
        v
    } else {
        vec![path.to_path_buf()]
    };
    for file in files {
        for doc in read_documents(&file)? {
            match doc.get("kind").and_then(Json::as_str) {
                Some("PolicyDefinition") => {
                    let mut pd: PolicyDefinition =
                        definition_from_value("PolicyDefinition", doc).with_context(|| format!("in {}", file.display()))?;
                    pd.metadata.namespace.get_or_insert_with(|| system_ns.to_string());
                    debug!(name = %pd.name_any(), "policy definition loaded");
                    cluster.add_policy(pd);
                }
                Some("TraitDefinition") => {
                    let mut td: TraitDefinition =
                        definition_from_value("TraitDefinition", doc).with_context(|| format!("in {}", file.display()))?;
                    td.metadata.namespace.get_or_insert_with(|| system_ns.to_string());
                    cluster.add_trait(td);
                }
                other => warn!(file = %file.display(), kind = ?other, "skipping unsupported document"),
            }
        }
    }
    Ok(cluster)
}

/// One component's rendered output as written in a manifests file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentFile {
    pub component: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub workload: Option<Manifest>,
    #[serde(default)]
    pub traits: Vec<Manifest>,
    #[serde(default)]
    pub skip_apply_workload: bool,
}

pub fn read_components(path: &Path) -> Result<Vec<ComponentFile>> {
    read_documents(path)?
        .into_iter()
        .map(|d| serde_json::from_value(d).with_context(|| format!("component in {}", path.display())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_kubehub::DefinitionSource;
    use std::io::Write;

    #[tokio::test]
    async fn loads_definitions_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("defs.yaml")).unwrap();
        writeln!(
            f,
            "apiVersion: core.oam.dev/v1beta1\nkind: TraitDefinition\nmetadata:\n  name: gateway\nspec:\n  stage: PostDispatch\n---\n\
             apiVersion: core.oam.dev/v1beta1\nkind: PolicyDefinition\nmetadata:\n  name: team\n  namespace: default\nspec:\n  scope: Application\n  global: true\n"
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let c = load_definitions(dir.path(), "vela-system").unwrap();
        let td = c.trait_definition("gateway", "default").await.unwrap();
        assert_eq!(td.stage(), Some("PostDispatch"));
        assert_eq!(c.list_policy_definitions("default").await.unwrap().len(), 1);
        assert!(c.list_policy_definitions("vela-system").await.unwrap().is_empty());
    }

    #[test]
    fn one_document_required() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("app.yaml");
        std::fs::write(&p, "a: 1\n---\nb: 2\n").unwrap();
        assert!(read_one::<Json>(&p).is_err());
    }
}
