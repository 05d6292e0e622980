use std::sync::atomic::Ordering;
use std::sync::Arc;

use kube::ResourceExt;
use rudder_core::{keys, Application, ApplicationComponent, ApplicationSpec, Settings, TraitDefinition, TraitDefinitionSpec};
use rudder_kubehub::memory::MemoryCluster;
use rudder_revision::{PreparedRevision, RenderedArtifacts, RevisionEngine};
use serde_json::json;

fn app(image: &str) -> Application {
    let mut a = Application::new(
        "app",
        ApplicationSpec {
            components: vec![ApplicationComponent {
                name: "web".into(),
                component_type: "webservice".into(),
                properties: Some(json!({"image": image})),
                traits: vec![],
            }],
            ..Default::default()
        },
    );
    a.metadata.namespace = Some("default".into());
    a
}

async fn reconcile(engine: &RevisionEngine, app: &mut Application, arts: &RenderedArtifacts) -> PreparedRevision {
    let mut prepared = engine.prepare_revision(app, arts).await.unwrap();
    engine.finalize_and_apply(app, &mut prepared).await.unwrap();
    engine.update_latest_revision_status(app, &prepared);
    prepared
}

#[tokio::test]
async fn first_revision_then_idempotent_rerun() {
    let cluster = Arc::new(MemoryCluster::new("vela-system"));
    let engine = RevisionEngine::new(cluster.clone(), &Settings::default());
    let mut a = app("nginx");
    let arts = RenderedArtifacts::default();

    let first = reconcile(&engine, &mut a, &arts).await;
    assert_eq!(first.name, "app-v1");
    assert!(first.is_new && first.needs_new_object);
    let latest = a.latest_revision().unwrap().clone();
    assert_eq!((latest.name.as_str(), latest.revision), ("app-v1", 1));
    let stored = cluster.revisions();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].labels().get(keys::LABEL_APP_REVISION_HASH), Some(&first.hash));
    assert_eq!(stored[0].labels().get(keys::LABEL_APP_NAME).map(String::as_str), Some("app"));
    let writes = cluster.revision_writes.load(Ordering::Relaxed);

    let second = reconcile(&engine, &mut a, &arts).await;
    assert_eq!(second.name, "app-v1");
    assert_eq!(second.hash, first.hash);
    assert!(!second.is_new && !second.needs_new_object);
    assert_eq!(cluster.revision_writes.load(Ordering::Relaxed), writes);
    assert_eq!(a.latest_revision().unwrap().clone(), latest);
}

#[tokio::test]
async fn reuse_keeps_stored_application_metadata() {
    let cluster = Arc::new(MemoryCluster::new("vela-system"));
    let engine = RevisionEngine::new(cluster.clone(), &Settings::default());
    let arts = RenderedArtifacts::default();
    let mut a = app("nginx");
    a.metadata.labels = Some([("team".to_string(), "a".to_string())].into());
    reconcile(&engine, &mut a, &arts).await;

    a.metadata.labels = Some([("team".to_string(), "b".to_string())].into());
    let reused = reconcile(&engine, &mut a, &arts).await;
    assert_eq!(reused.name, "app-v1");
    assert!(!reused.needs_new_object);
    let stored_app = &reused.revision.spec.application;
    assert_eq!(stored_app.metadata.labels.as_ref().and_then(|l| l.get("team")).map(String::as_str), Some("a"));
    assert_eq!(stored_app.spec, a.spec);
}

#[tokio::test]
async fn change_mints_and_revert_reuses_history() {
    let cluster = Arc::new(MemoryCluster::new("vela-system"));
    let engine = RevisionEngine::new(cluster.clone(), &Settings::default());
    let arts = RenderedArtifacts::default();
    let mut a = app("nginx");
    let v1 = reconcile(&engine, &mut a, &arts).await;

    a.spec.components[0].properties = Some(json!({"image": "nginx:1.25"}));
    let v2 = reconcile(&engine, &mut a, &arts).await;
    assert_eq!(v2.name, "app-v2");
    assert_ne!(v2.hash, v1.hash);
    assert_eq!(a.latest_revision().unwrap().revision, 2);

    a.spec.components[0].properties = Some(json!({"image": "nginx"}));
    let back = reconcile(&engine, &mut a, &arts).await;
    assert_eq!(back.name, "app-v1");
    assert!(back.is_new && !back.needs_new_object);
    assert_eq!(a.latest_revision().unwrap().name, "app-v1");
    assert_eq!(cluster.revisions().len(), 2);

    a.spec.components[0].properties = Some(json!({"image": "nginx:1.26"}));
    let v3 = reconcile(&engine, &mut a, &arts).await;
    assert_eq!(v3.name, "app-v3");
    assert_eq!(cluster.revisions().len(), 3);
}

#[tokio::test]
async fn publish_version_change_forces_new_revision() {
    let cluster = Arc::new(MemoryCluster::new("vela-system"));
    let engine = RevisionEngine::new(cluster.clone(), &Settings::default());
    let arts = RenderedArtifacts::default();
    let mut a = app("nginx");
    reconcile(&engine, &mut a, &arts).await;

    a.metadata.annotations = Some([(keys::ANNOTATION_PUBLISH_VERSION.to_string(), "alpha".to_string())].into());
    let next = reconcile(&engine, &mut a, &arts).await;
    assert_eq!(next.name, "app-v2");
    assert!(next.needs_new_object);
}

#[tokio::test]
async fn auto_update_compares_definitions() {
    let cluster = Arc::new(MemoryCluster::new("vela-system"));
    let engine = RevisionEngine::new(cluster.clone(), &Settings::default());
    let mut a = app("nginx");
    a.metadata.annotations = Some([(keys::ANNOTATION_AUTO_UPDATE.to_string(), "true".to_string())].into());
    let mut arts = RenderedArtifacts::default();
    reconcile(&engine, &mut a, &arts).await;

    arts.trait_definitions.insert(
        "scaler".into(),
        TraitDefinition::new("scaler", TraitDefinitionSpec { stage: Some("PostDispatch".into()), ..Default::default() }),
    );
    let next = reconcile(&engine, &mut a, &arts).await;
    assert_eq!(next.name, "app-v2");
}

#[tokio::test]
async fn disabled_revisions_never_persist() {
    let cluster = Arc::new(MemoryCluster::new("vela-system"));
    let settings = Settings { disable_app_revisions: true, ..Default::default() };
    let engine = RevisionEngine::new(cluster.clone(), &settings);
    let mut a = app("nginx");
    let prepared = reconcile(&engine, &mut a, &RenderedArtifacts::default()).await;
    assert!(prepared.is_new);
    assert!(cluster.revisions().is_empty());
    assert!(a.latest_revision().is_none());
    engine.update_revision_workflow_status(&a, &prepared).await;
}

#[tokio::test]
async fn missing_latest_revision_is_not_found() {
    let cluster = Arc::new(MemoryCluster::new("vela-system"));
    let engine = RevisionEngine::new(cluster, &Settings::default());
    let mut a = app("nginx");
    a.status_mut().latest_revision = Some(rudder_core::Revision { name: "app-v3".into(), revision: 3, revision_hash: "x".into() });
    let err = engine.prepare_revision(&a, &RenderedArtifacts::default()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn workflow_outcome_lands_on_revision_status() {
    let cluster = Arc::new(MemoryCluster::new("vela-system"));
    let engine = RevisionEngine::new(cluster.clone(), &Settings::default());
    let mut a = app("nginx");
    let prepared = reconcile(&engine, &mut a, &RenderedArtifacts::default()).await;
    a.status_mut().workflow = Some(rudder_core::WorkflowStatus {
        app_revision: "app-v1".into(),
        finished: true,
        phase: Some("succeeded".into()),
        ..Default::default()
    });
    engine.update_revision_workflow_status(&a, &prepared).await;
    let st = cluster.revisions()[0].status.clone().unwrap();
    assert!(st.succeeded);
    assert!(st.workflow.unwrap().finished);
}
