use std::sync::Arc;

use rudder_core::manifest::{manifest_from_json, manifest_key};
use rudder_core::{ApplicationRevision, ApplicationRevisionSpec, Manifest, ReconcileError, TraitDefinition, TraitDefinitionSpec};
use rudder_dispatch::{
    generate_dispatchers, run_dispatchers, ComponentManifests, DispatchEnv, ManifestDispatcher, ReconcileState, StageType,
    WAITING_COMPONENT, WAITING_PREVIOUS_STAGE,
};
use rudder_kubehub::memory::{MemoryCluster, MemoryResourceKeeper, StaticHealthEvaluator};
use rudder_kubehub::HealthStatus;
use serde_json::json;

struct Fixture {
    keeper: Arc<MemoryResourceKeeper>,
    health: Arc<StaticHealthEvaluator>,
    state: Arc<ReconcileState>,
    cluster: MemoryCluster,
    revision: ApplicationRevision,
    comp: ComponentManifests,
}

fn manifest(kind: &str, name: &str, trait_type: Option<&str>) -> Manifest {
    let mut meta = json!({"name": name, "namespace": "default"});
    if let Some(t) = trait_type {
        meta["labels"] = json!({"trait.oam.dev/type": t});
    }
    manifest_from_json(json!({"apiVersion": "v1", "kind": kind, "metadata": meta})).unwrap()
}

fn trait_def(name: &str, stage: Option<&str>) -> TraitDefinition {
    TraitDefinition::new(name, TraitDefinitionSpec { stage: stage.map(str::to_string), ..Default::default() })
}

fn fixture() -> Fixture {
    let mut spec = ApplicationRevisionSpec::default();
    for td in [trait_def("sidecar", Some("PreDispatch")), trait_def("scaler", None), trait_def("gateway", Some("PostDispatch"))] {
        spec.trait_definitions.insert(td.metadata.name.clone().unwrap(), td);
    }
    Fixture {
        keeper: Arc::new(MemoryResourceKeeper::new()),
        health: Arc::new(StaticHealthEvaluator::new()),
        state: Arc::new(ReconcileState::new()),
        cluster: MemoryCluster::new("vela-system"),
        revision: ApplicationRevision::new("web-app-v1", spec),
        comp: ComponentManifests {
            component: "web".into(),
            namespace: "default".into(),
            workload: Some(manifest("Deployment", "web", None)),
            traits: vec![
                manifest("Service", "web-gw", Some("gateway")),
                manifest("ConfigMap", "web-sidecar", Some("sidecar")),
                manifest("HorizontalPodAutoscaler", "web-hpa", Some("scaler")),
            ],
            skip_apply_workload: false,
        },
    }
}

impl Fixture {
    fn env(&self) -> DispatchEnv {
        DispatchEnv { keeper: self.keeper.clone(), health: self.health.clone(), state: self.state.clone() }
    }

    async fn dispatchers(&self, auto_update: bool) -> Vec<ManifestDispatcher> {
        generate_dispatchers(&self.env(), &self.comp, &self.revision, &self.cluster, "default", auto_update).await.unwrap()
    }
}

fn key(kind: &str, name: &str) -> String {
    manifest_key(&manifest(kind, name, None))
}

#[tokio::test]
async fn stages_are_sorted_and_default_carries_workload() {
    let f = fixture();
    let ds = f.dispatchers(false).await;
    let stages: Vec<_> = ds.iter().map(|d| d.stage()).collect();
    assert_eq!(stages, vec![StageType::PreDispatch, StageType::DefaultDispatch, StageType::PostDispatch]);
    for d in &ds {
        assert_eq!(d.option().workload.is_some(), d.stage() == StageType::DefaultDispatch);
        assert_eq!(d.option().traits.len(), 1);
    }
}

#[tokio::test]
async fn default_stage_exists_without_default_traits() {
    let mut f = fixture();
    f.comp.traits.retain(|t| t.metadata.name.as_deref() == Some("web-gw"));
    let ds = f.dispatchers(false).await;
    let stages: Vec<_> = ds.iter().map(|d| d.stage()).collect();
    assert_eq!(stages, vec![StageType::DefaultDispatch, StageType::PostDispatch]);
    assert!(ds[0].option().workload.is_some() && ds[0].option().traits.is_empty());
}

#[tokio::test]
async fn healthy_component_dispatches_in_stage_order_then_settles() {
    let f = fixture();
    let ds = f.dispatchers(false).await;
    assert!(run_dispatchers(&ds).await.unwrap());
    assert_eq!(
        f.keeper.dispatch_log(),
        vec![key("ConfigMap", "web-sidecar"), key("Deployment", "web"), key("HorizontalPodAutoscaler", "web-hpa"), key("Service", "web-gw")]
    );
    let svc = f.state.service_status("web", "default").unwrap();
    assert!(svc.healthy);
    assert_eq!(svc.traits.len(), 3);
    assert!(svc.traits.iter().all(|t| t.healthy && !t.pending));

    // second pass: everything applied and healthy, nothing re-sent
    assert!(run_dispatchers(&f.dispatchers(false).await).await.unwrap());
    assert_eq!(f.keeper.dispatch_log().len(), 4);
}

#[tokio::test]
async fn health_check_requires_applied_resources() {
    let f = fixture();
    let ds = f.dispatchers(false).await;
    assert!(!ds[1].health_check().await.unwrap());
    assert!(ds[1].run().await.unwrap());
    assert!(ds[1].health_check().await.unwrap());
}

#[tokio::test]
async fn post_traits_wait_for_workload() {
    let f = fixture();
    f.health.set(f.comp.workload.as_ref().unwrap(), HealthStatus::unhealthy("0/1 replicas ready"));
    let ds = f.dispatchers(false).await;

    assert!(!run_dispatchers(&ds).await.unwrap());
    assert!(!f.keeper.dispatch_log().contains(&key("Service", "web-gw")));

    let post = ds.iter().find(|d| d.stage() == StageType::PostDispatch).unwrap();
    assert!(!post.run().await.unwrap());
    assert!(!f.keeper.dispatch_log().contains(&key("Service", "web-gw")));

    let svc = f.state.service_status("web", "default").unwrap();
    assert!(!svc.healthy);
    assert_eq!(svc.message, "0/1 replicas ready");
    let gw = svc.traits.iter().find(|t| t.trait_type == "gateway").unwrap();
    assert!(gw.pending && !gw.healthy);
    assert_eq!(gw.stage, "PostDispatch");
    assert_eq!(gw.message, WAITING_COMPONENT);
    assert!(svc.traits.iter().any(|t| t.trait_type == "scaler" && t.healthy));

    // workload recovers: gateway goes out and the pending entry is replaced
    f.health.set(f.comp.workload.as_ref().unwrap(), HealthStatus::healthy());
    assert!(run_dispatchers(&f.dispatchers(false).await).await.unwrap());
    assert!(f.keeper.dispatch_log().contains(&key("Service", "web-gw")));
    let gw = f.state.service_status("web", "default").unwrap().traits.into_iter().find(|t| t.trait_type == "gateway").unwrap();
    assert!(gw.healthy && !gw.pending);
}

#[tokio::test]
async fn unhealthy_default_trait_also_gates_post() {
    let f = fixture();
    f.health.set(&f.comp.traits[2], HealthStatus::unhealthy("scaling"));
    let ds = f.dispatchers(false).await;
    let post = ds.iter().find(|d| d.stage() == StageType::PostDispatch).unwrap();
    assert!(!post.run().await.unwrap());
    assert!(f.keeper.dispatch_log().is_empty());
}

#[tokio::test]
async fn pre_stage_reports_waiting() {
    let f = fixture();
    let ds = f.dispatchers(false).await;
    assert_eq!(ds[0].stage(), StageType::PreDispatch);
    assert!(ds[0].run().await.unwrap());
    let svc = f.state.service_status("web", "default").unwrap();
    assert!(!svc.healthy);
    assert_eq!(svc.message, WAITING_PREVIOUS_STAGE);
    assert_eq!(svc.traits[0].stage, "PreDispatch");
}

#[tokio::test]
async fn auto_update_forces_reapply() {
    let f = fixture();
    assert!(run_dispatchers(&f.dispatchers(true).await).await.unwrap());
    assert!(run_dispatchers(&f.dispatchers(true).await).await.unwrap());
    let log = f.keeper.dispatch_log();
    assert_eq!(log.len(), 8);
    assert_eq!(log.iter().filter(|k| **k == key("Deployment", "web")).count(), 2);
}

#[tokio::test]
async fn skipped_workload_is_never_applied_or_forced() {
    let mut f = fixture();
    f.comp.skip_apply_workload = true;
    f.health.set(f.comp.workload.as_ref().unwrap(), HealthStatus::unhealthy("not ours"));
    assert!(run_dispatchers(&f.dispatchers(true).await).await.unwrap());
    assert!(run_dispatchers(&f.dispatchers(true).await).await.unwrap());
    let log = f.keeper.dispatch_log();
    assert!(!log.contains(&key("Deployment", "web")));
    assert_eq!(log.len(), 3);
}

#[tokio::test]
async fn apply_failure_fails_the_stage_only() {
    let f = fixture();
    f.keeper.set_failing(true);
    let ds = f.dispatchers(false).await;
    let err = run_dispatchers(&ds).await.unwrap_err();
    match err {
        ReconcileError::Apply(m) => {
            assert!(m.starts_with("PreDispatch"), "{m}");
            assert!(m.contains("failed to dispatch manifests"), "{m}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(f.state.services().is_empty());

    f.keeper.set_failing(false);
    assert!(run_dispatchers(&ds).await.unwrap());
}

#[tokio::test]
async fn bad_declared_stage_fails_generation() {
    let mut f = fixture();
    f.revision.spec.trait_definitions.insert("scaler".into(), trait_def("scaler", Some("Eventually")));
    let res = generate_dispatchers(&f.env(), &f.comp, &f.revision, &f.cluster, "default", false).await;
    assert!(matches!(res, Err(ReconcileError::Validation(_))));
}
