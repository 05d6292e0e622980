//! Stage-ordered, health-gated manifest dispatch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use rudder_core::manifest::trait_type;
use rudder_core::{ApplicationComponentStatus, ApplicationRevision, ApplicationTraitStatus, Manifest, ReconcileError, Result};
use rudder_kubehub::{DefinitionSource, HealthEvaluator, ResourceKeeper};
use tracing::{debug, info, warn};

use crate::stage::{classify_stage, StageType};
use crate::state::{merge_traits, ReconcileState};

pub const WAITING_PREVIOUS_STAGE: &str = "waiting for previous stage healthy";
pub const WAITING_COMPONENT: &str = "Waiting for component to be healthy";

/// Collaborators shared by every dispatcher of one reconcile pass.
#[derive(Clone)]
pub struct DispatchEnv {
    pub keeper: Arc<dyn ResourceKeeper>,
    pub health: Arc<dyn HealthEvaluator>,
    pub state: Arc<ReconcileState>,
}

/// What one stage applies. Only the default stage carries the workload.
#[derive(Debug, Clone)]
pub struct DispatchOption {
    pub stage: StageType,
    pub workload: Option<Manifest>,
    pub traits: Vec<Manifest>,
}

/// Rendered output of one component.
#[derive(Debug, Clone, Default)]
pub struct ComponentManifests {
    pub component: String,
    pub namespace: String,
    pub workload: Option<Manifest>,
    pub traits: Vec<Manifest>,
    /// The workload is managed elsewhere; only its traits are applied.
    pub skip_apply_workload: bool,
}

pub struct ManifestDispatcher {
    env: DispatchEnv,
    component: String,
    namespace: String,
    option: DispatchOption,
    skip_apply_workload: bool,
    auto_update: bool,
    /// Workload and non-Post traits checked before a Post stage may apply.
    gate: Vec<Manifest>,
}

impl ManifestDispatcher {
    pub fn stage(&self) -> StageType { self.option.stage }

    pub fn option(&self) -> &DispatchOption { &self.option }

    fn skip_workload(&self) -> bool { self.skip_apply_workload || self.option.workload.is_none() }

    /// Manifests this stage would send to the resource keeper.
    pub fn manifests(&self) -> Vec<Manifest> {
        let mut out = Vec::with_capacity(self.option.traits.len() + 1);
        if let (false, Some(w)) = (self.skip_apply_workload, &self.option.workload) {
            out.push(w.clone());
        }
        out.extend(self.option.traits.iter().cloned());
        out
    }

    /// Healthy when everything is applied and the evaluator agrees.
    pub async fn health_check(&self) -> Result<bool> {
        if !self.env.keeper.contains_resources(&self.manifests()) {
            return Ok(false);
        }
        let (_, healthy) = self.collect_health().await?;
        Ok(healthy)
    }

    /// Start from the stored status; re-evaluate the workload and this
    /// stage's traits. The status flag tracks the workload only.
    async fn collect_health(&self) -> Result<(ApplicationComponentStatus, bool)> {
        let mut status = self.env.state.service_status(&self.component, &self.namespace).unwrap_or_else(|| {
            ApplicationComponentStatus {
                name: self.component.clone(),
                namespace: self.namespace.clone(),
                healthy: true,
                ..Default::default()
            }
        });
        let mut healthy = true;
        let mut message = String::new();
        if let (false, Some(w)) = (self.skip_workload(), &self.option.workload) {
            let h = self.env.health.evaluate(&self.component, w).await?;
            status.healthy = h.healthy;
            healthy &= h.healthy;
            message = h.message;
        }
        let mut fresh = Vec::with_capacity(self.option.traits.len());
        for t in &self.option.traits {
            let h = self.env.health.evaluate(&self.component, t).await?;
            healthy &= h.healthy;
            if message.is_empty() {
                message = h.message.clone();
            }
            fresh.push(ApplicationTraitStatus {
                trait_type: trait_type(t).unwrap_or_default().to_string(),
                healthy: h.healthy,
                pending: false,
                stage: self.option.stage.to_string(),
                message: h.message,
            });
        }
        merge_traits(&mut status.traits, fresh);
        if !message.is_empty() || !self.skip_workload() {
            status.message = message;
        }
        Ok((status, healthy))
    }

    async fn gate_healthy(&self) -> Result<bool> {
        for m in &self.gate {
            let h = self.env.health.evaluate(&self.component, m).await?;
            if !h.healthy {
                debug!(component = %self.component, message = %h.message, "post-dispatch gate not satisfied");
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn mark_pending(&self) {
        let pending = self
            .option
            .traits
            .iter()
            .map(|t| ApplicationTraitStatus {
                trait_type: trait_type(t).unwrap_or_default().to_string(),
                healthy: false,
                pending: true,
                stage: StageType::PostDispatch.to_string(),
                message: WAITING_COMPONENT.to_string(),
            })
            .collect();
        self.env.state.merge_trait_statuses(&self.component, &self.namespace, pending);
    }

    /// Apply this stage if needed and report whether it is healthy.
    /// A healthy stage without a forced update is a no-op.
    pub async fn run(&self) -> Result<bool> {
        let t0 = Instant::now();
        let out = self.run_stage().await;
        histogram!("dispatch_stage_ms", t0.elapsed().as_secs_f64() * 1000.0, "stage" => self.option.stage.as_str());
        if let Err(e) = &out {
            counter!("dispatch_stage_errors_total", 1u64, "stage" => self.option.stage.as_str());
            warn!(component = %self.component, stage = %self.option.stage, error = %e, "stage failed");
        }
        out
    }

    async fn run_stage(&self) -> Result<bool> {
        if self.option.stage == StageType::PostDispatch && !self.gate_healthy().await? {
            self.mark_pending();
            info!(component = %self.component, traits = self.option.traits.len(), "post-dispatch traits pending");
            return Ok(false);
        }
        let forced = !self.skip_apply_workload && self.auto_update;
        let healthy = match self.health_check().await {
            Ok(h) => h,
            Err(e) => {
                debug!(component = %self.component, error = %e, "health check failed, dispatching");
                false
            }
        };
        if healthy && !forced {
            return Ok(true);
        }
        let manifests = self.manifests();
        self.env
            .keeper
            .dispatch(&manifests)
            .await
            .map_err(|e| ReconcileError::Apply(format!("failed to dispatch manifests: {e}")))?;
        self.env.state.record_applied(&manifests);
        counter!("dispatch_apply_total", 1u64, "stage" => self.option.stage.as_str());
        debug!(component = %self.component, stage = %self.option.stage, count = manifests.len(), forced, "manifests dispatched");

        let (mut status, healthy) = self.collect_health().await?;
        if self.option.stage < StageType::DefaultDispatch {
            status.healthy = false;
            if status.message.is_empty() {
                status.message = WAITING_PREVIOUS_STAGE.to_string();
            }
        }
        self.env.state.add_service_status(status);
        Ok(healthy)
    }
}

/// One dispatcher per non-empty stage, ascending. The default stage is
/// always present and carries the workload.
pub async fn generate_dispatchers(
    env: &DispatchEnv,
    comp: &ComponentManifests,
    revision: &ApplicationRevision,
    defs: &dyn DefinitionSource,
    app_namespace: &str,
    auto_update: bool,
) -> Result<Vec<ManifestDispatcher>> {
    let mut buckets: BTreeMap<StageType, Vec<Manifest>> = BTreeMap::new();
    buckets.insert(StageType::DefaultDispatch, Vec::new());
    for t in &comp.traits {
        let stage = classify_stage(t, revision, defs, app_namespace).await?;
        buckets.entry(stage).or_default().push(t.clone());
    }
    let mut gate: Vec<Manifest> = comp.workload.iter().filter(|_| !comp.skip_apply_workload).cloned().collect();
    for (stage, traits) in &buckets {
        if *stage != StageType::PostDispatch {
            gate.extend(traits.iter().cloned());
        }
    }
    Ok(buckets
        .into_iter()
        .map(|(stage, traits)| ManifestDispatcher {
            env: env.clone(),
            component: comp.component.clone(),
            namespace: comp.namespace.clone(),
            option: DispatchOption {
                stage,
                workload: if stage == StageType::DefaultDispatch { comp.workload.clone() } else { None },
                traits,
            },
            skip_apply_workload: comp.skip_apply_workload,
            auto_update,
            gate: if stage == StageType::PostDispatch { gate.clone() } else { Vec::new() },
        })
        .collect())
}

/// Run dispatchers in order, stopping at the first stage that is not
/// healthy yet. Errors stop the component but carry the stage.
pub async fn run_dispatchers(dispatchers: &[ManifestDispatcher]) -> Result<bool> {
    for d in dispatchers {
        let healthy = d
            .run()
            .await
            .map_err(|e| match e {
                ReconcileError::Apply(m) => ReconcileError::Apply(format!("{}: {m}", d.stage())),
                other => other,
            })?;
        if !healthy {
            debug!(component = %d.component, stage = %d.stage(), "stopping at unhealthy stage");
            return Ok(false);
        }
    }
    Ok(true)
}
