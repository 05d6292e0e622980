//! Revision reuse decisions and persistence.

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use metrics::{counter, histogram};
use rudder_core::{keys, Application, ApplicationRevision, ApplicationRevisionStatus, ReconcileError, Result, Revision, Settings};
use rudder_kubehub::RevisionStore;
use tracing::{debug, info, warn};

use crate::equal::{deep_equal_app_in_revision, deep_equal_revision, WorkflowCompareGate};
use crate::gather::{gather_revision_spec, RenderedArtifacts};
use crate::extract_revision_num;

/// Outcome of [`RevisionEngine::prepare_revision`].
#[derive(Debug, Clone)]
pub struct PreparedRevision {
    pub revision: ApplicationRevision,
    pub name: String,
    pub hash: String,
    /// The latest-revision pointer must move.
    pub is_new: bool,
    /// No stored object matches; one will be created.
    pub needs_new_object: bool,
}

pub struct RevisionEngine {
    store: Arc<dyn RevisionStore>,
    disabled: bool,
    gate: WorkflowCompareGate,
}

impl RevisionEngine {
    pub fn new(store: Arc<dyn RevisionStore>, settings: &Settings) -> Self {
        Self { store, disabled: settings.disable_app_revisions, gate: WorkflowCompareGate::from_settings(settings) }
    }

    pub fn disabled(&self) -> bool { self.disabled }

    /// The revision `status.latestRevision` points at; missing is an error.
    pub async fn latest_revision(&self, app: &Application) -> Result<Option<ApplicationRevision>> {
        if self.disabled {
            return Ok(None);
        }
        let Some(latest) = app.latest_revision().filter(|r| !r.name.is_empty()) else {
            return Ok(None);
        };
        let ns = app.namespace().unwrap_or_default();
        match self.store.get_revision(&ns, &latest.name).await? {
            Some(r) => Ok(Some(r)),
            None => Err(ReconcileError::not_found("ApplicationRevision", &ns, &latest.name)),
        }
    }

    /// Decide whether the resolved application reuses a stored revision.
    pub async fn prepare_revision(&self, app: &Application, artifacts: &RenderedArtifacts) -> Result<PreparedRevision> {
        let started = Instant::now();
        let (current, hash) = gather_revision_spec(app, artifacts)?;
        let prepared = self.decide(app, current, hash).await?;
        let (ns, name) = (app.namespace().unwrap_or_default(), app.name_any());
        if prepared.needs_new_object {
            counter!("revision_new_total", 1u64);
        }
        histogram!("revision_prepare_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(namespace = %ns, app = %name, revision = %prepared.name, hash = %prepared.hash, is_new = prepared.is_new, "revision prepared");
        Ok(prepared)
    }

    async fn decide(&self, app: &Application, current: ApplicationRevision, hash: String) -> Result<PreparedRevision> {
        let ns = app.namespace().unwrap_or_default();
        let latest = self.latest_revision(app).await?;
        let Some(latest) = latest else {
            return Ok(self.minted(app, current, hash, 0));
        };

        let mut is_latest = deep_equal_app_in_revision(&self.gate, &latest, &current);
        if app.annotation(keys::ANNOTATION_AUTO_UPDATE).is_some() {
            is_latest = hash_label(&latest) == Some(hash.as_str()) && deep_equal_revision(&self.gate, &latest, &current);
        }
        if latest.spec.application.publish_version() != app.publish_version() {
            is_latest = false;
        }
        if is_latest {
            let mut reused = latest;
            reused.spec.application.spec = current.spec.application.spec;
            reused.spec.trait_definitions = current.spec.trait_definitions;
            reused.spec.workflow_step_definitions = current.spec.workflow_step_definitions;
            let hash = app.latest_revision().map(|r| r.revision_hash.clone()).filter(|h| !h.is_empty()).unwrap_or(hash);
            let name = reused.name_any();
            debug!(revision = %name, "reusing latest revision");
            return Ok(PreparedRevision { revision: reused, name, hash, is_new: false, needs_new_object: false });
        }

        let history = self.store.list_revisions(&ns, &app.name_any()).await?;
        let highest = history.iter().map(|r| extract_revision_num(&r.name_any())).max().unwrap_or(0);
        for rev in history {
            if hash_label(&rev) == Some(hash.as_str())
                && deep_equal_revision(&self.gate, &rev, &current)
                && rev.spec.application.publish_version() == app.publish_version()
            {
                let name = rev.name_any();
                debug!(revision = %name, "reusing matching historical revision");
                return Ok(PreparedRevision { revision: rev, name, hash, is_new: true, needs_new_object: false });
            }
        }
        Ok(self.minted(app, current, hash, highest))
    }

    fn minted(&self, app: &Application, mut current: ApplicationRevision, hash: String, highest: i64) -> PreparedRevision {
        let latest = app.latest_revision().map(|r| r.revision.max(extract_revision_num(&r.name))).unwrap_or(0);
        let next = latest.max(highest) + 1;
        let name = format!("{}-v{next}", app.name_any());
        current.metadata.name = Some(name.clone());
        current.metadata.namespace = app.namespace();
        PreparedRevision { revision: current, name, hash, is_new: true, needs_new_object: true }
    }

    /// Create or update the stored revision; unchanged objects are left alone.
    pub async fn finalize_and_apply(&self, app: &Application, prepared: &mut PreparedRevision) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        let mut rev = prepared.revision.clone();
        rev.metadata.name = Some(prepared.name.clone());
        rev.metadata.namespace = app.namespace();
        let mut annotations = app.annotation_map();
        annotations.remove(keys::ANNOTATION_LAST_APPLIED);
        annotations.remove(keys::ANNOTATION_KUBECTL_LAST_APPLIED);
        rev.metadata.annotations = Some(annotations);
        let mut labels = app.label_map();
        labels.insert(keys::LABEL_APP_NAME.to_string(), app.name_any());
        labels.insert(keys::LABEL_APP_REVISION_HASH.to_string(), prepared.hash.clone());
        rev.metadata.labels = Some(labels);
        rev.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "core.oam.dev/v1beta1".into(),
            kind: "Application".into(),
            name: app.name_any(),
            uid: app.uid().unwrap_or_default(),
            controller: Some(true),
            ..Default::default()
        }]);

        let ns = app.namespace().unwrap_or_default();
        let stored = match self.store.get_revision(&ns, &prepared.name).await? {
            None => {
                info!(namespace = %ns, revision = %prepared.name, "creating application revision");
                self.store.create_revision(&rev).await?
            }
            Some(existing) if existing.spec == rev.spec && existing.metadata.labels == rev.metadata.labels
                && existing.metadata.annotations == rev.metadata.annotations => {
                debug!(revision = %prepared.name, "application revision unchanged");
                existing
            }
            Some(existing) => {
                rev.metadata.resource_version = existing.metadata.resource_version.clone();
                rev.status = existing.status.clone();
                info!(namespace = %ns, revision = %prepared.name, "updating application revision");
                self.store.update_revision(&rev).await?
            }
        };
        prepared.revision = stored;
        Ok(())
    }

    /// Point `status.latestRevision` at a new revision. Returns true when changed.
    pub fn update_latest_revision_status(&self, app: &mut Application, prepared: &PreparedRevision) -> bool {
        if self.disabled || !prepared.is_new {
            return false;
        }
        app.status_mut().latest_revision = Some(Revision {
            name: prepared.name.clone(),
            revision: extract_revision_num(&prepared.name),
            revision_hash: prepared.hash.clone(),
        });
        true
    }

    /// Copy the workflow outcome onto the revision. Failures are logged only.
    pub async fn update_revision_workflow_status(&self, app: &Application, prepared: &PreparedRevision) {
        if self.disabled {
            return;
        }
        let workflow = app.status.as_ref().and_then(|s| s.workflow.clone());
        let succeeded = workflow.as_ref().and_then(|w| w.phase.as_deref()) == Some("succeeded");
        let mut rev = prepared.revision.clone();
        rev.status = Some(ApplicationRevisionStatus { succeeded, workflow });
        if let Err(e) = self.store.update_revision_status(&rev).await {
            warn!(revision = %prepared.name, error = %e, "failed to update revision workflow status");
        }
    }
}

fn hash_label(rev: &ApplicationRevision) -> Option<&str> {
    rev.labels().get(keys::LABEL_APP_REVISION_HASH).map(String::as_str)
}
