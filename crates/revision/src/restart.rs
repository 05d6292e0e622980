//! `app.oam.dev/restart-workflow` scheduling.

use chrono::{DateTime, Duration, Utc};
use rudder_core::{keys, Application, ReconcileError, Result, WorkflowStatus};

/// Parse `90s`, `5m`, `1h30m`, `250ms` and the other humantime forms.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let invalid = |e: String| ReconcileError::Validation(format!("invalid {} annotation {raw:?}: {e}", keys::ANNOTATION_WORKFLOW_RESTART));
    let std = humantime::parse_duration(raw.trim()).map_err(|e| invalid(e.to_string()))?;
    Duration::from_std(std).map_err(|e| invalid(e.to_string()))
}

/// Translate the restart annotation into `status.workflowRestartScheduledAt`.
pub fn handle_workflow_restart_annotation(app: &mut Application, now: DateTime<Utc>) -> Result<()> {
    let Some(raw) = app.annotation(keys::ANNOTATION_WORKFLOW_RESTART).map(str::to_string) else {
        return Ok(());
    };
    let remove = |app: &mut Application| {
        if let Some(a) = app.metadata.annotations.as_mut() {
            a.remove(keys::ANNOTATION_WORKFLOW_RESTART);
        }
    };
    if raw.eq_ignore_ascii_case("true") {
        app.status_mut().workflow_restart_scheduled_at = Some(now);
        remove(app);
        return Ok(());
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(&raw) {
        app.status_mut().workflow_restart_scheduled_at = Some(at.with_timezone(&Utc));
        remove(app);
        return Ok(());
    }
    let every = parse_duration(&raw)?;
    let last_end = app.status.as_ref().and_then(|s| s.workflow.as_ref()).and_then(|w| w.end_time);
    match last_end {
        Some(end) => {
            let at = end.checked_add_signed(every).ok_or_else(|| {
                ReconcileError::Validation(format!("{} annotation {raw:?} schedules past the supported time range", keys::ANNOTATION_WORKFLOW_RESTART))
            })?;
            app.status_mut().workflow_restart_scheduled_at = Some(at);
        }
        None => tracing::debug!(app = %app.app_key(), "recurring restart waits for a finished workflow"),
    }
    Ok(())
}

/// Reset the workflow status when a scheduled restart is due or the desired
/// revision moved. Returns true when the workflow was restarted.
pub fn check_workflow_restart(app: &mut Application, current_revision: &str, now: DateTime<Utc>) -> bool {
    let desired = app.publish_version().unwrap_or(current_revision).to_string();
    let status = app.status_mut();
    let due = status.workflow_restart_scheduled_at.map(|at| at <= now).unwrap_or(false);
    let moved = status.workflow.as_ref().map(|w| w.app_revision != desired).unwrap_or(false);
    if !due && !moved {
        return false;
    }
    if due {
        status.workflow_restart_scheduled_at = None;
    }
    tracing::info!(revision = %desired, scheduled = due, "restarting workflow");
    status.workflow = Some(WorkflowStatus { app_revision: desired, ..Default::default() });
    status.services.clear();
    true
}
