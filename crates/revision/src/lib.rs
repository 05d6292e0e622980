//! Rudder revision engine: content hashing over a resolved application,
//! revision reuse decisions and ApplicationRevision persistence.

#![forbid(unsafe_code)]

pub mod engine;
pub mod equal;
pub mod gather;
pub mod restart;

pub use engine::{PreparedRevision, RevisionEngine};
pub use equal::{deep_equal_app_in_revision, deep_equal_revision, WorkflowCompareGate};
pub use gather::{compute_app_revision_hash, gather_revision_spec, RenderedArtifacts};
pub use restart::{check_workflow_restart, handle_workflow_restart_annotation};

/// Revision number from a `{app}-v{n}` name; 0 when the name has no such suffix.
pub fn extract_revision_num(name: &str) -> i64 {
    name.rsplit_once('-')
        .and_then(|(_, tail)| tail.strip_prefix('v'))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}
