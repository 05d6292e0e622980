//! Rudder policy pipeline: discovers global and explicit Application-scoped
//! policies, renders them through an external renderer with a process-wide
//! cache, applies their transforms and records an audit trail.

#![forbid(unsafe_code)]

pub mod cache;
pub mod discovery;
pub mod dryrun;
pub mod pipeline;
pub mod render;
pub mod result;
pub mod transforms;
pub mod validate;

pub use cache::{CacheEntry, PolicyCache};
pub use discovery::{
    discover_global_policies, policy_set_hash, resolve_explicit_policies, resolve_policies, resolve_policy_definition,
    sort_policies, validate_explicit_references,
};
pub use dryrun::{simulate, DryRunMode, DryRunOptions, DryRunResult, PlanStep, PolicyOutcome};
pub use pipeline::{audit_records, PolicyContext, PolicyPipeline};
pub use render::{render_context, render_policy};
pub use result::{PolicySource, RenderedPolicyResult, ResolvedPolicy, Transform, TransformType, Transforms};
pub use transforms::{apply_result, deep_merge, filter_user_metadata, PolicyChanges};
pub use validate::{admit_policy_definition, validate_policy_definition, PolicyValidation};
