//! Semantic revision equality used to decide reuse.

use std::collections::BTreeMap;

use rudder_core::{keys, Application, ApplicationRevision, Settings};
use semver::Version;

/// Applications recorded by a controller older than `threshold` stored no
/// workflow in their revisions, so workflow equality is bypassed for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowCompareGate {
    threshold: Version,
}

impl Default for WorkflowCompareGate {
    fn default() -> Self {
        Self { threshold: Version::new(1, 5, 7) }
    }
}

/// `v1.5`, `1.5.7-alpha.4` and `v1.6.0` all parse; missing parts are zero.
pub fn parse_version_lenient(raw: &str) -> Option<Version> {
    let s = raw.trim().trim_start_matches('v');
    if let Ok(v) = Version::parse(s) {
        return Some(v);
    }
    let (core, pre) = match s.split_once('-') {
        Some((c, p)) => (c, Some(p)),
        None => (s, None),
    };
    let mut nums = core.split('.').map(|p| p.parse::<u64>());
    let major = nums.next()?.ok()?;
    let minor = nums.next().transpose().ok()?.unwrap_or(0);
    let patch = nums.next().transpose().ok()?.unwrap_or(0);
    let normal = format!("{major}.{minor}.{patch}");
    Version::parse(&match pre { Some(p) => format!("{normal}-{p}"), None => normal }).ok()
}

impl WorkflowCompareGate {
    pub fn new(threshold: &str) -> Self {
        match parse_version_lenient(threshold) {
            Some(threshold) => Self { threshold },
            None => {
                tracing::warn!(threshold, "unparsable workflow compare version, using default");
                Self::default()
            }
        }
    }

    pub fn from_settings(s: &Settings) -> Self { Self::new(&s.workflow_compare_version) }

    /// True when the old application skips workflow comparison.
    pub fn bypasses_workflow(&self, old: &Application) -> bool {
        if old.publish_version().is_some() {
            return false;
        }
        match old.annotation(keys::ANNOTATION_KUBEVELA_VERSION).filter(|v| !v.is_empty()) {
            Some(v) => parse_version_lenient(v).map(|v| v < self.threshold).unwrap_or(false),
            None => false,
        }
    }

    fn equal_app_spec(&self, old: &Application, new: &Application) -> bool {
        if self.bypasses_workflow(old) {
            let (mut o, mut n) = (old.spec.clone(), new.spec.clone());
            o.workflow = None;
            n.workflow = None;
            return o == n;
        }
        old.spec == new.spec
    }
}

fn same_specs<T, S: PartialEq>(old: &BTreeMap<String, T>, new: &BTreeMap<String, T>, spec: impl Fn(&T) -> &S) -> bool {
    old.len() == new.len() && new.iter().all(|(k, n)| old.get(k).map(|o| spec(o) == spec(n)).unwrap_or(false))
}

/// Policies, workflow and application spec equality.
pub fn deep_equal_app_in_revision(gate: &WorkflowCompareGate, old: &ApplicationRevision, new: &ApplicationRevision) -> bool {
    let (o, n) = (&old.spec, &new.spec);
    let policies = o.policies.len() == n.policies.len()
        && n.policies.iter().all(|(k, p)| {
            o.policies.get(k).map(|op| op.policy_type == p.policy_type && op.properties == p.properties).unwrap_or(false)
        });
    if !policies {
        return false;
    }
    let workflow = match (&o.workflow, &n.workflow) {
        (None, None) => true,
        (Some(a), Some(b)) => a.steps == b.steps,
        _ => false,
    };
    workflow && gate.equal_app_spec(&o.application, &n.application)
}

/// Full semantic equality: definition maps, then everything in
/// [`deep_equal_app_in_revision`].
pub fn deep_equal_revision(gate: &WorkflowCompareGate, old: &ApplicationRevision, new: &ApplicationRevision) -> bool {
    let (o, n) = (&old.spec, &new.spec);
    same_specs(&o.workload_definitions, &n.workload_definitions, |d| &d.spec)
        && same_specs(&o.trait_definitions, &n.trait_definitions, |d| &d.spec)
        && same_specs(&o.component_definitions, &n.component_definitions, |d| &d.spec)
        && deep_equal_app_in_revision(gate, old, new)
}
