//! Per-reconcile mutable state shared by every dispatcher of one pass.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use rudder_core::manifest::manifest_key;
use rudder_core::{Application, ApplicationComponentStatus, ApplicationTraitStatus, Manifest};

#[derive(Debug, Default)]
struct Inner {
    applied: BTreeSet<String>,
    services: Vec<ApplicationComponentStatus>,
}

/// Applied manifest keys and accumulated component health.
#[derive(Debug, Default)]
pub struct ReconcileState {
    inner: Mutex<Inner>,
}

impl ReconcileState {
    pub fn new() -> Self { Self::default() }

    /// Seed with the service statuses already on the application.
    pub fn from_application(app: &Application) -> Self {
        let services = app.status.as_ref().map(|s| s.services.clone()).unwrap_or_default();
        Self { inner: Mutex::new(Inner { applied: BTreeSet::new(), services }) }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn record_applied(&self, manifests: &[Manifest]) {
        let mut g = self.lock();
        for m in manifests {
            g.applied.insert(manifest_key(m));
        }
    }

    pub fn applied(&self) -> BTreeSet<String> { self.lock().applied.clone() }

    pub fn service_status(&self, name: &str, namespace: &str) -> Option<ApplicationComponentStatus> {
        self.lock().services.iter().find(|s| s.name == name && s.namespace == namespace).cloned()
    }

    /// Insert or replace the entry with the same name and namespace.
    pub fn add_service_status(&self, status: ApplicationComponentStatus) {
        let mut g = self.lock();
        match g.services.iter_mut().find(|s| s.name == status.name && s.namespace == status.namespace) {
            Some(existing) => *existing = status,
            None => g.services.push(status),
        }
    }

    /// Replace trait entries by type on a component, creating it if absent.
    /// The component's own health flag is left alone.
    pub fn merge_trait_statuses(&self, name: &str, namespace: &str, traits: Vec<ApplicationTraitStatus>) {
        let mut g = self.lock();
        let idx = match g.services.iter().position(|s| s.name == name && s.namespace == namespace) {
            Some(i) => i,
            None => {
                g.services.push(ApplicationComponentStatus {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    healthy: true,
                    ..Default::default()
                });
                g.services.len() - 1
            }
        };
        merge_traits(&mut g.services[idx].traits, traits);
    }

    pub fn services(&self) -> Vec<ApplicationComponentStatus> { self.lock().services.clone() }

    /// Write the accumulated service statuses back onto the application.
    pub fn write_back(&self, app: &mut Application) {
        app.status_mut().services = self.services();
    }
}

pub(crate) fn merge_traits(current: &mut Vec<ApplicationTraitStatus>, fresh: Vec<ApplicationTraitStatus>) {
    current.retain(|t| !fresh.iter().any(|f| f.trait_type == t.trait_type));
    current.extend(fresh);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trait_status(ty: &str, healthy: bool) -> ApplicationTraitStatus {
        ApplicationTraitStatus { trait_type: ty.into(), healthy, ..Default::default() }
    }

    #[test]
    fn add_replaces_by_name_and_namespace() {
        let s = ReconcileState::new();
        s.add_service_status(ApplicationComponentStatus { name: "web".into(), namespace: "a".into(), healthy: false, ..Default::default() });
        s.add_service_status(ApplicationComponentStatus { name: "web".into(), namespace: "b".into(), healthy: false, ..Default::default() });
        s.add_service_status(ApplicationComponentStatus { name: "web".into(), namespace: "a".into(), healthy: true, ..Default::default() });
        assert_eq!(s.services().len(), 2);
        assert!(s.service_status("web", "a").unwrap().healthy);
        assert!(!s.service_status("web", "b").unwrap().healthy);
    }

    #[test]
    fn merge_keeps_other_trait_types() {
        let s = ReconcileState::new();
        s.merge_trait_statuses("web", "", vec![trait_status("scaler", true), trait_status("gateway", true)]);
        s.merge_trait_statuses("web", "", vec![trait_status("gateway", false)]);
        let svc = s.service_status("web", "").unwrap();
        assert!(svc.healthy);
        assert_eq!(svc.traits.len(), 2);
        assert!(svc.traits.iter().any(|t| t.trait_type == "scaler" && t.healthy));
        assert!(svc.traits.iter().any(|t| t.trait_type == "gateway" && !t.healthy));
    }
}
