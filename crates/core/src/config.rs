//! Process settings read from `RUDDER_*` environment variables.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SYSTEM_NAMESPACE: &str = "vela-system";
pub const DEFAULT_WORKFLOW_COMPARE_VERSION: &str = "v1.5.7";
pub const DEFAULT_PRIORITY_WARN: i32 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Namespace holding cluster-wide definitions and global policies.
    pub system_namespace: String,
    /// Run global policy discovery.
    pub enable_global_policies: bool,
    /// Execute Application-scoped policies; discovery alone is observable.
    pub enable_application_scoped_policies: bool,
    /// Turn every revision persistence operation into a no-op.
    pub disable_app_revisions: bool,
    /// Apps recorded with an older version skip workflow comparison.
    pub workflow_compare_version: String,
    pub policy_priority_warn: i32,
    /// Cache entries older than this are dropped by `purge_older_than`.
    pub policy_cache_max_age_secs: u64,
    pub db_path: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            enable_global_policies: true,
            enable_application_scoped_policies: true,
            disable_app_revisions: false,
            workflow_compare_version: DEFAULT_WORKFLOW_COMPARE_VERSION.to_string(),
            policy_priority_warn: DEFAULT_PRIORITY_WARN,
            policy_cache_max_age_secs: 3600,
            db_path: None,
        }
    }
}

impl Settings {
    /// `RUDDER_DB_PATH` when set, else `$HOME/.rudder/audit.db`, else a relative `.rudder/audit.db`.
    pub fn audit_db_path(&self) -> PathBuf {
        match &self.db_path {
            Some(p) => PathBuf::from(p),
            None => std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default().join(".rudder").join("audit.db"),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build settings from an arbitrary key lookup; unset or unparsable keys keep defaults.
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(get: F) -> Self {
        let d = Self::default();
        let flag = |k: &str, dflt: bool| get(k).map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(dflt);
        Self {
            system_namespace: get("RUDDER_SYSTEM_NAMESPACE").filter(|s| !s.is_empty()).unwrap_or(d.system_namespace),
            enable_global_policies: flag("RUDDER_ENABLE_GLOBAL_POLICIES", d.enable_global_policies),
            enable_application_scoped_policies: flag("RUDDER_ENABLE_APP_SCOPED_POLICIES", d.enable_application_scoped_policies),
            disable_app_revisions: flag("RUDDER_DISABLE_APP_REVISIONS", d.disable_app_revisions),
            workflow_compare_version: get("RUDDER_WORKFLOW_COMPARE_VERSION").filter(|s| !s.is_empty()).unwrap_or(d.workflow_compare_version),
            policy_priority_warn: get("RUDDER_POLICY_PRIORITY_WARN").and_then(|s| s.parse().ok()).unwrap_or(d.policy_priority_warn),
            policy_cache_max_age_secs: get("RUDDER_POLICY_CACHE_MAX_AGE_SECS").and_then(|s| s.parse().ok()).unwrap_or(d.policy_cache_max_age_secs),
            db_path: get("RUDDER_DB_PATH").filter(|s| !s.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn lookup_overrides_and_falls_back() {
        let env: HashMap<&str, &str> = [
            ("RUDDER_SYSTEM_NAMESPACE", "kube-system"),
            ("RUDDER_ENABLE_GLOBAL_POLICIES", "0"),
            ("RUDDER_POLICY_PRIORITY_WARN", "not-a-number"),
            ("RUDDER_DISABLE_APP_REVISIONS", "TRUE"),
        ]
        .into_iter()
        .collect();
        let s = Settings::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(s.system_namespace, "kube-system");
        assert!(!s.enable_global_policies);
        assert!(s.enable_application_scoped_policies);
        assert!(s.disable_app_revisions);
        assert_eq!(s.policy_priority_warn, DEFAULT_PRIORITY_WARN);
        assert_eq!(s.workflow_compare_version, "v1.5.7");
    }

    #[test]
    fn audit_db_path_prefers_explicit_setting() {
        let s = Settings { db_path: Some("/var/lib/rudder/a.db".into()), ..Settings::default() };
        assert_eq!(s.audit_db_path(), PathBuf::from("/var/lib/rudder/a.db"));
        assert!(Settings::default().audit_db_path().ends_with(".rudder/audit.db"));
    }
}
