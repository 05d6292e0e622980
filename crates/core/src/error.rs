use serde::{Deserialize, Serialize};

/// Reconcile errors, grouped by how the caller should react.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ReconcileError {
    /// Definition, policy or revision lookup failed.
    #[error("not_found: {0}")]
    NotFound(String),
    /// Template evaluation failed for one policy or trait.
    #[error("render: {0}")]
    Render(String),
    /// Manifest dispatch or delete failed; retried on the next pass.
    #[error("apply: {0}")]
    Apply(String),
    #[error("health: {0}")]
    Health(String),
    /// A definition or application failed admission checks.
    #[error("validation: {0}")]
    Validation(String),
    /// Revision hashing or equality failed; the pass must fail closed.
    #[error("hash: {0}")]
    Hash(String),
    #[error("store: {0}")]
    Store(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;

impl ReconcileError {
    pub fn not_found(kind: &str, namespace: &str, name: &str) -> Self {
        if namespace.is_empty() {
            Self::NotFound(format!("{kind} {name}"))
        } else {
            Self::NotFound(format!("{kind} {namespace}/{name}"))
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound(_)) }
}

impl From<kube::Error> for ReconcileError {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound(ae.message.clone()),
            _ => Self::Apply(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(e: serde_json::Error) -> Self { Self::Internal(format!("json: {e}")) }
}
