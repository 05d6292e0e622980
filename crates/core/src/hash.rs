//! Stable content hashing for specs and revisions.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{ReconcileError, Result};

/// Hash any serializable value into a short hex digest.
///
/// serde_json serializes struct fields in declaration order and `BTreeMap`
/// keys sorted, so equal values always hash equally. `serde_json::Value`
/// objects are sorted as well since the `preserve_order` feature is off.
pub fn compute_spec_hash<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value).map_err(|e| ReconcileError::Hash(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let mut out = hex::encode(hasher.finalize());
    out.truncate(16);
    Ok(out)
}
