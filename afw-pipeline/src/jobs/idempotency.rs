//! Idempotency key derivation

use sha2::{Digest, Sha256};

use crate::models::StageParams;

/// ASCII unit separator between digest fields
const FIELD_SEPARATOR: u8 = 0x1F;

/// Deterministic digest of `(artifact_id, stage, params)`
///
/// Hex SHA-256 over the fields joined by a unit separator, with params in
/// their canonical JSON form. Logically equal params always produce the same
/// key regardless of the order their keys were inserted.
pub fn idempotency_key(artifact_id: &str, stage: &str, params: &StageParams) -> String {
    let mut hasher = Sha256::new();
    hasher.update(artifact_id.as_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(stage.as_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(params.canonical_json().as_bytes());
    format!("{:x}", hasher.finalize())
}
