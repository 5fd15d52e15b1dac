//! Owner identity derivation for task partitioning.
//!
//! Every governor operation is scoped to an [`OwnerId`] — a stable, opaque
//! partition key derived from the backend credential the caller presented.
//! Deriving it here keeps "how the identity was established" (API key entry,
//! a future OAuth exchange, ...) decoupled from everything that consumes it:
//! downstream code only ever sees the resolved id, never the raw secret.

use sha2::{Digest, Sha256};
use std::fmt;

/// Opaque, stable identifier partitioning one user's tasks from another's.
///
/// Currently the hex SHA-256 of the backend credential. The digest is safe to
/// log and to use as a storage key; the credential itself is not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolve a raw backend credential into its owner identity.
pub fn resolve(credential: &str) -> OwnerId {
    OwnerId(hex_sha256(credential.trim()))
}

/// A caller whose credential has been validated and resolved for this
/// request. Passed explicitly into every tool handler — the daemon holds no
/// ambient "current credential" state.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub owner_id: OwnerId,
    pub credential: String,
}

impl AuthedUser {
    pub fn from_credential(credential: impl Into<String>) -> Self {
        let credential = credential.into();
        Self {
            owner_id: resolve(&credential),
            credential,
        }
    }
}

// ─── Hashing ─────────────────────────────────────────────────────────────────

fn hex_sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
