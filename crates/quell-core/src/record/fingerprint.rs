//! Definition fingerprinting.

use sha2::{Digest, Sha256};

/// Computes the 64-bit fingerprint of a definition payload.
///
/// SHA-256 truncated to the leading 8 bytes, big-endian. Fingerprints are a
/// duplicate pre-check only; equality is confirmed by the template comparator
/// before a conflict is raised.
#[must_use]
pub fn definition_fingerprint(payload: &[u8]) -> u64 {
    let digest = Sha256::digest(payload);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}
