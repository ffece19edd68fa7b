//! Structural fingerprints
//!
//! SHA-256 digests over canonical text, hex-encoded. Used to key the
//! compilation cache (`source_hash`) and to detect registry drift
//! (`registry_hash`).

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of the given canonical text
pub fn fingerprint(text: &str) -> String {
    use std::fmt::Write as _;

    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
