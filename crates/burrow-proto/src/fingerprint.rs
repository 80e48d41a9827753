//! Host key fingerprints

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Fingerprint of a public key given its SSH wire encoding: the padded
/// standard base64 of its SHA-256 digest.
pub fn fingerprint(key_bytes: &[u8]) -> String {
    let digest = Sha256::digest(key_bytes);
    STANDARD.encode(digest)
}
