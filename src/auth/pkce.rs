//! PKCE S256 verification (RFC 7636 section 4.6).
//!
//! Only the `S256` method is supported; `plain` is rejected at the
//! authorization endpoint before a code is ever issued.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};

pub const METHOD_S256: &str = "S256";

/// Computes `base64url(SHA-256(verifier))` without padding.
pub fn challenge_for(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Returns true when `verifier` hashes to `challenge`.
pub fn verify(verifier: &str, challenge: &str) -> bool {
    !challenge.is_empty() && challenge_for(verifier) == challenge
}
