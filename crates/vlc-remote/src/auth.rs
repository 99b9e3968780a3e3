//! Challenge/response helpers.
//!
//! The player shows a short code on screen and hands out a random challenge
//! over HTTP. Possession of the code is proven by sending
//! `hex(sha256(code || challenge))` instead of the code itself.

use sha2::{Digest, Sha256};

/// Compute the digest presented to `/verify-code`.
pub fn challenge_digest(code: &str, challenge: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.trim().as_bytes());
    hasher.update(challenge.as_bytes());
    hex::encode(hasher.finalize())
}
