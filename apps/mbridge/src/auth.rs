// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Password hashing.
//!
//! Current scheme: SHA-256 over an 8-byte random salt plus the password,
//! re-hashed for 1000 iterations, serialized as `base64(salt ‖ hash)`.
//! Stored values carrying the literal `SALT_` prefix predate the SHA-256
//! scheme and verify through the legacy SHA-1 path.

use base64::Engine;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256};

const SALT_LENGTH: usize = 8;
const ITERATIONS: usize = 1000;
const LEGACY_PREFIX: &str = "SALT_";

fn iterated_digest<D: Digest>(salt: &[u8], password: &[u8]) -> Vec<u8> {
    let mut hasher = D::new();
    hasher.update(salt);
    hasher.update(password);
    let mut hash = hasher.finalize().to_vec();
    for _ in 1..ITERATIONS {
        hash = D::digest(&hash).to_vec();
    }
    hash
}

/// Hashes a password with a fresh random salt.
#[must_use]
pub fn hash_password(password: &str) -> String {
    let mut salt = [0_u8; SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);

    let hash = iterated_digest::<Sha256>(&salt, password.as_bytes());
    let mut combined = salt.to_vec();
    combined.extend_from_slice(&hash);
    base64::engine::general_purpose::STANDARD.encode(combined)
}

/// Verifies a password against a stored hash, routing `SALT_`-prefixed
/// values through the legacy SHA-1 scheme.
#[must_use]
pub fn verify_password(password: &str, stored: &str) -> bool {
    match stored.strip_prefix(LEGACY_PREFIX) {
        Some(legacy) => verify_with::<Sha1>(password, legacy),
        None => verify_with::<Sha256>(password, stored),
    }
}

fn verify_with<D: Digest>(password: &str, encoded: &str) -> bool {
    let Ok(combined) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    if combined.len() <= SALT_LENGTH {
        return false;
    }
    let (salt, expected) = combined.split_at(SALT_LENGTH);
    iterated_digest::<D>(salt, password.as_bytes()) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify_round_trip() {
        let stored = hash_password("s3cret!");
        assert!(verify_password("s3cret!", &stored));
        assert!(!verify_password("wrong", &stored));
    }

    #[test]
    fn test_salts_are_random() {
        assert_ne!(hash_password("same"), hash_password("same"));
    }

    #[test]
    fn test_legacy_sha1_path() {
        // Build a legacy-format value by hand: SALT_ + base64(salt ‖ sha1^1000).
        let salt = [1_u8, 2, 3, 4, 5, 6, 7, 8];
        let hash = iterated_digest::<Sha1>(&salt, b"old-password");
        let mut combined = salt.to_vec();
        combined.extend_from_slice(&hash);
        let stored =
            format!("SALT_{}", base64::engine::general_purpose::STANDARD.encode(combined));

        assert!(verify_password("old-password", &stored));
        assert!(!verify_password("new-password", &stored));
    }

    #[test]
    fn test_garbage_input_is_rejected() {
        assert!(!verify_password("anything", "not-base64!!!"));
        assert!(!verify_password("anything", ""));
    }
}
