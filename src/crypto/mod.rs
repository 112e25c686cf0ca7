//! Field-level encryption for secrets at rest.
//!
//! Values are sealed with AES-256-GCM under the primary key of a [`Keyset`]
//! and stored as `base64(nonce || ciphertext || tag)`. Key ids live in the
//! keyset, never in the ciphertext, so opening a value means trying each
//! enabled key until one authenticates.

pub mod envelope;
pub mod keyset;
pub mod migration;

pub use envelope::Envelope;
pub use keyset::{KeyStatus, Keyset, KeysetInfo};

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Ciphertext could not be opened. The reason is a fixed string so the
    /// error can be logged without leaking input.
    #[error("crypto failure: {0}")]
    CryptoFailure(&'static str),

    #[error("keyset unavailable: {0}")]
    KeysetUnavailable(String),
}

/// Short, non-reversible identifier for a secret, safe to log.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex::encode(&digest[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = fingerprint("tolp_secret");
        assert_eq!(a.len(), 12);
        assert_eq!(a, fingerprint("tolp_secret"));
        assert_ne!(a, fingerprint("tolp_other"));
    }
}
