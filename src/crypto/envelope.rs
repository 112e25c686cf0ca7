use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::RngCore;

use super::{CryptoError, Keyset};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Seals and opens field values with the process keyset.
///
/// Cloning is cheap; the keyset is shared and never mutated after startup.
#[derive(Clone, Debug)]
pub struct Envelope {
    keyset: Arc<Keyset>,
}

impl Envelope {
    pub fn new(keyset: Keyset) -> Self {
        Self {
            keyset: Arc::new(keyset),
        }
    }

    /// Loads the keyset from its base64 form. Failure here is fatal at startup.
    pub fn from_base64(encoded: Option<&str>) -> Result<Self, CryptoError> {
        let encoded = encoded
            .ok_or_else(|| CryptoError::KeysetUnavailable("OPENLANE_TINK_KEYSET is not set".into()))?;
        Ok(Self::new(Keyset::from_base64(encoded)?))
    }

    pub fn keyset(&self) -> &Keyset {
        &self.keyset
    }

    /// Encrypts with the primary key under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let key = self
            .keyset
            .primary()
            .ok_or_else(|| CryptoError::KeysetUnavailable("no primary key".into()))?;
        let cipher = Aes256Gcm::new_from_slice(key.bytes.as_slice())
            .map_err(|_| CryptoError::KeysetUnavailable("invalid key length".into()))?;

        let nonce_bytes = generate_nonce();
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError::CryptoFailure("encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(B64.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, CryptoError> {
        let raw = B64
            .decode(encoded)
            .map_err(|_| CryptoError::CryptoFailure("invalid base64"))?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::CryptoFailure("truncated payload"));
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce);

        for key in self.keyset.decryption_order() {
            let Ok(cipher) = Aes256Gcm::new_from_slice(key.bytes.as_slice()) else {
                continue;
            };
            if let Ok(plain) = cipher.decrypt(nonce, sealed) {
                return Ok(plain);
            }
        }
        Err(CryptoError::CryptoFailure("no key matched"))
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<String, CryptoError> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_str(&self, encoded: &str) -> Result<String, CryptoError> {
        let plain = self.decrypt(encoded)?;
        String::from_utf8(plain).map_err(|_| CryptoError::CryptoFailure("plaintext is not utf-8"))
    }

    /// Structural check used by the column migration: valid base64, long
    /// enough for nonce and tag, and opens under the current keyset.
    pub fn is_encrypted(&self, value: &str) -> bool {
        self.decrypt(value).is_ok()
    }
}

fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope::new(Keyset::generate())
    }

    #[test]
    fn test_encryption_roundtrip() {
        let env = envelope();
        for plaintext in ["", "sk_live_123456789", "ünïcødé ✓"] {
            let sealed = env.encrypt_str(plaintext).unwrap();
            assert_eq!(env.decrypt_str(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn same_plaintext_yields_distinct_ciphertexts() {
        let env = envelope();
        let a = env.encrypt_str("same").unwrap();
        let b = env.encrypt_str("same").unwrap();
        assert_ne!(a, b, "nonces must differ between encryptions");
    }

    #[test]
    fn every_bit_flip_is_rejected() {
        let env = envelope();
        let sealed = env.encrypt_str("tolp_abc").unwrap();
        let raw = B64.decode(&sealed).unwrap();

        for byte in 0..raw.len() {
            for bit in 0..8 {
                let mut mutated = raw.clone();
                mutated[byte] ^= 1 << bit;
                let err = env.decrypt(&B64.encode(&mutated)).unwrap_err();
                assert!(matches!(err, CryptoError::CryptoFailure(_)));
            }
        }
    }

    #[test]
    fn rejects_bad_base64_and_short_payloads() {
        let env = envelope();
        assert!(matches!(
            env.decrypt("%%%"),
            Err(CryptoError::CryptoFailure("invalid base64"))
        ));
        assert!(matches!(
            env.decrypt(&B64.encode([0u8; 20])),
            Err(CryptoError::CryptoFailure("truncated payload"))
        ));
    }

    #[test]
    fn old_ciphertext_opens_after_rotation() {
        let mut keyset = Keyset::generate();
        let before = Envelope::new(Keyset::from_base64(&keyset.to_base64().unwrap()).unwrap());
        let sealed = before.encrypt_str("legacy").unwrap();

        keyset.rotate();
        let after = Envelope::new(keyset);
        assert_eq!(after.decrypt_str(&sealed).unwrap(), "legacy");
    }

    #[test]
    fn foreign_keyset_cannot_open() {
        let sealed = envelope().encrypt_str("secret").unwrap();
        let err = envelope().decrypt(&sealed).unwrap_err();
        assert!(matches!(err, CryptoError::CryptoFailure("no key matched")));
        assert!(!envelope().is_encrypted(&sealed));
    }

    #[test]
    fn missing_keyset_is_unavailable() {
        assert!(matches!(
            Envelope::from_base64(None),
            Err(CryptoError::KeysetUnavailable(_))
        ));
    }
}
