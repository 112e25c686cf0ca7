//! Opaque bearer tokens (personal access tokens and API tokens).
//!
//! Only a SHA-256 hash and an envelope-encrypted copy are stored. Lookup is
//! by hash; the encrypted copy is opened and compared in constant time
//! before the row is trusted.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::crypto::{CryptoError, Envelope};

pub const PAT_PREFIX: &str = "tolp_";
pub const API_TOKEN_PREFIX: &str = "tola_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenShape {
    PersonalAccessToken,
    ApiToken,
    /// Not prefixed. May be a JWT or a legacy opaque token.
    Unknown,
}

pub fn classify(token: &str) -> TokenShape {
    if token.starts_with(PAT_PREFIX) {
        TokenShape::PersonalAccessToken
    } else if token.starts_with(API_TOKEN_PREFIX) {
        TokenShape::ApiToken
    } else {
        TokenShape::Unknown
    }
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// A freshly minted token. `plaintext` is shown to the caller once.
pub struct IssuedToken {
    pub plaintext: String,
    pub token_hash: String,
    pub encrypted_token: String,
}

pub fn issue(prefix: &str, envelope: &Envelope) -> Result<IssuedToken, CryptoError> {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let plaintext = format!("{}{}", prefix, URL_SAFE_NO_PAD.encode(bytes));
    Ok(IssuedToken {
        token_hash: hash_token(&plaintext),
        encrypted_token: envelope.encrypt_str(&plaintext)?,
        plaintext,
    })
}

/// Opens the stored copy and compares it to the presented token.
pub fn confirm(presented: &str, encrypted_token: &str, envelope: &Envelope) -> Result<bool, CryptoError> {
    let stored = envelope.decrypt_str(encrypted_token)?;
    Ok(bool::from(stored.as_bytes().ct_eq(presented.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keyset;

    #[test]
    fn issued_tokens_are_prefixed_and_confirmable() {
        let envelope = Envelope::new(Keyset::generate());
        let token = issue(PAT_PREFIX, &envelope).unwrap();
        assert_eq!(classify(&token.plaintext), TokenShape::PersonalAccessToken);
        assert_eq!(token.token_hash, hash_token(&token.plaintext));
        assert!(confirm(&token.plaintext, &token.encrypted_token, &envelope).unwrap());
        assert!(!confirm("tolp_other", &token.encrypted_token, &envelope).unwrap());
    }

    #[test]
    fn tampered_copy_fails_closed() {
        let envelope = Envelope::new(Keyset::generate());
        let token = issue(API_TOKEN_PREFIX, &envelope).unwrap();
        let mut tampered = token.encrypted_token.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'A' { 'B' } else { 'A' });
        assert!(confirm(&token.plaintext, &tampered, &envelope).is_err());
    }

    #[test]
    fn classification() {
        assert_eq!(classify("tola_abc"), TokenShape::ApiToken);
        assert_eq!(classify("eyJhbGciOi.x.y"), TokenShape::Unknown);
    }
}
