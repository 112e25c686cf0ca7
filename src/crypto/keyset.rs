use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::CryptoError;

pub const KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Enabled,
    Disabled,
}

/// Serialized form. The whole document is base64-encoded JSON so it fits in
/// a single environment variable.
#[derive(Serialize, Deserialize)]
struct KeysetDocument {
    primary_key_id: u32,
    keys: Vec<KeyDocument>,
}

#[derive(Serialize, Deserialize)]
struct KeyDocument {
    key_id: u32,
    status: KeyStatus,
    created_at: DateTime<Utc>,
    material: String,
}

pub(crate) struct KeyMaterial {
    pub(crate) id: u32,
    pub(crate) status: KeyStatus,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) bytes: Zeroizing<[u8; KEY_LEN]>,
}

/// A set of AEAD keys with exactly one primary.
pub struct Keyset {
    primary_key_id: u32,
    keys: Vec<KeyMaterial>,
}

/// Metadata view of a keyset. Never carries key material.
#[derive(Debug, Clone, Serialize)]
pub struct KeysetInfo {
    pub primary_key_id: u32,
    pub keys: Vec<KeyInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyInfo {
    pub key_id: u32,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    pub primary: bool,
}

impl Keyset {
    /// Fresh keyset with a single enabled primary key.
    pub fn generate() -> Self {
        let mut keyset = Self {
            primary_key_id: 0,
            keys: Vec::new(),
        };
        keyset.rotate();
        keyset
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let raw = B64
            .decode(encoded.trim())
            .map_err(|_| CryptoError::KeysetUnavailable("keyset is not valid base64".into()))?;
        let doc: KeysetDocument = serde_json::from_slice(&raw)
            .map_err(|e| CryptoError::KeysetUnavailable(format!("keyset is malformed: {}", e)))?;

        let mut keys = Vec::with_capacity(doc.keys.len());
        for k in doc.keys {
            let material = Zeroizing::new(B64.decode(&k.material).map_err(|_| {
                CryptoError::KeysetUnavailable(format!("key {} material is not base64", k.key_id))
            })?);
            if material.len() != KEY_LEN {
                return Err(CryptoError::KeysetUnavailable(format!(
                    "key {} must be {} bytes, got {}",
                    k.key_id,
                    KEY_LEN,
                    material.len()
                )));
            }
            let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
            bytes.copy_from_slice(&material);
            keys.push(KeyMaterial {
                id: k.key_id,
                status: k.status,
                created_at: k.created_at,
                bytes,
            });
        }

        let keyset = Self {
            primary_key_id: doc.primary_key_id,
            keys,
        };
        match keyset.find(keyset.primary_key_id) {
            Some(k) if k.status == KeyStatus::Enabled => Ok(keyset),
            Some(_) => Err(CryptoError::KeysetUnavailable("primary key is disabled".into())),
            None => Err(CryptoError::KeysetUnavailable("primary key not present".into())),
        }
    }

    pub fn to_base64(&self) -> Result<String, CryptoError> {
        let doc = KeysetDocument {
            primary_key_id: self.primary_key_id,
            keys: self
                .keys
                .iter()
                .map(|k| KeyDocument {
                    key_id: k.id,
                    status: k.status,
                    created_at: k.created_at,
                    material: B64.encode(k.bytes.as_slice()),
                })
                .collect(),
        };
        let json = serde_json::to_vec(&doc)
            .map_err(|e| CryptoError::KeysetUnavailable(format!("serialize keyset: {}", e)))?;
        Ok(B64.encode(json))
    }

    /// Adds a new key and promotes it to primary. Older keys stay enabled so
    /// existing ciphertext keeps opening.
    pub fn rotate(&mut self) -> u32 {
        let id = self.add_key();
        self.primary_key_id = id;
        id
    }

    /// Adds an enabled, non-primary key.
    pub fn add_key(&mut self) -> u32 {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut bytes[..]);
        let id = self.next_key_id();
        self.keys.push(KeyMaterial {
            id,
            status: KeyStatus::Enabled,
            created_at: Utc::now(),
            bytes,
        });
        id
    }

    /// Disables every key except the primary and the `keep` most recent
    /// others. Returns how many keys were disabled.
    pub fn disable_old_keys(&mut self, keep: usize) -> usize {
        let primary = self.primary_key_id;
        let mut others: Vec<&mut KeyMaterial> = self
            .keys
            .iter_mut()
            .filter(|k| k.id != primary && k.status == KeyStatus::Enabled)
            .collect();
        others.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut disabled = 0;
        for key in others.into_iter().skip(keep) {
            key.status = KeyStatus::Disabled;
            disabled += 1;
        }
        disabled
    }

    pub fn info(&self) -> KeysetInfo {
        KeysetInfo {
            primary_key_id: self.primary_key_id,
            keys: self
                .keys
                .iter()
                .map(|k| KeyInfo {
                    key_id: k.id,
                    status: k.status,
                    created_at: k.created_at,
                    primary: k.id == self.primary_key_id,
                })
                .collect(),
        }
    }

    pub fn primary_key_id(&self) -> u32 {
        self.primary_key_id
    }

    pub(crate) fn primary(&self) -> Option<&KeyMaterial> {
        self.find(self.primary_key_id)
    }

    /// Enabled keys in the order decryption should try them: the primary
    /// first, then the rest newest to oldest.
    pub(crate) fn decryption_order(&self) -> Vec<&KeyMaterial> {
        let mut keys: Vec<&KeyMaterial> = self
            .keys
            .iter()
            .filter(|k| k.status == KeyStatus::Enabled)
            .collect();
        let primary = self.primary_key_id;
        keys.sort_by(|a, b| {
            (b.id == primary)
                .cmp(&(a.id == primary))
                .then(b.created_at.cmp(&a.created_at))
        });
        keys
    }

    fn find(&self, id: u32) -> Option<&KeyMaterial> {
        self.keys.iter().find(|k| k.id == id)
    }

    fn next_key_id(&self) -> u32 {
        loop {
            let candidate = OsRng.next_u32();
            if candidate != 0 && self.find(candidate).is_none() {
                return candidate;
            }
        }
    }
}

impl std::fmt::Debug for Keyset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyset")
            .field("primary_key_id", &self.primary_key_id)
            .field("keys", &self.keys.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keyset_survives_serialization() {
        let keyset = Keyset::generate();
        let encoded = keyset.to_base64().unwrap();
        let decoded = Keyset::from_base64(&encoded).unwrap();
        assert_eq!(decoded.primary_key_id(), keyset.primary_key_id());
        assert_eq!(decoded.info().keys.len(), 1);
    }

    #[test]
    fn rotate_promotes_new_primary_and_keeps_old_enabled() {
        let mut keyset = Keyset::generate();
        let first = keyset.primary_key_id();
        let second = keyset.rotate();
        assert_ne!(first, second);
        assert_eq!(keyset.primary_key_id(), second);

        let order: Vec<u32> = keyset.decryption_order().iter().map(|k| k.id).collect();
        assert_eq!(order[0], second, "primary must be tried first");
        assert!(order.contains(&first));
    }

    #[test]
    fn disable_old_keys_never_touches_primary() {
        let mut keyset = Keyset::generate();
        keyset.rotate();
        keyset.rotate();
        let disabled = keyset.disable_old_keys(0);
        assert_eq!(disabled, 2);
        let info = keyset.info();
        let primary = info.keys.iter().find(|k| k.primary).unwrap();
        assert_eq!(primary.status, KeyStatus::Enabled);
        assert_eq!(keyset.decryption_order().len(), 1);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            Keyset::from_base64("not base64!!"),
            Err(CryptoError::KeysetUnavailable(_))
        ));
        let bogus = B64.encode(br#"{"primary_key_id":7,"keys":[]}"#);
        assert!(matches!(
            Keyset::from_base64(&bogus),
            Err(CryptoError::KeysetUnavailable(_))
        ));
    }
}
