//! Signature verification port and the release key allowlist.

use std::collections::BTreeMap;

use base64::Engine;
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

/// Signature kind for Ed25519 release signatures.
pub const SIG_KIND_ED25519: &str = "sig.ed25519.v0";

pub(crate) const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Signature primitives the release verifier relies on.
pub trait CryptoPort: Send + Sync {
    /// Whether this port knows how to verify `sig_kind`.
    fn supports(&self, sig_kind: &str) -> bool;

    /// Verifies `signature` over `message`. Unsupported kinds and malformed
    /// keys or signatures verify as `false`.
    fn verify(&self, sig_kind: &str, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool;
}

/// Ed25519 (strict verification) via `ed25519-dalek`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Port;

impl CryptoPort for Ed25519Port {
    fn supports(&self, sig_kind: &str) -> bool {
        sig_kind == SIG_KIND_ED25519
    }

    fn verify(&self, sig_kind: &str, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        if !self.supports(sig_kind) {
            return false;
        }
        let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify_strict(message, &signature).is_ok()
    }
}

/// A release signing key the host trusts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedKey {
    pub sig_kind: String,
    pub public_key_b64: String,
}

impl AllowedKey {
    pub fn public_key_bytes(&self) -> Option<Vec<u8>> {
        B64.decode(&self.public_key_b64).ok()
    }
}

/// `keyId -> key` map of trusted release signers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyAllowlist {
    keys: BTreeMap<String, AllowedKey>,
}

impl KeyAllowlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key_id: &str, sig_kind: &str, public_key: &[u8]) {
        self.keys.insert(
            key_id.to_string(),
            AllowedKey {
                sig_kind: sig_kind.to_string(),
                public_key_b64: B64.encode(public_key),
            },
        );
    }

    pub fn get(&self, key_id: &str) -> Option<&AllowedKey> {
        self.keys.get(key_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
