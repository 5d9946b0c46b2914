//! Public keys, content-derived key identifiers, and the signer seam.
//!
//! Keys are opaque to the rest of the engine: authorization only compares key
//! ids, and the verification capability lives here. Ed25519 is the only
//! scheme with a built-in verifier; other key types can be listed in policy
//! but their signatures never validate.

use std::fmt;

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PolicyError, Result};

/// Key type for Ed25519 keys.
pub const KEY_TYPE_ED25519: &str = "ed25519";
/// Signature scheme for Ed25519 keys.
pub const SCHEME_ED25519: &str = "ed25519";
/// Key type (and scheme) for OpenPGP keys, which are representable but not verifiable here.
pub const KEY_TYPE_GPG: &str = "gpg";

/// A public key trusted by some role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    #[serde(rename = "keyid")]
    pub key_id: String,
    #[serde(rename = "keytype")]
    pub key_type: String,
    pub scheme: String,
    #[serde(rename = "keyval", with = "public_material")]
    pub public_material: Vec<u8>,
}

/// Identity portion hashed into the key id. Field order is part of the id.
#[derive(Serialize)]
struct KeyIdentity<'a> {
    keytype: &'a str,
    scheme: &'a str,
    keyval: KeyVal,
}

#[derive(Serialize, Deserialize)]
struct KeyVal {
    public: String,
}

impl Key {
    /// Builds a key and derives its id from the type, scheme and public material.
    pub fn new(key_type: &str, scheme: &str, public_material: Vec<u8>) -> Result<Self> {
        let key_id = derive_key_id(key_type, scheme, &public_material)?;
        Ok(Self {
            key_id,
            key_type: key_type.to_string(),
            scheme: scheme.to_string(),
            public_material,
        })
    }

    /// Wraps an Ed25519 verifying key.
    pub fn from_ed25519(verifying_key: &VerifyingKey) -> Result<Self> {
        Self::new(
            KEY_TYPE_ED25519,
            SCHEME_ED25519,
            verifying_key.to_bytes().to_vec(),
        )
    }

    /// Returns `true` when `signature` is a valid signature over `message`.
    ///
    /// Malformed material and unsupported schemes yield `false` instead of an
    /// error so envelope verification can skip them.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match self.key_type.as_str() {
            KEY_TYPE_ED25519 => verify_ed25519(&self.public_material, message, signature),
            other => {
                tracing::trace!(key_id = %self.key_id, key_type = other, "no verifier for key type");
                false
            }
        }
    }

    /// Checks that the stored id matches the key material.
    pub fn has_consistent_id(&self) -> bool {
        derive_key_id(&self.key_type, &self.scheme, &self.public_material)
            .map(|derived| derived == self.key_id)
            .unwrap_or(false)
    }
}

fn verify_ed25519(public: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(bytes) = <[u8; 32]>::try_from(public) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(message, &signature).is_ok()
}

/// Derives the content-based key id: hex SHA-256 of the serialized key identity.
fn derive_key_id(key_type: &str, scheme: &str, public_material: &[u8]) -> Result<String> {
    let identity = KeyIdentity {
        keytype: key_type,
        scheme,
        keyval: KeyVal {
            public: hex_encode(public_material),
        },
    };
    let bytes = serde_json::to_vec(&identity)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex_encode(hasher.finalize()))
}

/// Something able to produce signatures attributable to a [`Key`].
pub trait Signer: Send + Sync {
    /// Public half of the signing identity.
    fn public_key(&self) -> &Key;

    /// Signs `message`, returning the raw signature bytes.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;

    fn key_id(&self) -> &str {
        &self.public_key().key_id
    }
}

/// In-process Ed25519 signer.
pub struct Ed25519Signer {
    signing_key: SigningKey,
    public: Key,
}

impl Ed25519Signer {
    /// Builds a signer from a 32-byte secret seed.
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self> {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Result<Self> {
        let public = Key::from_ed25519(&signing_key.verifying_key())?;
        Ok(Self {
            signing_key,
            public,
        })
    }
}

impl fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("key_id", &self.public.key_id)
            .finish_non_exhaustive()
    }
}

impl Signer for Ed25519Signer {
    fn public_key(&self) -> &Key {
        &self.public
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let signature = self
            .signing_key
            .try_sign(message)
            .map_err(|err| PolicyError::Signing(err.to_string()))?;
        Ok(signature.to_bytes().to_vec())
    }
}

/// Serializes key material as `{"public": "<hex>"}`.
mod public_material {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::KeyVal;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        KeyVal {
            public: hex::encode(bytes),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let keyval = KeyVal::deserialize(deserializer)?;
        hex::decode(keyval.public).map_err(serde::de::Error::custom)
    }
}
