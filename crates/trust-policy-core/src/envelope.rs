//! DSSE-style envelopes binding metadata payloads to detached signatures.
//!
//! Signatures cover the pre-authentication encoding (PAE) of the payload
//! type and payload, never the envelope itself, so signatures from unknown or
//! untrusted keys can ride along without affecting verification. They are
//! kept verbatim to allow late co-signing.

use std::collections::BTreeSet;

use data_encoding::BASE64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::key::{Key, Signer};

/// Payload type recorded in every policy envelope.
pub const PAYLOAD_TYPE: &str = "application/vnd.gittuf+json";

/// Authenticated container for a serialized metadata document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub payload_type: String,
    /// Base64-encoded payload bytes.
    pub payload: String,
    pub signatures: Vec<EnvelopeSignature>,
}

/// A detached signature attributed to a key id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeSignature {
    pub keyid: String,
    /// Base64-encoded signature bytes.
    pub sig: String,
}

impl Envelope {
    pub fn decode_payload(&self) -> Result<Vec<u8>> {
        Ok(BASE64.decode(self.payload.as_bytes())?)
    }

    /// Deserializes the payload into a metadata document.
    pub fn metadata<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = self.decode_payload()?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Key ids that attached a signature, valid or not.
    pub fn signer_key_ids(&self) -> BTreeSet<&str> {
        self.signatures
            .iter()
            .map(|signature| signature.keyid.as_str())
            .collect()
    }
}

/// Serializes `metadata` into a fresh, unsigned envelope.
///
/// Metadata types use fixed field order and ordered maps, so the payload is
/// byte-for-byte reproducible.
pub fn create_envelope<T: Serialize>(metadata: &T) -> Result<Envelope> {
    let payload = serde_json::to_vec(metadata)?;
    Ok(Envelope {
        payload_type: PAYLOAD_TYPE.to_string(),
        payload: BASE64.encode(&payload),
        signatures: Vec::new(),
    })
}

/// Adds the signer's signature, replacing an earlier one from the same key.
pub fn sign_envelope(mut envelope: Envelope, signer: &dyn Signer) -> Result<Envelope> {
    let payload = envelope.decode_payload()?;
    let signature = signer.sign(&pae(&envelope.payload_type, &payload))?;
    let entry = EnvelopeSignature {
        keyid: signer.key_id().to_string(),
        sig: BASE64.encode(&signature),
    };
    match envelope
        .signatures
        .iter_mut()
        .find(|existing| existing.keyid == entry.keyid)
    {
        Some(existing) => *existing = entry,
        None => envelope.signatures.push(entry),
    }
    Ok(envelope)
}

/// Returns `true` when at least `threshold` distinct authorized keys produced valid signatures.
pub fn verify_envelope(envelope: &Envelope, authorized_keys: &[Key], threshold: usize) -> bool {
    count_valid_signatures(envelope, authorized_keys) >= threshold
}

/// Counts distinct authorized keys with a valid signature on the envelope.
pub fn count_valid_signatures(envelope: &Envelope, authorized_keys: &[Key]) -> usize {
    let Ok(payload) = envelope.decode_payload() else {
        return 0;
    };
    let message = pae(&envelope.payload_type, &payload);
    let mut verified: BTreeSet<&str> = BTreeSet::new();
    for signature in &envelope.signatures {
        if verified.contains(signature.keyid.as_str()) {
            continue;
        }
        let Some(key) = authorized_keys
            .iter()
            .find(|key| key.key_id == signature.keyid)
        else {
            continue;
        };
        let Ok(sig_bytes) = BASE64.decode(signature.sig.as_bytes()) else {
            continue;
        };
        if key.verify(&message, &sig_bytes) {
            verified.insert(key.key_id.as_str());
        }
    }
    verified.len()
}

/// DSSE pre-authentication encoding.
pub fn pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let header = format!(
        "DSSEv1 {} {} {} ",
        payload_type.len(),
        payload_type,
        payload.len()
    );
    let mut out = Vec::with_capacity(header.len() + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::key::Ed25519Signer;
    use crate::metadata::{initialize_root, RootMetadata};

    fn signer(seed: u8) -> Ed25519Signer {
        Ed25519Signer::from_seed(&[seed; 32]).unwrap()
    }

    fn root_envelope() -> Envelope {
        create_envelope(&initialize_root(signer(1).public_key())).unwrap()
    }

    #[test]
    fn pae_matches_the_dsse_layout() {
        assert_eq!(pae("t", b"abc"), b"DSSEv1 1 t 3 abc".to_vec());
    }

    #[test]
    fn created_envelopes_are_unsigned_and_decodable() {
        let root = initialize_root(signer(1).public_key());
        let envelope = create_envelope(&root).unwrap();
        assert!(envelope.signatures.is_empty());
        assert_eq!(envelope.payload_type, PAYLOAD_TYPE);
        let decoded: RootMetadata = envelope.metadata().unwrap();
        assert_eq!(decoded, root);
        assert_eq!(create_envelope(&root).unwrap(), envelope);
    }

    #[test]
    fn signing_twice_with_the_same_key_is_idempotent() {
        let a = signer(1);
        let once = sign_envelope(root_envelope(), &a).unwrap();
        let twice = sign_envelope(once.clone(), &a).unwrap();
        assert_eq!(twice.signatures.len(), 1);
        assert_eq!(
            count_valid_signatures(&twice, &[a.public_key().clone()]),
            count_valid_signatures(&once, &[a.public_key().clone()])
        );
    }

    #[test]
    fn thresholds_count_distinct_authorized_keys() {
        let a = signer(1);
        let b = signer(2);
        let keys = vec![a.public_key().clone(), b.public_key().clone()];
        let envelope = sign_envelope(root_envelope(), &a).unwrap();
        assert!(verify_envelope(&envelope, &keys, 1));
        assert!(!verify_envelope(&envelope, &keys, 2));
        let envelope = sign_envelope(envelope, &b).unwrap();
        assert!(verify_envelope(&envelope, &keys, 2));
    }

    #[test]
    fn outsider_signatures_are_kept_but_never_counted() {
        let a = signer(1);
        let outsider = signer(9);
        let keys = vec![a.public_key().clone()];
        let envelope = sign_envelope(root_envelope(), &outsider).unwrap();
        assert_eq!(envelope.signatures.len(), 1);
        assert!(!verify_envelope(&envelope, &keys, 1));
        let envelope = sign_envelope(envelope, &a).unwrap();
        assert_eq!(envelope.signatures.len(), 2);
        assert!(verify_envelope(&envelope, &keys, 1));
    }

    #[test]
    fn forged_signatures_are_ignored() {
        let a = signer(1);
        let keys = vec![a.public_key().clone()];
        let mut envelope = sign_envelope(root_envelope(), &a).unwrap();
        envelope.signatures[0].sig = BASE64.encode(&[0u8; 64]);
        assert!(!verify_envelope(&envelope, &keys, 1));
        envelope.signatures[0].sig = "not base64!".into();
        assert_eq!(count_valid_signatures(&envelope, &keys), 0);
    }

    #[test]
    fn payload_tampering_invalidates_signatures() {
        let a = signer(1);
        let keys = vec![a.public_key().clone()];
        let mut envelope = sign_envelope(root_envelope(), &a).unwrap();
        let other = create_envelope(&initialize_root(signer(2).public_key())).unwrap();
        envelope.payload = other.payload;
        assert!(!verify_envelope(&envelope, &keys, 1));
    }

    proptest! {
        #[test]
        fn verdict_ignores_non_member_signatures(
            members in 1u8..5,
            outsiders in 0u8..4,
            threshold in 1usize..6,
        ) {
            let member_signers: Vec<_> = (1..=members).map(signer).collect();
            let keys: Vec<Key> = member_signers.iter().map(|s| s.public_key().clone()).collect();
            let mut envelope = root_envelope();
            for member in &member_signers {
                envelope = sign_envelope(envelope, member).unwrap();
            }
            let verdict = verify_envelope(&envelope, &keys, threshold);
            prop_assert_eq!(verdict, members as usize >= threshold);
            for seed in 0..outsiders {
                envelope = sign_envelope(envelope, &signer(100 + seed)).unwrap();
            }
            prop_assert_eq!(verify_envelope(&envelope, &keys, threshold), verdict);
        }
    }
}
