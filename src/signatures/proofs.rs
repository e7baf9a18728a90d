//! Object Integrity Proofs (W3C Data Integrity, `eddsa-jcs-2022` cryptosuite)
//!
//! This is the signature scheme the engine prefers when present: unlike
//! HTTP Signatures, the proof survives relaying through forwarding actors
//! because it is embedded in the object itself rather than the transport.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

use crate::signatures::keys::{ed25519_signing_key_from_pem, ed25519_verifying_key_from_pem};

/// A `DataIntegrityProof` using the `eddsa-jcs-2022` cryptosuite, attached
/// to an object's `proof` field.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataIntegrityProof {
    #[serde(rename = "type")]
    kind: String,
    cryptosuite: String,
    created: DateTime<Utc>,
    verification_method: Url,
    proof_purpose: String,
    proof_value: String,
}

impl DataIntegrityProof {
    /// The verification method (a [`Multikey`](super::super::protocol::public_key::Multikey) id)
    /// that should be dereferenced to verify this proof.
    pub fn verification_method(&self) -> &Url {
        &self.verification_method
    }
}

/// Attach a Data Integrity proof to `object`. `object` must not already
/// contain a `proof` field; the returned value is `object` with `proof`
/// set.
pub fn sign_object(mut object: Value, verification_method: Url, private_key_pem: &str) -> anyhow::Result<Value> {
    let signing_key = ed25519_signing_key_from_pem(private_key_pem)?;
    let created = Utc::now();

    let proof_config = serde_json::json!({
        "type": "DataIntegrityProof",
        "cryptosuite": "eddsa-jcs-2022",
        "created": created.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        "verificationMethod": verification_method,
        "proofPurpose": "assertionMethod",
    });

    let object_hash = jcs_hash(&object)?;
    let config_hash = jcs_hash(&proof_config)?;
    let mut to_sign = config_hash.to_vec();
    to_sign.extend_from_slice(&object_hash);

    let signature = signing_key.sign(&to_sign);
    let proof_value = multibase::encode(multibase::Base::Base58Btc, signature.to_bytes());

    let proof = serde_json::json!({
        "type": "DataIntegrityProof",
        "cryptosuite": "eddsa-jcs-2022",
        "created": created.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        "verificationMethod": verification_method,
        "proofPurpose": "assertionMethod",
        "proofValue": proof_value,
    });

    object
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("object to sign must be a JSON object"))?
        .insert("proof".to_string(), proof);
    Ok(object)
}

/// True if `object` carries a `proof` field recognizable as a Data
/// Integrity proof (used by the inbox pipeline to decide whether to try
/// proof verification before HTTP Signature verification).
pub fn is_object_signed(object: &Value) -> bool {
    object.get("proof").and_then(Value::as_object).is_some()
}

/// Verify the `proof` embedded in `object` using the Ed25519 public key
/// `public_key_pem`, belonging to the verification method the proof names.
/// Returns the object with `proof` removed on success.
pub fn verify_object(mut object: Value, public_key_pem: &str) -> anyhow::Result<Value> {
    let proof_value = object
        .get("proof")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("object has no proof"))?;
    let proof: DataIntegrityProof = serde_json::from_value(proof_value.clone())?;

    let without_proof = object
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("object to verify must be a JSON object"))?;
    without_proof.remove("proof");

    let mut proof_config = proof_value;
    if let Some(map) = proof_config.as_object_mut() {
        map.remove("proofValue");
    }

    let object_hash = jcs_hash(&object)?;
    let config_hash = jcs_hash(&proof_config)?;
    let mut to_verify = config_hash.to_vec();
    to_verify.extend_from_slice(&object_hash);

    let (_, decoded) = multibase::decode(&proof.proof_value)?;
    let signature_bytes: [u8; 64] = decoded
        .try_into()
        .map_err(|_| anyhow::anyhow!("ed25519 signature has wrong length"))?;
    let signature = ed25519_dalek::Signature::from_bytes(&signature_bytes);

    let verifying_key = ed25519_verifying_key_from_pem(public_key_pem)?;
    verifying_key.verify(&to_verify, &signature)?;

    Ok(object)
}

fn jcs_hash(value: &Value) -> anyhow::Result<[u8; 32]> {
    let canonical = serde_jcs::to_string(value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signatures::keys::generate_ed25519_keypair;

    #[test]
    fn sign_then_verify_succeeds() {
        let keypair = generate_ed25519_keypair().unwrap();
        let method = Url::parse("https://example.com/users/alice#ed25519-key").unwrap();
        let object = serde_json::json!({"type": "Note", "content": "hi"});

        let signed = sign_object(object, method, &keypair.private_key).unwrap();
        assert!(is_object_signed(&signed));
        assert!(verify_object(signed, &keypair.public_key).is_ok());
    }

    #[test]
    fn tampered_document_fails_verification() {
        let keypair = generate_ed25519_keypair().unwrap();
        let method = Url::parse("https://example.com/users/alice#ed25519-key").unwrap();
        let object = serde_json::json!({"type": "Note", "content": "hi"});

        let mut signed = sign_object(object, method, &keypair.private_key).unwrap();
        signed["content"] = serde_json::json!("tampered");
        assert!(verify_object(signed, &keypair.public_key).is_err());
    }
}
