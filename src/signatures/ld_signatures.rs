//! Linked Data Signatures (`RsaSignature2017`), the legacy signature scheme
//! still emitted and checked for Mastodon compatibility.
//!
//! Unlike HTTP Signatures, the signature here is detached and embedded in
//! the JSON document itself as a `signature` field, so it survives being
//! relayed through intermediaries that don't preserve transport headers.

use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rsa::pkcs1v15::{SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, Verifier as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

use crate::signatures::keys::{rsa_private_key_from_pem, rsa_public_key_from_pem};

/// Embedded `RsaSignature2017` signature, attached to a document's
/// `signature` field.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedDataSignature {
    #[serde(rename = "type")]
    kind: String,
    creator: Url,
    created: DateTime<Utc>,
    signature_value: String,
}

/// Sign `object` (a JSON document without its `signature` field) with
/// `private_key_pem`, attributed to `creator`. Returns the populated
/// [`LinkedDataSignature`]; the caller attaches it to the document.
pub fn sign_object(object: &Value, creator: Url, private_key_pem: &str) -> anyhow::Result<LinkedDataSignature> {
    let created = Utc::now();
    let options_hash = hash_signature_options(&creator, created)?;
    let document_hash = hash_canonical(object)?;

    let mut to_sign = options_hash;
    to_sign.extend_from_slice(&document_hash);

    let private_key = rsa_private_key_from_pem(private_key_pem)?;
    let signing_key = SigningKey::<Sha256>::new(private_key);
    let signature = signing_key.sign_with_rng(&mut rand::thread_rng(), &to_sign);

    Ok(LinkedDataSignature {
        kind: "RsaSignature2017".to_string(),
        creator,
        created,
        signature_value: Base64.encode(signature.to_vec()),
    })
}

/// Verify `signature` over `object` (the same document, with the
/// `signature` field removed) using `public_key_pem`.
pub fn verify_object(object: &Value, signature: &LinkedDataSignature, public_key_pem: &str) -> anyhow::Result<bool> {
    let options_hash = hash_signature_options(&signature.creator, signature.created)?;
    let document_hash = hash_canonical(object)?;

    let mut to_verify = options_hash;
    to_verify.extend_from_slice(&document_hash);

    let public_key = rsa_public_key_from_pem(public_key_pem)?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let raw_signature = Base64.decode(&signature.signature_value)?;
    let parsed = rsa::pkcs1v15::Signature::try_from(raw_signature.as_slice())?;

    Ok(verifying_key.verify(&to_verify, &parsed).is_ok())
}

fn hash_signature_options(creator: &Url, created: DateTime<Utc>) -> anyhow::Result<[u8; 32]> {
    let options = serde_json::json!({
        "creator": creator,
        "created": created.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    });
    hash_canonical(&options)
}

fn hash_canonical(value: &Value) -> anyhow::Result<[u8; 32]> {
    let canonical = serde_jcs::to_string(value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signatures::keys::generate_rsa_keypair;

    #[test]
    fn sign_then_verify_succeeds() {
        let keypair = generate_rsa_keypair().unwrap();
        let creator = Url::parse("https://example.com/users/alice#main-key").unwrap();
        let object = serde_json::json!({"type": "Note", "content": "hi"});

        let signature = sign_object(&object, creator, &keypair.private_key).unwrap();
        assert!(verify_object(&object, &signature, &keypair.public_key).unwrap());
    }

    #[test]
    fn tampered_document_fails_verification() {
        let keypair = generate_rsa_keypair().unwrap();
        let creator = Url::parse("https://example.com/users/alice#main-key").unwrap();
        let object = serde_json::json!({"type": "Note", "content": "hi"});

        let signature = sign_object(&object, creator, &keypair.private_key).unwrap();
        let tampered = serde_json::json!({"type": "Note", "content": "tampered"});
        assert!(!verify_object(&tampered, &signature, &keypair.public_key).unwrap());
    }
}
