//! Cryptographic signing and verification: HTTP Signatures, Linked Data
//! Signatures, Object Integrity Proofs, and the key pairs behind them.

pub mod http_signatures;
pub mod keys;
pub mod ld_signatures;
pub mod proofs;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::protocol::public_key::{main_key_id, numbered_key_id, CryptographicKey, Multikey};

/// A full key pair for one actor: an optional RSA pair for HTTP Signatures
/// and an optional Ed25519 pair for Object Integrity Proofs, plus their
/// federated wire representations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActorKeyPair {
    /// RSA key material and its `CryptographicKey` wire form, if present
    pub rsa: Option<RsaKeyMaterial>,
    /// Ed25519 key material and its `Multikey` wire form, if present
    pub ed25519: Option<Ed25519KeyMaterial>,
}

/// RSA key material paired with its federated `CryptographicKey` form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RsaKeyMaterial {
    /// PKCS#8 PEM private key
    pub private_key_pem: String,
    /// SPKI PEM public key
    pub public_key_pem: String,
    /// Federated `publicKey` wire form
    pub cryptographic_key: CryptographicKey,
}

/// Ed25519 key material paired with its federated `Multikey` form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ed25519KeyMaterial {
    /// PKCS#8 PEM private key
    pub private_key_pem: String,
    /// SPKI PEM public key
    pub public_key_pem: String,
    /// Federated `assertionMethod` wire form
    pub multikey: Multikey,
}

/// Assign key ids (`#main-key`, `#key-2`, ...) to a sequence of generated
/// RSA/Ed25519 key pairs for `actor_id`, producing their federated wire
/// forms. The first pair in the list gets `#main-key` regardless of kind;
/// callers that want `#main-key` to be the RSA pair should put it first.
pub fn assign_key_ids(
    actor_id: &Url,
    rsa_keys: Vec<keys::RsaKeypair>,
    ed25519_keys: Vec<keys::Ed25519Keypair>,
) -> (Vec<RsaKeyMaterial>, Vec<Ed25519KeyMaterial>) {
    let mut next_index = 2;
    let mut main_key_assigned = false;
    let mut next_id = |actor_id: &Url, next_index: &mut usize| {
        if !main_key_assigned {
            main_key_assigned = true;
            main_key_id(actor_id)
        } else {
            let id = numbered_key_id(actor_id, *next_index);
            *next_index += 1;
            id
        }
    };

    let mut rsa_out = Vec::with_capacity(rsa_keys.len());
    for pair in rsa_keys {
        let id = next_id(actor_id, &mut next_index);
        rsa_out.push(RsaKeyMaterial {
            cryptographic_key: CryptographicKey::new(id, actor_id.clone(), pair.public_key.clone()),
            private_key_pem: pair.private_key,
            public_key_pem: pair.public_key,
        });
    }

    let mut ed_out = Vec::with_capacity(ed25519_keys.len());
    for pair in ed25519_keys {
        let id = next_id(actor_id, &mut next_index);
        let raw = keys::ed25519_verifying_key_from_pem(&pair.public_key)
            .map(|key| key.to_bytes())
            .unwrap_or([0u8; 32]);
        let multibase = crate::protocol::public_key::encode_multikey(&raw);
        ed_out.push(Ed25519KeyMaterial {
            multikey: Multikey::new(id, actor_id.clone(), multibase),
            private_key_pem: pair.private_key,
            public_key_pem: pair.public_key,
        });
    }

    (rsa_out, ed_out)
}
