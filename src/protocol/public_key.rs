//! Wire types for federating actor cryptographic material
//!
//! [`CryptographicKey`] is the legacy `security/v1` key used for HTTP
//! Signatures; [`Multikey`] is the `data-integrity` verification method used
//! for Object Integrity Proofs. Both are carried on the actor document so
//! that remote servers can dereference them without a separate fetch.

use serde::{Deserialize, Serialize};
use url::Url;

/// Public key of an actor, federated in its `publicKey` field and used to
/// verify HTTP Signatures.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptographicKey {
    /// Id of this key, e.g. `{actor_id}#main-key`
    pub id: Url,
    /// Id of the actor this key belongs to
    pub owner: Url,
    /// PEM-encoded SPKI public key
    pub public_key_pem: String,
}

impl CryptographicKey {
    /// Build a `CryptographicKey` for `owner` using the conventional
    /// `#main-key` / `#key-N` id scheme.
    pub fn new(id: Url, owner: Url, public_key_pem: String) -> Self {
        CryptographicKey {
            id,
            owner,
            public_key_pem,
        }
    }
}

/// A `data-integrity` Multikey verification method, federated in an actor's
/// `assertionMethod` field and used to verify Object Integrity Proofs.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Multikey {
    /// Id of this verification method
    pub id: Url,
    /// `Multikey`
    #[serde(rename = "type")]
    pub kind: String,
    /// Id of the actor this key belongs to
    pub controller: Url,
    /// Multibase-encoded Ed25519 public key, prefixed with the
    /// `ed25519-pub` multicodec
    pub public_key_multibase: String,
}

impl Multikey {
    /// Build a `Multikey` verification method for `controller`.
    pub fn new(id: Url, controller: Url, public_key_multibase: String) -> Self {
        Multikey {
            id,
            kind: "Multikey".to_string(),
            controller,
            public_key_multibase,
        }
    }
}

/// Encode a raw Ed25519 public key as a `did:key`-style multibase string
/// (base58btc, `ed25519-pub` multicodec prefix `0xed01`).
pub fn encode_multikey(raw_public_key: &[u8; 32]) -> String {
    let mut prefixed = Vec::with_capacity(2 + raw_public_key.len());
    prefixed.extend_from_slice(&[0xed, 0x01]);
    prefixed.extend_from_slice(raw_public_key);
    multibase::encode(multibase::Base::Base58Btc, prefixed)
}

/// Decode a multibase Ed25519 public key produced by [`encode_multikey`].
pub fn decode_multikey(encoded: &str) -> anyhow::Result<[u8; 32]> {
    let (_, bytes) = multibase::decode(encoded)?;
    let key_bytes = bytes
        .strip_prefix(&[0xed, 0x01])
        .ok_or_else(|| anyhow::anyhow!("unsupported multikey prefix"))?;
    key_bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("ed25519 multikey has wrong length"))
}

/// Recover the SPKI PEM form of a [`Multikey`]'s public key, for handing to
/// [`crate::signatures::proofs::verify_object`].
pub fn multikey_to_public_key_pem(multikey: &Multikey) -> anyhow::Result<String> {
    use ed25519_dalek::pkcs8::EncodePublicKey;
    use pkcs8::LineEnding;

    let raw = decode_multikey(&multikey.public_key_multibase)?;
    let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&raw)?;
    Ok(verifying_key.to_public_key_pem(LineEnding::LF)?)
}

pub(crate) fn main_key_id(owner: &Url) -> Url {
    let mut id = owner.clone();
    id.set_fragment(Some("main-key"));
    id
}

pub(crate) fn numbered_key_id(owner: &Url, index: usize) -> Url {
    let mut id = owner.clone();
    id.set_fragment(Some(&format!("key-{index}")));
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multikey_roundtrips() {
        let raw = [7u8; 32];
        let encoded = encode_multikey(&raw);
        assert_eq!(decode_multikey(&encoded).unwrap(), raw);
    }

    #[test]
    fn main_key_id_uses_fragment() {
        let owner = Url::parse("https://example.com/users/alice").unwrap();
        assert_eq!(main_key_id(&owner).as_str(), "https://example.com/users/alice#main-key");
        assert_eq!(numbered_key_id(&owner, 2).as_str(), "https://example.com/users/alice#key-2");
    }
}
