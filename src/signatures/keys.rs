//! Actor key pair generation
//!
//! Each actor may carry two independent key pairs: an RSA pair used for HTTP
//! Signatures, and an Ed25519 pair used for Object Integrity Proofs. Both
//! are optional but at least one of each is required to produce the
//! corresponding signature kind; a dispatcher that only returns one kind is
//! valid, just less interoperable.

use ed25519_dalek::pkcs8::{
    DecodePrivateKey as Ed25519DecodePrivateKey, DecodePublicKey as Ed25519DecodePublicKey,
    EncodePrivateKey as Ed25519EncodePrivateKey, EncodePublicKey as Ed25519EncodePublicKey,
};
use ed25519_dalek::SigningKey;
use pkcs8::LineEnding;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};

/// An RSASSA-PKCS1-v1.5 SHA-256 key pair, PEM encoded, used to sign and
/// verify HTTP Signatures.
#[derive(Clone, Debug)]
pub struct RsaKeypair {
    /// PKCS#8 PEM-encoded private key
    pub private_key: String,
    /// SPKI PEM-encoded public key
    pub public_key: String,
}

/// An Ed25519 key pair, PEM encoded, used to sign and verify Object
/// Integrity Proofs (`eddsa-jcs-2022`).
#[derive(Clone, Debug)]
pub struct Ed25519Keypair {
    /// PKCS#8 PEM-encoded private key
    pub private_key: String,
    /// SPKI PEM-encoded public key
    pub public_key: String,
}

/// Generate a new 2048-bit RSA key pair.
pub fn generate_rsa_keypair() -> anyhow::Result<RsaKeypair> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 2048)?;
    let public_key = RsaPublicKey::from(&private_key);
    Ok(RsaKeypair {
        private_key: private_key.to_pkcs8_pem(LineEnding::LF)?.to_string(),
        public_key: public_key.to_public_key_pem(LineEnding::LF)?,
    })
}

/// Generate a new Ed25519 key pair.
pub fn generate_ed25519_keypair() -> anyhow::Result<Ed25519Keypair> {
    let signing_key = SigningKey::generate(&mut OsRng);
    let private_key = signing_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
    let public_key = signing_key.verifying_key().to_public_key_pem(LineEnding::LF)?;
    Ok(Ed25519Keypair {
        private_key,
        public_key,
    })
}

pub(crate) fn rsa_private_key_from_pem(pem: &str) -> anyhow::Result<RsaPrivateKey> {
    Ok(RsaPrivateKey::from_pkcs8_pem(pem)?)
}

pub(crate) fn rsa_public_key_from_pem(pem: &str) -> anyhow::Result<RsaPublicKey> {
    Ok(RsaPublicKey::from_public_key_pem(pem)?)
}

pub(crate) fn ed25519_signing_key_from_pem(pem: &str) -> anyhow::Result<SigningKey> {
    Ok(SigningKey::from_pkcs8_pem(pem)?)
}

pub(crate) fn ed25519_verifying_key_from_pem(pem: &str) -> anyhow::Result<ed25519_dalek::VerifyingKey> {
    Ok(ed25519_dalek::VerifyingKey::from_public_key_pem(pem)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_rsa_keypair_roundtrips() {
        let pair = generate_rsa_keypair().unwrap();
        let private = rsa_private_key_from_pem(&pair.private_key).unwrap();
        let public = rsa_public_key_from_pem(&pair.public_key).unwrap();
        assert_eq!(RsaPublicKey::from(&private), public);
    }

    #[test]
    fn generated_ed25519_keypair_roundtrips() {
        let pair = generate_ed25519_keypair().unwrap();
        let signing = ed25519_signing_key_from_pem(&pair.private_key).unwrap();
        let verifying = ed25519_verifying_key_from_pem(&pair.public_key).unwrap();
        assert_eq!(signing.verifying_key(), verifying);
    }
}
