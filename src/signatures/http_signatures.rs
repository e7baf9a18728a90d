//! HTTP Signatures (draft-cavage), the transport signature scheme used by
//! nearly every fediverse implementation.
//!
//! Signing is handled internally by the outbox pipeline; hosts never call
//! [`sign_request`] directly. Verification is used by the inbox pipeline
//! and is also available standalone for callers that terminate their own
//! HTTP layer.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine;
use bytes::Bytes;
use http::{HeaderName, HeaderValue, Method, Uri};
use http_signature_normalization_reqwest::prelude::{Config, SignExt};
use once_cell::sync::Lazy;
use reqwest_middleware::RequestBuilder;
use rsa::pkcs1v15::{SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, Verifier as _};
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

use super::keys::{rsa_private_key_from_pem, rsa_public_key_from_pem};
use crate::error::Error;

/// How long a signature remains valid after its `created` timestamp. Large
/// enough to tolerate clock skew and delayed delivery, per the fediverse
/// convention.
pub(crate) const SIGNATURE_EXPIRES_AFTER: Duration = Duration::from_secs(60 * 60);

static SIGN_CONFIG: Lazy<Config> = Lazy::new(|| Config::new().set_expiration(SIGNATURE_EXPIRES_AFTER));
static SIGN_CONFIG_COMPAT: Lazy<Config> =
    Lazy::new(|| Config::new().mastodon_compat().set_expiration(SIGNATURE_EXPIRES_AFTER));

/// Sign `request_builder` with `private_key_pem`, keyed by `key_id`. The
/// resulting request carries `Signature`, `Digest`, `Date`, and `Host`
/// headers per draft-cavage.
pub(crate) async fn sign_request(
    request_builder: RequestBuilder,
    key_id: &Url,
    body: Bytes,
    private_key_pem: &str,
    compat: bool,
) -> anyhow::Result<reqwest::Request> {
    let private_key = rsa_private_key_from_pem(private_key_pem)?;
    let signing_key = SigningKey::<Sha256>::new(private_key);
    let config = if compat { SIGN_CONFIG_COMPAT.clone() } else { SIGN_CONFIG.clone() };
    let key_id = key_id.to_string();

    request_builder
        .signature_with_digest(config, key_id, Sha256::new(), body, move |signing_string| {
            let signature = signing_key.sign_with_rng(&mut rand::thread_rng(), signing_string.as_bytes());
            Ok(Base64.encode(signature.to_vec())) as Result<_, anyhow::Error>
        })
        .await
}

/// An acceptable clock-skew window large enough that, in practice, the
/// `Date` header expiration check never trips. Substituted when a host
/// configures `signature_time_window: None`, since the underlying
/// `http_signature_normalization::Config` has no literal "never expires"
/// option.
const EFFECTIVELY_UNBOUNDED_WINDOW: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 100);

/// Verify the `Signature` header on an incoming request against
/// `public_key_pem`. `time_window` is the acceptable clock skew for the
/// `Date` header, per [`crate::config::FederationConfig::signature_time_window`];
/// `None` allows effectively any skew. Returns `Ok(())` only if the
/// signature, the signed header list, and (if present) the body digest all
/// check out.
pub fn verify_signature<'a, H>(
    headers: H,
    method: &Method,
    uri: &Uri,
    public_key_pem: &str,
    time_window: Option<Duration>,
) -> Result<(), Error>
where
    H: IntoIterator<Item = (&'a HeaderName, &'a HeaderValue)>,
{
    let mut header_map = BTreeMap::<String, String>::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            header_map.insert(name.to_string(), value.to_string());
        }
    }

    let verify_config = http_signature_normalization::Config::new().set_expiration(time_window.unwrap_or(EFFECTIVELY_UNBOUNDED_WINDOW));

    let public_key = rsa_public_key_from_pem(public_key_pem).map_err(Error::other)?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);

    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("");
    let verified = verify_config
        .begin_verify(method.as_str(), path_and_query, header_map)
        .map_err(Error::other)?
        .verify(|signature, signing_string| -> anyhow::Result<bool> {
            debug!("verifying signing string: {signing_string}");
            let decoded = Base64.decode(signature)?;
            let signature = rsa::pkcs1v15::Signature::try_from(decoded.as_slice())?;
            Ok(verifying_key.verify(signing_string.as_bytes(), &signature).is_ok())
        })
        .map_err(Error::other)?;

    if verified {
        Ok(())
    } else {
        Err(Error::ActivitySignatureInvalid)
    }
}

struct DigestPart {
    algorithm: String,
    digest: String,
}

impl DigestPart {
    fn parse_header(value: &HeaderValue) -> Option<Vec<DigestPart>> {
        let value = value.to_str().ok()?;
        let parts: Vec<_> = value
            .split(',')
            .filter_map(|part| {
                let mut iter = part.splitn(2, '=');
                let algorithm = iter.next()?;
                let digest = iter.next()?;
                Some(DigestPart {
                    algorithm: algorithm.to_owned(),
                    digest: digest.to_owned(),
                })
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts)
        }
    }
}

/// Verify the `Digest` header against the raw request body. SHA-1 digests
/// are accepted only if `accept_sha1` is set, for interoperability with
/// older fediverse software; this crate never emits SHA-1.
pub(crate) fn verify_body_digest(digest_header: Option<&HeaderValue>, body: &[u8], accept_sha1: bool) -> Result<(), Error> {
    let parts = digest_header
        .and_then(DigestPart::parse_header)
        .ok_or(Error::ActivityBodyDigestInvalid)?;

    for part in parts {
        let matches = match part.algorithm.to_ascii_uppercase().as_str() {
            "SHA-256" => {
                let mut hasher = sha2::Sha256::new();
                hasher.update(body);
                Base64.encode(hasher.finalize()) == part.digest
            }
            "SHA-512" => {
                use sha2::Sha512;
                let mut hasher = Sha512::new();
                hasher.update(body);
                Base64.encode(hasher.finalize()) == part.digest
            }
            "SHA" | "SHA-1" if accept_sha1 => {
                use sha1::{Digest as _, Sha1};
                let mut hasher = Sha1::new();
                hasher.update(body);
                Base64.encode(hasher.finalize()) == part.digest
            }
            _ => false,
        };
        if !matches {
            return Err(Error::ActivityBodyDigestInvalid);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signatures::keys::generate_rsa_keypair;
    use reqwest::Client;
    use reqwest_middleware::ClientWithMiddleware;
    use std::str::FromStr;

    #[tokio::test]
    async fn sign_then_verify_succeeds() {
        let keypair = generate_rsa_keypair().unwrap();
        let key_id = Url::parse("https://example.com/users/alice#main-key").unwrap();
        let inbox = Url::parse("https://remote.example/users/bob/inbox").unwrap();

        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::HOST, HeaderValue::from_str(inbox.host_str().unwrap()).unwrap());

        let request_builder = ClientWithMiddleware::from(Client::new())
            .post(inbox.to_string())
            .headers(headers);

        let request = sign_request(request_builder, &key_id, Bytes::from_static(b"{}"), &keypair.private_key, false)
            .await
            .unwrap();

        let result = verify_signature(
            request.headers(),
            request.method(),
            &Uri::from_str(request.url().as_str()).unwrap(),
            &keypair.public_key,
            Some(SIGNATURE_EXPIRES_AFTER),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn body_digest_mismatch_is_rejected() {
        let header = HeaderValue::from_static("sha-256=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=");
        let result = verify_body_digest(Some(&header), b"hello world", false);
        assert_eq!(result, Err(Error::ActivityBodyDigestInvalid));
    }
}
