//! Fetches JSON-LD documents over HTTP
//!
//! The engine needs to fetch three kinds of remote documents: actors and
//! objects referenced by an incoming activity, JSON-LD context documents
//! during compaction, and public keys during signature verification. All
//! three go through a [`DocumentLoader`] so that a host can swap in caching,
//! authenticated (signed-GET) fetching, or a test double.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use once_cell::sync::Lazy;
use reqwest_middleware::ClientWithMiddleware;
use serde::de::DeserializeOwned;
use tracing::info;
use url::{Host, Url};

use crate::error::Error;
use crate::kv::{KvStore, Key};
use crate::signatures::http_signatures::sign_request;

/// `Accept` header sent on every document fetch.
pub const FEDERATION_CONTENT_TYPE: &str = "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\", application/activity+json";

/// A fetched document plus the JSON-LD bookkeeping fields the caller needs
/// for context resolution.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    /// The `@context` URL referenced by the document, if any
    pub context_url: Option<Url>,
    /// The URL the document was ultimately fetched from, after redirects
    pub document_url: Url,
    /// Parsed JSON body
    pub document: serde_json::Value,
}

/// Fetches remote JSON-LD documents. Implementations decide caching,
/// authentication, and fetch limits.
#[async_trait]
pub trait DocumentLoader: Send + Sync {
    /// Fetch and parse the document at `url`.
    async fn load(&self, url: &Url) -> Result<LoadedDocument, Error>;
}

/// Rejects fetches to loopback, link-local, and private network addresses
/// unless explicitly allowed — guards against SSRF via attacker-controlled
/// URLs embedded in federated content.
fn is_disallowed_host(url: &Url, allow_private_network: bool) -> bool {
    if allow_private_network {
        return false;
    }
    match url.host() {
        Some(Host::Ipv4(ip)) => is_disallowed_ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => is_disallowed_ip(IpAddr::V6(ip)),
        Some(Host::Domain(domain)) => domain == "localhost",
        None => true,
    }
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified(),
        IpAddr::V6(ip) => ip.is_loopback() || ip.is_unspecified(),
    }
}

/// Default [`DocumentLoader`]: plain unauthenticated `GET`, following
/// redirects, bounded by a response body size limit and a per-request
/// fetch counter shared across the lifetime of the loader.
pub struct HttpDocumentLoader {
    client: ClientWithMiddleware,
    request_timeout: Duration,
    max_response_body_bytes: usize,
    fetch_limit: u32,
    fetch_count: AtomicU32,
    allow_private_network: bool,
}

impl HttpDocumentLoader {
    /// Create a loader using `client`.
    pub fn new(client: ClientWithMiddleware, request_timeout: Duration, fetch_limit: u32) -> Self {
        HttpDocumentLoader {
            client,
            request_timeout,
            max_response_body_bytes: 10 * 1024 * 1024,
            fetch_limit,
            fetch_count: AtomicU32::new(0),
            allow_private_network: false,
        }
    }

    /// Allow fetching private/loopback network addresses. Intended for
    /// tests against a local federation fixture.
    pub fn allow_private_network(mut self, allow: bool) -> Self {
        self.allow_private_network = allow;
        self
    }
}

#[async_trait]
impl DocumentLoader for HttpDocumentLoader {
    async fn load(&self, url: &Url) -> Result<LoadedDocument, Error> {
        if is_disallowed_host(url, self.allow_private_network) {
            return Err(Error::UrlVerificationError("refusing to fetch a private network address"));
        }

        let count = self.fetch_count.fetch_add(1, Ordering::SeqCst);
        if count >= self.fetch_limit {
            return Err(Error::RequestLimit);
        }

        info!("fetching remote document {url}");
        let response = self
            .client
            .get(url.as_str())
            .header("Accept", FEDERATION_CONTENT_TYPE)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(Error::other)?;

        if response.status() == StatusCode::GONE {
            return Err(Error::ObjectDeleted);
        }
        let document_url = response.url().clone();

        let body = read_body_limited(response, self.max_response_body_bytes).await?;
        let document: serde_json::Value = serde_json::from_slice(&body)?;
        let context_url = document
            .get("@context")
            .and_then(|v| v.as_str())
            .and_then(|s| Url::parse(s).ok());

        Ok(LoadedDocument {
            context_url,
            document_url,
            document,
        })
    }
}

async fn read_body_limited(response: reqwest::Response, limit: usize) -> Result<Bytes, Error> {
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(Error::ResponseBodyLimit);
        }
    }
    let bytes = response.bytes().await.map_err(Error::other)?;
    if bytes.len() > limit {
        return Err(Error::ResponseBodyLimit);
    }
    Ok(bytes)
}

/// Fetch and deserialize a remote document directly, bypassing the
/// [`DocumentLoader`] trait object. Used where the caller already knows the
/// target type, e.g. fetching a public key during signature verification.
pub async fn fetch_object<T: DeserializeOwned>(
    client: &ClientWithMiddleware,
    url: &Url,
    request_timeout: Duration,
) -> Result<T, Error> {
    let response = client
        .get(url.as_str())
        .header("Accept", FEDERATION_CONTENT_TYPE)
        .timeout(request_timeout)
        .send()
        .await
        .map_err(Error::other)?;
    if response.status() == StatusCode::GONE {
        return Err(Error::ObjectDeleted);
    }
    let body = read_body_limited(response, 10 * 1024 * 1024).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// A well-known whitelist of JSON-LD context URLs safe to cache for a day;
/// anything else passes through the wrapped loader uncached, since third
/// party contexts can change meaning underneath a long-lived cache entry.
static CACHEABLE_CONTEXTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "https://www.w3.org/ns/activitystreams",
        "https://w3id.org/security/v1",
        "https://w3id.org/security/data-integrity/v1",
    ]
});

const CONTEXT_CACHE_TTL: Duration = Duration::from_secs(60 * 60 * 24);

/// Wraps a [`DocumentLoader`] with a [`KvStore`]-backed cache for the small
/// whitelist of well-known context URLs.
pub struct CachingDocumentLoader<L> {
    inner: L,
    store: Arc<dyn KvStore>,
    kv_prefix: Vec<String>,
}

impl<L: DocumentLoader> CachingDocumentLoader<L> {
    /// Wrap `inner` with caching backed by `store`.
    pub fn new(inner: L, store: Arc<dyn KvStore>, kv_prefix: Vec<String>) -> Self {
        CachingDocumentLoader { inner, store, kv_prefix }
    }

    fn cache_key(&self, url: &Url) -> Key {
        let mut key = self.kv_prefix.clone();
        key.push("remote_document".to_string());
        key.push(url.to_string());
        key
    }
}

#[async_trait]
impl<L: DocumentLoader> DocumentLoader for CachingDocumentLoader<L> {
    async fn load(&self, url: &Url) -> Result<LoadedDocument, Error> {
        if !CACHEABLE_CONTEXTS.contains(&url.as_str()) {
            return self.inner.load(url).await;
        }

        let key = self.cache_key(url);
        if let Ok(Some(cached)) = self.store.get(&key).await {
            if let Ok(document) = serde_json::from_slice::<serde_json::Value>(&cached) {
                return Ok(LoadedDocument {
                    context_url: None,
                    document_url: url.clone(),
                    document,
                });
            }
        }

        let loaded = self.inner.load(url).await?;
        if let Ok(serialized) = serde_json::to_vec(&loaded.document) {
            let _ = self.store.set(key, serialized, Some(CONTEXT_CACHE_TTL)).await;
        }
        Ok(loaded)
    }
}

/// A [`DocumentLoader`] variant where every `GET` is HTTP-signed as
/// `actor_id`, for fetching from servers running in authorized-fetch mode.
/// Used by [`crate::context::Context::document_loader`] when a key pair is
/// available for the requesting identity.
pub struct AuthenticatedDocumentLoader {
    client: ClientWithMiddleware,
    actor_id: Url,
    private_key_pem: String,
}

impl AuthenticatedDocumentLoader {
    /// Sign every fetch as `actor_id` with `private_key_pem`.
    pub fn new(client: ClientWithMiddleware, actor_id: Url, private_key_pem: String) -> Self {
        AuthenticatedDocumentLoader {
            client,
            actor_id,
            private_key_pem,
        }
    }
}

#[async_trait]
impl DocumentLoader for AuthenticatedDocumentLoader {
    async fn load(&self, url: &Url) -> Result<LoadedDocument, Error> {
        let request_builder = self.client.get(url.as_str()).header("Accept", FEDERATION_CONTENT_TYPE);
        let key_id = {
            let mut id = self.actor_id.clone();
            id.set_fragment(Some("main-key"));
            id
        };
        let request = sign_request(request_builder, &key_id, Bytes::new(), &self.private_key_pem, false)
            .await
            .map_err(Error::other)?;
        let response = self.client.execute(request).await.map_err(Error::other)?;
        if response.status() == StatusCode::GONE {
            return Err(Error::ObjectDeleted);
        }
        let document_url = response.url().clone();
        let body = read_body_limited(response, 10 * 1024 * 1024).await?;
        let document: serde_json::Value = serde_json::from_slice(&body)?;
        Ok(LoadedDocument {
            context_url: None,
            document_url,
            document,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_private_network_by_default() {
        let url = Url::parse("http://127.0.0.1/actor").unwrap();
        assert!(is_disallowed_host(&url, false));
        assert!(!is_disallowed_host(&url, true));
    }

    #[test]
    fn allows_public_host() {
        let url = Url::parse("https://example.com/actor").unwrap();
        assert!(!is_disallowed_host(&url, false));
    }
}
