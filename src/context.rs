//! Request-scoped handles to the federation engine
//!
//! [`Context`] is cheap to clone (it holds an `Arc` internally) and is what
//! handlers, listeners, and dispatcher callbacks actually work with: URL
//! building against the registered routes, fetching and caching remote
//! documents, and signing/sending outgoing activities. [`RequestContext`]
//! and [`InboxContext`] add the bits that only make sense while handling one
//! incoming HTTP request.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::OnceCell;
use url::Url;

use crate::config::FederationConfig;
use crate::docloader::{fetch_object, AuthenticatedDocumentLoader, CachingDocumentLoader, DocumentLoader, HttpDocumentLoader, LoadedDocument};
use crate::error::Error;
use crate::kv_key;
use crate::queue::QueuedMessage;
use crate::router::Matched;
use crate::signatures::http_signatures::sign_request;

const IDEMPOTENCE_TTL_SECS: u64 = 60 * 60 * 24;

/// A cheaply-cloneable handle to the federation engine, rooted at a shared
/// [`FederationConfig`]. Tracks the number of outgoing fetches triggered so
/// far, shared across every clone produced from the same incoming request.
pub struct Context<T: Clone> {
    pub(crate) config: Arc<FederationConfig<T>>,
    fetch_count: Arc<AtomicU32>,
}

impl<T: Clone> Clone for Context<T> {
    fn clone(&self) -> Self {
        Context {
            config: self.config.clone(),
            fetch_count: self.fetch_count.clone(),
        }
    }
}

impl<T: Clone> Context<T> {
    /// Build a new, request-scoped context rooted at `config`.
    pub fn new(config: Arc<FederationConfig<T>>) -> Self {
        Context {
            config,
            fetch_count: Arc::new(AtomicU32::new(0)),
        }
    }

    /// The application data passed to [`crate::config::FederationConfigBuilder::app_data`].
    pub fn app_data(&self) -> &T {
        &self.config.app_data
    }

    /// The domain this instance serves federation traffic for.
    pub fn domain(&self) -> &str {
        &self.config.domain
    }

    fn note_fetch(&self) -> Result<(), Error> {
        let count = self.fetch_count.fetch_add(1, Ordering::SeqCst);
        if count >= self.config.http_fetch_limit {
            return Err(Error::RequestLimit);
        }
        Ok(())
    }

    /// Number of outgoing fetches made so far against this context.
    pub fn fetch_count(&self) -> u32 {
        self.fetch_count.load(Ordering::SeqCst)
    }

    /// Match `path` against the registered routes.
    pub fn route_path(&self, path: &str) -> Option<Matched> {
        let router = self.config.router.lock().expect("router mutex poisoned");
        router.route(path)
    }

    /// Parse a local id out of a fully-qualified `uri`, if it points at a
    /// registered local route.
    pub fn parse_uri(&self, uri: &Url) -> Option<Matched> {
        if !self.config.is_local_url(uri) {
            return None;
        }
        self.route_path(uri.path())
    }

    fn build_uri(&self, route_name: &str, values: &HashMap<String, String>) -> Result<Url, Error> {
        let path = {
            let router = self.config.router.lock().expect("router mutex poisoned");
            router.build(route_name, values)
        };
        let path = path.ok_or(Error::NotFound)?;
        let mut url = Url::parse(&format!("https://{}", self.config.domain))?;
        url.set_path(&path);
        Ok(url)
    }

    fn single_value(name: &str, value: &str) -> HashMap<String, String> {
        HashMap::from([(name.to_string(), value.to_string())])
    }

    /// Build the public URI of the actor identified by `identifier`.
    pub fn actor_uri(&self, identifier: &str) -> Result<Url, Error> {
        self.build_uri("actor", &Self::single_value("identifier", identifier))
    }

    /// Build an actor's inbox URI.
    pub fn inbox_uri(&self, identifier: &str) -> Result<Url, Error> {
        self.build_uri("inbox", &Self::single_value("identifier", identifier))
    }

    /// Build the shared inbox URI, if one is registered.
    pub fn shared_inbox_uri(&self) -> Result<Url, Error> {
        self.build_uri("shared_inbox", &HashMap::new())
    }

    /// Build an actor's outbox URI.
    pub fn outbox_uri(&self, identifier: &str) -> Result<Url, Error> {
        self.build_uri("outbox", &Self::single_value("identifier", identifier))
    }

    /// Build an actor's following collection URI.
    pub fn following_uri(&self, identifier: &str) -> Result<Url, Error> {
        self.build_uri("following", &Self::single_value("identifier", identifier))
    }

    /// Build an actor's followers collection URI.
    pub fn followers_uri(&self, identifier: &str) -> Result<Url, Error> {
        self.build_uri("followers", &Self::single_value("identifier", identifier))
    }

    /// Build an actor's liked collection URI.
    pub fn liked_uri(&self, identifier: &str) -> Result<Url, Error> {
        self.build_uri("liked", &Self::single_value("identifier", identifier))
    }

    /// Build an actor's featured (pinned objects) collection URI.
    pub fn featured_uri(&self, identifier: &str) -> Result<Url, Error> {
        self.build_uri("featured", &Self::single_value("identifier", identifier))
    }

    /// Build an actor's featured hashtags collection URI.
    pub fn featured_tags_uri(&self, identifier: &str) -> Result<Url, Error> {
        self.build_uri("featured_tags", &Self::single_value("identifier", identifier))
    }

    /// Build the public URI of an object identified by `object_id`.
    pub fn object_uri(&self, object_id: &str) -> Result<Url, Error> {
        self.build_uri("object", &Self::single_value("object_id", object_id))
    }

    /// Build the NodeInfo 2.1 document URI.
    pub fn node_info_uri(&self) -> Result<Url, Error> {
        self.build_uri("node_info", &HashMap::new())
    }

    /// A plain, unauthenticated [`DocumentLoader`] wrapped with the
    /// whitelisted-context cache.
    pub fn document_loader(&self) -> CachingDocumentLoader<HttpDocumentLoader> {
        let inner = HttpDocumentLoader::new(self.config.client.clone(), self.config.request_timeout, self.config.http_fetch_limit)
            .allow_private_network(self.config.debug);
        CachingDocumentLoader::new(inner, self.config.kv_store.clone(), vec!["_fedi".to_string(), "document_cache".to_string()])
    }

    /// A [`DocumentLoader`] that signs every fetch as `actor_id`, for
    /// servers running in authorized-fetch mode.
    pub fn authenticated_document_loader(&self, actor_id: Url, private_key_pem: String) -> AuthenticatedDocumentLoader {
        AuthenticatedDocumentLoader::new(self.config.client.clone(), actor_id, private_key_pem)
    }

    /// Fetch and parse a remote JSON-LD document at `url`, after verifying
    /// it and counting it against the per-request fetch limit.
    pub async fn load_document(&self, url: &Url) -> Result<LoadedDocument, Error> {
        self.config.verify_url_valid(url).await?;
        self.note_fetch()?;
        self.document_loader().load(url).await
    }

    /// Fetch and deserialize a remote object of type `D` at `url`.
    pub async fn fetch_object<D: DeserializeOwned>(&self, url: &Url) -> Result<D, Error> {
        self.config.verify_url_valid(url).await?;
        self.note_fetch()?;
        fetch_object(&self.config.client, url, self.config.request_timeout).await
    }

    fn idempotence_key(activity_id: &Url) -> crate::kv::Key {
        kv_key!["_fedi", "activity_idempotence", activity_id.as_str()]
    }

    /// True if `activity_id` has already been processed by the inbox
    /// pipeline, per the idempotence record in the configured [`KvStore`].
    pub async fn has_processed_activity(&self, activity_id: &Url) -> Result<bool, Error> {
        let key = Self::idempotence_key(activity_id);
        Ok(self.config.kv_store.get(&key).await.map_err(Error::other)?.is_some())
    }

    /// Record `activity_id` as processed, so a retried or duplicate
    /// delivery of the same activity is skipped.
    pub async fn mark_activity_processed(&self, activity_id: &Url) -> Result<(), Error> {
        let key = Self::idempotence_key(activity_id);
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        self.config
            .kv_store
            .set(key, now.to_be_bytes().to_vec(), Some(std::time::Duration::from_secs(IDEMPOTENCE_TTL_SECS)))
            .await
            .map_err(Error::other)
    }

    /// Sign `body` as `key_id`/`private_key_pem` and deliver it to `inbox`
    /// right away, bypassing the outbox queue. Used both by the outbox
    /// worker and by callers that want synchronous delivery (`debug` mode,
    /// tests). `collection_sync`, when set, is attached as the
    /// `Collection-Synchronization` header (partial-delivery reconciliation
    /// for shared-inbox followers delivery).
    pub async fn deliver_now(&self, inbox: &Url, key_id: &Url, body: Bytes, private_key_pem: &str, collection_sync: Option<&str>) -> Result<(), Error> {
        self.config.verify_url_valid(inbox).await?;
        let mut request_builder = self.config.client.post(inbox.as_str()).header("Content-Type", "application/activity+json");
        if let Some(sync) = collection_sync {
            request_builder = request_builder.header("Collection-Synchronization", sync);
        }
        let request = sign_request(request_builder, key_id, body, private_key_pem, false).await.map_err(Error::other)?;
        let response = self.config.client.execute(request).await.map_err(Error::other)?;
        if !response.status().is_success() {
            return Err(Error::other(anyhow::anyhow!("delivery to {inbox} failed with status {}", response.status())));
        }
        Ok(())
    }

    /// Hand a signed, serialized activity off to the outbox queue, unless
    /// `immediate` is set or no queue is configured, in which case it is
    /// delivered right now instead using the key material carried on
    /// `message`.
    pub async fn enqueue_delivery(&self, message: QueuedMessage, immediate: bool) -> Result<(), Error> {
        if !immediate {
            if let Some(queue) = &self.config.outbox_queue {
                return queue.enqueue(message).await.map_err(Error::other);
            }
        }
        self.deliver_queued_message(&message).await
    }

    async fn deliver_queued_message(&self, message: &QueuedMessage) -> Result<(), Error> {
        let signing_key = message
            .signing_key
            .as_ref()
            .ok_or_else(|| Error::other(anyhow::anyhow!("queued message for {} has no signing key", message.inbox)))?;
        self.deliver_now(
            &message.inbox,
            &signing_key.key_id,
            Bytes::from(message.body.clone()),
            &signing_key.private_key_pem,
            message.collection_sync.as_deref(),
        )
        .await
    }

    /// Process one message pulled off the outbox queue: deliver it now using
    /// its carried signing key. The handler an outbox [`crate::queue::MessageQueue::listen`]
    /// call should invoke per dequeued message.
    pub async fn process_queued_outbox_message(&self, message: QueuedMessage) -> anyhow::Result<()> {
        self.deliver_queued_message(&message).await.map_err(anyhow::Error::from)
    }
}

impl<T: Clone> Deref for Context<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.config.app_data
    }
}

/// A [`Context`] scoped to one incoming HTTP request, adding lazily-fetched
/// and memoized access to the request's signing actor and target object.
pub struct RequestContext<T: Clone> {
    inner: Context<T>,
    request_uri: Url,
    signed_by: OnceCell<Option<Url>>,
}

impl<T: Clone> RequestContext<T> {
    /// Build a request context for an incoming request at `request_uri`.
    pub fn new(context: Context<T>, request_uri: Url) -> Self {
        RequestContext {
            inner: context,
            request_uri,
            signed_by: OnceCell::new(),
        }
    }

    /// The URI of the incoming request this context was built for.
    pub fn request_uri(&self) -> &Url {
        &self.request_uri
    }

    /// The `keyId` of the HTTP Signature on the incoming request, if the
    /// pipeline has verified one. Set by the inbox pipeline before a
    /// listener is invoked.
    pub fn signed_by(&self) -> Option<&Url> {
        self.signed_by.get().and_then(|v| v.as_ref())
    }

    /// Record the verified signer of the current request. Errors if called
    /// more than once.
    pub fn set_signed_by(&self, signer: Option<Url>) {
        let _ = self.signed_by.set(signer);
    }

    /// Fetch the remote document at `object_id`, counted against this
    /// request's fetch limit.
    pub async fn object(&self, object_id: &Url) -> Result<Value, Error> {
        Ok(self.inner.load_document(object_id).await?.document)
    }
}

impl<T: Clone> Deref for RequestContext<T> {
    type Target = Context<T>;

    fn deref(&self) -> &Context<T> {
        &self.inner
    }
}

/// A [`RequestContext`] for one inbox POST, adding the triggering activity
/// envelope and the ability to forward it to followers unmodified.
pub struct InboxContext<T: Clone> {
    inner: RequestContext<T>,
    activity: Value,
}

impl<T: Clone> InboxContext<T> {
    /// Build an inbox context around the parsed JSON body of the incoming
    /// activity.
    pub fn new(request: RequestContext<T>, activity: Value) -> Self {
        InboxContext { inner: request, activity }
    }

    /// The raw JSON of the activity that triggered this dispatch.
    pub fn activity(&self) -> &Value {
        &self.activity
    }

    /// Re-deliver the triggering activity, unmodified, to `inbox`, signed
    /// as `forwarding_actor`. Used to relay an `Announce`d or `Create`d
    /// object to followers that would not otherwise see the original
    /// delivery, per the server-to-server forwarding recommendation.
    pub async fn forward_activity(&self, inbox: &Url, forwarding_actor: &Url, private_key_pem: &str) -> Result<(), Error> {
        let body = serde_json::to_vec(&self.activity)?;
        let mut key_id = forwarding_actor.clone();
        key_id.set_fragment(Some("main-key"));
        self.inner.deliver_now(inbox, &key_id, Bytes::from(body), private_key_pem, None).await
    }
}

impl<T: Clone> Deref for InboxContext<T> {
    type Target = RequestContext<T>;

    fn deref(&self) -> &RequestContext<T> {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn test_config() -> Arc<FederationConfig<()>> {
        Arc::new(
            FederationConfig::builder()
                .domain("example.com")
                .app_data(())
                .kv_store(Arc::new(MemoryKvStore::new()))
                .build()
                .unwrap(),
        )
    }

    fn context_with_routes() -> Context<()> {
        let config = test_config();
        {
            let mut router = config.router.lock().unwrap();
            router.add("/users/{identifier}", "actor").unwrap();
            router.add("/users/{identifier}/inbox", "inbox").unwrap();
        }
        Context::new(config)
    }

    #[test]
    fn builds_actor_uri_from_registered_route() {
        let context = context_with_routes();
        let uri = context.actor_uri("alice").unwrap();
        assert_eq!(uri.as_str(), "https://example.com/users/alice");
    }

    #[test]
    fn parse_uri_rejects_foreign_domain() {
        let context = context_with_routes();
        let uri = Url::parse("https://other.example/users/alice").unwrap();
        assert!(context.parse_uri(&uri).is_none());
    }

    #[test]
    fn parse_uri_matches_registered_route() {
        let context = context_with_routes();
        let uri = context.inbox_uri("alice").unwrap();
        let matched = context.parse_uri(&uri).unwrap();
        assert_eq!(matched.name, "inbox");
        assert_eq!(matched.values.get("identifier").unwrap(), "alice");
    }

    #[tokio::test]
    async fn idempotence_record_round_trips() {
        let context = context_with_routes();
        let activity_id = Url::parse("https://remote.example/activities/1").unwrap();
        assert!(!context.has_processed_activity(&activity_id).await.unwrap());
        context.mark_activity_processed(&activity_id).await.unwrap();
        assert!(context.has_processed_activity(&activity_id).await.unwrap());
    }
}
