//! The federation engine: registration, request dispatch, and the inbox and
//! outbox pipelines.
//!
//! A [`Federation`] is built once per process, after registering every route
//! the host serves. It owns the [`crate::router::Router`] (via its
//! [`Context`]), the inbox listener set, and the collection/object/actor
//! dispatcher callbacks a host registers. [`Federation::fetch`] is the single
//! entry point an HTTP adapter calls for every incoming request.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::collection::{build_collection_page, CollectionPageData, CollectionResponse};
use crate::config::FederationConfig;
use crate::context::{Context, InboxContext, RequestContext};
use crate::error::Error;
use crate::listeners::{InboxListenerSet, Listener};
use crate::nodeinfo::{NodeInfo, NodeInfoWellKnown};
use crate::protocol::public_key::CryptographicKey;
use crate::queue::{QueuedMessage, QueuedSigningKey};
use crate::router::RouterError;
use crate::signatures::http_signatures::{verify_body_digest, verify_signature};
use crate::signatures::proofs;
use crate::signatures::{assign_key_ids, ActorKeyPair, Ed25519KeyMaterial, RsaKeyMaterial};
use crate::vocab::ActivityEnvelope;
use crate::webfinger::{extract_webfinger_name, Webfinger, WEBFINGER_CONTENT_TYPE};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An actor, object, or collection dispatcher.
pub type ObjectDispatcher<T> = Arc<dyn Fn(Context<T>, String) -> BoxFuture<'static, Result<Option<Value>, Error>> + Send + Sync>;

/// Resolves an identifier to the key pairs registered for it.
pub type KeyPairsDispatcher<T> = Arc<dyn Fn(Context<T>, String) -> BoxFuture<'static, Result<Vec<ActorKeyPair>, Error>> + Send + Sync>;

/// Produces one page of a collection for `identifier`, given an optional
/// cursor.
pub type CollectionDispatcher<T> =
    Arc<dyn Fn(Context<T>, String, Option<String>) -> BoxFuture<'static, Result<CollectionPageData, Error>> + Send + Sync>;

/// Builds the NodeInfo 2.1 document for this instance.
pub type NodeInfoDispatcher<T> = Arc<dyn Fn(Context<T>) -> BoxFuture<'static, Result<NodeInfo, Error>> + Send + Sync>;

/// Resolves a WebFinger account name to the actor(s) sharing it, if any.
pub type WebfingerDispatcher<T> = Arc<dyn Fn(Context<T>, String) -> BoxFuture<'static, Result<Option<Webfinger>, Error>> + Send + Sync>;

/// Counts the total size of a collection, used to fill `totalItems` when the
/// dispatcher itself doesn't report one.
pub type CollectionCounter<T> = Arc<dyn Fn(Context<T>, String) -> BoxFuture<'static, Result<u64, Error>> + Send + Sync>;

/// Filters one collection item against a query-string filter value (e.g.
/// Mastodon's followers `?base-url=` filter).
pub type CollectionFilter<T> = Arc<dyn Fn(&Value, &str) -> bool + Send + Sync>;

/// Decides whether the requester may view a collection at all.
pub type CollectionAuthorize<T> = Arc<dyn Fn(RequestContext<T>) -> BoxFuture<'static, bool> + Send + Sync>;

/// Registered callbacks for one collection route.
#[derive(Clone)]
pub struct CollectionCallbacks<T: Clone> {
    /// Produces items for the collection, optionally paginated by cursor.
    pub dispatcher: CollectionDispatcher<T>,
    /// Cursor to use for the first page, if the collection is paginated.
    pub first_cursor: Option<String>,
    /// Cursor to use for the last page, if the collection is paginated.
    pub last_cursor: Option<String>,
    /// Reports the collection's total size, when the dispatcher doesn't.
    pub counter: Option<CollectionCounter<T>>,
    /// Filters items against a recognized query-string filter.
    pub filter: Option<CollectionFilter<T>>,
    /// Gates access to the collection entirely.
    pub authorize: Option<CollectionAuthorize<T>>,
}

impl<T: Clone> CollectionCallbacks<T> {
    /// Build callbacks with only a dispatcher; the rest default to `None`.
    pub fn new(dispatcher: CollectionDispatcher<T>) -> Self {
        CollectionCallbacks {
            dispatcher,
            first_cursor: None,
            last_cursor: None,
            counter: None,
            filter: None,
            authorize: None,
        }
    }
}

/// Expected variable-set shape for a registered route, per §4.8.1(c).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RouteShape {
    /// Exactly `{identifier}`. `{handle}` is accepted as a deprecated alias.
    ActorScoped,
    /// No variables (NodeInfo, shared inbox, WebFinger).
    Empty,
    /// One or more variables (object routes).
    Object,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum CollectionKind {
    Outbox,
    Following,
    Followers,
    Liked,
    Featured,
    FeaturedTags,
}

/// A neutral HTTP response, translated to a framework-specific type by the
/// `axum`/`actix-web` adapters.
#[derive(Debug, Clone)]
pub struct EngineResponse {
    /// HTTP status code
    pub status: StatusCode,
    /// `Content-Type` header value, if any
    pub content_type: Option<&'static str>,
    /// `Vary` header value, if any
    pub vary: Option<&'static str>,
    /// Response body
    pub body: Vec<u8>,
}

impl EngineResponse {
    fn status_only(status: StatusCode) -> Self {
        EngineResponse {
            status,
            content_type: None,
            vary: None,
            body: Vec::new(),
        }
    }

    /// `406 Not Acceptable`, per §6: clients that only accept an HTML
    /// representation get this instead of a JSON-LD body.
    fn not_acceptable() -> Self {
        EngineResponse {
            status: StatusCode::NOT_ACCEPTABLE,
            content_type: None,
            vary: Some("Accept, Signature"),
            body: Vec::new(),
        }
    }

    fn json(status: StatusCode, value: &impl serde::Serialize) -> Result<Self, Error> {
        Self::json_with_type(status, value, crate::FEDERATION_CONTENT_TYPE)
    }

    fn json_with_type(status: StatusCode, value: &impl serde::Serialize, content_type: &'static str) -> Result<Self, Error> {
        Ok(EngineResponse {
            status,
            content_type: Some(content_type),
            vary: Some("Accept"),
            body: serde_json::to_vec(value)?,
        })
    }
}

/// True if `accept` asks only for an HTML representation (`text/html` or
/// `application/xhtml+xml`) and names none of the JSON-LD media types this
/// engine can serve — the `406` case in §6's content-negotiation table.
fn prefers_html_only(headers: &HeaderMap) -> bool {
    let Some(accept) = headers.get(http::header::ACCEPT).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let wants_html = accept.contains("text/html") || accept.contains("application/xhtml+xml");
    let wants_json = ["application/activity+json", "application/ld+json", "application/json", "*/*"]
        .iter()
        .any(|kind| accept.contains(kind));
    wants_html && !wants_json
}

/// One resolved delivery recipient.
#[derive(Clone, Debug)]
pub struct Recipient {
    /// The recipient actor's id, used for `Collection-Synchronization`
    /// accounting and deduplication.
    pub id: Url,
    /// The recipient's personal inbox.
    pub inbox: Url,
    /// The recipient's shared inbox, if it advertises one.
    pub shared_inbox: Option<Url>,
}

/// Destination set for [`Federation::send_activity`].
pub enum Recipients {
    /// Deliver to exactly these recipients.
    Explicit(Vec<Recipient>),
    /// Expand to the sending actor's registered followers collection,
    /// paginating through every cursor, and emit a
    /// `Collection-Synchronization` header on shared-inbox deliveries for
    /// partial-delivery reconciliation (the Mastodon extension).
    Followers,
}

/// Options for [`Federation::send_activity`].
pub struct SendActivityOptions {
    /// The serialized activity to deliver.
    pub activity: Value,
    /// Identifier of the sending actor, used to look up signing keys.
    pub sender_identifier: String,
    /// Who to deliver to.
    pub recipients: Recipients,
    /// Prefer each recipient's shared inbox over their personal one, when
    /// they advertise one. Recipients are deduplicated by the inbox URL
    /// actually chosen.
    pub prefer_shared_inbox: bool,
    /// Skip any resolved inbox whose origin (scheme/host/port) matches one
    /// of these base URIs.
    pub exclude_base_uris: Vec<Url>,
    /// Send synchronously, bypassing the outbox queue.
    pub immediate: bool,
}

/// The federation engine. Build one with [`Federation::new`], register every
/// route, then serve requests through [`Federation::fetch`].
pub struct Federation<T: Clone> {
    context: Context<T>,
    actor_dispatcher: Option<ObjectDispatcher<T>>,
    key_pairs_dispatcher: Option<KeyPairsDispatcher<T>>,
    object_dispatchers: HashMap<String, ObjectDispatcher<T>>,
    collections: HashMap<CollectionKind, CollectionCallbacks<T>>,
    listeners: InboxListenerSet<T>,
    node_info_dispatcher: Option<NodeInfoDispatcher<T>>,
    webfinger_dispatcher: Option<WebfingerDispatcher<T>>,
    key_pair_cache: moka::future::Cache<String, Arc<(Vec<RsaKeyMaterial>, Vec<Ed25519KeyMaterial>)>>,
}

impl<T: Clone + Send + Sync + 'static> Federation<T> {
    /// Start a federation engine rooted at `config`.
    pub fn new(config: FederationConfig<T>) -> Self {
        Federation {
            context: Context::new(Arc::new(config)),
            actor_dispatcher: None,
            key_pairs_dispatcher: None,
            object_dispatchers: HashMap::new(),
            collections: HashMap::new(),
            listeners: InboxListenerSet::new(),
            node_info_dispatcher: None,
            webfinger_dispatcher: None,
            key_pair_cache: moka::future::Cache::builder().max_capacity(10_000).build(),
        }
    }

    /// A [`Context`] rooted at this engine's configuration, for building
    /// URIs or sending activities outside of a request.
    pub fn context(&self) -> Context<T> {
        self.context.clone()
    }

    fn add_route(&self, template: &str, name: &str, shape: RouteShape) -> Result<(), Error> {
        let rewritten;
        let template = if shape == RouteShape::ActorScoped && template.contains("{handle}") {
            warn!("route '{name}' uses the deprecated '{{handle}}' variable; treating it as '{{identifier}}'");
            rewritten = template.replace("{handle}", "{identifier}");
            rewritten.as_str()
        } else {
            template
        };

        let variables = {
            let mut router = self.context.config.router.lock().expect("router mutex poisoned");
            router.add(template, name)?
        };

        let shape_matches = match shape {
            RouteShape::ActorScoped => variables.len() == 1 && variables.contains("identifier"),
            RouteShape::Empty => variables.is_empty(),
            RouteShape::Object => !variables.is_empty(),
        };
        if !shape_matches {
            return Err(Error::Router(RouterError::WrongVariableSet(name.to_string())));
        }
        Ok(())
    }

    /// Register the actor route (`/users/{identifier}`) and its dispatcher.
    pub fn register_actor(&mut self, template: &str, dispatcher: ObjectDispatcher<T>) -> Result<(), Error> {
        self.add_route(template, "actor", RouteShape::ActorScoped)?;
        self.actor_dispatcher = Some(dispatcher);
        Ok(())
    }

    /// Register the personal inbox route (`/users/{identifier}/inbox`). The
    /// inbox pipeline itself is generic; no dispatcher is needed here.
    pub fn register_inbox(&mut self, template: &str) -> Result<(), Error> {
        self.add_route(template, "inbox", RouteShape::ActorScoped)
    }

    /// Register the shared inbox route (`/inbox`).
    pub fn register_shared_inbox(&mut self, template: &str) -> Result<(), Error> {
        self.add_route(template, "shared_inbox", RouteShape::Empty)
    }

    /// Register the actor key-pairs dispatcher, used both to answer actor
    /// document requests and to sign outgoing activities.
    pub fn register_actor_key_pairs(&mut self, dispatcher: KeyPairsDispatcher<T>) {
        self.key_pairs_dispatcher = Some(dispatcher);
    }

    /// Register a route serving one object type, e.g. `/objects/{object_id}`
    /// for `type_id = "note"`.
    pub fn register_object(&mut self, template: &str, type_id: &str, dispatcher: ObjectDispatcher<T>) -> Result<(), Error> {
        let route_name = format!("object:{type_id}");
        self.add_route(template, &route_name, RouteShape::Object)?;
        self.object_dispatchers.insert(route_name, dispatcher);
        Ok(())
    }

    fn register_collection(&mut self, kind: CollectionKind, route_name: &str, template: &str, callbacks: CollectionCallbacks<T>) -> Result<(), Error> {
        self.add_route(template, route_name, RouteShape::ActorScoped)?;
        self.collections.insert(kind, callbacks);
        Ok(())
    }

    /// Register the outbox collection route.
    pub fn register_outbox(&mut self, template: &str, callbacks: CollectionCallbacks<T>) -> Result<(), Error> {
        self.register_collection(CollectionKind::Outbox, "outbox", template, callbacks)
    }

    /// Register the following collection route.
    pub fn register_following(&mut self, template: &str, callbacks: CollectionCallbacks<T>) -> Result<(), Error> {
        self.register_collection(CollectionKind::Following, "following", template, callbacks)
    }

    /// Register the followers collection route.
    pub fn register_followers(&mut self, template: &str, callbacks: CollectionCallbacks<T>) -> Result<(), Error> {
        self.register_collection(CollectionKind::Followers, "followers", template, callbacks)
    }

    /// Register the liked collection route.
    pub fn register_liked(&mut self, template: &str, callbacks: CollectionCallbacks<T>) -> Result<(), Error> {
        self.register_collection(CollectionKind::Liked, "liked", template, callbacks)
    }

    /// Register the featured (pinned objects) collection route.
    pub fn register_featured(&mut self, template: &str, callbacks: CollectionCallbacks<T>) -> Result<(), Error> {
        self.register_collection(CollectionKind::Featured, "featured", template, callbacks)
    }

    /// Register the featured hashtags collection route.
    pub fn register_featured_tags(&mut self, template: &str, callbacks: CollectionCallbacks<T>) -> Result<(), Error> {
        self.register_collection(CollectionKind::FeaturedTags, "featured_tags", template, callbacks)
    }

    /// Register the NodeInfo 2.1 document route and its dispatcher, plus
    /// the `/.well-known/nodeinfo` discovery document that links to it.
    pub fn register_node_info(&mut self, template: &str, well_known_template: &str, dispatcher: NodeInfoDispatcher<T>) -> Result<(), Error> {
        self.add_route(template, "node_info", RouteShape::Empty)?;
        self.add_route(well_known_template, "node_info_jrd", RouteShape::Empty)?;
        self.node_info_dispatcher = Some(dispatcher);
        Ok(())
    }

    /// Register the `/.well-known/webfinger` route and its dispatcher,
    /// resolving an extracted account name to the actor(s) sharing it.
    pub fn register_webfinger(&mut self, template: &str, dispatcher: WebfingerDispatcher<T>) -> Result<(), Error> {
        self.add_route(template, "webfinger", RouteShape::Empty)?;
        self.webfinger_dispatcher = Some(dispatcher);
        Ok(())
    }

    /// Register a listener for `activity_type`. See [`InboxListenerSet::register`].
    pub fn register_listener(&mut self, activity_type: impl Into<String>, listener: Listener<T>) -> Result<(), Error> {
        self.listeners
            .register(activity_type, listener)
            .map_err(|err| Error::Router(RouterError::DuplicateName(err.0)))
    }

    async fn key_pairs(&self, context: &Context<T>, identifier: &str) -> Result<Vec<ActorKeyPair>, Error> {
        let dispatcher = self.key_pairs_dispatcher.as_ref().ok_or(Error::NotFound)?;
        dispatcher(context.clone(), identifier.to_string()).await
    }

    /// Resolve `identifier`'s registered key pairs, assign `#main-key`/
    /// `#key-N` ids against its actor URI, and rebuild the federated wire
    /// forms. Results are cached by identifier: keys are content-addressed
    /// by `key_id`, so a stale cache entry can only ever point at a key
    /// that's still valid, never a wrong one.
    pub async fn actor_key_pairs(&self, identifier: &str) -> Result<(Vec<RsaKeyMaterial>, Vec<Ed25519KeyMaterial>), Error> {
        if let Some(cached) = self.key_pair_cache.get(identifier).await {
            return Ok((*cached).clone());
        }

        let actor_id = self.context.actor_uri(identifier)?;
        let pairs = self.key_pairs(&self.context, identifier).await?;
        let rsa: Vec<_> = pairs.iter().filter_map(|p| p.rsa.clone()).collect();
        let ed25519: Vec<_> = pairs.iter().filter_map(|p| p.ed25519.clone()).collect();
        let rsa_keys = rsa
            .into_iter()
            .map(|m| crate::signatures::keys::RsaKeypair {
                private_key: m.private_key_pem,
                public_key: m.public_key_pem,
            })
            .collect();
        let ed_keys = ed25519
            .into_iter()
            .map(|m| crate::signatures::keys::Ed25519Keypair {
                private_key: m.private_key_pem,
                public_key: m.public_key_pem,
            })
            .collect();
        let resolved = assign_key_ids(&actor_id, rsa_keys, ed_keys);
        self.key_pair_cache.insert(identifier.to_string(), Arc::new(resolved.clone())).await;
        Ok(resolved)
    }

    /// Entry point for every incoming request: matches the route, dispatches
    /// to the inbox pipeline or a GET handler, and returns a neutral
    /// response for the HTTP adapter to translate.
    pub async fn fetch(&self, method: &Method, uri: &Url, headers: &HeaderMap, body: Bytes) -> EngineResponse {
        let matched = self.context.route_path(uri.path());
        let Some(matched) = matched else {
            return EngineResponse::status_only(StatusCode::NOT_FOUND);
        };

        if method == Method::POST && (matched.name == "inbox" || matched.name == "shared_inbox") {
            return self.handle_inbox_post(headers, method, uri, body).await;
        }

        let negotiable = matched.name != "webfinger" && matched.name != "node_info" && matched.name != "node_info_jrd";
        if negotiable && prefers_html_only(headers) {
            return EngineResponse::not_acceptable();
        }

        match self.dispatch_get(&matched.name, &matched.values, uri).await {
            Ok(response) => response,
            Err(Error::NotFound) => EngineResponse::status_only(StatusCode::NOT_FOUND),
            Err(Error::Unauthorized) => EngineResponse::status_only(StatusCode::UNAUTHORIZED),
            Err(err) => {
                warn!("error handling {uri}: {err}");
                EngineResponse::status_only(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    async fn dispatch_get(&self, route_name: &str, values: &HashMap<String, String>, uri: &Url) -> Result<EngineResponse, Error> {
        if route_name == "actor" {
            let identifier = values.get("identifier").ok_or(Error::NotFound)?;
            let dispatcher = self.actor_dispatcher.as_ref().ok_or(Error::NotFound)?;
            let actor = dispatcher(self.context.clone(), identifier.clone()).await?.ok_or(Error::NotFound)?;
            return EngineResponse::json(StatusCode::OK, &actor);
        }

        if route_name == "node_info" {
            let dispatcher = self.node_info_dispatcher.as_ref().ok_or(Error::NotFound)?;
            let node_info = dispatcher(self.context.clone()).await?;
            return EngineResponse::json(StatusCode::OK, &node_info);
        }

        if route_name == "node_info_jrd" {
            let well_known = NodeInfoWellKnown::new_2_1(self.context.node_info_uri()?);
            return EngineResponse::json(StatusCode::OK, &well_known);
        }

        if route_name == "webfinger" {
            let resource = uri.query_pairs().find(|(key, _)| key == "resource").map(|(_, value)| value.into_owned()).ok_or(Error::NotFound)?;
            let name = extract_webfinger_name(&resource, self.context.domain()).map_err(|_| Error::WebfingerResolveFailed)?;
            let dispatcher = self.webfinger_dispatcher.as_ref().ok_or(Error::NotFound)?;
            let webfinger = dispatcher(self.context.clone(), name.to_string()).await?.ok_or(Error::NotFound)?;
            return EngineResponse::json_with_type(StatusCode::OK, &webfinger, WEBFINGER_CONTENT_TYPE.to_str().unwrap_or("application/jrd+json"));
        }

        if let Some(type_id) = route_name.strip_prefix("object:") {
            let object_id = values.get("object_id").ok_or(Error::NotFound)?;
            let dispatcher = self.object_dispatchers.get(&format!("object:{type_id}")).ok_or(Error::NotFound)?;
            let object = dispatcher(self.context.clone(), object_id.clone()).await?.ok_or(Error::NotFound)?;
            return EngineResponse::json(StatusCode::OK, &object);
        }

        let kind = match route_name {
            "outbox" => CollectionKind::Outbox,
            "following" => CollectionKind::Following,
            "followers" => CollectionKind::Followers,
            "liked" => CollectionKind::Liked,
            "featured" => CollectionKind::Featured,
            "featured_tags" => CollectionKind::FeaturedTags,
            _ => return Err(Error::NotFound),
        };
        let identifier = values.get("identifier").ok_or(Error::NotFound)?;
        let callbacks = self.collections.get(&kind).ok_or(Error::NotFound)?.clone();

        if let Some(authorize) = &callbacks.authorize {
            let request_context = RequestContext::new(self.context.clone(), uri.clone());
            if !authorize(request_context).await {
                return Err(Error::Unauthorized);
            }
        }

        let cursor = uri.query_pairs().find(|(key, _)| key == "cursor").map(|(_, value)| value.into_owned());
        let mut page = (callbacks.dispatcher)(self.context.clone(), identifier.clone(), cursor.clone()).await?;

        if let Some(filter_value) = uri.query_pairs().find(|(key, _)| key == "base-url").map(|(_, value)| value.into_owned()) {
            match &callbacks.filter {
                Some(filter) => page.items.retain(|item| filter(item, &filter_value)),
                None => warn!("route '{route_name}' got a base-url filter but has no filter predicate registered; returning the full collection, which may be large"),
            }
        }

        if page.total_items.is_none() {
            if let Some(counter) = &callbacks.counter {
                page.total_items = Some(counter(self.context.clone(), identifier.clone()).await?);
            }
        }

        let response = build_collection_page(uri, cursor.as_deref(), page, callbacks.first_cursor.as_deref(), callbacks.last_cursor.as_deref());
        match response {
            CollectionResponse::Collection(collection) => EngineResponse::json(StatusCode::OK, &collection),
            CollectionResponse::Page(page) => EngineResponse::json(StatusCode::OK, &page),
        }
    }

    async fn handle_inbox_post(&self, headers: &HeaderMap, method: &Method, uri: &Url, body: Bytes) -> EngineResponse {
        let activity: Value = match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(_) => return EngineResponse::status_only(StatusCode::BAD_REQUEST),
        };

        match self.verify_inbox_request(headers, method, uri, &body, &activity).await {
            Ok(()) => {}
            Err(_) => return EngineResponse::status_only(StatusCode::UNAUTHORIZED),
        }

        let envelope: ActivityEnvelope = match serde_json::from_value(activity.clone()) {
            Ok(envelope) => envelope,
            Err(_) => return EngineResponse::status_only(StatusCode::BAD_REQUEST),
        };

        let Some(activity_id) = envelope.id.clone() else {
            return EngineResponse::status_only(StatusCode::ACCEPTED);
        };

        match self.context.has_processed_activity(&activity_id).await {
            Ok(true) => return EngineResponse::status_only(StatusCode::ACCEPTED),
            Ok(false) => {}
            Err(err) => {
                warn!("idempotence check failed for {activity_id}: {err}");
                return EngineResponse::status_only(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }

        if let Some(queue) = &self.context.config.inbox_queue {
            let queued = QueuedMessage {
                activity_id: activity_id.clone(),
                inbox: uri.clone(),
                body: body.to_vec(),
                signed_by: activity_id,
                signing_key: None,
                collection_sync: None,
            };
            if queue.enqueue(queued).await.is_err() {
                return EngineResponse::status_only(StatusCode::INTERNAL_SERVER_ERROR);
            }
            return EngineResponse::status_only(StatusCode::ACCEPTED);
        }

        match self.process_inbox_activity(envelope.kind, activity_id, activity).await {
            Ok(()) => EngineResponse::status_only(StatusCode::ACCEPTED),
            Err(err) => {
                warn!("inbox listener failed: {err}");
                EngineResponse::status_only(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    async fn verify_inbox_request(&self, headers: &HeaderMap, method: &Method, uri: &Url, body: &Bytes, activity: &Value) -> Result<(), Error> {
        if proofs::is_object_signed(activity) {
            let verification_method = activity
                .get("proof")
                .and_then(|proof| proof.get("verificationMethod"))
                .and_then(|value| value.as_str())
                .ok_or(Error::ActivitySignatureInvalid)?;
            let key_url = Url::parse(verification_method)?;
            let multikey: crate::protocol::public_key::Multikey = self.context.fetch_object(&key_url).await?;
            let public_key_pem = crate::protocol::public_key::multikey_to_public_key_pem(&multikey).map_err(Error::other)?;
            proofs::verify_object(activity.clone(), &public_key_pem).map_err(|_| Error::ActivitySignatureInvalid)?;

            let actor_ids = activity_actor_ids(activity);
            if !actor_ids.iter().any(|id| id == &multikey.controller) {
                return Err(Error::KeyOwnerMismatch);
            }
            return Ok(());
        }

        verify_body_digest(headers.get("digest"), body, self.context.config.accept_sha1_digest)?;

        let http_uri: http::Uri = uri.as_str().parse().map_err(|_| Error::ActivitySignatureInvalid)?;
        let key_id = signature_key_id(headers).ok_or(Error::ActivitySignatureInvalid)?;
        let key_url = Url::parse(&key_id)?;
        let key: CryptographicKey = self.context.fetch_object(&key_url).await?;
        verify_signature(headers.iter(), method, &http_uri, &key.public_key_pem, self.context.config.signature_time_window)?;

        let actor_ids = activity_actor_ids(activity);
        if !actor_ids.iter().any(|id| id == &key.owner) {
            return Err(Error::KeyOwnerMismatch);
        }
        Ok(())
    }

    /// Dispatch one already-verified, already-deduplicated activity to its
    /// matching listener and record it as processed on success. Used both
    /// for inline inbox handling and as the retry callback an inbox
    /// [`crate::queue::MessageQueue`] invokes per delivery attempt.
    pub async fn process_inbox_activity(&self, kind: String, activity_id: Url, activity: Value) -> anyhow::Result<()> {
        let Some(listener) = self.listeners.find(&kind) else {
            return Ok(());
        };
        let request_context = RequestContext::new(self.context.clone(), activity_id.clone());
        let inbox_context = InboxContext::new(request_context, activity);
        listener(inbox_context).await?;
        self.context.mark_activity_processed(&activity_id).await?;
        Ok(())
    }

    /// Process one message pulled off the inbox queue: parse its body back
    /// into an envelope and run the same dispatch an inline POST would.
    pub async fn process_queued_inbox_message(&self, message: QueuedMessage) -> anyhow::Result<()> {
        let activity: Value = serde_json::from_slice(&message.body)?;
        let envelope: ActivityEnvelope = serde_json::from_value(activity.clone())?;
        let activity_id = envelope.id.unwrap_or(message.activity_id);
        self.process_inbox_activity(envelope.kind, activity_id, activity).await
    }

    /// Start draining the inbox queue in the background, dispatching each
    /// message through [`Federation::process_queued_inbox_message`]. Returns
    /// `None` if no inbox queue is configured. The host must call this
    /// explicitly once the engine is wrapped in an `Arc`, since building the
    /// handler requires `&Federation` to exist.
    pub fn spawn_inbox_worker(self: &Arc<Self>) -> Option<crate::queue::Cancellation> {
        let queue = self.context.config.inbox_queue.clone()?;
        let federation = self.clone();
        let handler: crate::queue::QueueHandler = Arc::new(move |message| {
            let federation = federation.clone();
            Box::pin(async move { federation.process_queued_inbox_message(message).await })
        });
        let cancel = crate::queue::Cancellation::new();
        let listen_cancel = cancel.clone();
        tokio::spawn(async move { queue.listen(handler, listen_cancel).await });
        Some(cancel)
    }

    /// Start draining the outbox queue in the background, dispatching each
    /// message through [`Context::process_queued_outbox_message`]. Returns
    /// `None` if no outbox queue is configured.
    pub fn spawn_outbox_worker(self: &Arc<Self>) -> Option<crate::queue::Cancellation> {
        let queue = self.context.config.outbox_queue.clone()?;
        let context = self.context.clone();
        let handler: crate::queue::QueueHandler = Arc::new(move |message| {
            let context = context.clone();
            Box::pin(async move { context.process_queued_outbox_message(message).await })
        });
        let cancel = crate::queue::Cancellation::new();
        let listen_cancel = cancel.clone();
        tokio::spawn(async move { queue.listen(handler, listen_cancel).await });
        Some(cancel)
    }

    /// Expand `options.recipients` to the `Followers` collection's current
    /// members, paginating through every cursor.
    async fn resolve_followers(&self, identifier: &str) -> Result<Vec<Recipient>, Error> {
        let callbacks = self.collections.get(&CollectionKind::Followers).ok_or(Error::NotFound)?.clone();
        let mut recipients = Vec::new();
        let mut cursor = callbacks.first_cursor.clone();
        loop {
            let page = (callbacks.dispatcher)(self.context.clone(), identifier.to_string(), cursor.clone()).await?;
            recipients.extend(page.items.iter().filter_map(recipient_from_collection_item));
            match page.next_cursor {
                Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(recipients)
    }

    /// Sign and deliver `options.activity` to every resolved recipient,
    /// sending immediately or enqueuing on the outbox queue per §4.8.4.
    pub async fn send_activity(&self, mut options: SendActivityOptions) -> Result<(), Error> {
        let (rsa_keys, ed_keys) = self.actor_key_pairs(&options.sender_identifier).await?;
        if rsa_keys.is_empty() && ed_keys.is_empty() {
            return Err(Error::other(anyhow::anyhow!("sender '{}' has no registered keys", options.sender_identifier)));
        }

        if options.activity.get("id").and_then(Value::as_str).is_none() {
            let synthesized = format!("urn:uuid:{}", Uuid::new_v4());
            warn!("activity has no id, synthesizing {synthesized}");
            if let Value::Object(map) = &mut options.activity {
                map.insert("id".to_string(), Value::String(synthesized));
            }
        }

        let mut activity = options.activity;
        for key in &ed_keys {
            activity = proofs::sign_object(activity, key.multikey.id.clone(), &key.private_key_pem).map_err(Error::other)?;
        }
        if ed_keys.is_empty() {
            warn!("sending activity without an object integrity proof: no ed25519 key registered");
        }
        if let Some(key) = rsa_keys.first() {
            let signature = crate::signatures::ld_signatures::sign_object(&activity, key.cryptographic_key.id.clone(), &key.private_key_pem).map_err(Error::other)?;
            if let Value::Object(map) = &mut activity {
                map.insert("signature".to_string(), serde_json::to_value(signature)?);
            }
        } else {
            warn!("sending activity without a linked data signature: no rsa key registered");
        }

        let body = serde_json::to_vec(&activity)?;
        let sender_id = rsa_keys
            .first()
            .map(|k| k.cryptographic_key.owner.clone())
            .or_else(|| ed_keys.first().map(|k| k.multikey.controller.clone()))
            .ok_or_else(|| Error::other(anyhow::anyhow!("no signing key available")))?;
        let activity_id = activity.get("id").and_then(Value::as_str).and_then(|s| Url::parse(s).ok()).unwrap_or_else(|| sender_id.clone());

        let is_followers_expansion = matches!(options.recipients, Recipients::Followers);
        let recipients = match options.recipients {
            Recipients::Explicit(recipients) => recipients,
            Recipients::Followers => self.resolve_followers(&options.sender_identifier).await?,
        };
        let collection_sync_base = if is_followers_expansion {
            Some(self.context.followers_uri(&options.sender_identifier)?)
        } else {
            None
        };

        let signing_key = rsa_keys.first().map(|key| QueuedSigningKey {
            key_id: key.cryptographic_key.id.clone(),
            private_key_pem: key.private_key_pem.clone(),
        });

        for resolved in resolve_inboxes(recipients, options.prefer_shared_inbox, &options.exclude_base_uris) {
            let collection_sync = match (&collection_sync_base, resolved.via_shared) {
                (Some(collection_id), true) => Some(collection_sync_header(collection_id, &resolved.actor_ids)),
                _ => None,
            };
            let message = QueuedMessage {
                activity_id: activity_id.clone(),
                inbox: resolved.inbox,
                body: body.clone(),
                signed_by: sender_id.clone(),
                signing_key: signing_key.clone(),
                collection_sync,
            };
            self.context.enqueue_delivery(message, options.immediate).await?;
        }
        Ok(())
    }
}

/// Build a [`Recipient`] from one collection-dispatcher item: either a bare
/// actor-id string (trusted to double as its own inbox), or a full actor
/// object carrying `id`/`inbox`/`endpoints.sharedInbox`.
fn recipient_from_collection_item(item: &Value) -> Option<Recipient> {
    match item {
        Value::String(s) => {
            let id = Url::parse(s).ok()?;
            Some(Recipient {
                id: id.clone(),
                inbox: id,
                shared_inbox: None,
            })
        }
        Value::Object(_) => {
            let id = item.get("id").and_then(Value::as_str).and_then(|s| Url::parse(s).ok())?;
            let inbox = item.get("inbox").and_then(Value::as_str).and_then(|s| Url::parse(s).ok()).unwrap_or_else(|| id.clone());
            let shared_inbox = item
                .get("endpoints")
                .and_then(|endpoints| endpoints.get("sharedInbox"))
                .and_then(Value::as_str)
                .and_then(|s| Url::parse(s).ok());
            Some(Recipient { id, inbox, shared_inbox })
        }
        _ => None,
    }
}

/// True if `a` and `b` share scheme, host, and (explicit-or-default) port.
fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme() && a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default()
}

/// One inbox URL chosen for delivery, with the actor ids routed through it.
struct ResolvedInbox {
    inbox: Url,
    via_shared: bool,
    actor_ids: Vec<Url>,
}

/// Compute the inbox set per §4.8.4 step 5: pick each recipient's shared
/// inbox when `prefer_shared_inbox` and available, else their personal
/// inbox; de-duplicate by the chosen inbox URL; drop any inbox whose origin
/// matches `exclude_base_uris`.
fn resolve_inboxes(recipients: Vec<Recipient>, prefer_shared_inbox: bool, exclude_base_uris: &[Url]) -> Vec<ResolvedInbox> {
    let mut by_inbox: HashMap<Url, ResolvedInbox> = HashMap::new();
    for recipient in recipients {
        let (inbox, via_shared) = match (&recipient.shared_inbox, prefer_shared_inbox) {
            (Some(shared), true) => (shared.clone(), true),
            _ => (recipient.inbox.clone(), false),
        };
        if exclude_base_uris.iter().any(|base| same_origin(base, &inbox)) {
            continue;
        }
        by_inbox
            .entry(inbox.clone())
            .and_modify(|entry| entry.actor_ids.push(recipient.id.clone()))
            .or_insert_with(|| ResolvedInbox {
                inbox,
                via_shared,
                actor_ids: vec![recipient.id.clone()],
            });
    }
    by_inbox.into_values().collect()
}

/// Build the `Collection-Synchronization` header value for a shared-inbox
/// delivery: a hex SHA-256 digest of the sorted, comma-joined actor ids
/// delivered through this inbox, alongside the followers collection id.
fn collection_sync_header(collection_id: &Url, actor_ids: &[Url]) -> String {
    let mut ids: Vec<String> = actor_ids.iter().map(ToString::to_string).collect();
    ids.sort();
    let mut hasher = Sha256::new();
    hasher.update(ids.join(",").as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!(r#"collectionId="{collection_id}", digest="{digest}", url="{collection_id}""#)
}

/// Extract the `actor` field's id(s) from an activity, accepting either a
/// single string or an array of strings.
fn activity_actor_ids(activity: &Value) -> Vec<Url> {
    activity
        .get("actor")
        .map(|value| match value {
            Value::String(s) => Url::parse(s).into_iter().collect(),
            Value::Array(values) => values.iter().filter_map(Value::as_str).filter_map(|s| Url::parse(s).ok()).collect(),
            _ => Vec::new(),
        })
        .unwrap_or_default()
}

fn signature_key_id(headers: &HeaderMap) -> Option<String> {
    let signature = headers.get("signature")?.to_str().ok()?;
    signature.split(',').find_map(|part| part.trim().strip_prefix("keyId=")).map(|value| value.trim_matches('"').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn test_federation() -> Federation<()> {
        let config = FederationConfig::builder()
            .domain("example.com")
            .app_data(())
            .kv_store(Arc::new(MemoryKvStore::new()))
            .build()
            .unwrap();
        Federation::new(config)
    }

    #[test]
    fn register_actor_twice_fails() {
        let mut federation = test_federation();
        let dispatcher: ObjectDispatcher<()> = Arc::new(|_ctx, _id| Box::pin(async { Ok(None) }));
        federation.register_actor("/users/{identifier}", dispatcher.clone()).unwrap();
        assert!(federation.register_actor("/other/{identifier}", dispatcher).is_err());
    }

    #[tokio::test]
    async fn fetch_returns_not_found_for_unmatched_route() {
        let federation = test_federation();
        let uri = Url::parse("https://example.com/nowhere").unwrap();
        let response = federation.fetch(&Method::GET, &uri, &HeaderMap::new(), Bytes::new()).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn fetch_returns_not_found_when_actor_dispatcher_has_none() {
        let mut federation = test_federation();
        let dispatcher: ObjectDispatcher<()> = Arc::new(|_ctx, _id| Box::pin(async { Ok(None) }));
        federation.register_actor("/users/{identifier}", dispatcher).unwrap();
        let uri = Url::parse("https://example.com/users/alice").unwrap();
        let response = federation.fetch(&Method::GET, &uri, &HeaderMap::new(), Bytes::new()).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn fetch_returns_actor_document() {
        let mut federation = test_federation();
        let dispatcher: ObjectDispatcher<()> = Arc::new(|_ctx, id| Box::pin(async move { Ok(Some(serde_json::json!({"id": id}))) }));
        federation.register_actor("/users/{identifier}", dispatcher).unwrap();
        let uri = Url::parse("https://example.com/users/alice").unwrap();
        let response = federation.fetch(&Method::GET, &uri, &HeaderMap::new(), Bytes::new()).await;
        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn inbox_without_signature_is_rejected() {
        let mut federation = test_federation();
        federation.register_inbox("/users/{identifier}/inbox").unwrap();
        let uri = Url::parse("https://example.com/users/alice/inbox").unwrap();
        let body = Bytes::from_static(br#"{"type":"Follow","actor":"https://remote.example/users/bob"}"#);
        let response = federation.fetch(&Method::POST, &uri, &HeaderMap::new(), body).await;
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn prefers_html_only_detects_browser_accept_header() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::ACCEPT, "text/html,application/xhtml+xml,application/xml;q=0.9".parse().unwrap());
        assert!(prefers_html_only(&headers));
    }

    #[test]
    fn prefers_html_only_false_when_json_ld_is_acceptable() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::ACCEPT, "text/html,application/activity+json".parse().unwrap());
        assert!(!prefers_html_only(&headers));

        let mut wildcard = HeaderMap::new();
        wildcard.insert(http::header::ACCEPT, "*/*".parse().unwrap());
        assert!(!prefers_html_only(&wildcard));

        assert!(!prefers_html_only(&HeaderMap::new()));
    }

    #[tokio::test]
    async fn fetch_returns_not_acceptable_for_html_only_actor_request() {
        let mut federation = test_federation();
        let dispatcher: ObjectDispatcher<()> = Arc::new(|_ctx, id| Box::pin(async move { Ok(Some(serde_json::json!({"id": id}))) }));
        federation.register_actor("/users/{identifier}", dispatcher).unwrap();
        let uri = Url::parse("https://example.com/users/alice").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(http::header::ACCEPT, "text/html".parse().unwrap());
        let response = federation.fetch(&Method::GET, &uri, &headers, Bytes::new()).await;
        assert_eq!(response.status, StatusCode::NOT_ACCEPTABLE);
        assert_eq!(response.vary, Some("Accept, Signature"));
    }
}
