//! Process-wide federation configuration
//!
//! Use [`FederationConfig::builder`] to construct one. A `FederationConfig`
//! is built once per process and shared (behind an `Arc`, via [`Context`])
//! across every request; it owns the pluggable stores, HTTP client,
//! signature policy, and — once [`FederationConfigBuilder::build`] runs —
//! the registration tables and outbox queue.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use derive_builder::Builder;
use dyn_clone::{clone_trait_object, DynClone};
use reqwest_middleware::ClientWithMiddleware;
use url::Url;

use crate::error::Error;
use crate::kv::KvStore;
use crate::queue::MessageQueue;
use crate::retry::RetryPolicy;
use crate::router::{Router, TrailingSlash};

/// Handler for validating URLs, called on activity ids, fetch targets, and
/// inbox URLs before the engine touches them.
///
/// ```
/// # use async_trait::async_trait;
/// # use url::Url;
/// # use fedikit::config::UrlVerifier;
/// #[derive(Clone)]
/// struct Blocklist(Vec<String>);
///
/// #[async_trait]
/// impl UrlVerifier for Blocklist {
///     async fn verify(&self, url: &Url) -> Result<(), &'static str> {
///         match url.domain() {
///             Some(domain) if self.0.iter().any(|b| b == domain) => Err("domain is blocked"),
///             _ => Ok(()),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait UrlVerifier: DynClone + Send + Sync {
    /// Return `Ok(())` if `url` may be fetched from or delivered to.
    async fn verify(&self, url: &Url) -> Result<(), &'static str>;
}

clone_trait_object!(UrlVerifier);

#[derive(Clone)]
struct DefaultUrlVerifier;

#[async_trait]
impl UrlVerifier for DefaultUrlVerifier {
    async fn verify(&self, _url: &Url) -> Result<(), &'static str> {
        Ok(())
    }
}

/// Process-wide federation configuration, parameterized by `T`, the host
/// application data (database pool, settings, ...) handlers need.
#[derive(Builder)]
#[builder(build_fn(private, name = "partial_build"))]
pub struct FederationConfig<T: Clone> {
    /// The domain this instance serves federation traffic for.
    #[builder(setter(into))]
    pub(crate) domain: String,
    /// Arbitrary application state handlers receive via [`Context::app_data`].
    pub(crate) app_data: T,
    /// Backing store for idempotence records, key caches, and context caches.
    pub(crate) kv_store: Arc<dyn KvStore>,
    /// Outgoing delivery queue. `None` sends every activity inline, which is
    /// convenient for tests but blocks the caller on every remote inbox.
    #[builder(default = "None")]
    pub(crate) outbox_queue: Option<Arc<dyn MessageQueue>>,
    /// Incoming activity processing queue. `None` runs listeners inline
    /// during the POST request; failures then become `500`.
    #[builder(default = "None")]
    pub(crate) inbox_queue: Option<Arc<dyn MessageQueue>>,
    /// Retry policy applied to outbox deliveries.
    #[builder(default)]
    pub(crate) outbox_retry_policy: RetryPolicy,
    /// Retry policy applied to inbox listener failures.
    #[builder(default)]
    pub(crate) inbox_retry_policy: RetryPolicy,
    /// Maximum outgoing HTTP requests triggered while handling one incoming
    /// request, guarding against recursive-fetch denial of service.
    #[builder(default = "20")]
    pub(crate) http_fetch_limit: u32,
    /// HTTP client used for outgoing requests. Attach middleware here for
    /// tracing or retries.
    #[builder(default = "reqwest::Client::default().into()")]
    pub(crate) client: ClientWithMiddleware,
    /// Number of concurrent outbox delivery workers.
    #[builder(default = "64")]
    pub(crate) worker_count: usize,
    /// Allow `http://` and `localhost` URLs and send outgoing activities
    /// inline. Never set this in production.
    #[builder(default = "false")]
    pub(crate) debug: bool,
    /// Timeout applied to every outgoing HTTP request.
    #[builder(default = "Duration::from_secs(10)")]
    pub(crate) request_timeout: Duration,
    /// Acceptable clock skew for incoming HTTP Signature `Date` headers.
    /// `None` disables the check entirely.
    #[builder(default = "Some(Duration::from_secs(3600))")]
    pub(crate) signature_time_window: Option<Duration>,
    /// Accept SHA-1 `Digest` headers on incoming requests, for
    /// interoperability with older software. Never emitted by this crate.
    #[builder(default = "false")]
    pub(crate) accept_sha1_digest: bool,
    /// `User-Agent` sent with outgoing requests.
    #[builder(default = "format!(\"fedikit/{}\", env!(\"CARGO_PKG_VERSION\"))")]
    pub(crate) user_agent: String,
    /// Whether `/x` and `/x/` are treated as the same route.
    #[builder(default = "TrailingSlash::Insensitive")]
    pub(crate) trailing_slash: TrailingSlash,
    /// Called with URL-verification failures for activity ids, fetch
    /// targets, and inbox URLs.
    #[builder(default = "Box::new(DefaultUrlVerifier)")]
    pub(crate) url_verifier: Box<dyn UrlVerifier>,
    #[builder(setter(skip), default = "Arc::new(std::sync::Mutex::new(Router::new(TrailingSlash::Insensitive)))")]
    pub(crate) router: Arc<std::sync::Mutex<Router>>,
}

impl<T: Clone> FederationConfig<T> {
    /// Start building a new configuration.
    pub fn builder() -> FederationConfigBuilder<T> {
        FederationConfigBuilder::default()
    }

    /// True if `url`'s host (and port) matches this instance's configured
    /// domain.
    pub(crate) fn is_local_url(&self, url: &Url) -> bool {
        let mut host = match url.host_str() {
            Some(host) => host.to_string(),
            None => return false,
        };
        if let Some(port) = url.port() {
            host = format!("{host}:{port}");
        }
        host == self.domain
    }

    /// Run the configured [`UrlVerifier`] plus the engine's own baseline
    /// scheme/domain checks against `url`.
    pub(crate) async fn verify_url_valid(&self, url: &Url) -> Result<(), Error> {
        match url.scheme() {
            "https" => {}
            "http" if self.debug => {}
            "http" => return Err(Error::UrlVerificationError("http urls are only allowed in debug mode")),
            _ => return Err(Error::UrlVerificationError("invalid url scheme")),
        }
        if self.is_local_url(url) {
            return Ok(());
        }
        if url.domain().is_none() {
            return Err(Error::UrlVerificationError("url must have a domain"));
        }
        if url.domain() == Some("localhost") && !self.debug {
            return Err(Error::UrlVerificationError("localhost is only allowed in debug mode"));
        }
        self.url_verifier.verify(url).await.map_err(Error::UrlVerificationError)
    }
}

impl<T: Clone> FederationConfigBuilder<T> {
    /// Finish building, wiring up the router's frozen state. Registration
    /// methods on [`crate::federation::Federation`] must run before the
    /// first call to `fetch`; this crate does not enforce that at runtime,
    /// matching the looser invariant in the data model.
    pub fn build(&mut self) -> Result<FederationConfig<T>, FederationConfigBuilderError> {
        let mut config = self.partial_build()?;
        config.router = Arc::new(std::sync::Mutex::new(Router::new(config.trailing_slash)));
        Ok(config)
    }
}

impl<T: Clone> Deref for FederationConfig<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.app_data
    }
}
