//! Utilities for serving a [`Federation`] engine behind an axum router.
//!
//! Because [`Federation::fetch`] is a single entry point that already knows
//! how to route GETs and POSTs alike, there is no per-activity extractor to
//! write: register [`serve`] as a fallback (or against each federation
//! route) and let the engine do the rest.
//!
//! ```ignore
//! let app: axum::Router = axum::Router::new()
//!     .fallback(fedikit::axum::serve::<MyData>)
//!     .with_state(federation);
//! ```

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use url::Url;

use crate::federation::Federation;

/// Maximum request body accepted before an incoming request is rejected,
/// mirroring [`crate::config::FederationConfig::http_fetch_limit`]'s spirit
/// for inbound rather than outbound traffic.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Serve `request` through `federation`'s [`Federation::fetch`], translating
/// its neutral [`crate::federation::EngineResponse`] into an axum
/// [`Response`].
pub async fn serve<T>(State(federation): State<Arc<Federation<T>>>, request: Request<Body>) -> Response
where
    T: Clone + Send + Sync + 'static,
{
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let Some(uri) = request_url(&parts, federation.context().domain()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let response = federation.fetch(&parts.method, &uri, &parts.headers, body).await;
    let mut builder = Response::builder().status(response.status);
    if let Some(content_type) = response.content_type {
        builder = builder.header(http::header::CONTENT_TYPE, content_type);
    }
    if let Some(vary) = response.vary {
        builder = builder.header(http::header::VARY, vary);
    }
    builder.body(Body::from(response.body)).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn request_url(parts: &http::request::Parts, domain: &str) -> Option<Url> {
    let host = parts.headers.get(http::header::HOST).and_then(|value| value.to_str().ok()).unwrap_or(domain);
    let scheme = if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
        "http"
    } else {
        "https"
    };
    Url::parse(&format!("{scheme}://{host}{}", parts.uri)).ok()
}
