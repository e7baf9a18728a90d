//! Utilities for serving a [`Federation`] engine behind an actix-web app.
//!
//! Because [`Federation::fetch`] is a single entry point that already knows
//! how to route GETs and POSTs alike, there is no per-activity extractor to
//! write: register [`serve`] as the default service and let the engine do
//! the rest.
//!
//! ```ignore
//! App::new()
//!     .app_data(web::Data::new(federation.clone()))
//!     .default_service(web::route().to(fedikit::actix_web::serve::<MyData>))
//! ```

mod http_compat;

use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};

use crate::federation::Federation;

/// Serve `request` through `federation`'s [`Federation::fetch`], translating
/// its neutral [`crate::federation::EngineResponse`] into an actix-web
/// [`HttpResponse`].
pub async fn serve<T>(federation: web::Data<Arc<Federation<T>>>, request: HttpRequest, body: web::Bytes) -> HttpResponse
where
    T: Clone + Send + Sync + 'static,
{
    let Some(uri) = request_url(&request, federation.context().domain()) else {
        return HttpResponse::BadRequest().finish();
    };
    let headers = http_compat::header_map(request.headers());
    let method = http_compat::method(request.method());

    let response = federation.fetch(&method, &uri, &headers, body.into()).await;
    let status = actix_web::http::StatusCode::from_u16(response.status.as_u16()).unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = HttpResponse::build(status);
    if let Some(content_type) = response.content_type {
        builder.content_type(content_type);
    }
    if let Some(vary) = response.vary {
        builder.insert_header(("Vary", vary));
    }
    builder.body(response.body)
}

fn request_url(request: &HttpRequest, domain: &str) -> Option<url::Url> {
    let host = request.headers().get(actix_web::http::header::HOST).and_then(|value| value.to_str().ok()).unwrap_or(domain);
    let scheme = request.connection_info().scheme().to_string();
    url::Url::parse(&format!("{scheme}://{host}{}", request.uri())).ok()
}
