//! Request ID generation and propagation.

use axum::{
    extract::Request,
    http::{header::HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

type MiddlewareFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

type MiddlewareFn = fn(Request, Next) -> MiddlewareFuture;

/// The layer returned by [`request_id_layer`].
pub type MiddlewareLayer = axum::middleware::FromFnLayer<MiddlewareFn, (), (Request,)>;

/// Request ID, available to handlers as a request extension.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Tags every request with an ID (taken from `x-request-id` or generated),
/// runs it inside a `request` span and echoes the ID in the response.
pub fn request_id_layer() -> MiddlewareLayer {
    axum::middleware::from_fn(request_id_middleware_fn as MiddlewareFn)
}

fn request_id_middleware_fn(mut request: Request, next: Next) -> MiddlewareFuture {
    Box::pin(async move {
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let span = tracing::info_span!(
            "request",
            request_id = %request_id,
            method = %request.method(),
            uri = %request.uri(),
        );

        request
            .extensions_mut()
            .insert(RequestId(request_id.clone()));

        let start = Instant::now();
        let mut response = next.run(request).instrument(span.clone()).await;

        span.in_scope(|| {
            tracing::debug!(
                status = response.status().as_u16(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Request completed"
            );
        });

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
        }

        response
    })
}
