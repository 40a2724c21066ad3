//! Smart HTTP handlers.
//!
//! | Method | Path | Operation |
//! |--------|------|-----------|
//! | GET | `/{owner}/{repo}.git/info/refs?service=...` | Reference discovery |
//! | POST | `/{owner}/{repo}.git/git-upload-pack` | Fetch negotiation |
//! | POST | `/{owner}/{repo}.git/git-receive-pack` | Push |
//!
//! Routes accept every method so the handlers can answer a wrong method with
//! 400. Method, query, service, authentication and content type are all
//! checked before any store work starts.

use crate::error::ApiError;
use crate::observability::request_id_layer;
use crate::server::Server;
use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, RawQuery, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::Response,
    routing::any,
    Router,
};
use bytes::Buf;
use flate2::read::GzDecoder;
use ghb_git::{
    AdvertisedRefs, Deadline, GitError, ReferenceUpdateRequest, Service, UploadPackRequest,
};
use std::io::Read;
use tower_http::trace::TraceLayer;

/// The three smart HTTP routes bound to `server`.
pub(crate) fn routes<S>(server: Server) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route(&server.path_info_refs(), any(git_info_refs))
        .route(&server.path_upload_pack(), any(git_upload_pack))
        .route(&server.path_receive_pack(), any(git_receive_pack))
        // Pushes routinely exceed the default body limit.
        .layer(DefaultBodyLimit::disable())
        .with_state(server)
}

/// Creates the full router with tracing and request IDs.
pub(crate) fn create_router(server: Server) -> Router {
    routes(server)
        .layer(TraceLayer::new_for_http())
        .layer(request_id_layer())
}

/// Reference discovery.
async fn git_info_refs(
    State(server): State<Server>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if method != Method::GET {
        return Err(ApiError::MethodNotAllowed(method));
    }
    let service = parse_service_query(query.as_deref())?;
    authorize(&server, &headers)?;

    let store = server.store();
    let output = run_blocking(&server, service, move |_deadline| {
        let refs = AdvertisedRefs::build(store.as_ref(), service)?;
        tracing::info!(
            service = %service,
            refs = refs.references.len(),
            empty = refs.is_empty(),
            "Advertised references"
        );
        let mut output = Vec::new();
        refs.encode(&mut output, Some(service))?;
        Ok(output)
    })
    .await?;

    git_response(service.advertisement_content_type(), output)
}

/// Fetch negotiation.
async fn git_upload_pack(
    State(server): State<Server>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let service = Service::UploadPack;
    check_rpc(&server, service, &method, &headers)?;

    let store = server.store();
    let gzip = is_gzip(&headers);
    let output = run_blocking(&server, service, move |deadline| {
        let request = UploadPackRequest::decode(request_body(body, gzip))?;
        let response = ghb_git::upload_pack(store.as_ref(), &request, deadline)?;
        tracing::info!(
            wants = request.wants.len(),
            haves = request.haves.len(),
            depth = ?request.depth,
            done = request.done,
            ack = response.common.is_some(),
            objects = response.object_count,
            "Served upload-pack"
        );
        let mut output = Vec::new();
        response.encode(&mut output)?;
        Ok(output)
    })
    .await?;

    git_response(service.result_content_type(), output)
}

/// Push.
async fn git_receive_pack(
    State(server): State<Server>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let service = Service::ReceivePack;
    check_rpc(&server, service, &method, &headers)?;

    let store = server.store();
    let gzip = is_gzip(&headers);
    let output = run_blocking(&server, service, move |deadline| {
        let request = ReferenceUpdateRequest::decode(request_body(body, gzip))?;
        let response = ghb_git::receive_pack(store.as_ref(), &request, deadline)?;
        tracing::info!(
            commands = request.commands.len(),
            pack_bytes = request.pack.len(),
            success = response.is_success(),
            "Applied receive-pack"
        );
        for status in &response.statuses {
            tracing::debug!(ref_name = %status.ref_name, status = ?status.status, "Reference status");
        }
        let mut output = Vec::new();
        response.encode(&mut output)?;
        Ok(output)
    })
    .await?;

    git_response(service.result_content_type(), output)
}

/// `info/refs` takes exactly one parameter, `service`.
fn parse_service_query(query: Option<&str>) -> Result<Service, ApiError> {
    let params: Vec<&str> = query
        .unwrap_or_default()
        .split('&')
        .filter(|p| !p.is_empty())
        .collect();
    if params.len() != 1 {
        return Err(ApiError::BadRequest(format!(
            "expected exactly one query parameter, got {}",
            params.len()
        )));
    }

    let (key, value) = params[0].split_once('=').unwrap_or((params[0], ""));
    let name = if key == "service" { value } else { "" };
    Service::parse(name).ok_or_else(|| ApiError::Forbidden(name.to_string()))
}

fn authorize(server: &Server, headers: &HeaderMap) -> Result<(), ApiError> {
    if server.options().auth.authorize(headers) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

fn check_rpc(
    server: &Server,
    service: Service,
    method: &Method,
    headers: &HeaderMap,
) -> Result<(), ApiError> {
    if method != Method::POST {
        return Err(ApiError::MethodNotAllowed(method.clone()));
    }
    authorize(server, headers)?;

    let expected = service.request_content_type();
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    if content_type != Some(expected) {
        return Err(ApiError::InvalidContentType { expected });
    }
    Ok(())
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("gzip") || v.eq_ignore_ascii_case("x-gzip"))
        .unwrap_or(false)
}

/// Git compresses large fetch requests; decode transparently.
fn request_body(body: Bytes, gzip: bool) -> Box<dyn Read + Send> {
    if gzip {
        Box::new(GzDecoder::new(body.reader()))
    } else {
        Box::new(body.reader())
    }
}

/// Runs protocol work on the blocking pool, bounded by the session timeout.
///
/// The engine sees the same bound as a [`Deadline`] and stops at its next
/// checkpoint; the outer timeout answers the client even if it does not.
async fn run_blocking<F>(server: &Server, service: Service, work: F) -> Result<Vec<u8>, ApiError>
where
    F: FnOnce(&Deadline) -> ghb_git::Result<Vec<u8>> + Send + 'static,
{
    let timeout = server.options().session_timeout;
    let deadline = Deadline::after(timeout);
    let span = tracing::Span::current();
    let task = tokio::task::spawn_blocking(move || span.in_scope(|| work(&deadline)));

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result.map_err(ApiError::from),
        Ok(Err(e)) => Err(ApiError::Internal(format!("{} task failed: {}", service, e))),
        Err(_) => {
            tracing::warn!(service = %service, timeout_secs = timeout.as_secs(), "Session timed out");
            Err(ApiError::Git(GitError::Timeout))
        }
    }
}

fn git_response(content_type: &'static str, output: Vec<u8>) -> Result<Response, ApiError> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(output))
        .map_err(|e| ApiError::Internal(e.to_string()))
}
