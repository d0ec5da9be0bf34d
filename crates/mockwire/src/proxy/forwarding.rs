//! Forwarding of non-mocked requests to their real target.

use super::client::HttpClient;
use super::headers::{forwardable, is_hop_by_hop};
use crate::handlers::HttpResponse;
use crate::request::MsRequest;
use anyhow::Context;
use http_body_util::{BodyExt, Full, Limited};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{HeaderMap, Request, StatusCode};
use serde_json::json;
use tracing::debug;

/// JSON error response produced by the proxy itself.
pub fn error_response(status: StatusCode, message: &str) -> HttpResponse {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    HttpResponse::new(
        status,
        headers,
        json!({ "error": message }).to_string().into(),
    )
}

/// Send the buffered request to its absolute target and buffer the answer.
/// An upstream body longer than `body_limit` bytes is an error.
pub async fn forward_request(
    http_client: &HttpClient,
    request: &MsRequest,
    body_limit: usize,
) -> Result<HttpResponse, anyhow::Error> {
    debug!("Forwarding {} {}", request.method(), request.uri());

    let mut upstream_req = Request::builder()
        .method(request.method().clone())
        .uri(request.uri().clone())
        .body(Full::new(request.raw_body().clone()))
        .context("Failed to build upstream request")?;
    *upstream_req.headers_mut() = forwardable(request.headers());

    let upstream_response = http_client
        .request(upstream_req)
        .await
        .with_context(|| format!("Failed to reach {}", request.uri()))?;

    let (parts, body) = upstream_response.into_parts();
    let body = Limited::new(body, body_limit)
        .collect()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read upstream response from {}: {}", request.uri(), e))?
        .to_bytes();

    let headers = parts
        .headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    Ok(HttpResponse::new(parts.status, headers, body))
}
