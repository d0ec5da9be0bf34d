//! Response headers added by the proxy and request headers it drops.

use hyper::header::{HeaderName, HeaderValue};
use hyper::HeaderMap;

/// Set on responses served from a mock.
pub static X_MOCKWIRE_MOCKED: HeaderName = HeaderName::from_static("x-mockwire-mocked");
/// Request id under which history and responses were recorded.
pub static X_MOCKWIRE_REQUEST_ID: HeaderName = HeaderName::from_static("x-mockwire-request-id");

pub static VALUE_TRUE: HeaderValue = HeaderValue::from_static("true");

/// Connection-scoped headers that must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Copy of `headers` without hop-by-hop headers and `host`.
pub fn forwardable(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name) && *name != hyper::header::HOST)
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Tag a response with the request id. Invalid ids are skipped.
pub fn set_request_id(headers: &mut HeaderMap, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_MOCKWIRE_REQUEST_ID.clone(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwardable_drops_hop_by_hop_and_host() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("api.example.com"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("connection", HeaderValue::from_static("close"));
        headers.insert("accept", HeaderValue::from_static("application/json"));

        let forwarded = forwardable(&headers);
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded.get("accept").unwrap(), "application/json");
    }

    #[test]
    fn test_set_request_id() {
        let mut headers = HeaderMap::new();
        set_request_id(&mut headers, "abc-123");
        assert_eq!(headers.get(&X_MOCKWIRE_REQUEST_ID).unwrap(), "abc-123");

        let mut headers = HeaderMap::new();
        set_request_id(&mut headers, "bad\nvalue");
        assert!(headers.is_empty());
    }
}
