//! Intercepted request with its derived identity.

use crate::body::{BodyClassifier, ParsedBody};
use crate::feature_id::FeatureIdResolver;
use crate::model::HistoryRecord;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use hyper::header::HOST;
use hyper::{HeaderMap, Method, Uri};
use std::collections::BTreeMap;

/// A buffered request as seen by the dispatch pipeline.
///
/// The feature ID and API ID are computed once at construction so every
/// stage of the pipeline sees the same identity.
#[derive(Debug, Clone)]
pub struct MsRequest {
    request_id: String,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    host: String,
    api_id: String,
    feature_id: String,
    path_params: BTreeMap<String, String>,
}

impl MsRequest {
    pub fn new(
        request_id: impl Into<String>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        resolver: &FeatureIdResolver,
    ) -> Self {
        let host = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| {
                headers
                    .get(HOST)
                    .and_then(|h| h.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();

        let api_id = resolver.resolve_api_id(&host);
        let feature_id = resolver.resolve_feature_id(&host, method.as_str(), uri.path());

        Self {
            request_id: request_id.into(),
            method,
            uri,
            headers,
            body,
            host,
            api_id,
            feature_id,
            path_params: BTreeMap::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn raw_body(&self) -> &Bytes {
        &self.body
    }

    /// Authority as written in the request, port included.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn api_id(&self) -> &str {
        &self.api_id
    }

    pub fn feature_id(&self) -> &str {
        &self.feature_id
    }

    /// Absolute URL of the request.
    pub fn url(&self) -> String {
        if self.uri.scheme().is_some() {
            return self.uri.to_string();
        }
        let path_and_query = self
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("http://{}{}", self.host, path_and_query)
    }

    /// Query parameters; a repeated key keeps its last value.
    pub fn query_params(&self) -> BTreeMap<String, String> {
        parse_query_string(self.uri.query())
    }

    pub fn path_params(&self) -> &BTreeMap<String, String> {
        &self.path_params
    }

    pub fn set_path_params(&mut self, params: BTreeMap<String, String>) {
        self.path_params = params;
    }

    pub fn body(&self, classifier: &BodyClassifier) -> ParsedBody {
        classifier.classify_bytes(&self.headers, &self.body)
    }

    pub fn to_history_record(&self, classifier: &BodyClassifier) -> HistoryRecord {
        HistoryRecord {
            api_id: self.api_id.clone(),
            feature_id: self.feature_id.clone(),
            path: self.path().to_string(),
            method: self.method.to_string(),
            date: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            request_id: self.request_id.clone(),
            body: self.body(classifier).value(),
            // Every intercepted request is recorded as the first attempt
            order: 1,
        }
    }
}

/// Parse a form-encoded query string (`+` is a space).
pub fn parse_query_string(query: Option<&str>) -> BTreeMap<String, String> {
    let decode = |s: &str| {
        let spaced = s.replace('+', " ");
        urlencoding::decode(&spaced)
            .map(|d| d.into_owned())
            .unwrap_or(spaced)
    };

    let mut params = BTreeMap::new();
    if let Some(q) = query {
        for pair in q.split('&').filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some((key, value)) => params.insert(decode(key), decode(value)),
                None => params.insert(decode(pair), String::new()),
            };
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::BodyType;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use serde_json::json;

    fn request(method: Method, uri: &str, body: &'static [u8]) -> MsRequest {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        MsRequest::new(
            "req-1",
            method,
            uri.parse().unwrap(),
            headers,
            Bytes::from_static(body),
            &FeatureIdResolver::default(),
        )
    }

    #[test]
    fn test_identity_from_absolute_uri() {
        let req = request(Method::POST, "https://API.example.com:8443/v1/users/?a=1", b"");
        assert_eq!(req.host(), "API.example.com:8443");
        assert_eq!(req.api_id(), "api.example.com:8443");
        assert_eq!(req.feature_id(), "CREATE-api.example.com:8443-v1-users");
        assert_eq!(req.path(), "/v1/users/");
    }

    #[test]
    fn test_identity_from_host_header() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("b.com"));
        let req = MsRequest::new(
            "r",
            Method::GET,
            "/items".parse().unwrap(),
            headers,
            Bytes::new(),
            &FeatureIdResolver::default(),
        );
        assert_eq!(req.feature_id(), "GET-b.com-items");
        assert_eq!(req.url(), "http://b.com/items");
    }

    #[test]
    fn test_query_params_decoded() {
        let req = request(Method::GET, "http://a.com/s?q=hello+world&x=%2F&x=last&flag", b"");
        let params = req.query_params();
        assert_eq!(params["q"], "hello world");
        assert_eq!(params["x"], "last");
        assert_eq!(params["flag"], "");
    }

    #[test]
    fn test_history_record() {
        let req = request(Method::PUT, "http://a.com/items/1", br#"{"n":1}"#);
        let record = req.to_history_record(&BodyClassifier::default());

        assert_eq!(record.feature_id, "UPDATE-a.com-items-1");
        assert_eq!(record.method, "PUT");
        assert_eq!(record.path, "/items/1");
        assert_eq!(record.request_id, "req-1");
        assert_eq!(record.body, json!({"n": 1}));
        assert_eq!(record.order, 1);
        assert!(record.date.ends_with('Z'));
    }

    #[test]
    fn test_body_classified_on_demand() {
        let req = request(Method::GET, "http://a.com/", b"");
        assert_eq!(req.body(&BodyClassifier::default()).body_type, BodyType::NoBody);
    }
}
