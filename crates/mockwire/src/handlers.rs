//! Default handlers: statically registered responses consulted when no
//! custom mock serves a request.
//!
//! ```ignore
//! let handlers = DefaultHandlers::new();
//! HttpSetup::new(&handlers, &resolver, "https://api.example.com")
//!     .get("/users/:id", Responder::json(json!({"id": "{{requestParams.id}}"})), None);
//! ```

use crate::body::BodyClassifier;
use crate::error::DispatchError;
use crate::feature_id::FeatureIdResolver;
use crate::model::ResponseInit;
use crate::request::MsRequest;
use crate::template::{apply_json_backing, JsonBacking};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{HeaderMap, Method, Response, StatusCode};
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// A fully rendered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub status_text: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            status_text: None,
            headers,
            body,
        }
    }

    /// JSON response with `application/json` unless `init` sets a content type.
    pub fn json(body: &Value, init: Option<&ResponseInit>) -> Result<Self, DispatchError> {
        let bytes = serde_json::to_vec(body)?;
        Self::with_init(Bytes::from(bytes), "application/json", init)
    }

    pub fn text(body: impl Into<String>, init: Option<&ResponseInit>) -> Result<Self, DispatchError> {
        Self::with_init(Bytes::from(body.into()), "text/plain;charset=UTF-8", init)
    }

    fn with_init(
        body: Bytes,
        content_type: &'static str,
        init: Option<&ResponseInit>,
    ) -> Result<Self, DispatchError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));

        let mut status = StatusCode::OK;
        let mut status_text = None;
        if let Some(init) = init {
            if let Some(code) = init.status {
                status = StatusCode::from_u16(code).map_err(hyper::http::Error::from)?;
            }
            status_text = init.status_text.clone();
            for (name, value) in &init.headers {
                let name = HeaderName::from_bytes(name.as_bytes()).map_err(hyper::http::Error::from)?;
                let value = HeaderValue::from_str(value).map_err(hyper::http::Error::from)?;
                headers.insert(name, value);
            }
        }

        Ok(Self {
            status,
            status_text,
            headers,
            body,
        })
    }

    /// Explicit status text, else the canonical reason phrase.
    pub fn status_text(&self) -> String {
        self.status_text
            .clone()
            .or_else(|| self.status.canonical_reason().map(str::to_string))
            .unwrap_or_default()
    }

    pub fn into_hyper(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

#[derive(Debug, Clone)]
enum MockResponseKind {
    Json { body: Value, defaults: JsonBacking },
    Text(String),
}

/// Static response definition rendered per request.
#[derive(Debug, Clone)]
pub struct MockResponse {
    kind: MockResponseKind,
    init: Option<ResponseInit>,
}

impl MockResponse {
    /// JSON body rendered through the request template.
    pub fn json(body: Value, init: Option<ResponseInit>, defaults: Option<JsonBacking>) -> Self {
        Self {
            kind: MockResponseKind::Json {
                body,
                defaults: defaults.unwrap_or_default(),
            },
            init,
        }
    }

    /// Text body returned verbatim.
    pub fn text(body: impl Into<String>, init: Option<ResponseInit>) -> Self {
        Self {
            kind: MockResponseKind::Text(body.into()),
            init,
        }
    }

    pub fn init(&self) -> Option<&ResponseInit> {
        self.init.as_ref()
    }

    /// The unrendered body, for listings.
    pub fn original_body(&self) -> Value {
        match &self.kind {
            MockResponseKind::Json { body, .. } => body.clone(),
            MockResponseKind::Text(text) => Value::String(text.clone()),
        }
    }

    pub fn respond(
        &self,
        request: &MsRequest,
        classifier: &BodyClassifier,
    ) -> Result<HttpResponse, DispatchError> {
        match &self.kind {
            MockResponseKind::Json { body, defaults } => {
                let rendered = apply_json_backing(body, json_backing(request, classifier), defaults);
                HttpResponse::json(&rendered, self.init.as_ref())
            }
            MockResponseKind::Text(text) => HttpResponse::text(text.clone(), self.init.as_ref()),
        }
    }
}

/// Template backing built from the decoded request.
pub fn json_backing(request: &MsRequest, classifier: &BodyClassifier) -> JsonBacking {
    let to_object = |map: &BTreeMap<String, String>| {
        Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    };
    JsonBacking {
        request_body: request.body(classifier).value(),
        request_query: to_object(&request.query_params()),
        request_params: to_object(request.path_params()),
    }
}

pub type ResolverFn =
    Arc<dyn Fn(MsRequest) -> BoxFuture<'static, Result<HttpResponse, DispatchError>> + Send + Sync>;

/// How a default handler produces its response, chosen at registration.
#[derive(Clone)]
pub enum Responder {
    Static(MockResponse),
    Resolver(ResolverFn),
}

impl Responder {
    pub fn json(body: Value) -> Self {
        Responder::Static(MockResponse::json(body, None, None))
    }

    pub fn text(body: impl Into<String>) -> Self {
        Responder::Static(MockResponse::text(body, None))
    }

    pub fn resolver<F, Fut>(f: F) -> Self
    where
        F: Fn(MsRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse, DispatchError>> + Send + 'static,
    {
        Responder::Resolver(Arc::new(move |req| f(req).boxed()))
    }

    pub async fn respond(
        &self,
        request: MsRequest,
        classifier: &BodyClassifier,
    ) -> Result<HttpResponse, DispatchError> {
        match self {
            Responder::Static(response) => response.respond(&request, classifier),
            Responder::Resolver(resolver) => resolver(request).await,
        }
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Responder::Static(response) => f.debug_tuple("Static").field(response).finish(),
            Responder::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// Short human readable description shown in listings
    pub description: Option<String>,
}

/// URL pattern with `:param` segments and `*` wildcards.
///
/// Patterns starting with `/` match the request path; anything else matches
/// `scheme://authority/path`. The query string is ignored and a trailing
/// slash is optional.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    source: String,
    regex: Option<Regex>,
    params: Vec<String>,
}

impl UrlPattern {
    pub fn parse(source: &str) -> Self {
        let trimmed = source.trim_end_matches('/');
        let mut expr = String::from("^");
        let mut params = Vec::new();
        let mut chars = trimmed.chars().peekable();
        let mut literal = String::new();

        while let Some(c) = chars.next() {
            match c {
                // Port numbers (":8080") and the scheme separator stay literal
                ':' if chars.peek().map(|n| n.is_ascii_alphabetic() || *n == '_').unwrap_or(false) => {
                    expr.push_str(&regex::escape(&literal));
                    literal.clear();
                    let mut name = String::new();
                    while let Some(n) = chars.peek() {
                        if n.is_ascii_alphanumeric() || *n == '_' {
                            name.push(*n);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    params.push(name);
                    expr.push_str("([^/]+)");
                }
                '*' => {
                    expr.push_str(&regex::escape(&literal));
                    literal.clear();
                    expr.push_str(".*");
                }
                other => literal.push(other),
            }
        }
        expr.push_str(&regex::escape(&literal));
        expr.push_str("/?$");

        let regex = match Regex::new(&expr) {
            Ok(regex) => Some(regex),
            Err(e) => {
                tracing::warn!("URL pattern '{}' cannot be compiled and will never match: {}", source, e);
                None
            }
        };

        Self {
            source: source.to_string(),
            regex,
            params,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Path parameters when `request` matches.
    pub fn matches(&self, request: &MsRequest) -> Option<BTreeMap<String, String>> {
        let regex = self.regex.as_ref()?;
        let target = if self.source.starts_with('/') {
            request.path().to_string()
        } else {
            let url = request.url();
            match url.split_once('?') {
                Some((base, _)) => base.to_string(),
                None => url,
            }
        };

        let caps = regex.captures(&target)?;
        Some(
            self.params
                .iter()
                .enumerate()
                .filter_map(|(i, name)| {
                    caps.get(i + 1).map(|m| {
                        let value = urlencoding::decode(m.as_str())
                            .map(|d| d.into_owned())
                            .unwrap_or_else(|_| m.as_str().to_string());
                        (name.clone(), value)
                    })
                })
                .collect(),
        )
    }
}

#[derive(Debug)]
pub struct DefaultHandler {
    pub id: String,
    pub method: Method,
    pub url: UrlPattern,
    pub responder: Responder,
    pub options: HandlerOptions,
}

/// Insertion-ordered registry of default handlers.
#[derive(Debug, Default)]
pub struct DefaultHandlers {
    handlers: RwLock<Vec<Arc<DefaultHandler>>>,
}

impl DefaultHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        id: impl Into<String>,
        method: Method,
        url: &str,
        responder: Responder,
        options: Option<HandlerOptions>,
    ) {
        let handler = DefaultHandler {
            id: id.into(),
            method,
            url: UrlPattern::parse(url),
            responder,
            options: options.unwrap_or_default(),
        };
        tracing::debug!(
            "Registered default handler {} {} {}",
            handler.id,
            handler.method,
            handler.url.as_str()
        );
        self.handlers.write().push(Arc::new(handler));
    }

    pub fn remove(&self, id: &str) {
        self.handlers.write().retain(|h| h.id != id);
    }

    /// The earliest registered handler whose method and URL pattern match,
    /// with its captured path parameters.
    pub fn first_match(&self, request: &MsRequest) -> Option<(Arc<DefaultHandler>, BTreeMap<String, String>)> {
        self.handlers
            .read()
            .iter()
            .filter(|h| h.method == *request.method())
            .find_map(|h| h.url.matches(request).map(|params| (Arc::clone(h), params)))
    }

    /// A `*`-suffixed id looks up the first handler whose id has that prefix.
    pub fn by_id(&self, id: &str) -> Option<Arc<DefaultHandler>> {
        let handlers = self.handlers.read();
        match id.strip_suffix('*') {
            Some(prefix) => handlers.iter().find(|h| h.id.starts_with(prefix)).cloned(),
            None => handlers.iter().find(|h| h.id == id).cloned(),
        }
    }

    pub fn all(&self) -> Vec<Arc<DefaultHandler>> {
        self.handlers.read().clone()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registers default handlers under one domain, deriving feature IDs.
pub struct HttpSetup<'a> {
    registry: &'a DefaultHandlers,
    resolver: &'a FeatureIdResolver,
    domain: String,
}

impl<'a> HttpSetup<'a> {
    pub fn new(
        registry: &'a DefaultHandlers,
        resolver: &'a FeatureIdResolver,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            resolver,
            domain: domain.into(),
        }
    }

    fn register(&self, method: Method, path: &str, responder: Responder, options: Option<HandlerOptions>) -> &Self {
        if self.domain.is_empty() {
            tracing::warn!("Ignoring default handler for {} {}: no domain configured", method, path);
            return self;
        }
        let feature_id = self
            .resolver
            .resolve_feature_id(&self.domain, method.as_str(), path);
        let url = format!("{}{}", self.domain, path);
        self.registry.register(feature_id, method, &url, responder, options);
        self
    }

    pub fn get(&self, path: &str, responder: Responder, options: Option<HandlerOptions>) -> &Self {
        self.register(Method::GET, path, responder, options)
    }

    pub fn post(&self, path: &str, responder: Responder, options: Option<HandlerOptions>) -> &Self {
        self.register(Method::POST, path, responder, options)
    }

    pub fn put(&self, path: &str, responder: Responder, options: Option<HandlerOptions>) -> &Self {
        self.register(Method::PUT, path, responder, options)
    }

    pub fn patch(&self, path: &str, responder: Responder, options: Option<HandlerOptions>) -> &Self {
        self.register(Method::PATCH, path, responder, options)
    }

    pub fn delete(&self, path: &str, responder: Responder, options: Option<HandlerOptions>) -> &Self {
        self.register(Method::DELETE, path, responder, options)
    }
}
