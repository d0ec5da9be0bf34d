//! Per-request decision pipeline.
//!
//! ```text
//! disabled / unobservable method ──────────────────────────► passthrough
//! custom mock (exact id, else shortest pattern)
//!   claim ───────── exhausted ── drop ─┐
//!   record missing ──────────── drop ──┤
//!   PASSTHROUGH ──────────────────────────────────────────► passthrough
//!   MOCK ─────────────────────────────────────────────────► custom mock
//! default handler (first match) ◄──────┘ ─────────────────► default mock
//! nothing matched ────────────────────────────────────────► passthrough
//! ```
//!
//! Any failure along the way is logged and resolved to passthrough.

use crate::body::BodyClassifier;
use crate::error::DispatchError;
use crate::handlers::{json_backing, DefaultHandlers, HttpResponse};
use crate::lifecycle::{LifecycleEvent, Observer};
use crate::metrics;
use crate::model::MockPattern;
use crate::registry::MockRegistry;
use crate::repository::MockClaim;
use crate::request::MsRequest;
use crate::state::SharedState;
use crate::template::{apply_json_backing, JsonBacking};
use crate::watcher::Watcher;
use hyper::Method;
use std::sync::Arc;
use std::time::Instant;

/// Methods the pipeline intercepts. Everything else passes through untouched.
pub fn is_observable_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::POST | Method::PUT | Method::DELETE | Method::PATCH
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassthroughReason {
    Disabled,
    CustomPassthrough,
    NoMatch,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockSource {
    Custom,
    Default,
}

/// Terminal outcome of one dispatch.
#[derive(Debug, Clone)]
pub enum Resolution {
    Passthrough(PassthroughReason),
    Mocked {
        source: MockSource,
        id: String,
        response: HttpResponse,
    },
}

impl Resolution {
    pub fn outcome(&self) -> &'static str {
        match self {
            Resolution::Passthrough(PassthroughReason::Disabled) => "disabled",
            Resolution::Passthrough(PassthroughReason::CustomPassthrough) => "custom_passthrough",
            Resolution::Passthrough(PassthroughReason::NoMatch) => "passthrough",
            Resolution::Passthrough(PassthroughReason::Error) => "error",
            Resolution::Mocked {
                source: MockSource::Custom,
                ..
            } => "custom_mock",
            Resolution::Mocked {
                source: MockSource::Default,
                ..
            } => "default_mock",
        }
    }

    pub fn is_mocked(&self) -> bool {
        matches!(self, Resolution::Mocked { .. })
    }

    pub fn into_response(self) -> Option<HttpResponse> {
        match self {
            Resolution::Mocked { response, .. } => Some(response),
            Resolution::Passthrough(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    state: Arc<SharedState>,
    registry: Arc<MockRegistry>,
    handlers: Arc<DefaultHandlers>,
    watcher: Watcher,
    classifier: BodyClassifier,
    observer: Observer,
}

impl Dispatcher {
    pub fn new(
        state: Arc<SharedState>,
        registry: Arc<MockRegistry>,
        handlers: Arc<DefaultHandlers>,
        watcher: Watcher,
        classifier: BodyClassifier,
        observer: Observer,
    ) -> Self {
        Self {
            state,
            registry,
            handlers,
            watcher,
            classifier,
            observer,
        }
    }

    /// Decide how to answer `request`. Never fails: errors resolve to
    /// passthrough.
    pub async fn dispatch(&self, request: &MsRequest) -> Resolution {
        let started = Instant::now();

        if !self.state.is_enabled() || !is_observable_method(request.method()) {
            let resolution = Resolution::Passthrough(PassthroughReason::Disabled);
            metrics::record_resolution(resolution.outcome(), elapsed_ms(started));
            return resolution;
        }

        let quiet = self.state.is_blacklisted(request.feature_id());
        if !quiet {
            self.observer.emit(LifecycleEvent::RequestIntercepted {
                request_id: request.request_id().to_string(),
                url: request.url(),
            });
            self.spawn_history_write(request.clone());
        }

        let resolution = match self.resolve(request, quiet).await {
            Ok(resolution) => resolution,
            Err(e) => {
                self.observer.error(format!(
                    "Failed to resolve {} ({}): {}",
                    request.feature_id(),
                    request.request_id(),
                    e
                ));
                Resolution::Passthrough(PassthroughReason::Error)
            }
        };

        metrics::record_resolution(resolution.outcome(), elapsed_ms(started));
        resolution
    }

    fn spawn_history_write(&self, request: MsRequest) {
        let watcher = self.watcher.clone();
        let observer = self.observer.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher.save_in_history(&request).await {
                observer.error(format!(
                    "Failed to save history for {}: {}",
                    request.request_id(),
                    e
                ));
            }
        });
    }

    async fn resolve(&self, request: &MsRequest, quiet: bool) -> Result<Resolution, DispatchError> {
        if let Some(id) = self.state.patterns.search(request.feature_id()) {
            if let Some(resolution) = self.resolve_custom(&id, request, quiet).await? {
                return Ok(resolution);
            }
        }

        if let Some((handler, params)) = self.handlers.first_match(request) {
            if !quiet {
                self.emit_match(LifecycleEvent::MatchDefault {
                    id: request.feature_id().to_string(),
                    request_id: request.request_id().to_string(),
                });
            }
            let mut request = request.clone();
            request.set_path_params(params);
            let response = handler.responder.respond(request, &self.classifier).await?;
            return Ok(Resolution::Mocked {
                source: MockSource::Default,
                id: handler.id.clone(),
                response,
            });
        }

        if !quiet {
            self.emit_match(LifecycleEvent::Passthrough {
                id: request.feature_id().to_string(),
                request_id: request.request_id().to_string(),
            });
        }
        Ok(Resolution::Passthrough(PassthroughReason::NoMatch))
    }

    /// `None` means the custom mock is gone and the next stage should run.
    async fn resolve_custom(
        &self,
        id: &str,
        request: &MsRequest,
        quiet: bool,
    ) -> Result<Option<Resolution>, DispatchError> {
        let record = match self.registry.repository().claim(id).await? {
            MockClaim::Granted { record, remaining } => {
                if let Some(remaining) = remaining {
                    tracing::trace!("Mock {} granted, {} uses left", id, remaining);
                }
                record
            }
            MockClaim::Exhausted => {
                tracing::debug!("Mock {} exhausted its counter", id);
                MockRegistry::drop(&self.registry, id).await?;
                return Ok(None);
            }
            MockClaim::Missing => {
                tracing::debug!("Mock {} is registered but has no stored record", id);
                MockRegistry::drop(&self.registry, id).await?;
                return Ok(None);
            }
        };

        let event_ids = || {
            (
                request.feature_id().to_string(),
                request.request_id().to_string(),
            )
        };

        match record.pattern {
            MockPattern::Passthrough => {
                if !quiet {
                    let (id, request_id) = event_ids();
                    self.emit_match(LifecycleEvent::MatchCustomPassthrough { id, request_id });
                }
                Ok(Some(Resolution::Passthrough(
                    PassthroughReason::CustomPassthrough,
                )))
            }
            MockPattern::Mock => {
                if !quiet {
                    let (id, request_id) = event_ids();
                    self.emit_match(LifecycleEvent::MatchCustomMock { id, request_id });
                }
                let body = record.response_body.clone().unwrap_or_default();
                let rendered = apply_json_backing(
                    &body,
                    json_backing(request, &self.classifier),
                    &JsonBacking::default(),
                );
                let response = HttpResponse::json(&rendered, record.init.as_ref())?;
                Ok(Some(Resolution::Mocked {
                    source: MockSource::Custom,
                    id: id.to_string(),
                    response,
                }))
            }
        }
    }

    fn emit_match(&self, event: LifecycleEvent) {
        self.observer.emit(event);
    }

    /// Response write-back for both mocked and forwarded responses.
    pub async fn on_response(&self, request: &MsRequest, response: &HttpResponse, is_mocked: bool) {
        if !self.state.is_enabled()
            || !is_observable_method(request.method())
            || self.state.is_blacklisted(request.feature_id())
        {
            return;
        }

        if let Err(e) = self.watcher.save_response(request, response, is_mocked).await {
            self.observer.error(format!(
                "Failed to save response for {}: {}",
                request.request_id(),
                e
            ));
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::BlacklistRule;
    use crate::events::EventBus;
    use crate::feature_id::FeatureIdResolver;
    use crate::handlers::{HandlerOptions, HttpSetup, Responder};
    use crate::model::{MockRecord, ResponseInit};
    use crate::repository::MockRepository;
    use crate::error::StoreError;
    use crate::store::{BatchOp, InMemoryStore, KeySpace, KvStore, Subscription, TimeoutStore};
    use bytes::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::{HeaderMap, StatusCode};
    use serde_json::{json, Value};
    use std::collections::{BTreeMap, HashMap};
    use std::time::Duration;

    struct Fixture {
        store: Arc<dyn KvStore>,
        state: Arc<SharedState>,
        registry: Arc<MockRegistry>,
        handlers: Arc<DefaultHandlers>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(InMemoryStore::new()))
    }

    fn fixture_with(store: Arc<dyn KvStore>) -> Fixture {
        let state = Arc::new(SharedState::new());
        let observer = Observer::new();
        let registry = Arc::new(MockRegistry::new(
            MockRepository::new(Arc::clone(&store), KeySpace::default(), 60),
            Arc::clone(&state),
            observer.clone(),
            EventBus::new(Arc::clone(&store), "ms-events"),
        ));
        let handlers = Arc::new(DefaultHandlers::new());
        let watcher = Watcher::new(
            Arc::clone(&store),
            KeySpace::default(),
            BodyClassifier::default(),
            Arc::clone(&state.blacklist),
            60,
            200 * 1024,
            "unknown",
            None,
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&state),
            Arc::clone(&registry),
            Arc::clone(&handlers),
            watcher,
            BodyClassifier::default(),
            observer,
        );
        Fixture {
            store,
            state,
            registry,
            handlers,
            dispatcher,
        }
    }

    fn request(method: Method, url: &str, body: &str) -> MsRequest {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        MsRequest::new(
            uuid::Uuid::new_v4().to_string(),
            method,
            url.parse().unwrap(),
            headers,
            Bytes::from(body.to_string()),
            &FeatureIdResolver::default(),
        )
    }

    fn body_json(resolution: Resolution) -> Value {
        let response = resolution.into_response().expect("mocked response");
        serde_json::from_slice(&response.body).unwrap()
    }

    #[tokio::test]
    async fn test_disabled_service_passes_through() {
        let f = fixture();
        f.registry
            .set("GET-api.example.com-users", MockRecord::mock(json!(1)))
            .await
            .unwrap();
        f.state.set_enabled(false);

        let resolution = f
            .dispatcher
            .dispatch(&request(Method::GET, "https://api.example.com/users", ""))
            .await;
        assert_eq!(resolution.outcome(), "disabled");
    }

    #[tokio::test]
    async fn test_unobservable_method_passes_through() {
        let f = fixture();
        let resolution = f
            .dispatcher
            .dispatch(&request(Method::OPTIONS, "https://api.example.com/users", ""))
            .await;
        assert!(matches!(
            resolution,
            Resolution::Passthrough(PassthroughReason::Disabled)
        ));
    }

    #[tokio::test]
    async fn test_custom_mock_renders_template_and_init() {
        let f = fixture();
        let mut headers = BTreeMap::new();
        headers.insert("x-mocked".to_string(), "yes".to_string());
        let record = MockRecord::mock(json!({"echo": "{{requestBody.name}}", "q": "{{requestQuery.page}}"}))
            .with_init(ResponseInit {
                status: Some(201),
                status_text: None,
                headers,
            });
        f.registry.set("CREATE-api.example.com-users", record).await.unwrap();

        let resolution = f
            .dispatcher
            .dispatch(&request(
                Method::POST,
                "https://api.example.com/users?page=3",
                r#"{"name":"ada"}"#,
            ))
            .await;
        assert_eq!(resolution.outcome(), "custom_mock");
        let response = resolution.clone().into_response().unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.headers.get("x-mocked").unwrap(), "yes");
        assert_eq!(body_json(resolution), json!({"echo": "ada", "q": "3"}));
    }

    #[tokio::test]
    async fn test_custom_passthrough() {
        let f = fixture();
        f.registry
            .set("GET-api.example.com-*", MockRecord::passthrough())
            .await
            .unwrap();

        let resolution = f
            .dispatcher
            .dispatch(&request(Method::GET, "https://api.example.com/users", ""))
            .await;
        assert!(matches!(
            resolution,
            Resolution::Passthrough(PassthroughReason::CustomPassthrough)
        ));
    }

    #[tokio::test]
    async fn test_counter_gated_mock_falls_through_after_n_matches() {
        let f = fixture();
        f.registry
            .set("GET-api.example.com-x", MockRecord::mock(json!({"a": 1})).with_count(2))
            .await
            .unwrap();

        let req = || request(Method::GET, "https://api.example.com/x", "");
        assert!(f.dispatcher.dispatch(&req()).await.is_mocked());
        assert!(f.dispatcher.dispatch(&req()).await.is_mocked());
        let third = f.dispatcher.dispatch(&req()).await;
        assert_eq!(third.outcome(), "passthrough");

        assert!(!f.state.patterns.contains("GET-api.example.com-x"));
        assert_eq!(f.store.get("ms:mocking:GET-api.example.com-x").await.unwrap(), None);
        assert_eq!(f.store.get("ms:mocking-count:GET-api.example.com-x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_record_is_dropped_and_falls_through() {
        let f = fixture();
        f.state.patterns.add("GET-api.example.com-ghost");

        let resolution = f
            .dispatcher
            .dispatch(&request(Method::GET, "https://api.example.com/ghost", ""))
            .await;
        assert_eq!(resolution.outcome(), "passthrough");
        assert!(!f.state.patterns.contains("GET-api.example.com-ghost"));
    }

    #[tokio::test]
    async fn test_exhausted_custom_mock_falls_back_to_default_handler() {
        let f = fixture();
        let resolver = FeatureIdResolver::default();
        HttpSetup::new(&f.handlers, &resolver, "https://api.example.com").get(
            "/users/:id",
            Responder::json(json!({"id": "{{requestParams.id}}", "from": "default"})),
            Some(HandlerOptions {
                description: Some("user".into()),
            }),
        );
        f.registry
            .set("GET-api.example.com-users-*", MockRecord::mock(json!({"from": "custom"})).with_count(1))
            .await
            .unwrap();

        let req = || request(Method::GET, "https://api.example.com/users/42", "");
        assert_eq!(body_json(f.dispatcher.dispatch(&req()).await), json!({"from": "custom"}));

        let second = f.dispatcher.dispatch(&req()).await;
        assert_eq!(second.outcome(), "default_mock");
        assert_eq!(body_json(second), json!({"id": "42", "from": "default"}));
    }

    #[tokio::test]
    async fn test_resolver_failure_resolves_to_passthrough() {
        let f = fixture();
        f.handlers.register(
            "GET-api.example.com-boom",
            Method::GET,
            "https://api.example.com/boom",
            Responder::resolver(|_req| async {
                Err(DispatchError::Store(crate::error::StoreError::Timeout("get")))
            }),
            None,
        );
        let mut events = f.dispatcher.observer.subscribe();

        let resolution = f
            .dispatcher
            .dispatch(&request(Method::GET, "https://api.example.com/boom", ""))
            .await;
        assert_eq!(resolution.outcome(), "error");

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            saw_error |= matches!(event, LifecycleEvent::Error { .. });
        }
        assert!(saw_error);
    }

    /// In-memory store whose claim step stalls.
    struct StallingClaimStore(InMemoryStore);

    #[async_trait::async_trait]
    impl KvStore for StallingClaimStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.0.get(key).await
        }
        async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.0.set(key, value).await
        }
        async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
            self.0.del(keys).await
        }
        async fn expire(&self, key: &str, ttl: u64) -> Result<bool, StoreError> {
            self.0.expire(key, ttl).await
        }
        async fn decr_and_get(
            &self,
            counter_key: &str,
            value_key: &str,
        ) -> Result<(Option<i64>, Option<String>), StoreError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            self.0.decr_and_get(counter_key, value_key).await
        }
        async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
            self.0.hset(key, field, value).await
        }
        async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
            self.0.hgetall(key).await
        }
        async fn hgetall_matching(
            &self,
            pattern: &str,
        ) -> Result<HashMap<String, HashMap<String, String>>, StoreError> {
            self.0.hgetall_matching(pattern).await
        }
        async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
            self.0.keys(pattern).await
        }
        async fn exec_atomic(&self, ops: Vec<BatchOp>) -> Result<Vec<bool>, StoreError> {
            self.0.exec_atomic(ops).await
        }
        async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
            self.0.publish(channel, message).await
        }
        async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
            self.0.subscribe(channel).await
        }
    }

    #[tokio::test]
    async fn test_store_timeout_resolves_to_passthrough() {
        let slow: Arc<dyn KvStore> = Arc::new(StallingClaimStore(InMemoryStore::new()));
        let f = fixture_with(Arc::new(TimeoutStore::new(slow, Duration::from_millis(20))));
        f.registry
            .set("GET-api.example.com-slow", MockRecord::mock(json!(1)).with_count(1))
            .await
            .unwrap();

        let started = Instant::now();
        let resolution = f
            .dispatcher
            .dispatch(&request(Method::GET, "https://api.example.com/slow", ""))
            .await;

        assert!(matches!(
            resolution,
            Resolution::Passthrough(PassthroughReason::Error)
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
        // The timed-out claim did not drop the mock
        assert!(f.state.patterns.contains("GET-api.example.com-slow"));
    }

    #[tokio::test]
    async fn test_history_is_written_in_background() {
        let f = fixture();
        let req = request(Method::POST, "https://api.example.com/orders", r#"{"n":1}"#);
        f.dispatcher.dispatch(&req).await;

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let hash = f.store.hgetall("ms:watcher:unknown").await.unwrap();
                if !hash.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_blacklisted_request_is_mocked_but_not_recorded() {
        let f = fixture();
        f.state
            .blacklist
            .replace(vec![BlacklistRule::parse("GET-api.example.com-health").unwrap()]);
        f.registry
            .set("GET-api.example.com-health", MockRecord::mock(json!({"up": true})))
            .await
            .unwrap();
        let mut events = f.dispatcher.observer.subscribe();

        let req = request(Method::GET, "https://api.example.com/health", "");
        let resolution = f.dispatcher.dispatch(&req).await;
        assert!(resolution.is_mocked());
        let response = resolution.into_response().unwrap();
        f.dispatcher.on_response(&req, &response, true).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.store.keys("ms:watcher:*").await.unwrap().is_empty());
        assert!(f.store.keys("ms:response*").await.unwrap().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_on_response_saves_forwarded_response() {
        let f = fixture();
        let req = request(Method::GET, "https://api.example.com/users", "");
        let response = HttpResponse::text("plain", None).unwrap();

        f.dispatcher.on_response(&req, &response, false).await;

        let raw = f
            .store
            .get(&format!("ms:response:{}", req.request_id()))
            .await
            .unwrap()
            .unwrap();
        let stored: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored["isMockedResponse"], json!(false));
        assert_eq!(stored["body"], json!("plain"));
        assert_eq!(stored["meta"]["type"], json!("TEXT"));
    }
}
