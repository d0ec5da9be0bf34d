//! Service facade wiring the store, caches, pipeline and dashboard together.
//!
//! ```ignore
//! let service = MockService::builder(Config::from_file("mockwire.yaml")?)
//!     .request_agg_key(|| Some(current_test_name()))
//!     .build()
//!     .await?;
//!
//! service
//!     .http("https://api.example.com")
//!     .get("/users", Responder::json(json!([])), None);
//!
//! let request = service.request(Method::GET, uri, headers, body);
//! match service.dispatcher().dispatch(&request).await { .. }
//! ```

use crate::blacklist::{BlacklistRule, BlacklistService, BlacklistSettings};
use crate::body::BodyClassifier;
use crate::config::Config;
use crate::dashboard::Dashboard;
use crate::dispatch::Dispatcher;
use crate::error::{RepositoryError, ServiceError};
use crate::events::{EventBus, SyncEvent};
use crate::handlers::{DefaultHandlers, HttpSetup};
use crate::lifecycle::{LifecycleEvent, Observer};
use crate::registry::MockRegistry;
use crate::repository::MockRepository;
use crate::request::MsRequest;
use crate::state::SharedState;
use crate::store::{create_store, KeySpace, KvStore, TimeoutStore};
use crate::watcher::{AggregationKeyFn, Watcher};
use anyhow::Context;
use bytes::Bytes;
use hyper::{HeaderMap, Method, Uri};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub struct MockServiceBuilder {
    config: Config,
    store: Option<Arc<dyn KvStore>>,
    aggregation_key: Option<AggregationKeyFn>,
}

impl MockServiceBuilder {
    /// Use an existing store instead of connecting the configured backend.
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Key under which request history is grouped. `None` or an empty key
    /// uses `history.aggregation_key`.
    pub fn request_agg_key<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.aggregation_key = Some(Arc::new(f));
        self
    }

    /// Connect, hydrate local caches from the store and start listening for
    /// events from other instances.
    pub async fn build(self) -> Result<MockService, anyhow::Error> {
        let config = self.config;
        config.validate()?;

        let store: Arc<dyn KvStore> = match self.store {
            Some(store) => Arc::new(TimeoutStore::new(
                store,
                Duration::from_millis(config.store.operation_timeout_ms),
            )),
            None => create_store(&config.store).await?,
        };
        let keys = KeySpace::new(config.store.key_prefix.clone());

        let state = Arc::new(SharedState::new());
        let observer = Observer::new();
        let bus = EventBus::new(Arc::clone(&store), keys.event_channel());
        let classifier = BodyClassifier::new(config.body_size_limit_bytes);
        let handlers = Arc::new(DefaultHandlers::new());

        let registry = Arc::new(MockRegistry::new(
            MockRepository::new(Arc::clone(&store), keys.clone(), config.mock_ttl_seconds),
            Arc::clone(&state),
            observer.clone(),
            bus.clone(),
        ));
        registry
            .resync()
            .await
            .context("Failed to load registered mocks")?;

        let blacklist = BlacklistService::new(
            Arc::clone(&store),
            keys.clone(),
            Arc::clone(&state.blacklist),
        );
        blacklist
            .renew_default(&config.blacklist_rules())
            .await
            .context("Failed to load request blacklist")?;

        let listener = bus
            .spawn_listener(Arc::clone(&state))
            .await
            .context("Failed to subscribe to event channel")?;

        let watcher = Watcher::new(
            Arc::clone(&store),
            keys.clone(),
            classifier,
            Arc::clone(&state.blacklist),
            config.history_ttl_seconds,
            config.short_body_threshold_bytes(),
            config.history.aggregation_key.clone(),
            self.aggregation_key,
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&state),
            Arc::clone(&registry),
            Arc::clone(&handlers),
            watcher,
            classifier,
            observer.clone(),
        );
        let dashboard = Dashboard::new(
            Arc::clone(&store),
            keys.clone(),
            Arc::clone(&state),
            Arc::clone(&registry),
            Arc::clone(&handlers),
            config.mock_ttl_seconds,
            config.history.dashboard_body_limit_kb * 1024,
        );

        tracing::info!(
            "Mock service ready (backend={}, prefix={}, {} mocks, {} blacklist rules)",
            config.store.backend,
            keys.prefix(),
            state.patterns.len(),
            state.blacklist.active().len()
        );

        Ok(MockService {
            config: Arc::new(config),
            state,
            observer,
            bus,
            registry,
            handlers,
            blacklist,
            dispatcher,
            dashboard,
            listener: Mutex::new(Some(listener)),
        })
    }
}

pub struct MockService {
    config: Arc<Config>,
    state: Arc<SharedState>,
    observer: Observer,
    bus: EventBus,
    registry: Arc<MockRegistry>,
    handlers: Arc<DefaultHandlers>,
    blacklist: BlacklistService,
    dispatcher: Dispatcher,
    dashboard: Dashboard,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl MockService {
    pub fn builder(config: Config) -> MockServiceBuilder {
        MockServiceBuilder {
            config,
            store: None,
            aggregation_key: None,
        }
    }

    pub async fn new(config: Config) -> Result<Self, anyhow::Error> {
        Self::builder(config).build().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn dashboard(&self) -> &Dashboard {
        &self.dashboard
    }

    pub fn handlers(&self) -> &Arc<DefaultHandlers> {
        &self.handlers
    }

    /// Lifecycle notifications emitted from now on.
    pub fn events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.observer.subscribe()
    }

    /// Register default handlers for `domain`.
    pub fn http(&self, domain: impl Into<String>) -> HttpSetup<'_> {
        HttpSetup::new(&self.handlers, &self.config.feature_id, domain)
    }

    /// Wrap an intercepted request with a fresh request id.
    pub fn request(&self, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> MsRequest {
        MsRequest::new(
            uuid::Uuid::new_v4().to_string(),
            method,
            uri,
            headers,
            body,
            &self.config.feature_id,
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_enabled()
    }

    pub async fn on(&self) -> Result<(), ServiceError> {
        self.state.set_enabled(true);
        self.bus.publish(&SyncEvent::On).await?;
        tracing::info!("Mocking enabled");
        Ok(())
    }

    pub async fn off(&self) -> Result<(), ServiceError> {
        self.state.set_enabled(false);
        self.bus.publish(&SyncEvent::Off).await?;
        tracing::info!("Mocking disabled");
        Ok(())
    }

    pub fn is_blacklisted_feature(&self, feature_id: &str) -> bool {
        self.state.is_blacklisted(feature_id)
    }

    /// Replace the active blacklist everywhere. Entries written as `/.../`
    /// are regexes.
    pub async fn set_request_blacklist<S: AsRef<str>>(
        &self,
        entries: &[S],
    ) -> Result<BlacklistSettings, ServiceError> {
        let rules = entries
            .iter()
            .map(|entry| {
                BlacklistRule::parse(entry.as_ref())
                    .map_err(|e| ServiceError::InvalidRule(format!("{}: {}", entry.as_ref(), e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let settings = self.blacklist.put(rules, None).await?;
        self.bus
            .publish(&SyncEvent::BlacklistSet(settings.to_raw()))
            .await?;
        Ok(settings)
    }

    /// Stored blacklist settings.
    pub async fn request_blacklist(&self) -> Result<BlacklistSettings, ServiceError> {
        self.blacklist.settings().await
    }

    /// Rebuild the local pattern cache from the store.
    pub async fn resync(&self) -> Result<usize, RepositoryError> {
        self.registry.resync().await
    }

    /// Stop applying events from other instances.
    pub fn close(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
            tracing::info!("Mock service closed");
        }
    }
}

impl Drop for MockService {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn test_build_with_defaults() {
        let service = MockService::new(Config::default()).await.unwrap();
        assert!(service.is_enabled());
        assert_eq!(
            service.dashboard().config_detailed().expiration,
            "60.00 minutes"
        );
        service.close();
        service.close();
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = Config::default();
        config.mock_ttl_seconds = 0;
        assert!(MockService::new(config).await.is_err());
    }

    #[tokio::test]
    async fn test_configured_blacklist_is_applied_on_startup() {
        let mut config = Config::default();
        config.request_blacklist = vec!["GET-health".to_string(), "/amazonaws/".to_string()];
        let service = MockService::builder(config)
            .store(Arc::new(InMemoryStore::new()))
            .build()
            .await
            .unwrap();

        assert!(service.is_blacklisted_feature("GET-health"));
        assert!(service.is_blacklisted_feature("CREATE-sqs.amazonaws.com-queue"));
        assert!(!service.is_blacklisted_feature("GET-api.example.com"));

        let stored = service.request_blacklist().await.unwrap();
        assert_eq!(stored.default.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_blacklist_entry_is_rejected() {
        let service = MockService::new(Config::default()).await.unwrap();
        let err = service.set_request_blacklist(&["/(/"]).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRule(_)));
    }

    #[tokio::test]
    async fn test_request_ids_are_unique() {
        let service = MockService::new(Config::default()).await.unwrap();
        let uri: Uri = "https://api.example.com/x".parse().unwrap();
        let a = service.request(Method::GET, uri.clone(), HeaderMap::new(), Bytes::new());
        let b = service.request(Method::GET, uri, HeaderMap::new(), Bytes::new());
        assert_ne!(a.request_id(), b.request_id());
        assert_eq!(a.feature_id(), "GET-api.example.com-x");
    }
}
