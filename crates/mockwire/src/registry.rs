//! Mock registration: keeps the repository, the local pattern cache, the
//! lifecycle observer and the other instances in step.

use crate::error::RepositoryError;
use crate::events::{EventBus, MockDropPayload, MockSetPayload, SyncEvent};
use crate::lifecycle::{LifecycleEvent, Observer};
use crate::model::MockRecord;
use crate::repository::MockRepository;
use crate::state::SharedState;
use std::sync::Arc;

pub struct MockRegistry {
    repository: MockRepository,
    state: Arc<SharedState>,
    observer: Observer,
    bus: EventBus,
}

impl MockRegistry {
    pub fn new(
        repository: MockRepository,
        state: Arc<SharedState>,
        observer: Observer,
        bus: EventBus,
    ) -> Self {
        Self {
            repository,
            state,
            observer,
            bus,
        }
    }

    pub fn repository(&self) -> &MockRepository {
        &self.repository
    }

    /// Store the mock, then announce it. Returns the applied TTL.
    pub async fn set(&self, id: &str, record: MockRecord) -> Result<u64, RepositoryError> {
        let ttl_seconds = self.repository.set_mock(id, &record).await?;
        self.state.patterns.add(id);

        self.observer.emit(LifecycleEvent::MockSet {
            id: id.to_string(),
            record: record.clone(),
            ttl_seconds,
        });
        self.broadcast(SyncEvent::MockSet(MockSetPayload {
            id: id.to_string(),
            body: Some(record),
            mock_ttl: Some(ttl_seconds),
        }))
        .await;

        Ok(ttl_seconds)
    }

    /// Remove the mock and its counter everywhere.
    pub async fn drop(&self, id: &str) -> Result<(), RepositoryError> {
        self.repository.drop_mock(id).await?;
        self.state.patterns.remove(id);

        self.observer.emit(LifecycleEvent::MockDrop { id: id.to_string() });
        self.broadcast(SyncEvent::MockDrop(MockDropPayload { id: id.to_string() }))
            .await;
        Ok(())
    }

    /// Rebuild the local pattern cache from the stored mock keys.
    pub async fn resync(&self) -> Result<usize, RepositoryError> {
        let ids = self.repository.get_all_mock_keys().await?;
        let count = ids.len();
        self.state.patterns.replace_all(ids);
        tracing::info!("Pattern store rebuilt with {} mock ids", count);
        Ok(count)
    }

    /// Delivery is best effort; local state is already updated.
    async fn broadcast(&self, event: SyncEvent) {
        if let Err(e) = self.bus.publish(&event).await {
            tracing::warn!("Failed to publish {}: {}", event.command(), e);
        }
    }
}
