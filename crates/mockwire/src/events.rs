//! Cross-instance synchronization over the store's pub/sub channel.
//!
//! Wire format: `{"command": "...", "payload": ...}`. Every instance, the
//! publisher included, applies each event it receives. Applying an event is
//! idempotent, so the publisher re-applying its own change is harmless.
//! Delivery is at-most-once; a missed event is repaired by the next resync.

use crate::blacklist::{BlacklistSettings, BlacklistSettingsRaw};
use crate::error::{StoreError, SyncError};
use crate::metrics;
use crate::model::MockRecord;
use crate::state::SharedState;
use crate::store::KvStore;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockSetPayload {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<MockRecord>,
    #[serde(rename = "mockTTL", default, skip_serializing_if = "Option::is_none")]
    pub mock_ttl: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockDropPayload {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload")]
pub enum SyncEvent {
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "OFF")]
    Off,
    #[serde(rename = "BL-SET")]
    BlacklistSet(BlacklistSettingsRaw),
    #[serde(rename = "MOCK-SET")]
    MockSet(MockSetPayload),
    #[serde(rename = "MOCK-DROP")]
    MockDrop(MockDropPayload),
}

impl SyncEvent {
    pub fn command(&self) -> &'static str {
        match self {
            SyncEvent::On => "ON",
            SyncEvent::Off => "OFF",
            SyncEvent::BlacklistSet(_) => "BL-SET",
            SyncEvent::MockSet(_) => "MOCK-SET",
            SyncEvent::MockDrop(_) => "MOCK-DROP",
        }
    }
}

/// Apply one event to local state.
pub fn apply(state: &SharedState, event: &SyncEvent) -> Result<(), SyncError> {
    match event {
        SyncEvent::On => state.set_enabled(true),
        SyncEvent::Off => state.set_enabled(false),
        SyncEvent::BlacklistSet(raw) => {
            let settings =
                BlacklistSettings::from_raw(raw).map_err(|e| SyncError::InvalidRule {
                    source_text: format!("{:?}", raw.active),
                    reason: e.to_string(),
                })?;
            state.blacklist.replace(settings.active);
        }
        SyncEvent::MockSet(payload) => state.patterns.add(&payload.id),
        SyncEvent::MockDrop(payload) => state.patterns.remove(&payload.id),
    }
    Ok(())
}

/// Decode and apply a raw channel message.
pub fn handle_message(state: &SharedState, message: &str) -> Result<SyncEvent, SyncError> {
    let event: SyncEvent = serde_json::from_str(message)?;
    apply(state, &event)?;
    Ok(event)
}

/// Publisher and subscriber for one event channel.
#[derive(Clone)]
pub struct EventBus {
    store: Arc<dyn KvStore>,
    channel: String,
}

impl EventBus {
    pub fn new(store: Arc<dyn KvStore>, channel: impl Into<String>) -> Self {
        Self {
            store,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn publish(&self, event: &SyncEvent) -> Result<(), StoreError> {
        let message = serde_json::to_string(event)?;
        tracing::debug!("Publishing {} on {}", event.command(), self.channel);
        self.store.publish(&self.channel, &message).await
    }

    /// Subscribe, then apply every received event on a background task.
    /// The subscription is active when this returns.
    pub async fn spawn_listener(&self, state: Arc<SharedState>) -> Result<JoinHandle<()>, StoreError> {
        let mut messages = self.store.subscribe(&self.channel).await?;
        let channel = self.channel.clone();
        tracing::info!("Listening for events on {}", channel);

        Ok(tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                match handle_message(&state, &message) {
                    Ok(event) => {
                        tracing::debug!("Applied {} from {}", event.command(), channel);
                        metrics::record_sync_event(event.command(), true);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to apply event from {}: {}", channel, e);
                        metrics::record_sync_event("unknown", false);
                    }
                }
            }
            tracing::info!("Event subscription on {} closed", channel);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::{RawRule, RegexMarker};
    use crate::store::InMemoryStore;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_wire_format() {
        assert_eq!(serde_json::to_value(SyncEvent::On).unwrap(), json!({"command": "ON"}));
        assert_eq!(
            serde_json::to_value(SyncEvent::MockDrop(MockDropPayload { id: "X".into() })).unwrap(),
            json!({"command": "MOCK-DROP", "payload": {"id": "X"}})
        );

        let parsed: SyncEvent = serde_json::from_value(json!({
            "command": "MOCK-SET",
            "payload": {"id": "GET-a*", "body": {"pattern": "MOCK"}, "mockTTL": 3600}
        }))
        .unwrap();
        assert!(matches!(parsed, SyncEvent::MockSet(ref p) if p.id == "GET-a*"));

        let off: SyncEvent = serde_json::from_str(r#"{"command":"OFF"}"#).unwrap();
        assert_eq!(off, SyncEvent::Off);
    }

    #[test]
    fn test_apply_transitions() {
        let state = SharedState::new();

        apply(&state, &SyncEvent::Off).unwrap();
        assert!(!state.is_enabled());
        apply(&state, &SyncEvent::On).unwrap();
        assert!(state.is_enabled());

        let set = SyncEvent::MockSet(MockSetPayload {
            id: "GET-a.com-*".into(),
            body: None,
            mock_ttl: None,
        });
        apply(&state, &set).unwrap();
        apply(&state, &set).unwrap();
        assert_eq!(state.patterns.pattern_ids(), vec!["GET-a.com-*"]);

        apply(&state, &SyncEvent::MockDrop(MockDropPayload { id: "GET-a.com-*".into() })).unwrap();
        assert!(state.patterns.is_empty());
    }

    #[test]
    fn test_apply_blacklist() {
        let state = SharedState::new();
        let raw = BlacklistSettingsRaw {
            default: vec![],
            active: vec![
                RawRule::Exact("GET-health".into()),
                RawRule::Pattern(RegexMarker {
                    is_reg_exp: true,
                    source: "amazonaws".into(),
                }),
            ],
        };
        apply(&state, &SyncEvent::BlacklistSet(raw)).unwrap();
        assert!(state.is_blacklisted("GET-health"));
        assert!(state.is_blacklisted("GET-sqs.amazonaws.com-q"));
    }

    #[test]
    fn test_invalid_blacklist_leaves_cache_untouched() {
        let state = SharedState::new();
        state
            .blacklist
            .replace(vec![crate::blacklist::BlacklistRule::Exact("keep".into())]);

        let raw = BlacklistSettingsRaw {
            default: vec![],
            active: vec![RawRule::Pattern(RegexMarker {
                is_reg_exp: true,
                source: "(".into(),
            })],
        };
        assert!(matches!(
            apply(&state, &SyncEvent::BlacklistSet(raw)),
            Err(SyncError::InvalidRule { .. })
        ));
        assert!(state.is_blacklisted("keep"));
    }

    #[test]
    fn test_malformed_message() {
        let state = SharedState::new();
        assert!(matches!(
            handle_message(&state, r#"{"command":"REBOOT"}"#),
            Err(SyncError::Decode(_))
        ));
        assert!(handle_message(&state, "not json").is_err());
    }

    #[tokio::test]
    async fn test_bus_round_trip_between_instances() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let bus_a = EventBus::new(Arc::clone(&store), "ms-events");
        let bus_b = EventBus::new(Arc::clone(&store), "ms-events");

        let state_b = Arc::new(SharedState::new());
        let handle = bus_b.spawn_listener(Arc::clone(&state_b)).await.unwrap();

        bus_a.publish(&SyncEvent::Off).await.unwrap();
        bus_a
            .publish(&SyncEvent::MockSet(MockSetPayload {
                id: "X".into(),
                body: None,
                mock_ttl: None,
            }))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while state_b.is_enabled() || !state_b.patterns.contains("X") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        handle.abort();
    }
}
