//! Lifecycle notifications.
//!
//! Every notification is logged and fanned out to in-process subscribers.
//! Subscribers that lag behind lose the oldest notifications.

use crate::model::MockRecord;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    MockSet {
        id: String,
        record: MockRecord,
        ttl_seconds: u64,
    },
    MockDrop {
        id: String,
    },
    RequestIntercepted {
        request_id: String,
        url: String,
    },
    MatchCustomMock {
        id: String,
        request_id: String,
    },
    MatchCustomPassthrough {
        id: String,
        request_id: String,
    },
    MatchDefault {
        id: String,
        request_id: String,
    },
    Passthrough {
        id: String,
        request_id: String,
    },
    Error {
        message: String,
    },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::MockSet { .. } => "mock:set",
            LifecycleEvent::MockDrop { .. } => "mock:drop",
            LifecycleEvent::RequestIntercepted { .. } => "request:intercepted",
            LifecycleEvent::MatchCustomMock { .. } => "request:match-custom-mock",
            LifecycleEvent::MatchCustomPassthrough { .. } => "request:match-custom-passthrough",
            LifecycleEvent::MatchDefault { .. } => "request:match-default",
            LifecycleEvent::Passthrough { .. } => "request:passthrough",
            LifecycleEvent::Error { .. } => "error",
        }
    }
}

/// Logs lifecycle events and broadcasts them to subscribers.
#[derive(Debug, Clone)]
pub struct Observer {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl Default for Observer {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: LifecycleEvent) {
        match &event {
            LifecycleEvent::Error { message } => tracing::error!("{}: {}", event.name(), message),
            LifecycleEvent::MockSet { id, ttl_seconds, .. } => {
                tracing::info!("{} id={} ttl={}s", event.name(), id, ttl_seconds)
            }
            LifecycleEvent::MockDrop { id } => tracing::info!("{} id={}", event.name(), id),
            LifecycleEvent::RequestIntercepted { request_id, url } => {
                tracing::info!("{} requestId={} url={}", event.name(), request_id, url)
            }
            LifecycleEvent::MatchCustomMock { id, request_id }
            | LifecycleEvent::MatchCustomPassthrough { id, request_id }
            | LifecycleEvent::MatchDefault { id, request_id }
            | LifecycleEvent::Passthrough { id, request_id } => {
                tracing::info!("{} id={} requestId={}", event.name(), id, request_id)
            }
        }

        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(LifecycleEvent::Error {
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let observer = Observer::new();
        let mut rx = observer.subscribe();

        observer.emit(LifecycleEvent::MockDrop { id: "X".into() });
        observer.error("boom");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.name(), "mock:drop");
        let second = rx.recv().await.unwrap();
        assert_eq!(
            second,
            LifecycleEvent::Error {
                message: "boom".into()
            }
        );
    }

    #[test]
    fn test_emit_without_subscribers_does_not_fail() {
        Observer::new().emit(LifecycleEvent::Passthrough {
            id: "GET-a".into(),
            request_id: "r".into(),
        });
    }
}
