//! Mockwire: mock resolution core for intercepted HTTP traffic.
//!
//! Every intercepted request is resolved to a custom mock stored in a shared
//! store, a default handler registered in-process, or a passthrough to the
//! real target. Several instances sharing one store stay in agreement through
//! a pub/sub event channel.

// ===== Core =====
pub mod dispatch;
pub mod feature_id;
pub mod pattern_store;
pub mod registry;
pub mod repository;
pub mod service;
pub mod state;

// ===== Messages and rendering =====
pub mod body;
pub mod handlers;
pub mod model;
pub mod request;
pub mod template;

// ===== History, blacklist and inspection =====
pub mod blacklist;
pub mod dashboard;
pub mod watcher;

// ===== Infrastructure =====
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod metrics;
pub mod proxy;
pub mod store;

pub use config::Config;
pub use dispatch::{Dispatcher, Resolution};
pub use error::{DispatchError, RepositoryError, ServiceError, StoreError};
pub use handlers::{HttpResponse, Responder};
pub use model::{MockPattern, MockRecord, ResponseInit};
pub use service::MockService;
