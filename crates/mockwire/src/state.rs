//! Process-wide state shared by the dispatcher and the event listener.

use crate::blacklist::BlacklistCache;
use crate::pattern_store::PatternStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Enabled flag plus the two read-mostly caches. Mutated only through the
/// service API or applied events.
#[derive(Debug)]
pub struct SharedState {
    enabled: AtomicBool,
    pub patterns: PatternStore,
    pub blacklist: Arc<BlacklistCache>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            patterns: PatternStore::new(),
            blacklist: Arc::new(BlacklistCache::new()),
        }
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_blacklisted(&self, feature_id: &str) -> bool {
        self.blacklist.is_blacklisted(feature_id)
    }
}
