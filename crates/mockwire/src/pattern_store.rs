//! Process-local cache of registered mock IDs with reverse pattern matching.
//!
//! Two disjoint sets are kept: exact feature IDs and wildcard patterns (IDs
//! ending in `*`). A pattern string is compiled as a regular expression as-is,
//! so operators must supply valid regex syntax. A pattern that fails to compile
//! is kept (so it can still be removed) but never matches.
//!
//! Writers replace the whole snapshot (copy-on-write); readers clone the `Arc`
//! and filter without holding the lock.

use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone)]
struct CompiledPattern {
    source: String,
    regex: Option<Regex>,
}

impl CompiledPattern {
    fn compile(source: &str) -> Self {
        let regex = match Regex::new(source) {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!("Pattern '{}' is not a valid regex and will never match: {}", source, e);
                None
            }
        };
        Self {
            source: source.to_string(),
            regex,
        }
    }

    fn matches(&self, feature_id: &str) -> bool {
        self.regex
            .as_ref()
            .map(|r| r.is_match(feature_id))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default)]
struct IdSets {
    exact: HashSet<String>,
    /// Insertion ordered.
    patterns: Vec<CompiledPattern>,
}

pub fn is_pattern(id: &str) -> bool {
    id.ends_with('*')
}

/// Feature ID manager: exact IDs plus wildcard patterns.
#[derive(Debug, Default)]
pub struct PatternStore {
    sets: RwLock<Arc<IdSets>>,
}

impl PatternStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let store = Self::new();
        store.replace_all(ids);
        store
    }

    fn snapshot(&self) -> Arc<IdSets> {
        Arc::clone(&self.sets.read())
    }

    fn update(&self, f: impl FnOnce(&mut IdSets)) {
        let mut guard = self.sets.write();
        let mut next = IdSets::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }

    /// Idempotent insert into the exact or pattern set.
    pub fn add(&self, id: &str) {
        if is_pattern(id) {
            if self.snapshot().patterns.iter().any(|p| p.source == id) {
                return;
            }
            let compiled = CompiledPattern::compile(id);
            self.update(|sets| {
                if !sets.patterns.iter().any(|p| p.source == compiled.source) {
                    sets.patterns.push(compiled);
                }
            });
        } else {
            if self.snapshot().exact.contains(id) {
                return;
            }
            self.update(|sets| {
                sets.exact.insert(id.to_string());
            });
        }
    }

    pub fn remove(&self, id: &str) {
        self.update(|sets| {
            if is_pattern(id) {
                sets.patterns.retain(|p| p.source != id);
            } else {
                sets.exact.remove(id);
            }
        });
    }

    /// Resolve a concrete feature ID to the registered mock ID serving it.
    ///
    /// An exact registration always wins. Otherwise the shortest matching
    /// pattern is returned, ties going to the earliest inserted.
    pub fn search(&self, feature_id: &str) -> Option<String> {
        let sets = self.snapshot();
        if sets.exact.contains(feature_id) {
            return Some(feature_id.to_string());
        }

        sets.patterns
            .iter()
            .filter(|p| p.matches(feature_id))
            .min_by_key(|p| p.source.len())
            .map(|p| p.source.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        let sets = self.snapshot();
        if is_pattern(id) {
            sets.patterns.iter().any(|p| p.source == id)
        } else {
            sets.exact.contains(id)
        }
    }

    /// Rebuild both sets from a full ID listing in one swap.
    pub fn replace_all<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut next = IdSets::default();
        for id in ids {
            let id = id.as_ref();
            if is_pattern(id) {
                if !next.patterns.iter().any(|p| p.source == id) {
                    next.patterns.push(CompiledPattern::compile(id));
                }
            } else {
                next.exact.insert(id.to_string());
            }
        }
        *self.sets.write() = Arc::new(next);
    }

    pub fn clear(&self) {
        *self.sets.write() = Arc::new(IdSets::default());
    }

    pub fn exact_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.snapshot().exact.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn pattern_ids(&self) -> Vec<String> {
        self.snapshot()
            .patterns
            .iter()
            .map(|p| p.source.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        let sets = self.snapshot();
        sets.exact.len() + sets.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
