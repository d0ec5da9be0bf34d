//! Request blacklist.
//!
//! A blacklisted feature ID is still mocked and dispatched, but it is not
//! written to history and produces no info-level lifecycle output.
//!
//! Rules are either exact feature IDs or regexes written as `/source/`.
//! Settings persist as `{ default, active }` under `settings:blacklist`, with
//! regex entries stored as `{ "__isRegExp": true, "source": "..." }`.

use crate::error::{ServiceError, StoreError};
use crate::store::{KeySpace, KvStore};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum BlacklistRule {
    Exact(String),
    Pattern(Regex),
}

impl BlacklistRule {
    /// `/.../` is a regex source, anything else an exact feature ID.
    pub fn parse(entry: &str) -> Result<Self, regex::Error> {
        match entry
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
        {
            Some(source) if entry.len() >= 2 => Ok(BlacklistRule::Pattern(Regex::new(source)?)),
            _ => Ok(BlacklistRule::Exact(entry.to_string())),
        }
    }

    pub fn matches(&self, feature_id: &str) -> bool {
        match self {
            BlacklistRule::Exact(id) => id == feature_id,
            BlacklistRule::Pattern(regex) => regex.is_match(feature_id),
        }
    }

    pub fn to_raw(&self) -> RawRule {
        match self {
            BlacklistRule::Exact(id) => RawRule::Exact(id.clone()),
            BlacklistRule::Pattern(regex) => RawRule::Pattern(RegexMarker {
                is_reg_exp: true,
                source: regex.as_str().to_string(),
            }),
        }
    }

    pub fn from_raw(raw: &RawRule) -> Result<Self, regex::Error> {
        match raw {
            RawRule::Exact(id) => Ok(BlacklistRule::Exact(id.clone())),
            RawRule::Pattern(marker) if marker.is_reg_exp => {
                Ok(BlacklistRule::Pattern(Regex::new(&marker.source)?))
            }
            // Unmarked objects are kept as literal sources
            RawRule::Pattern(marker) => Ok(BlacklistRule::Exact(marker.source.clone())),
        }
    }
}

impl fmt::Display for BlacklistRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlacklistRule::Exact(id) => f.write_str(id),
            BlacklistRule::Pattern(regex) => write!(f, "/{}/", regex.as_str()),
        }
    }
}

impl PartialEq for BlacklistRule {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegexMarker {
    #[serde(rename = "__isRegExp")]
    pub is_reg_exp: bool,
    pub source: String,
}

/// Stored form of one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawRule {
    Exact(String),
    Pattern(RegexMarker),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistSettingsRaw {
    #[serde(default)]
    pub default: Vec<RawRule>,
    #[serde(default)]
    pub active: Vec<RawRule>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlacklistSettings {
    pub default: Vec<BlacklistRule>,
    pub active: Vec<BlacklistRule>,
}

impl BlacklistSettings {
    pub fn to_raw(&self) -> BlacklistSettingsRaw {
        BlacklistSettingsRaw {
            default: self.default.iter().map(BlacklistRule::to_raw).collect(),
            active: self.active.iter().map(BlacklistRule::to_raw).collect(),
        }
    }

    pub fn from_raw(raw: &BlacklistSettingsRaw) -> Result<Self, regex::Error> {
        let decode = |rules: &[RawRule]| {
            rules
                .iter()
                .map(BlacklistRule::from_raw)
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            default: decode(&raw.default)?,
            active: decode(&raw.active)?,
        })
    }
}

/// Same rules regardless of order.
fn same_content(a: &[BlacklistRule], b: &[BlacklistRule]) -> bool {
    let mut a: Vec<String> = a.iter().map(ToString::to_string).collect();
    let mut b: Vec<String> = b.iter().map(ToString::to_string).collect();
    a.sort();
    b.sort();
    a == b
}

/// Order-preserving union.
fn union(first: &[BlacklistRule], second: &[BlacklistRule]) -> Vec<BlacklistRule> {
    let mut merged: Vec<BlacklistRule> = Vec::with_capacity(first.len() + second.len());
    for rule in first.iter().chain(second) {
        if !merged.contains(rule) {
            merged.push(rule.clone());
        }
    }
    merged
}

/// Process-local active rule list, replaced wholesale.
#[derive(Debug, Default)]
pub struct BlacklistCache {
    rules: RwLock<Arc<Vec<BlacklistRule>>>,
}

impl BlacklistCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, rules: Vec<BlacklistRule>) {
        *self.rules.write() = Arc::new(rules);
    }

    pub fn active(&self) -> Arc<Vec<BlacklistRule>> {
        Arc::clone(&self.rules.read())
    }

    pub fn is_blacklisted(&self, feature_id: &str) -> bool {
        self.active().iter().any(|rule| rule.matches(feature_id))
    }
}

/// Persists blacklist settings and keeps the local cache in step.
pub struct BlacklistService {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    cache: Arc<BlacklistCache>,
}

impl BlacklistService {
    pub fn new(store: Arc<dyn KvStore>, keys: KeySpace, cache: Arc<BlacklistCache>) -> Self {
        Self { store, keys, cache }
    }

    pub fn cache(&self) -> &Arc<BlacklistCache> {
        &self.cache
    }

    /// Stored settings, empty when none were ever written.
    pub async fn settings(&self) -> Result<BlacklistSettings, ServiceError> {
        let Some(raw) = self.store.get(&self.keys.blacklist_settings()).await? else {
            return Ok(BlacklistSettings::default());
        };
        let parsed: BlacklistSettingsRaw = serde_json::from_str(&raw).map_err(StoreError::from)?;
        BlacklistSettings::from_raw(&parsed).map_err(|e| ServiceError::InvalidRule(e.to_string()))
    }

    /// Persist a new active list, keeping the stored default unless given.
    pub async fn put(
        &self,
        active: Vec<BlacklistRule>,
        default: Option<Vec<BlacklistRule>>,
    ) -> Result<BlacklistSettings, ServiceError> {
        let default = match default {
            Some(default) => default,
            None => self.settings().await?.default,
        };
        let settings = BlacklistSettings { default, active };

        let encoded = serde_json::to_string(&settings.to_raw()).map_err(StoreError::from)?;
        self.store
            .set(&self.keys.blacklist_settings(), &encoded)
            .await?;
        self.cache.replace(settings.active.clone());

        tracing::debug!("Stored request blacklist with {} active rules", settings.active.len());
        Ok(settings)
    }

    /// Reconcile stored settings with the configured default list on startup.
    ///
    /// Stored active rules survive restarts. When the configured list changes,
    /// its rules are added to the active list and it becomes the new default.
    pub async fn renew_default(&self, configured: &[BlacklistRule]) -> Result<(), ServiceError> {
        let stored = self.settings().await?;
        self.cache.replace(stored.active.clone());

        if stored.active.is_empty() || stored.default.is_empty() {
            self.put(configured.to_vec(), Some(configured.to_vec())).await?;
        }

        if same_content(&stored.default, configured) {
            return Ok(());
        }

        let active = union(&stored.active, configured);
        self.put(active, Some(configured.to_vec())).await?;
        Ok(())
    }
}
