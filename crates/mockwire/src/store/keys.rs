//! Store key namespace. Every key lives under one configurable prefix.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("ms:")
    }
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn mock(&self, id: &str) -> String {
        format!("{}mocking:{}", self.prefix, id)
    }

    pub fn mock_count(&self, id: &str) -> String {
        format!("{}mocking-count:{}", self.prefix, id)
    }

    pub fn mock_pattern(&self) -> String {
        format!("{}mocking:*", self.prefix)
    }

    /// Strip the mock prefix from a full key, if it is a mock key.
    pub fn mock_id<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_prefix("mocking:"))
    }

    pub fn history(&self, aggregation_key: &str) -> String {
        format!("{}watcher:{}", self.prefix, aggregation_key)
    }

    pub fn history_pattern(&self) -> String {
        format!("{}watcher:*", self.prefix)
    }

    pub fn response(&self, request_id: &str) -> String {
        format!("{}response:{}", self.prefix, request_id)
    }

    pub fn response_short(&self, request_id: &str) -> String {
        format!("{}response-short:{}", self.prefix, request_id)
    }

    pub fn blacklist_settings(&self) -> String {
        format!("{}settings:blacklist", self.prefix)
    }

    pub fn everything(&self) -> String {
        format!("{}*", self.prefix)
    }

    /// Pub/sub channel for cross-instance events: `ms:` becomes `ms-events`.
    pub fn event_channel(&self) -> String {
        format!("{}-events", self.prefix.trim_end_matches(':'))
    }
}
