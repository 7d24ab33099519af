use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default wait before a store with no listeners stops hearing other contexts.
pub const DEFAULT_GRACE_DELAY_MS: u64 = 1000;

/// Settings shared by every binding created from one engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long an unobserved binding keeps its event registration, so
    /// a quick unsubscribe/resubscribe does not churn the backend.
    pub grace_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grace_delay_ms: DEFAULT_GRACE_DELAY_MS,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_grace_delay(mut self, delay: Duration) -> Self {
        self.grace_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn grace_delay(&self) -> Duration {
        Duration::from_millis(self.grace_delay_ms)
    }
}
