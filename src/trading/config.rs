//! Engine tunables.

use std::time::Duration;

use crate::api::CallPolicy;

/// Configuration for the trigger engine and its exchange calls.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Seconds between ticks
    pub poll_interval_secs: u64,

    /// Timeout applied to each exchange call attempt
    pub call_timeout: Duration,

    /// Attempts per idempotent exchange call, including the first
    pub max_attempts: u32,

    /// First backoff delay; doubles up to `max_backoff`
    pub initial_backoff: Duration,

    pub max_backoff: Duration,

    /// How long the tradable-symbol listing is trusted before refetching
    pub symbol_cache_ttl: Duration,

    /// Write `enabled=false` back for entries that fail validation
    pub auto_disable_invalid: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            call_timeout: Duration::from_secs(15),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            symbol_cache_ttl: Duration::from_secs(3600),
            auto_disable_invalid: true,
        }
    }
}

impl EngineConfig {
    pub fn call_policy(&self) -> CallPolicy {
        CallPolicy {
            timeout: self.call_timeout,
            max_attempts: self.max_attempts,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
        }
    }
}
