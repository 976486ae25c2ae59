//! Configuration types for the scheduler.

use serde::Deserialize;
use std::time::Duration;

/// Top-level scheduler configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Document store configuration.
    pub store: StoreConfig,
    /// Distributed-lock service configuration.
    pub lock: LockConfig,
    /// Work queue configuration.
    pub queue: QueueConfig,
    /// Loop tuning.
    pub scheduler: LoopConfig,
}

/// Document store connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Connection URL.
    pub url: String,
    /// Maximum pool connections.
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/stratum".to_owned(),
            max_connections: 10,
        }
    }
}

/// Distributed-lock service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Connection URL.
    pub url: String,
    /// Lock TTL in seconds.
    pub ttl_secs: u64,
    /// Acquisition attempts before giving up.
    pub retry_attempts: u32,
    /// Delay between acquisition attempts in milliseconds.
    pub retry_delay_ms: u64,
    /// Maximum pool connections.
    pub max_connections: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_owned(),
            ttl_secs: 60,
            retry_attempts: 10,
            retry_delay_ms: 50,
            max_connections: 10,
        }
    }
}

impl LockConfig {
    /// Lock TTL as a [`Duration`].
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Work queue configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Connection URL.
    pub url: String,
    /// Queue name work orders are published to.
    pub queue: String,
    /// Maximum pool connections.
    pub max_connections: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_owned(),
            queue: "stratum:work".to_owned(),
            max_connections: 10,
        }
    }
}

/// Outer-loop tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Sleep when no policies exist or no wake time could be computed.
    pub idle_sleep_secs: u64,
    /// Advance `last_run` even when a pass published no messages.
    ///
    /// The original behaviour. Disabling it keeps `last_run` in place
    /// until at least one work order was published.
    pub advance_without_publish: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            idle_sleep_secs: 60,
            advance_without_publish: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.lock.ttl_secs, 60);
        assert_eq!(config.lock.retry_attempts, 10);
        assert_eq!(config.queue.queue, "stratum:work");
        assert_eq!(config.scheduler.idle_sleep_secs, 60);
        assert!(config.scheduler.advance_without_publish);
    }

    #[test]
    fn sections_deserialise_independently() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "scheduler": { "advance_without_publish": false }
        }))
        .expect("partial config should deserialise");

        assert!(!config.scheduler.advance_without_publish);
        assert_eq!(config.scheduler.idle_sleep_secs, 60);
        assert_eq!(config.store.max_connections, 10);
    }
}
