use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::{BASE_RETRY_DELAY_MS, LOCK_STALE_MS, MAX_RETRY_DELAY_MS, STUCK_THRESHOLD_MS};

/// Host-supplied tuning for the whole sync core.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub outbox: OutboxConfig,
    pub trigger: TriggerConfig,
    pub prefetch: PrefetchConfig,
}

impl SyncConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.outbox.validate()?;
        self.trigger.validate()?;
        self.prefetch.validate()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub lock_stale_ms: u64,
    pub stuck_threshold_ms: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_queue_entries: usize,
    pub max_archive_entries: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            lock_stale_ms: LOCK_STALE_MS,
            stuck_threshold_ms: STUCK_THRESHOLD_MS,
            base_backoff_ms: BASE_RETRY_DELAY_MS,
            max_backoff_ms: MAX_RETRY_DELAY_MS,
            max_queue_entries: 5_000,
            max_archive_entries: 500,
        }
    }
}

impl OutboxConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_stale_ms < 1_000 {
            return Err(ConfigError::Invalid(
                "lock_stale_ms should be at least 1000ms".into(),
            ));
        }
        if self.stuck_threshold_ms == 0 {
            return Err(ConfigError::Invalid("stuck_threshold_ms must be > 0".into()));
        }
        if self.base_backoff_ms == 0 {
            return Err(ConfigError::Invalid("base_backoff_ms must be > 0".into()));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(ConfigError::Invalid(
                "max_backoff_ms must be >= base_backoff_ms".into(),
            ));
        }
        if self.max_queue_entries == 0 {
            return Err(ConfigError::Invalid("max_queue_entries must be > 0".into()));
        }
        if self.max_archive_entries == 0 {
            return Err(ConfigError::Invalid("max_archive_entries must be > 0".into()));
        }
        Ok(())
    }

    /// `min(max, base * 2^attempts)`.
    #[must_use]
    pub fn backoff(&self, attempts: u32) -> Duration {
        Duration::from_millis(crate::calculate_retry_delay(
            attempts,
            self.base_backoff_ms,
            self.max_backoff_ms,
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Quiet period after the last event before a drain starts.
    pub debounce_ms: u64,
    /// Periodic drain while the app is in the foreground. 0 disables it.
    pub interval_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1_500,
            interval_ms: 30_000,
        }
    }
}

impl TriggerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms != 0 && self.interval_ms < self.debounce_ms {
            return Err(ConfigError::Invalid(
                "interval_ms must be 0 or >= debounce_ms".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_ms > 0).then(|| Duration::from_millis(self.interval_ms))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub concurrency: usize,
    pub warm_concurrency: usize,
    /// Applied to jobs that do not set their own TTL. `None` keeps such
    /// entries fresh until invalidated.
    pub default_ttl_ms: Option<u64>,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            warm_concurrency: 2,
            default_ttl_ms: Some(5 * 60 * 1000),
        }
    }
}

impl PrefetchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 || self.warm_concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be > 0".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_ms.map(Duration::from_millis)
    }
}
