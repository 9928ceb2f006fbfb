use crate::core::{CounterType, DEFAULT_COUNTER_TYPE, QuotaError, Result};
use crate::storage::memory::DEFAULT_MAX_TRANSACTION_ITEMS;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the create path enforces the quota.
///
/// The two modes have different overshoot bounds and are never mixed:
/// - `BestEffortRead`: QuotaGate reads both counters before the create
///   transaction, which carries no quota condition. With C admissions in
///   flight for one owner, at most `quota_max + C - 1` entities exist before
///   the gate observes the overshoot and denies further creates.
/// - `Transactional`: the create transaction additionally requires
///   `ledger_count < quota_max` on the owner at commit time, so the ledger
///   never passes `quota_max` through creates. Costs contention on the owner
///   record and turns concurrent last-slot creates into quota denials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    #[default]
    BestEffortRead,
    Transactional,
}

/// Bounded retry for synchronous store calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 5,
            max_backoff_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Exponential backoff after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(exponential_backoff_ms(
            self.base_backoff_ms,
            self.max_backoff_ms,
            attempt,
        ))
    }
}

/// Change-feed consumer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub shard_count: u32,
    /// Records fetched per poll of a shard.
    pub batch_size: usize,
    pub retry_base_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    /// Keep acknowledged records so shards can be rewound and replayed.
    /// Otherwise workers compact their shard after every processed batch.
    pub retain_acknowledged: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            shard_count: 4,
            batch_size: 16,
            retry_base_backoff_ms: 10,
            retry_max_backoff_ms: 1_000,
            retain_acknowledged: false,
        }
    }
}

impl FeedConfig {
    /// Backoff before redelivering a record that failed `attempt` times.
    pub fn redelivery_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(exponential_backoff_ms(
            self.retry_base_backoff_ms,
            self.retry_max_backoff_ms,
            attempt,
        ))
    }
}

fn exponential_backoff_ms(base: u64, max: u64, attempt: u32) -> u64 {
    let base = base.max(1);
    let cap = max.max(base);

    let mut backoff = base;
    for _ in 1..attempt {
        backoff = backoff.saturating_mul(2).min(cap);
    }
    backoff
}

/// Top-level configuration for the quota engine.
///
/// # Examples
///
/// ```
/// use quotacount::{AdmissionMode, QuotaConfig};
///
/// let config = QuotaConfig::new()
///     .default_quota_max(3)
///     .admission(AdmissionMode::Transactional)
///     .shard_count(2);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub counter_type: String,
    pub default_quota_max: i64,
    pub admission: AdmissionMode,
    pub retry: RetryPolicy,
    pub feed: FeedConfig,
    /// Entities flagged per transaction by bulk soft-delete.
    pub delete_batch_size: usize,
    pub max_transaction_items: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            counter_type: DEFAULT_COUNTER_TYPE.to_string(),
            default_quota_max: 10,
            admission: AdmissionMode::default(),
            retry: RetryPolicy::default(),
            feed: FeedConfig::default(),
            delete_batch_size: 25,
            max_transaction_items: DEFAULT_MAX_TRANSACTION_ITEMS,
        }
    }
}

impl QuotaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| QuotaError::Config(format!("invalid config JSON: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn counter_type(mut self, counter_type: impl Into<String>) -> Self {
        self.counter_type = counter_type.into();
        self
    }

    pub fn default_quota_max(mut self, quota_max: i64) -> Self {
        self.default_quota_max = quota_max;
        self
    }

    pub fn admission(mut self, mode: AdmissionMode) -> Self {
        self.admission = mode;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn shard_count(mut self, shard_count: u32) -> Self {
        self.feed.shard_count = shard_count;
        self
    }

    pub fn feed(mut self, feed: FeedConfig) -> Self {
        self.feed = feed;
        self
    }

    pub fn delete_batch_size(mut self, size: usize) -> Self {
        self.delete_batch_size = size;
        self
    }

    pub fn max_transaction_items(mut self, max: usize) -> Self {
        self.max_transaction_items = max;
        self
    }

    /// Typed counter discriminator.
    pub fn counter_kind(&self) -> Result<CounterType> {
        CounterType::new(self.counter_type.clone())
            .map_err(|err| QuotaError::Config(err.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.counter_kind()?;
        if self.default_quota_max < 0 {
            return Err(QuotaError::Config(
                "default_quota_max must be >= 0".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(QuotaError::Config(
                "retry.max_attempts must be >= 1".to_string(),
            ));
        }
        if self.feed.shard_count == 0 {
            return Err(QuotaError::Config(
                "feed.shard_count must be >= 1".to_string(),
            ));
        }
        if self.feed.batch_size == 0 {
            return Err(QuotaError::Config(
                "feed.batch_size must be >= 1".to_string(),
            ));
        }
        if self.max_transaction_items < 2 {
            return Err(QuotaError::Config(
                "max_transaction_items must be >= 2".to_string(),
            ));
        }
        // One slot of every bulk-delete transaction goes to the owner update.
        if self.delete_batch_size == 0 || self.delete_batch_size >= self.max_transaction_items {
            return Err(QuotaError::Config(format!(
                "delete_batch_size must be between 1 and {}",
                self.max_transaction_items - 1
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = QuotaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.admission, AdmissionMode::BestEffortRead);
        assert_eq!(config.counter_kind().unwrap().as_str(), "owned-entities");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = QuotaConfig::from_json_str(
            r#"{"admission": "transactional", "feed": {"shard_count": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.admission, AdmissionMode::Transactional);
        assert_eq!(config.feed.shard_count, 2);
        assert_eq!(config.feed.batch_size, 16);
        assert_eq!(config.delete_batch_size, 25);
    }

    #[test]
    fn test_invalid_configs() {
        assert!(QuotaConfig::new().shard_count(0).validate().is_err());
        assert!(QuotaConfig::new().counter_type("").validate().is_err());
        assert!(QuotaConfig::new().default_quota_max(-1).validate().is_err());
        assert!(
            QuotaConfig::new()
                .max_transaction_items(10)
                .delete_batch_size(10)
                .validate()
                .is_err()
        );
        assert!(QuotaConfig::from_json_str("{not json").is_err());
    }

    #[test]
    fn test_backoff_is_capped_exponential() {
        let retry = RetryPolicy {
            max_attempts: 5,
            base_backoff_ms: 5,
            max_backoff_ms: 15,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(5));
        assert_eq!(retry.backoff(2), Duration::from_millis(10));
        assert_eq!(retry.backoff(3), Duration::from_millis(15));
        assert_eq!(retry.backoff(9), Duration::from_millis(15));
    }
}
