//! Configuration for the sync manager.

use crate::conflict::ConflictPolicy;
use crate::error::{SyncError, SyncResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for sync operations.
///
/// Deserializes from JSON with every field optional:
///
/// ```rust
/// use leafsync_sync_engine::SyncConfig;
///
/// let config = SyncConfig::from_json(r#"{ "device_id": "tablet", "debounce_millis": 500 }"#).unwrap();
/// assert_eq!(config.device_id, "tablet");
/// assert_eq!(config.periodic_interval_secs, 300);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Device ID (unique per device).
    pub device_id: String,
    /// Seconds between periodic passes; 0 disables the timer.
    pub periodic_interval_secs: u64,
    /// First retry delay after a transient failure.
    pub backoff_base_secs: u64,
    /// Upper bound on the retry delay.
    pub backoff_max_secs: u64,
    /// Whether to add up to 25% random jitter to retry delays.
    pub backoff_jitter: bool,
    /// Window after the first local write before a debounced pass starts.
    pub debounce_millis: u64,
    /// Deadline for each remote call.
    pub request_timeout_secs: u64,
    /// Maximum records requested per pull.
    pub pull_batch_size: usize,
    /// Maximum records sent per push call.
    pub push_batch_size: usize,
    /// Push rounds per pass when the remote keeps reporting conflicts.
    pub max_push_rounds: u32,
    /// Age after which acknowledged tombstones are purged.
    pub tombstone_retention_secs: u64,
    /// How conflicts are settled.
    pub conflict_policy: ConflictPolicy,
}

impl SyncConfig {
    /// Creates a configuration for the given device.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            periodic_interval_secs: 300,
            backoff_base_secs: 2,
            backoff_max_secs: 300,
            backoff_jitter: true,
            debounce_millis: 2_000,
            request_timeout_secs: 30,
            pull_batch_size: 100,
            push_batch_size: 100,
            max_push_rounds: 3,
            tombstone_retention_secs: 30 * 24 * 60 * 60,
            conflict_policy: ConflictPolicy::LastWriterWins,
        }
    }

    /// Parses a JSON configuration, filling in defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if the JSON is malformed or the values
    /// are out of range.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] naming the first bad field.
    pub fn validate(&self) -> SyncResult<()> {
        let bad = |field: &str, why: &str| Err(SyncError::Config(format!("{field} {why}")));
        if self.device_id.is_empty() {
            return bad("device_id", "must not be empty");
        }
        if self.pull_batch_size == 0 {
            return bad("pull_batch_size", "must be at least 1");
        }
        if self.push_batch_size == 0 {
            return bad("push_batch_size", "must be at least 1");
        }
        if self.max_push_rounds == 0 {
            return bad("max_push_rounds", "must be at least 1");
        }
        if self.request_timeout_secs == 0 {
            return bad("request_timeout_secs", "must be at least 1");
        }
        if self.backoff_max_secs < self.backoff_base_secs {
            return bad("backoff_max_secs", "must not be below backoff_base_secs");
        }
        Ok(())
    }

    /// Sets the periodic interval; zero disables the timer.
    #[must_use]
    pub fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval_secs = interval.as_secs();
        self
    }

    /// Sets the retry backoff bounds.
    #[must_use]
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base_secs = base.as_secs();
        self.backoff_max_secs = max.as_secs();
        self
    }

    /// Enables or disables retry jitter.
    #[must_use]
    pub fn with_backoff_jitter(mut self, jitter: bool) -> Self {
        self.backoff_jitter = jitter;
        self
    }

    /// Sets the write debounce window.
    #[must_use]
    pub fn with_debounce(mut self, window: Duration) -> Self {
        self.debounce_millis = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs();
        self
    }

    /// Sets the pull batch size.
    #[must_use]
    pub fn with_pull_batch_size(mut self, size: usize) -> Self {
        self.pull_batch_size = size;
        self
    }

    /// Sets the push batch size.
    #[must_use]
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size;
        self
    }

    /// Sets the number of push rounds per pass.
    #[must_use]
    pub fn with_max_push_rounds(mut self, rounds: u32) -> Self {
        self.max_push_rounds = rounds;
        self
    }

    /// Sets the tombstone retention window.
    #[must_use]
    pub fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention_secs = retention.as_secs();
        self
    }

    /// Sets the conflict policy.
    #[must_use]
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Interval of the periodic timer, `None` if disabled.
    pub fn periodic_interval(&self) -> Option<Duration> {
        (self.periodic_interval_secs > 0).then(|| Duration::from_secs(self.periodic_interval_secs))
    }

    /// The write debounce window.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_millis)
    }

    /// The per-call timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The tombstone retention window.
    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_secs(self.tombstone_retention_secs)
    }

    /// Retry behavior derived from the backoff fields.
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_secs(self.backoff_base_secs),
            max_delay: Duration::from_secs(self.backoff_max_secs),
            backoff_multiplier: 2.0,
            add_jitter: self.backoff_jitter,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("local")
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Calculates the delay after `failures` consecutive failures.
    ///
    /// Zero failures means no delay. Jitter never pushes the delay past
    /// `max_delay`.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let base_delay =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();
        let delay_secs = base_delay.min(max_secs);

        if self.add_jitter {
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64((delay_secs + jitter).min(max_secs))
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("phone")
            .with_pull_batch_size(50)
            .with_push_batch_size(25)
            .with_request_timeout(Duration::from_secs(60))
            .with_debounce(Duration::from_millis(750))
            .with_max_push_rounds(5)
            .with_conflict_policy(ConflictPolicy::RemoteWins);

        assert_eq!(config.device_id, "phone");
        assert_eq!(config.max_push_rounds, 5);
        assert_eq!(config.conflict_policy, ConflictPolicy::RemoteWins);
        assert_eq!(config.pull_batch_size, 50);
        assert_eq!(config.push_batch_size, 25);
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
        assert_eq!(config.debounce(), Duration::from_millis(750));
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.periodic_interval(), Some(Duration::from_secs(300)));
        assert_eq!(config.debounce(), Duration::from_secs(2));
        assert_eq!(config.tombstone_retention(), Duration::from_secs(2_592_000));
        assert_eq!(config.conflict_policy, ConflictPolicy::LastWriterWins);
        config.validate().unwrap();
    }

    #[test]
    fn zero_interval_disables_timer() {
        let config = SyncConfig::default().with_periodic_interval(Duration::ZERO);
        assert_eq!(config.periodic_interval(), None);
    }

    #[test]
    fn from_json_fills_defaults() {
        let config = SyncConfig::from_json(
            r#"{"device_id": "e-reader", "backoff_base_secs": 1, "conflict_policy": "remote_wins"}"#,
        )
        .unwrap();
        assert_eq!(config.device_id, "e-reader");
        assert_eq!(config.backoff_base_secs, 1);
        assert_eq!(config.conflict_policy, ConflictPolicy::RemoteWins);
        assert_eq!(config.push_batch_size, 100);
    }

    #[test]
    fn from_json_rejects_bad_values() {
        assert!(matches!(
            SyncConfig::from_json(r#"{"push_batch_size": 0}"#),
            Err(SyncError::Config(_))
        ));
        assert!(matches!(
            SyncConfig::from_json("{not json"),
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn retry_delay_doubles_then_caps() {
        let retry = SyncConfig::default()
            .with_backoff(Duration::from_secs(2), Duration::from_secs(10))
            .with_backoff_jitter(false)
            .retry();

        assert_eq!(retry.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_secs(10));
        assert_eq!(retry.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let retry = SyncConfig::default()
            .with_backoff(Duration::from_secs(4), Duration::from_secs(6))
            .retry();
        for _ in 0..100 {
            let first = retry.delay_for_attempt(1);
            assert!(first >= Duration::from_secs(4) && first <= Duration::from_secs(5));
            assert!(retry.delay_for_attempt(5) <= Duration::from_secs(6));
        }
    }
}
