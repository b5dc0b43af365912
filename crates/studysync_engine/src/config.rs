//! Configuration for the sync engine.

use crate::error::SyncResult;
use std::time::Duration;
use url::Url;

/// Close code the server uses to reject the authentication token.
pub const DEFAULT_AUTH_REJECTED_CLOSE_CODE: u16 = 4001;

/// Storage key of the persisted offline queue.
pub const DEFAULT_QUEUE_KEY: &str = "studysync.offline_queue";

/// Storage key of the persisted device id.
pub const DEFAULT_DEVICE_KEY: &str = "studysync.device_id";

/// Configuration for the sync client.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Channel endpoint. `token` and `deviceId` are appended as query parameters.
    pub endpoint: Url,
    /// Reconnect policy.
    pub retry: RetryConfig,
    /// Close code that signals an auth rejection.
    pub auth_rejected_close_code: u16,
    /// Storage key of the offline queue.
    pub queue_key: String,
    /// Storage key of the device id.
    pub device_key: String,
}

impl SyncConfig {
    /// Creates a configuration for the given endpoint.
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            retry: RetryConfig::default(),
            auth_rejected_close_code: DEFAULT_AUTH_REJECTED_CLOSE_CODE,
            queue_key: DEFAULT_QUEUE_KEY.to_string(),
            device_key: DEFAULT_DEVICE_KEY.to_string(),
        }
    }

    /// Parses the endpoint and creates a configuration for it.
    pub fn from_endpoint(endpoint: &str) -> SyncResult<Self> {
        Ok(Self::new(Url::parse(endpoint)?))
    }

    /// Sets the reconnect policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the auth-rejection close code.
    pub fn with_auth_rejected_close_code(mut self, code: u16) -> Self {
        self.auth_rejected_close_code = code;
        self
    }

    /// Sets the storage key of the offline queue.
    pub fn with_queue_key(mut self, key: impl Into<String>) -> Self {
        self.queue_key = key.into();
        self
    }

    /// Sets the storage key of the device id.
    pub fn with_device_key(mut self, key: impl Into<String>) -> Self {
        self.device_key = key.into();
        self
    }
}

/// Configuration for reconnect behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of consecutive retries scheduled after unexpected drops.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a retry configuration with the default schedule.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    /// Creates a configuration that never reconnects automatically.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay before retry number `attempt` (0-indexed).
    ///
    /// `min(initial * multiplier^attempt, max)`, with no jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::from_endpoint("wss://sync.example.com/ws")
            .unwrap()
            .with_auth_rejected_close_code(4403)
            .with_queue_key("q")
            .with_device_key("d");

        assert_eq!(config.endpoint.as_str(), "wss://sync.example.com/ws");
        assert_eq!(config.auth_rejected_close_code, 4403);
        assert_eq!(config.queue_key, "q");
        assert_eq!(config.device_key, "d");
        assert_eq!(config.retry.max_attempts, 10);
    }

    #[test]
    fn sync_config_rejects_bad_endpoint() {
        assert!(SyncConfig::from_endpoint("not a url").is_err());
    }

    #[test]
    fn retry_config_no_retry() {
        assert_eq!(RetryConfig::no_retry().max_attempts, 0);
    }

    #[test]
    fn retry_delay_schedule() {
        let config = RetryConfig::default();
        let delays: Vec<u64> = (0..10)
            .map(|attempt| config.delay_for_attempt(attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30, 30, 30]);
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(5));
    }
}
