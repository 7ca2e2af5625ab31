//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Device or user name attached to uploads as the author.
    pub author: Option<String>,
    /// Maximum number of record operations running concurrently per batch.
    pub batch_concurrency: usize,
    /// Whether uploaded records are write-protected on the server.
    pub lock_uploads: bool,
    /// Retry configuration for remote calls.
    pub retry: RetryPolicy,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            author: None,
            batch_concurrency: 5,
            lock_uploads: false,
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the author name attached to uploads.
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Sets the per-batch concurrency cap.
    pub fn with_batch_concurrency(mut self, concurrency: usize) -> Self {
        self.batch_concurrency = concurrency.max(1);
        self
    }

    /// Sets whether uploads lock records on the server.
    pub fn with_lock_uploads(mut self, lock: bool) -> Self {
        self.lock_uploads = lock;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry behavior for rate-limited remote calls.
///
/// The delay starts at `initial_delay` and is multiplied by `multiplier`
/// after every retry; once the next delay would reach `give_up_at`, the
/// task stops retrying and surfaces the last error.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub multiplier: u32,
    /// Ceiling at which retrying stops.
    pub give_up_at: Duration,
}

impl RetryPolicy {
    /// Creates the default policy: 1s initial delay, doubling, 60s ceiling.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2,
            give_up_at: Duration::from_secs(60),
        }
    }

    /// Creates a policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2,
            give_up_at: Duration::ZERO,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the give-up ceiling.
    pub fn with_give_up_at(mut self, ceiling: Duration) -> Self {
        self.give_up_at = ceiling;
        self
    }

    /// The delay to use after the given one.
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(self.multiplier.max(1))
    }

    /// Returns true if a retry at the given delay should not be attempted.
    pub fn should_give_up(&self, delay: Duration) -> bool {
        delay >= self.give_up_at
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = SyncConfig::new()
            .with_author("laptop")
            .with_batch_concurrency(3)
            .with_lock_uploads(true);

        assert_eq!(config.author.as_deref(), Some("laptop"));
        assert_eq!(config.batch_concurrency, 3);
        assert!(config.lock_uploads);
    }

    #[test]
    fn concurrency_is_at_least_one() {
        let config = SyncConfig::new().with_batch_concurrency(0);
        assert_eq!(config.batch_concurrency, 1);
    }

    #[test]
    fn delay_doubles_until_ceiling() {
        let policy = RetryPolicy::new();
        let mut delay = policy.initial_delay;
        let mut performed = Vec::new();

        while !policy.should_give_up(delay) {
            performed.push(delay.as_secs());
            delay = policy.next_delay(delay);
        }

        assert_eq!(performed, vec![1, 2, 4, 8, 16, 32]);
    }

    #[test]
    fn no_retry_gives_up_immediately() {
        let policy = RetryPolicy::no_retry();
        assert!(policy.should_give_up(policy.initial_delay));
    }
}
