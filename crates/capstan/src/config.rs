//! Configuration for queue, dispatcher, and callback behavior

use std::time::Duration;

/// Lease and sweep settings shared by the dispatcher and sweeper
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a claim remains exclusive without renewal
    pub lease_duration: Duration,
    /// How often the sweeper reclaims expired leases
    pub sweep_interval: Duration,
    /// Lease acquisitions plus requeues before a job fails with
    /// `exhausted_retries`
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

/// Worker-pool settings
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Concurrent slots per dispatcher process
    pub concurrency: usize,
    pub queue: QueueConfig,
    /// Upper bound for the jittered idle-poll backoff
    pub idle_backoff_cap: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            queue: QueueConfig::default(),
            idle_backoff_cap: Duration::from_secs(2),
        }
    }
}

impl DispatcherConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

/// Webhook delivery settings
#[derive(Debug, Clone)]
pub struct CallbackConfig {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// Failure retry delay: `min(30s * 2^(attempts-1), 10m)`.
pub fn retry_delay(attempts: u32) -> Duration {
    let base = Duration::from_secs(30);
    let cap = Duration::from_secs(600);
    let shift = attempts.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        assert_eq!(retry_delay(1), Duration::from_secs(30));
        assert_eq!(retry_delay(2), Duration::from_secs(60));
        assert_eq!(retry_delay(3), Duration::from_secs(120));
        assert_eq!(retry_delay(10), Duration::from_secs(600));
        assert_eq!(retry_delay(0), Duration::from_secs(30));
    }

    #[test]
    fn test_defaults() {
        let q = QueueConfig::default();
        assert_eq!(q.lease_duration, Duration::from_secs(30));
        assert_eq!(q.max_attempts, 3);
        let d = DispatcherConfig::default().with_concurrency(0);
        assert_eq!(d.concurrency, 1);
    }
}
