//! Transfer Retry Policy
//!
//! Immutable description of how hard `select_pool_and_start_mover` tries:
//! how many budgeted attempts, how far apart, and for how long in total.
//! `Duration::MAX` stands for "infinite" wherever a duration is accepted.

use std::time::Duration;

use tokio::time::Instant;

/// Default spacing between attempts of the never-fail policy
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(60);

/// Default time a pool gets to create a mover
pub const DEFAULT_MOVER_START_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retry_count: u32,
    retry_period: Duration,
    total_timeout: Duration,
    mover_start_timeout: Duration,
}

impl RetryPolicy {
    /// Arbitrary bounded policy. A `retry_count` of zero behaves like one.
    pub fn bounded(
        retry_count: u32,
        retry_period: Duration,
        total_timeout: Duration,
        mover_start_timeout: Duration,
    ) -> Self {
        Self {
            retry_count: retry_count.max(1),
            retry_period,
            total_timeout,
            mover_start_timeout,
        }
    }

    /// Keep trying forever
    pub fn never_fail_policy() -> Self {
        Self::bounded(
            u32::MAX,
            DEFAULT_RETRY_PERIOD,
            Duration::MAX,
            DEFAULT_MOVER_START_TIMEOUT,
        )
    }

    /// A single attempt bounded by `timeout`; never sleeps
    pub fn try_once_policy(timeout: Duration) -> Self {
        Self::bounded(1, Duration::ZERO, timeout, timeout)
    }

    /// Maximum number of budgeted attempts
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Minimum spacing between the starts of two consecutive attempts
    pub fn retry_period(&self) -> Duration {
        self.retry_period
    }

    pub fn total_timeout(&self) -> Duration {
        self.total_timeout
    }

    pub fn mover_start_timeout(&self) -> Duration {
        self.mover_start_timeout
    }
}

/// Absolute point in time, possibly infinitely far away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// `timeout` from now, saturating to infinity
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    #[cfg(test)]
    pub fn never() -> Self {
        Self(None)
    }

    #[cfg(test)]
    pub fn is_infinite(&self) -> bool {
        self.0.is_none()
    }

    /// Time left; `Duration::MAX` when infinite, zero once passed
    pub fn remaining(&self) -> Duration {
        match self.0 {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    pub fn has_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let once = RetryPolicy::try_once_policy(Duration::from_secs(5));
        assert_eq!(once.retry_count(), 1);
        assert_eq!(once.retry_period(), Duration::ZERO);
        assert_eq!(once.total_timeout(), Duration::from_secs(5));
        assert_eq!(once.mover_start_timeout(), Duration::from_secs(5));

        let never = RetryPolicy::never_fail_policy();
        assert_eq!(never.retry_count(), u32::MAX);
        assert_eq!(never.total_timeout(), Duration::MAX);
        assert_eq!(never.retry_period(), DEFAULT_RETRY_PERIOD);
    }

    #[test]
    fn test_zero_retry_count_means_one_attempt() {
        let policy = RetryPolicy::bounded(0, Duration::ZERO, Duration::MAX, Duration::MAX);
        assert_eq!(policy.retry_count(), 1);
    }

    #[tokio::test]
    async fn test_infinite_deadline_saturates() {
        let deadline = Deadline::after(Duration::MAX);
        assert!(deadline.is_infinite());
        assert_eq!(deadline.remaining(), Duration::MAX);
        assert!(!deadline.has_expired());
        assert_eq!(Deadline::never(), deadline);
    }

    #[tokio::test]
    async fn test_finite_deadline_expires() {
        let deadline = Deadline::after(Duration::from_millis(10));
        assert!(!deadline.is_infinite());
        assert!(deadline.remaining() <= Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(deadline.has_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }
}
