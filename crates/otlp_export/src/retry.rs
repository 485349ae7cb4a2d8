//! Retry with exponential backoff.
//!
//! [`RetryingTransport`] wraps any [`Transport`] and re-sends a payload while
//! the failure is retryable, the attempt count allows it and the export's
//! total time budget is not spent. The delay schedule lives in the pure
//! function [`backoff_delay`] so it can be checked without a clock.

use crate::diag::Diagnostics;
use crate::error::ExportResult;
use crate::transport::Transport;
use bytes::Bytes;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{sleep, Instant};

// =============================================================================
// RETRY POLICY
// =============================================================================

/// Backoff parameters for one exporter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Upper bound for any computed delay.
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Relative jitter; 0.2 spreads each delay over ±20%.
    pub jitter: f64,
    /// Wall-clock budget for the whole export, all attempts and waits included.
    pub total_budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: 0.2,
            total_budget: Duration::from_secs(10) * 5,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Sizes the total budget to `timeout` per attempt.
    pub fn with_budget_for(mut self, timeout: Duration) -> Self {
        self.total_budget = timeout.saturating_mul(self.max_attempts.max(1));
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }
}

/// Delay before the attempt following failed attempt number `attempt` (1-based).
///
/// `jitter_sample` is a uniform sample in `[-1, 1]`. The result never exceeds
/// `max_backoff` unless the collector's `server_hint` asks for longer, in
/// which case the hint wins.
pub fn backoff_delay(
    policy: &RetryPolicy,
    attempt: u32,
    server_hint: Option<Duration>,
    jitter_sample: f64,
) -> Duration {
    let max = policy.max_backoff.as_secs_f64();
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let base = (policy.initial_backoff.as_secs_f64() * policy.backoff_multiplier.powi(exponent)).min(max);
    let factor = 1.0 + jitter_sample.clamp(-1.0, 1.0) * policy.jitter;
    let computed = Duration::from_secs_f64((base * factor).clamp(0.0, max));

    match server_hint {
        Some(hint) if hint > computed => hint,
        _ => computed,
    }
}

// =============================================================================
// RETRYING TRANSPORT
// =============================================================================

/// A transport wrapper that re-sends retryable failures with backoff.
///
/// ```ignore
/// let transport = RetryingTransport::new(http, RetryPolicy::default());
/// let body = transport.send(payload, Duration::from_secs(10)).await?;
/// ```
pub struct RetryingTransport<T: Transport> {
    inner: T,
    policy: RetryPolicy,
    diag: Diagnostics,
    /// Metrics: total retry attempts made
    total_retries: AtomicU64,
    /// Metrics: successful sends after retry (not first attempt)
    recovered_exports: AtomicU64,
    /// Metrics: sends that gave up with a retryable error
    exhausted_exports: AtomicU64,
}

impl<T: Transport> RetryingTransport<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            diag: Diagnostics::default(),
            total_retries: AtomicU64::new(0),
            recovered_exports: AtomicU64::new(0),
            exhausted_exports: AtomicU64::new(0),
        }
    }

    pub fn with_diagnostics(mut self, diag: Diagnostics) -> Self {
        self.diag = diag;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Returns the total number of retry attempts made.
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Returns sends that succeeded after at least one retry.
    pub fn recovered_exports(&self) -> u64 {
        self.recovered_exports.load(Ordering::Relaxed)
    }

    /// Returns sends that ran out of attempts or budget.
    pub fn exhausted_exports(&self) -> u64 {
        self.exhausted_exports.load(Ordering::Relaxed)
    }

    fn give_up(&self, attempts: u32, reason: &str) {
        self.exhausted_exports.fetch_add(1, Ordering::Relaxed);
        self.diag.debug(
            "retry",
            format_args!("{}: giving up after {attempts} attempt(s), {reason}", self.inner.name()),
        );
    }
}

impl<T: Transport> Transport for RetryingTransport<T> {
    async fn send(&self, payload: Bytes, timeout: Duration) -> ExportResult<Bytes> {
        let started = Instant::now();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let attempt_timeout = if attempt == 1 {
                timeout
            } else {
                timeout.min(self.policy.total_budget.saturating_sub(started.elapsed()))
            };

            let err = match self.inner.send(payload.clone(), attempt_timeout).await {
                Ok(body) => {
                    if attempt > 1 {
                        self.recovered_exports.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(body);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            if attempt >= max_attempts {
                self.give_up(attempt, "attempt limit reached");
                return Err(err);
            }

            let sample = rand::thread_rng().gen_range(-1.0..=1.0);
            let delay = backoff_delay(&self.policy, attempt, err.retry_after(), sample);
            if started.elapsed() + delay >= self.policy.total_budget {
                self.give_up(attempt, "time budget spent");
                return Err(err);
            }

            self.total_retries.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                transport = self.inner.name(),
                attempt,
                ?delay,
                error = %err,
                "retrying export"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExportError;
    use crate::transport::testing::ScriptedTransport;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_backoff(Duration::from_millis(100), Duration::from_secs(5))
            .with_jitter(0.0)
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = fast_policy();
        let delays: Vec<_> = (1..=4).map(|a| backoff_delay(&policy, a, None, 0.0)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }

    #[test]
    fn test_backoff_capped() {
        let policy = RetryPolicy::default();
        for attempt in [4, 10, 64, u32::MAX] {
            assert!(backoff_delay(&policy, attempt, None, 1.0) <= policy.max_backoff);
        }
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        let low = backoff_delay(&policy, 1, None, -1.0);
        let high = backoff_delay(&policy, 1, None, 1.0);
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        assert!((ms(low) - 800.0).abs() < 0.001, "{low:?}");
        assert!((ms(high) - 1200.0).abs() < 0.001, "{high:?}");
    }

    #[test]
    fn test_server_hint_wins_when_longer() {
        let policy = fast_policy();
        assert_eq!(
            backoff_delay(&policy, 1, Some(Duration::from_secs(7)), 0.0),
            Duration::from_secs(7)
        );
        assert_eq!(
            backoff_delay(&policy, 3, Some(Duration::from_millis(10)), 0.0),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn test_budget_follows_timeout() {
        let policy = RetryPolicy::default().with_budget_for(Duration::from_secs(2));
        assert_eq!(policy.total_budget, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_with_increasing_delays() {
        let transport = RetryingTransport::new(ScriptedTransport::failing(3), RetryPolicy::default());

        let result = transport.send(Bytes::from_static(b"p"), Duration::from_secs(1)).await;

        assert!(result.is_ok());
        let calls = transport.inner().call_instants();
        assert_eq!(calls.len(), 4);
        let gaps: Vec<_> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.windows(2).all(|g| g[1] > g[0]), "gaps not increasing: {gaps:?}");
        assert_eq!(transport.total_retries(), 3);
        assert_eq!(transport.recovered_exports(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts() {
        let transport = RetryingTransport::new(ScriptedTransport::failing(10), fast_policy());

        let result = transport.send(Bytes::new(), Duration::from_secs(1)).await;

        assert!(matches!(result, Err(ExportError::RetryableStatus { status: 503, .. })));
        assert_eq!(transport.inner().call_count(), 5);
        assert_eq!(transport.exhausted_exports(), 1);
        assert_eq!(transport.recovered_exports(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_immediately() {
        let inner = ScriptedTransport::new([Err(ExportError::NonRetryableStatus {
            status: 400,
            message: "bad request".into(),
        })]);
        let transport = RetryingTransport::new(inner, fast_policy());

        let result = transport.send(Bytes::new(), Duration::from_secs(1)).await;

        assert!(matches!(result, Err(ExportError::NonRetryableStatus { status: 400, .. })));
        assert_eq!(transport.inner().call_count(), 1);
        assert_eq!(transport.total_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_is_honored() {
        let inner = ScriptedTransport::new([Err(ExportError::RetryableStatus {
            status: 429,
            retry_after: Some(Duration::from_secs(3)),
        })]);
        let transport = RetryingTransport::new(inner, fast_policy());

        transport.send(Bytes::new(), Duration::from_secs(1)).await.unwrap();

        let calls = transport.inner().call_instants();
        assert_eq!(calls.len(), 2);
        assert!(calls[1] - calls[0] >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_limits_attempts() {
        let policy = fast_policy()
            .with_backoff(Duration::from_secs(1), Duration::from_secs(1))
            .with_budget_for(Duration::from_millis(500));
        let transport = RetryingTransport::new(ScriptedTransport::failing(10), policy);

        let result = transport.send(Bytes::new(), Duration::from_millis(500)).await;

        assert!(result.is_err());
        // 2.5s budget with 1s waits: attempts at t=0, 1s, 2s.
        assert_eq!(transport.inner().call_count(), 3);
        assert_eq!(transport.exhausted_exports(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_clipped_to_budget() {
        let policy = fast_policy()
            .with_backoff(Duration::from_millis(400), Duration::from_millis(400))
            .with_max_attempts(2);
        let policy = RetryPolicy {
            total_budget: Duration::from_secs(1),
            ..policy
        };
        let transport = RetryingTransport::new(ScriptedTransport::failing(1), policy);

        transport.send(Bytes::new(), Duration::from_secs(1)).await.unwrap();

        let timeouts = transport.inner().call_timeouts();
        assert_eq!(timeouts[0], Duration::from_secs(1));
        assert_eq!(timeouts[1], Duration::from_millis(600));
    }
}
