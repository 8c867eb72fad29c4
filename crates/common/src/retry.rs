//! Cancellation-aware retry helper with exponential backoff
//!
//! Used by any loop needing durable backoff: coordinator status pushes,
//! watermark persistence, log-stream reconnects. Step-level retry policy
//! lives in the node runtime; this helper is the generic contract.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Minimum delay substituted when a policy computes a non-positive wait.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Debug logs from retry loops are throttled to one per this window.
const LOG_THROTTLE: Duration = Duration::from_secs(30);

static LAST_LOG_MS: AtomicU64 = AtomicU64::new(0);

/// Exponential backoff parameters.
///
/// Delay for attempt `k` (1-based) is
/// `min(interval * backoff^(k-1), max_interval)`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub limit: u32,
    pub interval: Duration,
    pub backoff: f64,
    pub max_interval: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            limit: 3,
            interval: Duration::from_secs(1),
            backoff: 2.0,
            max_interval: None,
        }
    }
}

impl BackoffPolicy {
    /// Compute the delay before the given 1-based attempt.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff.max(1.0);
        let exp = attempt.saturating_sub(1);
        let secs = self.interval.as_secs_f64() * factor.powi(i32::try_from(exp).unwrap_or(i32::MAX));
        let delay = if secs.is_finite() && secs >= 0.0 {
            Duration::from_secs_f64(secs.min(u64::MAX as f64))
        } else {
            self.max_interval.unwrap_or(self.interval)
        };
        match self.max_interval {
            Some(cap) if delay > cap => cap,
            _ => delay,
        }
    }
}

/// Call `op` until it succeeds, the policy is exhausted, the error is
/// non-retriable, or the token is cancelled.
///
/// `op` is invoked at most `policy.limit + 1` times. Errors wrapped with
/// the permanent sentinel are returned immediately.
pub async fn retry<T, F, Fut>(
    cancel: &CancellationToken,
    policy: &BackoffPolicy,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_if(cancel, policy, op, Error::is_retryable).await
}

/// [`retry`] with a custom retriability predicate. Permanent errors are
/// always final regardless of the predicate.
pub async fn retry_if<T, F, Fut, P>(
    cancel: &CancellationToken,
    policy: &BackoffPolicy,
    mut op: F,
    is_retriable: P,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled("retry loop cancelled".to_string()));
        }
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if err.is_permanent() || !is_retriable(&err) {
                    return Err(err);
                }
                if attempt > policy.limit {
                    return Err(err);
                }
                let mut delay = policy.delay(attempt);
                if delay < MIN_RETRY_DELAY {
                    delay = MIN_RETRY_DELAY;
                }
                log_throttled(&err, attempt, delay);
                tokio::select! {
                    () = cancel.cancelled() => {
                        return Err(Error::Cancelled("retry loop cancelled".to_string()));
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

fn log_throttled(err: &Error, attempt: u32, delay: Duration) {
    let now_ms = chrono::Utc::now().timestamp_millis().unsigned_abs();
    let last = LAST_LOG_MS.load(Ordering::Relaxed);
    if now_ms.saturating_sub(last) >= LOG_THROTTLE.as_millis() as u64
        && LAST_LOG_MS
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    {
        debug!(attempt, ?delay, error = %err, "retrying after error");
    }
}
