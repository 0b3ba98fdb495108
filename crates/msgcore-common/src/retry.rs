use std::time::Duration;

use tracing::warn;

use crate::severity::{Classify, Severity};

/// A fixed retry schedule: how many attempts, and how long to sleep between
/// them. Spec.md specifies concrete schedules in several places (Gateway
/// upstream publish: 3 attempts, 50/200/800 ms; Logic persistence: 3
/// attempts with backoff; TaskRunner per-page: 3 attempts, exponential) —
/// this type captures any of them.
#[derive(Debug, Clone)]
pub struct Backoff {
    delays: Vec<Duration>,
}

impl Backoff {
    /// Explicit per-attempt delays, e.g. the Gateway's 50/200/800 ms schedule.
    pub fn fixed(delays: impl Into<Vec<Duration>>) -> Self {
        Self {
            delays: delays.into(),
        }
    }

    /// `attempts` total tries, delay doubling from `base` after each failure.
    pub fn exponential(attempts: usize, base: Duration) -> Self {
        let delays = (0..attempts.saturating_sub(1))
            .map(|i| base * 2u32.pow(i as u32))
            .collect();
        Self { delays }
    }

    /// Total number of attempts this schedule allows (retries + 1).
    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }
}

/// Run `f` until it succeeds, a non-retriable error is returned, or the
/// backoff schedule is exhausted. Returns the last error on exhaustion.
///
/// `f` is retried only while its error classifies as [`Severity::Transient`];
/// any other severity returns immediately (spec §7: conflicts are treated as
/// success by the caller before this ever runs, policy/fatal errors never
/// retry).
pub async fn retry_with_backoff<T, E, F, Fut>(backoff: &Backoff, mut f: F) -> Result<T, E>
where
    E: Classify + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0usize;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(err) => {
                let retriable = err.severity() == Severity::Transient;
                if !retriable || attempt >= backoff.delays.len() {
                    return Err(err);
                }
                warn!(attempt, error = %err, "retrying after transient failure");
                tokio::time::sleep(backoff.delays[attempt]).await;
                attempt += 1;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom(Severity);

    impl Classify for Boom {
        fn severity(&self) -> Severity {
            self.0
        }
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let backoff = Backoff::fixed([Duration::from_millis(1)]);
        let calls = AtomicUsize::new(0);
        let result: Result<u32, Boom> = retry_with_backoff(&backoff, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let backoff = Backoff::fixed([Duration::from_millis(1), Duration::from_millis(1)]);
        let calls = AtomicUsize::new(0);
        let result: Result<u32, Boom> = retry_with_backoff(&backoff, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Boom(Severity::Transient))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_retries_non_transient() {
        let backoff = Backoff::fixed([Duration::from_millis(1)]);
        let calls = AtomicUsize::new(0);
        let result: Result<u32, Boom> = retry_with_backoff(&backoff, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Boom(Severity::Policy)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_and_returns_last_error() {
        let backoff = Backoff::exponential(3, Duration::from_millis(1));
        assert_eq!(backoff.max_attempts(), 3);
        let calls = AtomicUsize::new(0);
        let result: Result<u32, Boom> = retry_with_backoff(&backoff, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Boom(Severity::Transient)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
