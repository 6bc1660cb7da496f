//! Bounded-attempt retry with multiplied backoff.

use std::future::Future;
use std::time::Duration;

/// Re-exported so callers can build richer policies without their own
/// dependency on the backoff crate.
pub use exponential_backoff::Backoff;

/// A bounded retry policy: `attempts` tries, sleeping `initial * factor^n`
/// between failures.
#[derive(Debug, Clone)]
pub struct Retry {
    attempts: u32,
    backoff: Backoff,
}

impl Retry {
    pub fn new(attempts: u32, initial: Duration, factor: u32) -> Self {
        let mut backoff = Backoff::new(attempts, initial, None);
        backoff.set_factor(factor);
        backoff.set_jitter(0.0);
        Self { attempts, backoff }
    }

    /// Spread sleeps by up to `jitter` (0.0..1.0) in either direction.
    pub fn with_jitter(mut self, jitter: f32) -> Self {
        self.backoff.set_jitter(jitter);
        self
    }

    /// Invoke `f(attempt, last_err)` until it succeeds or attempts are
    /// exhausted, returning the final error. `f` sees the zero-based attempt
    /// number and the previous attempt's error.
    pub async fn run<T, E, F, Fut>(&self, f: F) -> Result<T, E>
    where
        F: FnMut(u32, Option<&E>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_filtered(|_| true, f).await
    }

    /// As [`run`](Self::run), but an error for which `retryable` returns
    /// false short-circuits the remaining attempts.
    pub async fn run_filtered<T, E, F, Fut, R>(&self, retryable: R, mut f: F) -> Result<T, E>
    where
        F: FnMut(u32, Option<&E>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
    {
        let mut last_err: Option<E> = None;

        for attempt in 0..self.attempts.max(1) {
            match f(attempt, last_err.as_ref()).await {
                Ok(value) => return Ok(value),
                Err(err) if !retryable(&err) => return Err(err),
                Err(err) => last_err = Some(err),
            }
            if let Some(sleep) = self.backoff.next(attempt + 1) {
                tokio::time::sleep(sleep).await;
            }
        }
        Err(last_err.expect("at least one attempt ran"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let retry = Retry::new(5, Duration::from_millis(1), 2);

        let got: Result<u32, &str> = retry
            .run(|attempt, _last| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err("transient")
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(got, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_the_last_error() {
        let retry = Retry::new(3, Duration::from_millis(1), 2);

        let got: Result<(), String> = retry
            .run(|attempt, last| {
                // Each attempt can observe the preceding failure.
                if attempt > 0 {
                    assert!(last.is_some());
                }
                async move { Err(format!("attempt {attempt}")) }
            })
            .await;

        assert_eq!(got, Err("attempt 2".to_string()));
    }

    #[tokio::test]
    async fn non_retryable_errors_short_circuit() {
        let calls = AtomicU32::new(0);
        let retry = Retry::new(10, Duration::from_millis(1), 2);

        let got: Result<(), &str> = retry
            .run_filtered(
                |err| *err != "fatal",
                |attempt, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt == 0 {
                            Err("transient")
                        } else {
                            Err("fatal")
                        }
                    }
                },
            )
            .await;

        assert_eq!(got, Err("fatal"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let retry = Retry::new(0, Duration::from_millis(1), 2);
        let got: Result<u32, &str> = retry.run(|_, _| async { Ok(7) }).await;
        assert_eq!(got, Ok(7));
    }
}
