//! Retry driver for transient backend failures.
//!
//! Wraps a unit of work with exponential backoff and a should-retry
//! predicate. Callbacks let request-shaped work rewind its body before a
//! resend.
use crate::{Error, Result};
use std::{thread, time::Duration};

/// Per-attempt backoff: `min(0.1 * 2^attempt, 30)` seconds, attempt >= 1.
fn backoff(attempt: usize) -> Duration {
    let secs = 0.1 * 2f64.powi(attempt.min(16) as i32);
    Duration::from_secs_f64(secs.min(30.0))
}

pub struct Retry<'a> {
    max_retries: usize,
    should_retry: &'a dyn Fn(&Error) -> bool,
    retry_callback: Option<&'a mut dyn FnMut(&Error)>,
}

impl<'a> Retry<'a> {
    pub fn new(max_retries: usize, should_retry: &'a dyn Fn(&Error) -> bool) -> Self {
        Retry {
            max_retries: max_retries.max(1),
            should_retry,
            retry_callback: None,
        }
    }

    /// Run before each backoff sleep, e.g. to seek a rewindable request body
    /// back to 0 or reopen a file-backed body.
    pub fn on_retry(mut self, callback: &'a mut dyn FnMut(&Error)) -> Self {
        self.retry_callback = Some(callback);
        self
    }

    pub fn call<T>(mut self, mut work: impl FnMut() -> Result<T>) -> Result<T> {
        let mut recovered_from: Option<Error> = None;
        for attempt in 1..=self.max_retries {
            match work() {
                Ok(value) => {
                    if let Some(err) = recovered_from {
                        tracing::debug!("transient error resolved: {err}, with {attempt} tries");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if attempt == self.max_retries || !(self.should_retry)(&err) {
                        return Err(err);
                    }
                    if let Some(callback) = self.retry_callback.as_mut() {
                        callback(&err);
                    }
                    let interval = backoff(attempt);
                    tracing::debug!(
                        "transient error encountered: {err}, retry in {:.1} seconds after {attempt} tries",
                        interval.as_secs_f64()
                    );
                    thread::sleep(interval);
                    recovered_from = Some(err);
                }
            }
        }
        unreachable!("retry loop always returns")
    }
}

/// Convenience wrapper for the common case with no callbacks.
pub fn execute<T>(
    max_retries: usize,
    should_retry: impl Fn(&Error) -> bool,
    work: impl FnMut() -> Result<T>,
) -> Result<T> {
    Retry::new(max_retries, &should_retry).call(work)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn flaky(failures: usize) -> impl FnMut() -> Result<u32> {
        let calls = AtomicUsize::new(0);
        move || {
            if calls.fetch_add(1, Ordering::SeqCst) < failures {
                Err(Error::unknown("s3://b/k", anyhow::anyhow!("connection reset")))
            } else {
                Ok(42)
            }
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        assert_eq!(execute(5, |_| true, flaky(2)).unwrap(), 42);
    }

    #[test]
    fn gives_up_after_max_retries() {
        let result = execute(3, |_| true, flaky(10));
        assert!(result.is_err());
    }

    #[test]
    fn non_retryable_errors_propagate_immediately() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = execute(10, |_| false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::not_found("s3://b/k"))
        });
        assert!(matches!(result, Err(Error::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retry_callback_runs_before_each_sleep() {
        let mut rewinds = 0;
        let mut callback = |_: &Error| rewinds += 1;
        let result = Retry::new(4, &|_| true)
            .on_retry(&mut callback)
            .call(flaky(2));
        assert_eq!(result.unwrap(), 42);
        assert_eq!(rewinds, 2);
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff(1), Duration::from_secs_f64(0.2));
        assert_eq!(backoff(2), Duration::from_secs_f64(0.4));
        assert_eq!(backoff(20), Duration::from_secs_f64(30.0));
    }
}
