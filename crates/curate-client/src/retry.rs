// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 The spb-curate Authors.

//! Retry policy with scope-based error classification for the Curate Client.
//!
//! # Overview
//!
//! Every request the client issues, whether an API call, a presigned
//! file-storage PUT or a job status poll, is executed through a
//! [`RetryPolicy`].  The policy runs the request up to `max_attempts` times,
//! sleeping an exponentially growing (and capped) backoff delay between
//! attempts, and stops early on failures that retrying cannot fix.
//!
//! Requests fall into two scopes with different failure characteristics:
//!
//! - **Api**: Curate JSON API calls (`{api_base}/curate/...`). Low
//!   concurrency; authentication and validation failures must fail fast.
//! - **FileIO**: uploads to presigned storage URLs. High concurrency; S3
//!   style throttling and eventual-consistency conflicts are common.
//!
//! # Error Classification
//!
//! | Failure | Api | FileIO |
//! |---------|-----|--------|
//! | 408, 429 | Retry | Retry |
//! | 5xx | Retry | Retry |
//! | 409, 423 | Terminal | Retry |
//! | Other 4xx (400, 401, 403, 404, ...) | Terminal | Terminal |
//! | Connect, timeout, reset | Retry | Retry |
//! | Local file, JSON, parameter errors | Terminal | Terminal |
//!
//! # Backoff
//!
//! The delay before attempt `n + 1` is `min(backoff_base * 2^(n-1),
//! backoff_cap)`.  With jitter enabled up to 25% is added on top, so the
//! actual delay is never shorter than the nominal one.
//!
//! # Examples
//!
//! ```rust
//! use curate_client::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(4)
//!     .with_backoff(Duration::from_millis(200), Duration::from_secs(1))
//!     .with_jitter(false);
//!
//! assert_eq!(policy.backoff_delay(1), Duration::from_millis(200));
//! assert_eq!(policy.backoff_delay(2), Duration::from_millis(400));
//! assert_eq!(policy.backoff_delay(3), Duration::from_millis(800));
//! assert_eq!(policy.backoff_delay(4), Duration::from_secs(1));
//! ```

use crate::Error;
use log::{debug, warn};
use rand::Rng as _;
use std::{future::Future, time::Duration};
use tokio::time::Instant;

/// Default number of attempts per logical operation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Whether a failure is worth another attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    /// Transient failure: network, throttling or server side.
    Retryable,
    /// The same request would fail again.
    Terminal,
}

/// Classifies a failed attempt.
///
/// See the [module documentation](self) for the classification table.
pub fn classify(err: &Error) -> Classification {
    match err {
        Error::Api { status, .. } => match status {
            408 | 429 | 500..=599 => Classification::Retryable,
            _ => Classification::Terminal,
        },
        Error::FileTransfer { status, .. } => match status {
            408 | 409 | 423 | 429 | 500..=599 => Classification::Retryable,
            _ => Classification::Terminal,
        },
        Error::HttpError(e) => match e.status() {
            Some(status) => match status.as_u16() {
                408 | 429 | 500..=599 => Classification::Retryable,
                _ => Classification::Terminal,
            },
            // No status code means connection error, timeout, or other transport
            // failure while sending or receiving.
            None if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() => {
                Classification::Retryable
            }
            None => Classification::Terminal,
        },
        _ => Classification::Terminal,
    }
}

/// Bounded retry with capped exponential backoff.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(10),
            jitter: true,
        }
    }
}

/// Per-operation retry bookkeeping.  Owned by a single [`RetryPolicy::run`]
/// call and dropped once the operation succeeds or gives up.
#[derive(Debug)]
pub struct RetryContext {
    attempt: u32,
    started: Instant,
    last_error: Option<Error>,
}

impl RetryContext {
    fn new() -> Self {
        RetryContext {
            attempt: 0,
            started: Instant::now(),
            last_error: None,
        }
    }

    /// Number of attempts started so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Time since the first attempt started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// The failure of the previous attempt, if any.
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }
}

impl RetryPolicy {
    /// Creates a policy making at most `max_attempts` attempts (at least one).
    pub fn new(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// A policy that makes a single attempt.
    pub fn none() -> Self {
        RetryPolicy::new(1)
    }

    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    /// Sets the first backoff delay and the ceiling the delay grows to.
    pub fn with_backoff(self, base: Duration, cap: Duration) -> Self {
        RetryPolicy {
            backoff_base: base,
            backoff_cap: cap.max(base),
            ..self
        }
    }

    pub fn with_jitter(self, jitter: bool) -> Self {
        RetryPolicy { jitter, ..self }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    pub fn backoff_cap(&self) -> Duration {
        self.backoff_cap
    }

    /// Nominal delay slept after the `attempt`-th failure (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }

    fn sleep_duration(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let extra = (delay.as_millis() as u64) / 4;
        if extra == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=extra))
    }

    /// Runs `op` until it succeeds, fails terminally, or the attempts are
    /// exhausted.  The last failure is returned unchanged so callers can
    /// still inspect its status and classification.
    ///
    /// `what` names the operation in log messages.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut ctx = RetryContext::new();

        loop {
            ctx.attempt += 1;
            debug!(
                "{}: attempt {}/{}",
                what, ctx.attempt, self.max_attempts
            );

            let err = match op().await {
                Ok(value) => {
                    if ctx.attempt > 1 {
                        debug!(
                            "{}: succeeded after {} attempts ({:.2}s)",
                            what,
                            ctx.attempt,
                            ctx.elapsed().as_secs_f64()
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if classify(&err) == Classification::Terminal {
                debug!("{}: terminal failure on attempt {}: {}", what, ctx.attempt, err);
                return Err(err);
            }

            if ctx.attempt >= self.max_attempts {
                warn!(
                    "{}: giving up after {} attempts ({:.2}s): {}",
                    what,
                    ctx.attempt,
                    ctx.elapsed().as_secs_f64(),
                    err
                );
                return Err(err);
            }

            let delay = self.sleep_duration(ctx.attempt);
            warn!(
                "{}: attempt {}/{} failed ({}), retrying in {:.2}s",
                what,
                ctx.attempt,
                self.max_attempts,
                err,
                delay.as_secs_f64()
            );
            ctx.last_error = Some(err);
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    fn api(status: u16) -> Error {
        Error::Api {
            status,
            code: None,
            message: "test".to_string(),
        }
    }

    fn file(status: u16) -> Error {
        Error::FileTransfer {
            status,
            message: "test".to_string(),
        }
    }

    #[test]
    fn test_classify_api() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert_eq!(classify(&api(status)), Classification::Retryable, "{}", status);
        }
        for status in [400, 401, 403, 404, 409, 422, 423] {
            assert_eq!(classify(&api(status)), Classification::Terminal, "{}", status);
        }
    }

    #[test]
    fn test_classify_file_io() {
        for status in [408, 409, 423, 429, 500, 503] {
            assert_eq!(classify(&file(status)), Classification::Retryable, "{}", status);
        }
        for status in [400, 401, 403, 404] {
            assert_eq!(classify(&file(status)), Classification::Terminal, "{}", status);
        }
    }

    #[test]
    fn test_classify_local() {
        let err = Error::LocalAsset {
            key: "a.jpg".to_string(),
            message: "not found".to_string(),
        };
        assert_eq!(classify(&err), Classification::Terminal);
        assert_eq!(
            classify(&Error::InvalidParameters("x".to_string())),
            Classification::Terminal
        );
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::new(10)
            .with_backoff(Duration::from_millis(100), Duration::from_millis(500))
            .with_jitter(false);
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_never_shortens() {
        let policy = RetryPolicy::new(3)
            .with_backoff(Duration::from_millis(400), Duration::from_secs(4))
            .with_jitter(true);
        for attempt in 1..4 {
            let nominal = policy.backoff_delay(attempt);
            for _ in 0..50 {
                let actual = policy.sleep_duration(attempt);
                assert!(actual >= nominal);
                assert!(actual <= nominal + nominal / 4);
            }
        }
    }

    #[test]
    fn test_at_least_one_attempt() {
        assert_eq!(RetryPolicy::new(0).max_attempts(), 1);
        assert_eq!(RetryPolicy::none().max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let policy = RetryPolicy::new(5)
            .with_backoff(Duration::from_secs(1), Duration::from_secs(30))
            .with_jitter(false);
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result = policy
            .run("flaky", || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n <= 2 { Err(api(503)) } else { Ok(n) }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s after the first failure, 2s after the second.
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_single_attempt() {
        let policy = RetryPolicy::new(5);
        let calls = Arc::new(AtomicU32::new(0));

        let err = policy
            .run("rejected", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(api(400))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(400));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let policy = RetryPolicy::new(3)
            .with_backoff(Duration::from_millis(10), Duration::from_millis(10))
            .with_jitter(false);
        let calls = Arc::new(AtomicU32::new(0));

        let err = policy
            .run("down", || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(api(500 + n as u16))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.status(), Some(502));
    }
}
