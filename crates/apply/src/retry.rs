//! Bounded fixed-delay retry for transient cluster errors.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use once_cell::sync::Lazy;
use regex::RegexSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{ApplyError, Result};

static RETRYABLE: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r" x509: ",
        r"Gateway",
        r"Service Unavailable",
        r"InternalError",
        r"connection refused",
        r"EOF",
        r"i/o timeout",
        r"TLS handshake timeout",
    ])
    .expect("retryable patterns compile")
});

/// Whether an error message looks like a transient API server problem.
pub fn is_retryable(message: &str) -> bool {
    RETRYABLE.is_match(message)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, including the first.
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 10, delay: Duration::from_secs(5) }
    }
}

impl RetryPolicy {
    pub fn once() -> Self {
        Self { attempts: 1, delay: Duration::ZERO }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the attempts run out.
/// The last error is returned as is.
pub async fn retry<T, F, Fut>(cancel: &CancellationToken, policy: RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        let err = match op().await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        if attempt >= attempts || !err.is_transient() {
            return Err(err);
        }
        counter!("installer_yaml_retry", 1u64);
        debug!(what, attempt, attempts, error = %err, "retrying");
        tokio::select! {
            _ = cancel.cancelled() => return Err(ApplyError::Cancelled { what: what.to_string() }),
            _ = tokio::time::sleep(policy.delay) => {}
        }
        attempt += 1;
    }
}
