use crate::config::RetryPolicy;
use crate::core::Result;
use log::warn;
use std::future::Future;

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the policy runs out of attempts.
///
/// Only `QuotaError::is_retryable` failures (conflicts, transient store
/// errors) are retried. Each attempt must be a complete store call so that a
/// failed attempt leaves nothing behind.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let backoff = policy.backoff(attempt);
                warn!(
                    "{} retry on {} (attempt {} of {}): {} (backoff={}ms)",
                    label,
                    err.class(),
                    attempt,
                    max_attempts,
                    err,
                    backoff.as_millis()
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
