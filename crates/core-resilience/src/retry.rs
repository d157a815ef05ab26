//! Cancellable retry loop and shutdown-aware timeouts

use crate::backoff::{Backoff, BackoffConfig};
use crate::error::ResilienceError;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Run `op` until it succeeds, sleeping between failures
///
/// `op` receives the 1-based attempt number. The loop stops with
/// `Cancelled` as soon as `cancel` fires (also while an attempt or a sleep
/// is in progress) and with `RetriesExhausted` once the backoff has no more
/// delays to hand out.
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: &str,
    config: &BackoffConfig,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, ResilienceError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut backoff = Backoff::new(config.clone());
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(ResilienceError::Cancelled);
        }
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ResilienceError::Cancelled),
            result = op(attempt) => result,
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) => {
                let Some(delay) = backoff.next_delay() else {
                    return Err(ResilienceError::RetriesExhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                };

                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, backing off"
                );

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ResilienceError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Await `fut` for at most `limit`, giving up early when `cancel` fires
pub async fn with_timeout<F, T>(
    limit: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, ResilienceError>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ResilienceError::Cancelled),
        result = tokio::time::timeout(limit, fut) => result.map_err(|_| ResilienceError::Timeout(limit)),
    }
}
