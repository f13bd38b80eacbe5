//! Bounded retry with exponential backoff for transient network failures
//!
//! Fetch collaborators flag retryable failures by wrapping them in
//! [`TransientNetworkError`]; anything else is treated as non-retryable and
//! surfaces as a fetch failure immediately. A transient failure that
//! persists past the attempt budget becomes a fetch failure too. Backoff
//! jitter is derived from the process id so simultaneous processes do not
//! retry in lockstep, without needing an RNG.

use std::time::Duration;

use crate::error::EnvyError;

/// Marker wrapper for failures the fetcher believes are transient
/// (timeouts, connection resets, 5xx responses).
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TransientNetworkError(pub String);

/// Run `op` up to `attempts` times, sleeping between transient failures.
pub fn with_retries<T>(
    attempts: u32,
    base_delay: Duration,
    mut op: impl FnMut(u32) -> anyhow::Result<T>,
) -> Result<T, EnvyError> {
    let attempts = attempts.max(1);
    let mut last_reason = String::new();

    for attempt in 0..attempts {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                if err.downcast_ref::<TransientNetworkError>().is_none() {
                    return Err(EnvyError::Fetch(format!("{err:#}")));
                }
                last_reason = err.to_string();
                if attempt + 1 < attempts {
                    let backoff = base_delay.saturating_mul(1 << attempt.min(16));
                    let jitter =
                        Duration::from_millis(u64::from(std::process::id() % 7) * (u64::from(attempt) + 1));
                    tracing::debug!(
                        attempt,
                        reason = %last_reason,
                        "transient fetch failure, backing off"
                    );
                    std::thread::sleep(backoff + jitter);
                }
            }
        }
    }

    Err(EnvyError::Fetch(format!(
        "transient failure persisted after {attempts} attempts: {last_reason}"
    )))
}
