//! Bounded retry with exponential backoff.
//!
//! Applied to idempotent storage operations only (read, hash, upload-and-
//! verify). Destructive operations are never blindly retried; callers
//! re-check state first.

use crate::error::StorageError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Maximum attempts for an idempotent operation.
pub const MAX_ATTEMPTS: u32 = 3;

/// Initial backoff; doubles after each failed attempt.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Run `operation` up to [`MAX_ATTEMPTS`] times with doubling backoff.
/// `FileNotFound` and `InvalidPath` are not transient and fail immediately.
pub async fn with_retry<T, F, Fut>(op_name: &str, mut operation: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut last_err = None;

    for attempt in 1..=MAX_ATTEMPTS {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e @ StorageError::FileNotFound(_)) | Err(e @ StorageError::InvalidPath(_)) => {
                return Err(e)
            }
            Err(e) => {
                if attempt < MAX_ATTEMPTS {
                    warn!(operation = op_name, attempt, error = %e, "retrying after backoff");
                    sleep(backoff).await;
                    backoff *= 2;
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err.expect("at least one attempt was made"))
}
