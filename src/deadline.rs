use crate::error::{BookingError, StoreError};
use std::{future::Future, time::Duration};
use tokio::time::{sleep, timeout};
use tracing::warn;

/// Runs one store call under `limit`, handing back the store's own result so
/// the caller can react to specific [`StoreError`]s. Running out of time is
/// reported as a retryable [`BookingError::Unavailable`].
pub async fn within<T, F>(
    limit: Duration,
    operation: &str,
    future: F,
) -> Result<Result<T, StoreError>, BookingError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    timeout(limit, future).await.map_err(|_| {
        warn!(operation, ?limit, "Store call timed out");
        BookingError::Unavailable(format!("{operation} timed out"))
    })
}

/// Like [`within`], with store errors already mapped to [`BookingError`].
pub async fn with_deadline<T, F>(limit: Duration, operation: &str, future: F) -> Result<T, BookingError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    within(limit, operation, future)
        .await?
        .map_err(BookingError::from)
}

/// Retries an idempotent operation once after `backoff` when it failed with
/// [`BookingError::Unavailable`]. Every other outcome is returned as is.
pub async fn retry_once<T, F, Fut>(backoff: Duration, mut operation: F) -> Result<T, BookingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BookingError>>,
{
    match operation().await {
        Err(err) if err.is_retryable() => {
            warn!(%err, ?backoff, "Retrying after transient failure");
            sleep(backoff).await;
            operation().await
        }
        result => result,
    }
}
