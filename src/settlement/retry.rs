use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::AppResult;

/// Base delay between attempts; attempt `n` waits `n * RETRY_BACKOFF`
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Re-run a whole ledger transaction while it fails with a transient store
/// conflict, up to `attempts` tries in total.
pub async fn with_retry<T, F, Fut>(operation: &str, attempts: u32, mut run: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        match run().await {
            Err(e) if e.is_retryable() && attempt < attempts => {
                warn!(
                    "🔁 {} hit a transient store conflict (attempt {}/{}): {}",
                    operation, attempt, attempts, e
                );
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
