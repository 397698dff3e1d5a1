use std::{future::Future, time::Duration as StdDuration};

use anyhow::Result;
use time::Duration;

/// Format a duration as a compact human-readable string, e.g. `1h 2m 5s`.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.whole_seconds().max(0);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Run a read-only remote operation with bounded retries and doubling
/// backoff. Mutating operations must not go through this: a mutation that
/// times out may still have taken effect, and is corrected on the next pass
/// instead of being retried blindly.
pub async fn retry_read<T, F, Fut>(what: &str, attempts: u32, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = StdDuration::from_millis(500);
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                tracing::warn!(
                    "{what} failed (attempt {attempt}/{attempts}), retrying in {delay:?}: {err:#}"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
