use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Retry an idempotent async operation with exponential backoff and
/// jitter. Delays start at `base_delay_ms` and double per attempt, capped
/// at `max_delay_ms`.
pub async fn retry_with_backoff<F, Fut, T, E>(
    attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut last_error = None;

    for attempt in 0..attempts {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt < attempts - 1 {
                    let backoff = base_delay_ms.saturating_mul(2_u64.pow(attempt));
                    let jitter = rand::thread_rng().gen_range(0..=backoff / 2);
                    let delay_ms = (backoff + jitter).min(max_delay_ms);

                    tracing::debug!(
                        "attempt {} failed ({}), retrying in {}ms",
                        attempt + 1,
                        e,
                        delay_ms
                    );
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry_with_backoff(5, 1, 10, || {
            let c = counter_clone.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient")
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts() {
        let result: Result<(), &str> =
            retry_with_backoff(3, 1, 5, || async { Err("always") }).await;
        assert!(result.is_err());
    }
}
