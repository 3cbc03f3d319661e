use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runs `attempt` until it succeeds, sleeping a fixed `interval` between tries.
///
/// There is no attempt limit and no backoff growth. Returns `None` only when
/// `shutdown` is cancelled, which is checked before every attempt and
/// interrupts the wait.
pub async fn retry_every<T, E, F, Fut>(
    what: &str,
    interval: Duration,
    shutdown: &CancellationToken,
    mut attempt: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempts: u64 = 0;

    loop {
        if shutdown.is_cancelled() {
            info!("{} abandoned on shutdown after {} attempts", what, attempts);
            return None;
        }

        attempts += 1;
        match attempt().await {
            Ok(value) => {
                if attempts > 1 {
                    info!("{} succeeded on attempt {}", what, attempts);
                }
                return Some(value);
            }
            Err(e) => {
                warn!(
                    "{} failed (attempt {}): {}. Retrying in {:?}",
                    what, attempts, e, interval
                );
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn test_retries_until_success() {
        let shutdown = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let started = Instant::now();
        let result = retry_every("test op", Duration::from_millis(20), &shutdown, || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("failure {}", n))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // two waits of the fixed interval, no busy spinning
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_wait() {
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result: Option<()> =
            retry_every("never succeeds", Duration::from_secs(3600), &shutdown, || async {
                Err::<(), _>("down")
            })
            .await;

        assert!(result.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_no_attempt_after_shutdown() {
        tokio_test::block_on(async {
            let shutdown = CancellationToken::new();
            shutdown.cancel();
            let calls = AtomicU32::new(0);

            let result = retry_every("cancelled", Duration::from_millis(1), &shutdown, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(()) }
            })
            .await;

            assert!(result.is_none());
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        });
    }
}
