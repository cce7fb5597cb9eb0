//! Bounded waiting primitives used by ingestion and extraction.
//!
//! Both run on `tokio::time`, so every wait is a suspension point and tests can
//! drive them with a paused clock.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Run `check` every `interval` until it yields a value or `deadline` elapses.
///
/// The check always runs at least once. Returns `None` on deadline; callers
/// decide whether that is fatal (it usually is not).
pub async fn poll_until<T, F, Fut>(
    interval: Duration,
    deadline: Duration,
    mut check: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline_at = Instant::now() + deadline;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        let now = Instant::now();
        if now >= deadline_at {
            return None;
        }
        sleep(interval.min(deadline_at - now)).await;
    }
}

/// Run `op` up to `attempts` times with a fixed `backoff` between tries.
///
/// `op` receives the 1-based attempt number. The last error is returned
/// when every attempt fails.
pub async fn retry<T, E, F, Fut>(attempts: u32, backoff: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                debug!("Attempt {}/{} failed: {}", attempt, attempts, e);
                sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_poll_returns_first_value() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let c = calls.clone();
        let found = poll_until(Duration::from_secs(2), Duration::from_secs(30), || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                (n == 3).then_some(n)
            }
        })
        .await;

        assert_eq!(found, Some(3));
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_stops_at_deadline() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let c = calls.clone();
        let found: Option<()> = poll_until(Duration::from_secs(2), Duration::from_secs(5), || {
            c.fetch_add(1, Ordering::SeqCst);
            async { None }
        })
        .await;

        assert!(found.is_none());
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        // t=0, 2, 4, 5
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let started = Instant::now();
        let result: Result<u32, String> = retry(3, Duration::from_secs(2), |attempt| async move {
            if attempt < 3 {
                Err(format!("attempt {} failed", attempt))
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_last_error() {
        let result: Result<(), String> =
            retry(2, Duration::from_millis(10), |attempt| async move {
                Err(format!("boom {}", attempt))
            })
            .await;
        assert_eq!(result, Err("boom 2".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_zero_attempts_runs_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry(0, Duration::from_secs(1), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("nope".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
