//! Explicit retry helper (spec §7/§9), replacing the source's decorator-based retry.
//! Grounded on `original_source/ingest_api/ingest/resilience/retry.py`
//! (RetryConfig/calculate_delay/retry_with_backoff).

use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            cap: Duration::from_secs(10),
            jitter: 0.25,
            max_attempts: 3,
        }
    }
}

fn calculate_delay(cfg: &RetryConfig, attempt: u32) -> Duration {
    let raw = cfg.base.as_secs_f64() * cfg.factor.powi(attempt as i32 - 1);
    let capped = raw.min(cfg.cap.as_secs_f64());
    let jitter_span = capped * cfg.jitter;
    let offset = if jitter_span > 0.0 {
        rand::thread_rng().gen_range(-jitter_span..=jitter_span)
    } else {
        0.0
    };
    Duration::from_secs_f64((capped + offset).max(0.0))
}

/// Retries `f` up to `cfg.max_attempts` times with exponential backoff and jitter. On
/// exhaustion, returns the last error (the caller is expected to warn-log and move on
/// per spec §7 — this helper does not itself decide the fallback behavior).
pub async fn retry_with_backoff<T, E, F, Fut>(cfg: &RetryConfig, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= cfg.max_attempts {
                    return Err(err);
                }
                tokio::time::sleep(calculate_delay(cfg, attempt)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry_on_first_try() {
        let calls = AtomicU32::new(0);
        let result: Result<i32, &str> = retry_with_backoff(&RetryConfig::default(), || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Ok(42) }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let cfg = RetryConfig {
            base: Duration::from_millis(1),
            factor: 1.0,
            cap: Duration::from_millis(2),
            jitter: 0.0,
            max_attempts: 3,
        };
        let calls = AtomicU32::new(0);
        let result: Result<i32, &str> = retry_with_backoff(&cfg, || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err("boom") }
        })
        .await;
        assert_eq!(result, Err("boom"));
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }
}
