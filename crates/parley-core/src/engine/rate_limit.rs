use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Global pacing: consecutive grants are at least `1/rate` apart across all callers.
///
/// Waiters are served in lock-arrival order (tokio's mutex is fair).
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Option<Duration>,
    last_grant: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(rate_per_second: Option<f64>) -> Self {
        let min_interval = rate_per_second
            .filter(|r| r.is_finite() && *r > 0.0)
            .and_then(|r| Duration::try_from_secs_f64(1.0 / r).ok());
        Self {
            min_interval,
            last_grant: Mutex::new(None),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    pub fn min_interval(&self) -> Option<Duration> {
        self.min_interval
    }

    pub async fn acquire(&self) {
        let Some(interval) = self.min_interval else {
            return;
        };
        let mut last = self.last_grant.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + interval;
            if Instant::now() < ready_at {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}
