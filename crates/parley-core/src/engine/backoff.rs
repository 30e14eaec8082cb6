use crate::errors::ClassifiedError;
use rand::Rng;
use std::time::Duration;

/// Wait before the attempt after `attempt` (1-based): `factor^(attempt-1) + U(0, jitter)` seconds.
pub fn backoff_delay<R: Rng + ?Sized>(attempt: u32, factor: f64, jitter: f64, rng: &mut R) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let base = sanitize(factor).powi(exponent);
    let jitter = if sanitize(jitter) > 0.0 {
        rng.gen::<f64>() * jitter
    } else {
        0.0
    };
    Duration::try_from_secs_f64(sanitize(base + jitter)).unwrap_or(Duration::MAX)
}

/// Retry iff the error is retryable and the budget (`max_retries + 1` attempts) is not spent.
pub fn should_retry(error: &ClassifiedError, attempt: u32, max_retries: u32) -> bool {
    error.retryable && attempt < max_retries.saturating_add(1)
}

fn sanitize(v: f64) -> f64 {
    if v.is_nan() || v < 0.0 {
        0.0
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn exponential_without_jitter() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(backoff_delay(1, 2.0, 0.0, &mut rng), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, 2.0, 0.0, &mut rng), Duration::from_secs(2));
        assert_eq!(backoff_delay(3, 2.0, 0.0, &mut rng), Duration::from_secs(4));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let d = backoff_delay(2, 3.0, 0.5, &mut rng);
            assert!(d >= Duration::from_secs(3));
            assert!(d < Duration::from_secs_f64(3.5));
        }
    }

    #[test]
    fn degenerate_inputs_do_not_panic() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(backoff_delay(4, -2.0, -1.0, &mut rng), Duration::ZERO);
        assert_eq!(backoff_delay(1, 0.0, 0.0, &mut rng), Duration::from_secs(1));
        assert_eq!(backoff_delay(5000, 10.0, 0.0, &mut rng), Duration::MAX);
    }

    #[test]
    fn retry_decision() {
        let transient = ClassifiedError::rate_limited("429");
        let fatal = ClassifiedError::protocol("bad", "bad");
        assert!(should_retry(&transient, 1, 2));
        assert!(should_retry(&transient, 2, 2));
        assert!(!should_retry(&transient, 3, 2));
        assert!(!should_retry(&fatal, 1, 2));
        assert!(!should_retry(&transient, 1, 0));
    }
}
