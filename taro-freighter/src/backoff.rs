use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Exponential backoff with full jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// First wait between attempts.
    pub base: Duration,
    /// Upper bound for any single wait.
    pub max: Duration,
    /// Maximum number of attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Backoff {
    /// A bounded policy for broadcast-style retries.
    pub fn bounded(base: Duration, max: Duration, attempts: u32) -> Self {
        Backoff {
            base,
            max,
            max_attempts: Some(attempts),
        }
    }

    /// An unbounded policy for deliver-until-acknowledged retries.
    pub fn forever(base: Duration, max: Duration) -> Self {
        Backoff {
            base,
            max,
            max_attempts: None,
        }
    }

    /// The jittered wait before attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let ceiling = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max);
        if ceiling.is_zero() {
            return ceiling;
        }
        // Full jitter: anywhere between zero and the exponential ceiling.
        let nanos = rand::thread_rng().gen_range(0..=ceiling.as_nanos() as u64);
        Duration::from_nanos(nanos)
    }
}

/// Runs `operation` until it succeeds or the policy's attempts run out,
/// sleeping with jittered exponential backoff in between. `on_retry` is
/// invoked with the attempt number and error before each wait.
pub async fn retry<T, E, F, Fut>(
    policy: Backoff,
    mut on_retry: impl FnMut(u32, &E),
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if let Some(max_attempts) = policy.max_attempts {
                    if attempt >= max_attempts {
                        return Err(err);
                    }
                }
                on_retry(attempt, &err);
                tokio::time::sleep(policy.delay(attempt)).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = Backoff::bounded(Duration::from_millis(1), Duration::from_millis(2), 5);

        let result: Result<u32, &str> = retry(policy, |_, _| {}, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient")
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn bounded_policy_surfaces_final_error() {
        let policy = Backoff::bounded(Duration::from_millis(1), Duration::from_millis(1), 3);
        let calls = AtomicU32::new(0);

        let result: Result<(), &str> = retry(policy, |_, _| {}, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("always") }
        })
        .await;

        assert_eq!(result.unwrap_err(), "always");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn delay_respects_ceiling() {
        let policy = Backoff::bounded(Duration::from_millis(100), Duration::from_millis(250), 10);
        for attempt in 1..12 {
            assert!(policy.delay(attempt) <= Duration::from_millis(250));
        }
    }
}
