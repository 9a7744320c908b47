use meshcell_core::config::BusConfig;
use meshcell_core::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Exponential backoff for bus (re)connection: `delay(n) = min(base * 2^n, cap)`,
/// at most `max_attempts` tries in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&BusConfig::default())
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
            max_attempts: config.max_reconnect_attempts,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds or the policy's attempt budget is spent.
/// `op` receives the zero-based attempt number.
pub async fn retry_with_backoff<T, F, Fut>(policy: ReconnectPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    info!(what = %what, attempt = attempt + 1, "Connected after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt + 1 >= max_attempts => {
                return Err(Error::Connection(format!(
                    "{} failed after {} attempts: {}",
                    what, max_attempts, e
                )));
            }
            Err(e) => {
                let delay = policy.delay(attempt);
                warn!(
                    what = %what,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Connection attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = ReconnectPolicy::new(Duration::from_millis(100), Duration::from_millis(1000), 10);
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_millis(1000));
        assert_eq!(policy.delay(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_defaults_follow_bus_config() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(policy.max_attempts, 10);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let policy = ReconnectPolicy::new(Duration::from_millis(1), Duration::from_millis(4), 5);
        let calls = AtomicU32::new(0);
        let value = retry_with_backoff(policy, "test", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(Error::Connection("refused".to_string()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let policy = ReconnectPolicy::new(Duration::from_millis(1), Duration::from_millis(2), 3);
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff(policy, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::Connection("refused".to_string())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
