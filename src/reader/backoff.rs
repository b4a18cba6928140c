use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectionExhausted {
    pub attempts: u32,
}

impl std::fmt::Display for ReconnectionExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Reconnection attempts exhausted after {} tries, manual intervention required",
            self.attempts
        )
    }
}

impl std::error::Error for ReconnectionExhausted {}

/// Retry bookkeeping with a fixed delay between attempts
///
/// Unlike an exponential schedule the wait never grows: a reader that comes
/// back is picked up within one `retry_delay`.
#[derive(Debug)]
pub struct FixedBackoff {
    delay: Duration,
    max_attempts: u32,
    current_attempt: u32,
}

impl FixedBackoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self::resume(policy, 0)
    }

    /// Continue counting from a previous run
    pub fn resume(policy: ReconnectPolicy, attempts: u32) -> Self {
        Self {
            delay: policy.retry_delay,
            max_attempts: policy.max_attempts,
            current_attempt: attempts.min(policy.max_attempts),
        }
    }

    /// Count one failed attempt, erroring once the ceiling is reached
    pub fn record_failure(&mut self) -> Result<u32, ReconnectionExhausted> {
        if self.current_attempt < self.max_attempts {
            self.current_attempt += 1;
        }

        if self.is_exhausted() {
            Err(ReconnectionExhausted {
                attempts: self.current_attempt,
            })
        } else {
            Ok(self.current_attempt)
        }
    }

    pub async fn sleep(&self) {
        log::warn!(
            "⏳ Retry attempt {} of {} in {}ms",
            self.current_attempt + 1,
            self.max_attempts,
            self.delay.as_millis()
        );

        sleep(self.delay).await;
    }

    pub fn is_exhausted(&self) -> bool {
        self.current_attempt >= self.max_attempts
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            retry_delay: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_exhausts_at_ceiling() {
        let mut backoff = FixedBackoff::new(policy(3));

        assert_eq!(backoff.record_failure(), Ok(1));
        assert_eq!(backoff.record_failure(), Ok(2));
        assert_eq!(backoff.record_failure(), Err(ReconnectionExhausted { attempts: 3 }));
        assert!(backoff.is_exhausted());

        // Stays pinned at the ceiling
        assert_eq!(backoff.record_failure(), Err(ReconnectionExhausted { attempts: 3 }));
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn test_resume_clamps_to_ceiling() {
        let backoff = FixedBackoff::resume(policy(5), 9);
        assert_eq!(backoff.attempts(), 5);
        assert!(backoff.is_exhausted());

        let fresh = FixedBackoff::resume(policy(5), 2);
        assert_eq!(fresh.attempts(), 2);
        assert!(!fresh.is_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_waits_fixed_delay() {
        let mut backoff = FixedBackoff::new(policy(5));
        let start = tokio::time::Instant::now();

        backoff.record_failure().unwrap();
        backoff.sleep().await;
        backoff.record_failure().unwrap();
        backoff.sleep().await;

        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }
}
