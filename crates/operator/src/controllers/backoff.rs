use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

pub const INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const MAX_DELAY: Duration = Duration::from_secs(300);

/// Per-object exponential requeue delay for failed reconciles.
///
/// Each consecutive failure of the same key doubles the delay, up to
/// [`MAX_DELAY`]. A successful reconcile forgets the key.
#[derive(Debug, Default)]
pub struct RequeueBackoff {
    failures: Mutex<HashMap<String, u32>>,
}

impl RequeueBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure for `key` and return how long to wait before retrying.
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut failures = match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let attempt = failures.entry(key.to_string()).or_insert(0);
        let delay = delay_for(*attempt);
        *attempt = attempt.saturating_add(1);
        delay
    }

    pub fn reset(&self, key: &str) {
        let mut failures = match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        failures.remove(key);
    }
}

fn delay_for(attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    INITIAL_DELAY
        .checked_mul(factor)
        .map_or(MAX_DELAY, |delay| delay.min(MAX_DELAY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_capped() {
        let backoff = RequeueBackoff::new();
        let delays: Vec<u64> = (0..11)
            .map(|_| backoff.next_delay("default/mnist").as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 300, 300]);
    }

    #[test]
    fn keys_back_off_independently() {
        let backoff = RequeueBackoff::new();
        backoff.next_delay("default/a");
        backoff.next_delay("default/a");
        assert_eq!(backoff.next_delay("default/a"), Duration::from_secs(4));
        assert_eq!(backoff.next_delay("default/b"), INITIAL_DELAY);
    }

    #[test]
    fn success_resets_the_key() {
        let backoff = RequeueBackoff::new();
        backoff.next_delay("default/a");
        backoff.next_delay("default/a");
        backoff.reset("default/a");
        assert_eq!(backoff.next_delay("default/a"), INITIAL_DELAY);
    }

    #[test]
    fn huge_attempt_counts_stay_capped() {
        assert_eq!(delay_for(64), MAX_DELAY);
    }
}
