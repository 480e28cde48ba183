use chrono::Duration;
use rand::{Rng, SeedableRng, rngs::SmallRng};

/// Exponential backoff as a standalone value, kept apart from the retry
/// ledger so the schedule is testable without storage.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_secs: u64,
    pub cap_secs: u64,
    pub jitter_secs: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_secs: 30,
            cap_secs: 1_800,
            jitter_secs: 15,
        }
    }
}

impl BackoffPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_secs: env_u64("RETRY_BACKOFF_BASE_SECS").unwrap_or(defaults.base_secs),
            cap_secs: env_u64("RETRY_BACKOFF_CAP_SECS").unwrap_or(defaults.cap_secs),
            jitter_secs: env_u64("RETRY_BACKOFF_JITTER_SECS").unwrap_or(defaults.jitter_secs),
        }
    }

    /// Immediate retries, deterministic; used by tests and manual sweeps.
    pub fn immediate() -> Self {
        Self {
            base_secs: 0,
            cap_secs: 0,
            jitter_secs: 0,
        }
    }

    /// Delay before the next attempt given how many attempts have been
    /// made. Doubles per attempt, saturating at the cap.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(16);
        let scaled = self
            .base_secs
            .saturating_mul(1u64 << exponent)
            .min(self.cap_secs);
        let jitter = if self.jitter_secs == 0 {
            0
        } else {
            let mut rng = SmallRng::from_os_rng();
            rng.random_range(0..=self.jitter_secs)
        };
        Duration::seconds((scaled + jitter) as i64)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(base_secs: u64, cap_secs: u64) -> BackoffPolicy {
        BackoffPolicy {
            base_secs,
            cap_secs,
            jitter_secs: 0,
        }
    }

    #[test]
    fn doubles_per_attempt() {
        let policy = no_jitter(30, 100_000);
        assert_eq!(policy.delay_for(1).num_seconds(), 30);
        assert_eq!(policy.delay_for(2).num_seconds(), 60);
        assert_eq!(policy.delay_for(3).num_seconds(), 120);
        assert_eq!(policy.delay_for(5).num_seconds(), 480);
    }

    #[test]
    fn saturates_at_the_cap() {
        let policy = no_jitter(30, 300);
        assert_eq!(policy.delay_for(10).num_seconds(), 300);
        assert_eq!(policy.delay_for(60).num_seconds(), 300);
    }

    #[test]
    fn jitter_stays_bounded() {
        let policy = BackoffPolicy {
            base_secs: 10,
            cap_secs: 10,
            jitter_secs: 5,
        };
        for _ in 0..50 {
            let secs = policy.delay_for(1).num_seconds();
            assert!((10..=15).contains(&secs), "unexpected delay {secs}");
        }
    }

    #[test]
    fn immediate_policy_is_zero() {
        assert_eq!(BackoffPolicy::immediate().delay_for(4).num_seconds(), 0);
    }
}
