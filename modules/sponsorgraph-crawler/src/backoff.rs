//! Retry delay policy: `base * 2^attempt`, capped, with jitter so a batch of
//! jobs failing together (e.g. after a shared rate-limit deferral) does not
//! retry in lockstep.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Deterministic part of the policy: exponential growth capped at `cap`.
/// `attempt` counts completed attempts, so the first retry uses `base`.
pub fn retry_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// Apply ±20% jitter.
pub fn with_jitter(delay: Duration) -> Duration {
    let millis = delay.as_millis() as u64;
    if millis == 0 {
        return delay;
    }
    let spread = millis / 5;
    let jittered = rand::rng().random_range(millis.saturating_sub(spread)..=millis + spread);
    Duration::from_millis(jittered)
}

/// Next time a failed job becomes eligible again.
pub fn next_eligible(
    now: DateTime<Utc>,
    base: Duration,
    cap: Duration,
    attempt: u32,
) -> DateTime<Utc> {
    let delay = with_jitter(retry_delay(base, cap, attempt));
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_attempt() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(900);
        assert_eq!(retry_delay(base, cap, 0), Duration::from_secs(1));
        assert_eq!(retry_delay(base, cap, 1), Duration::from_secs(2));
        assert_eq!(retry_delay(base, cap, 3), Duration::from_secs(8));
    }

    #[test]
    fn delay_is_capped() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(900);
        assert_eq!(retry_delay(base, cap, 30), cap);
        // Exponent overflow must not panic.
        assert_eq!(retry_delay(base, cap, u32::MAX), cap);
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let delay = Duration::from_secs(100);
        for _ in 0..50 {
            let jittered = with_jitter(delay);
            assert!(jittered >= Duration::from_secs(80), "{jittered:?}");
            assert!(jittered <= Duration::from_secs(120), "{jittered:?}");
        }
    }

    #[test]
    fn next_eligible_is_in_the_future() {
        let now = Utc::now();
        let eligible = next_eligible(now, Duration::from_secs(1), Duration::from_secs(900), 2);
        assert!(eligible > now);
    }
}
