use rand::{thread_rng, Rng};
use std::time::Duration;

/// Delay before retry number `attempt` (1-based): exponential growth from
/// `base`, capped at 2^6, plus up to 25% jitter.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let base = base.as_millis() as u64;
    let exp = base.saturating_mul(1u64 << (attempt.saturating_sub(1).min(6)));
    let jitter = thread_rng().gen_range(0..(exp / 4 + 1));
    Duration::from_millis(exp + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_and_caps() {
        let base = Duration::from_millis(100);
        let first = backoff_delay(base, 1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let third = backoff_delay(base, 3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
        let capped = backoff_delay(base, 40);
        assert!(capped <= Duration::from_millis(6400 + 1600));
    }

    #[test]
    fn zero_base_is_zero() {
        assert_eq!(backoff_delay(Duration::ZERO, 5), Duration::ZERO);
    }
}
