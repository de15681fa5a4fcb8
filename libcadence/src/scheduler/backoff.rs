//! Retry delays
//!
//! `base * factor^retry_count`, capped, with a symmetric random jitter that
//! is itself clamped to the cap.

use rand::Rng;

use crate::config::BackoffConfig;

/// Delay before retry number `retry_count + 1`, without jitter
pub fn base_delay(retry_count: i64, config: &BackoffConfig) -> u64 {
    let exponent = retry_count.clamp(0, 32) as u32;
    let multiplier = (config.factor.max(1) as u64).saturating_pow(exponent);
    config.base.saturating_mul(multiplier).min(config.cap)
}

/// Delay in seconds before the next attempt of a post that has already
/// been retried `retry_count` times
pub fn delay<R: Rng + ?Sized>(retry_count: i64, config: &BackoffConfig, rng: &mut R) -> u64 {
    let delay = base_delay(retry_count, config);
    let jitter = config.jitter.clamp(0.0, 1.0);
    if jitter == 0.0 || delay == 0 {
        return delay;
    }

    let spread = rng.gen_range(-jitter..=jitter);
    let jittered = (delay as f64 * (1.0 + spread)).round() as u64;
    jittered.min(config.cap)
}

/// Delay honouring a network's retry-after hint when it asks for longer
pub fn delay_with_hint<R: Rng + ?Sized>(
    retry_count: i64,
    retry_after: Option<u64>,
    config: &BackoffConfig,
    rng: &mut R,
) -> u64 {
    let computed = delay(retry_count, config, rng);
    match retry_after {
        Some(hint) => computed.max(hint),
        None => computed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::default()
        }
    }

    #[test]
    fn test_doubles_from_two_minutes_to_one_hour() {
        let config = no_jitter();
        let delays: Vec<u64> = (0..8).map(|n| base_delay(n, &config)).collect();
        assert_eq!(delays, vec![120, 240, 480, 960, 1920, 3600, 3600, 3600]);
    }

    #[test]
    fn test_monotonic_without_jitter() {
        let config = no_jitter();
        let mut rng = StdRng::seed_from_u64(7);
        let mut previous = 0;
        for n in 0..40 {
            let d = delay(n, &config, &mut rng);
            assert!(d >= previous, "delay({}) = {} < {}", n, d, previous);
            assert!(d <= config.cap);
            previous = d;
        }
    }

    #[test]
    fn test_jitter_stays_in_band_and_under_cap() {
        let config = BackoffConfig::default();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..500 {
            let first = delay(0, &config, &mut rng);
            assert!((108..=132).contains(&first), "first retry delay {}", first);

            let capped = delay(10, &config, &mut rng);
            assert!((3240..=3600).contains(&capped), "capped delay {}", capped);
        }
    }

    #[test]
    fn test_retry_after_hint_wins_when_longer() {
        let config = no_jitter();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(delay_with_hint(0, Some(900), &config, &mut rng), 900);
        assert_eq!(delay_with_hint(0, Some(30), &config, &mut rng), 120);
        assert_eq!(delay_with_hint(1, None, &config, &mut rng), 240);
    }

    #[test]
    fn test_huge_retry_counts_saturate() {
        let config = no_jitter();
        assert_eq!(base_delay(i64::MAX, &config), 3600);
        assert_eq!(base_delay(-1, &config), 120);
    }
}
