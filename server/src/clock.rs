use rand::Rng;

/// Wall-clock milliseconds since the Unix epoch.
pub fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Uniformly distributed delay in `[min_ms, max_ms]`.
pub fn jittered_delay_ms(min_ms: u64, max_ms: u64) -> u64 {
    if min_ms >= max_ms {
        return min_ms;
    }
    rand::thread_rng().gen_range(min_ms..=max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_stays_in_bounds() {
        for _ in 0..200 {
            let d = jittered_delay_ms(1_000, 2_000);
            assert!((1_000..=2_000).contains(&d));
        }
    }

    #[test]
    fn test_degenerate_range() {
        assert_eq!(jittered_delay_ms(500, 500), 500);
    }
}
