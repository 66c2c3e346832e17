//! Order statistics over integer samples.
//!
//! One implementation shared by the baseline builder, the noise scorer and
//! the network monitor. Samples stay integral; only derived scores leave
//! integer space.

/// Median with the lower-median rule: even counts average the two middle
/// values (integer floor).
pub fn median(values: &[i64]) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    if n % 2 == 1 {
        Some(sorted[n / 2])
    } else {
        Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2)
    }
}

/// Quartiles at `sorted[floor(0.25*n)]` and `sorted[floor(0.75*n)]`,
/// 0-indexed.
pub fn quartiles(values: &[i64]) -> Option<(i64, i64)> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    let q1 = sorted[n / 4];
    let q3 = sorted[(3 * n) / 4];
    Some((q1, q3))
}

/// Interquartile range, q3 - q1. Never negative.
pub fn iqr(values: &[i64]) -> Option<i64> {
    quartiles(values).map(|(q1, q3)| q3 - q1)
}

/// Population standard deviation. 0.0 for empty input.
pub fn population_stddev(values: &[i64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd() {
        assert_eq!(median(&[130, 110, 120]), Some(120));
    }

    #[test]
    fn test_median_even_averages_middle_pair() {
        assert_eq!(median(&[100, 200, 300, 400]), Some(250));
        // integer floor on odd sums
        assert_eq!(median(&[100, 101]), Some(100));
    }

    #[test]
    fn test_median_empty() {
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_quartile_indices_use_floor() {
        // n = 10: q1 at index 2, q3 at index 7
        let v: Vec<i64> = (0..10).map(|i| i * 10).collect();
        assert_eq!(quartiles(&v), Some((20, 70)));
        // n = 4: q1 at index 1, q3 at index 3
        assert_eq!(quartiles(&[10, 20, 30, 40]), Some((20, 40)));
    }

    #[test]
    fn test_quartiles_sort_input() {
        assert_eq!(quartiles(&[40, 10, 30, 20]), Some((20, 40)));
    }

    #[test]
    fn test_iqr_alternating_extremes() {
        // five 50s and five 700s: q1 = 50, q3 = 700
        let v = [50, 700, 50, 700, 50, 700, 50, 700, 50, 700];
        assert_eq!(iqr(&v), Some(650));
    }

    #[test]
    fn test_iqr_never_negative() {
        assert_eq!(iqr(&[100]), Some(0));
        assert_eq!(iqr(&[100, 100, 100]), Some(0));
    }

    #[test]
    fn test_population_stddev() {
        assert_eq!(population_stddev(&[]), 0.0);
        assert_eq!(population_stddev(&[5, 5, 5]), 0.0);
        // mean 4, deviations (-2, 0, 2), variance 8/3
        let s = population_stddev(&[2, 4, 6]);
        assert!((s - (8.0f64 / 3.0).sqrt()).abs() < 1e-9);
    }
}
