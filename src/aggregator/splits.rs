//! Per-distance splits
//!
//! Walks cumulative distance in time order and closes a split each time the
//! running total crosses a multiple of the split distance.

use chrono::{DateTime, Utc};

use crate::types::{BiometricSample, Split};

/// Splits plus the total distance they were computed from
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplitSummary {
    pub splits: Vec<Split>,
    pub total_distance_m: f64,
}

/// Compute splits from distance increments.
///
/// # Arguments
/// * `samples` - Distance samples, each carrying the meters covered since the previous one
/// * `start` - Session start; the first split is measured from here
/// * `split_distance_m` - Split length, typically 1000
///
/// Produces `floor(total / split_distance_m)` splits. Each split lasts from the
/// previous boundary crossing (or `start`) to its own crossing, so the split
/// durations sum to the time of the last crossing. A single sample crossing
/// several boundaries closes several splits at the same instant.
pub fn compute_splits(
    samples: &[BiometricSample],
    start: DateTime<Utc>,
    split_distance_m: f64,
) -> SplitSummary {
    let mut ordered: Vec<&BiometricSample> = samples
        .iter()
        .filter(|s| s.value.is_finite() && s.value >= 0.0)
        .collect();
    ordered.sort_by_key(|s| s.timestamp);

    let mut summary = SplitSummary::default();
    let mut boundary_at = start;

    for sample in ordered {
        summary.total_distance_m += sample.value;
        if split_distance_m <= 0.0 {
            continue;
        }

        // Multiply rather than accumulate so boundaries do not drift
        while summary.total_distance_m >= (summary.splits.len() + 1) as f64 * split_distance_m {
            let duration = (sample.timestamp - boundary_at).num_milliseconds().max(0) as f64 / 1000.0;
            summary.splits.push(Split {
                index: summary.splits.len() as u32 + 1,
                distance_meters: split_distance_m,
                duration_seconds: duration,
                ended_at: sample.timestamp,
            });
            boundary_at = sample.timestamp;
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BiometricKind;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, 6, 30, 0).unwrap()
    }

    fn distance(at_secs: i64, meters: f64) -> BiometricSample {
        BiometricSample::new(BiometricKind::Distance, start() + Duration::seconds(at_secs), meters)
    }

    #[test]
    fn test_split_count_is_floor_of_total() {
        // 250m every 75s, 3.5km total
        let samples: Vec<_> = (1..=14).map(|i| distance(i * 75, 250.0)).collect();
        let summary = compute_splits(&samples, start(), 1000.0);

        assert!((summary.total_distance_m - 3500.0).abs() < 0.001);
        assert_eq!(summary.splits.len(), 3);
        assert_eq!(
            summary.splits.iter().map(|s| s.index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        for split in &summary.splits {
            assert!((split.duration_seconds - 300.0).abs() < 0.001);
        }
    }

    #[test]
    fn test_durations_sum_to_last_crossing() {
        let samples = vec![
            distance(200, 600.0),
            distance(330, 500.0),
            distance(610, 700.0),
            distance(900, 300.0),
        ];
        let summary = compute_splits(&samples, start(), 1000.0);

        assert_eq!(summary.splits.len(), 2);
        let total: f64 = summary.splits.iter().map(|s| s.duration_seconds).sum();
        let last = summary.splits.last().unwrap().ended_at;
        assert!((total - (last - start()).num_seconds() as f64).abs() < 0.001);
        assert!((total - 900.0).abs() < 0.001);
    }

    #[test]
    fn test_large_sample_closes_multiple_splits() {
        let samples = vec![distance(600, 2100.0)];
        let summary = compute_splits(&samples, start(), 1000.0);

        assert_eq!(summary.splits.len(), 2);
        assert!((summary.splits[0].duration_seconds - 600.0).abs() < 0.001);
        assert!(summary.splits[1].duration_seconds.abs() < 0.001);
    }

    #[test]
    fn test_unordered_samples_are_sorted() {
        let samples = vec![distance(400, 500.0), distance(100, 500.0)];
        let summary = compute_splits(&samples, start(), 1000.0);
        assert_eq!(summary.splits.len(), 1);
        assert_eq!(summary.splits[0].ended_at, start() + Duration::seconds(400));
    }

    #[test]
    fn test_no_samples_no_splits() {
        let summary = compute_splits(&[], start(), 1000.0);
        assert!(summary.splits.is_empty());
        assert_eq!(summary.total_distance_m, 0.0);
    }

    #[test]
    fn test_invalid_increments_ignored() {
        let samples = vec![distance(10, f64::NAN), distance(20, -40.0), distance(30, 40.0)];
        let summary = compute_splits(&samples, start(), 1000.0);
        assert!((summary.total_distance_m - 40.0).abs() < 0.001);
    }
}
