/// Threshold staleness detection.
///
/// Upstream models are retrained and their thresholds move. A downstream
/// monitor comparing live values against months-old levels would raise or
/// miss alerts silently, so cached entries past a maximum age are flagged
/// for the `refresh` command.
///
/// # Clock injection
/// All functions accept a `now: DateTime<Utc>` parameter rather than calling
/// `Utc::now()` internally, so staleness is deterministic in tests.

use super::thresholds::{CachedThresholds, ThresholdCache};
use chrono::{DateTime, Duration, Utc};

// ---------------------------------------------------------------------------
// Staleness check
// ---------------------------------------------------------------------------

/// Returns `true` if the entry was refreshed more than `max_age` before `now`.
///
/// Staleness is strictly greater than the threshold:
///   age > max_age  →  stale
///   age == max_age →  not stale
pub fn is_stale_at(entry: &CachedThresholds, max_age: Duration, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(entry.refreshed_at) > max_age
}

/// Ids of every stale entry, ordered by gauge id.
pub fn stale_entries_at(cache: &ThresholdCache, max_age: Duration, now: DateTime<Utc>) -> Vec<String> {
    cache
        .entries()
        .into_iter()
        .filter(|e| is_stale_at(e, max_age, now))
        .map(|e| e.gauge_id)
        .collect()
}

/// Convenience wrapper that uses the real current time.
pub fn stale_entries(cache: &ThresholdCache, max_age: Duration) -> Vec<String> {
    stale_entries_at(cache, max_age, Utc::now())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FloodThresholds, GaugeValueUnit};
    use chrono::TimeZone;

    fn entry_at(refreshed_at: DateTime<Utc>) -> CachedThresholds {
        CachedThresholds {
            gauge_id: "hybas_4120570410".to_string(),
            warning_level: 4500.0,
            danger_level: 5500.0,
            extreme_danger_level: None,
            unit: GaugeValueUnit::CubicMetersPerSecond,
            refreshed_at,
        }
    }

    /// A fixed "now" used across all tests: 2024-08-01 13:00:00 UTC.
    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 1, 13, 0, 0).unwrap()
    }

    // --- Not stale ----------------------------------------------------------

    #[test]
    fn test_entry_refreshed_an_hour_ago_is_not_stale() {
        let entry = entry_at(Utc.with_ymd_and_hms(2024, 8, 1, 12, 0, 0).unwrap());
        assert!(!is_stale_at(&entry, Duration::hours(6), fixed_now()));
    }

    #[test]
    fn test_entry_exactly_at_threshold_is_not_stale() {
        let entry = entry_at(Utc.with_ymd_and_hms(2024, 8, 1, 7, 0, 0).unwrap());
        assert!(
            !is_stale_at(&entry, Duration::hours(6), fixed_now()),
            "staleness is strictly greater than, not >="
        );
    }

    #[test]
    fn test_entry_refreshed_in_the_future_is_not_stale() {
        let entry = entry_at(Utc.with_ymd_and_hms(2024, 8, 1, 14, 0, 0).unwrap());
        assert!(!is_stale_at(&entry, Duration::hours(6), fixed_now()));
    }

    // --- Stale --------------------------------------------------------------

    #[test]
    fn test_entry_one_minute_past_threshold_is_stale() {
        let entry = entry_at(Utc.with_ymd_and_hms(2024, 8, 1, 6, 59, 0).unwrap());
        assert!(is_stale_at(&entry, Duration::hours(6), fixed_now()));
    }

    #[test]
    fn test_stale_entries_listed_in_id_order() {
        let cache = ThresholdCache::new();
        let levels = FloodThresholds {
            warning_level: 1.0,
            danger_level: 2.0,
            extreme_danger_level: None,
            unit: GaugeValueUnit::Meters,
        };
        cache.upsert("B", &levels, Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap());
        cache.upsert("A", &levels, Utc.with_ymd_and_hms(2024, 7, 2, 0, 0, 0).unwrap());
        cache.upsert("C", &levels, fixed_now());

        assert_eq!(
            stale_entries_at(&cache, Duration::hours(6), fixed_now()),
            vec!["A".to_string(), "B".to_string()]
        );
    }
}
