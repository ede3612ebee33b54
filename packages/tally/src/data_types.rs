use std::time::Duration;

use xxhash_rust::xxh3::xxh3_64;

/// Durations, processor times and similar timing quantities, in milliseconds.
///
/// We use integers because sums of these are updated on the instrumentation hot path and
/// integer arithmetic keeps that path cheap. Sub-millisecond precision is not retained.
pub type Millis = i64;

/// Sentinel for "no data": a derived value that could not be computed because there were no
/// hits in the period or because the platform does not support the measurement.
///
/// This is distinct from zero, which means "measured, and the value was zero".
pub const NO_DATA: i64 = -1;

/// Floating-point form of [`NO_DATA`] for derived ratios such as percentages.
pub const NO_DATA_F64: f64 = -1.0;

/// Converts a duration to whole milliseconds, saturating at `Millis::MAX`.
pub(crate) fn duration_to_millis(duration: Duration) -> Millis {
    Millis::try_from(duration.as_millis()).unwrap_or(Millis::MAX)
}

/// Length of the hash suffix of a request identifier.
pub(crate) const REQUEST_HASH_LEN: usize = 16;

/// Derives the stable identifier of a request from the registry it belongs to and its name.
///
/// The identifier starts with the registry name, which lets a collector find the registry that
/// owns an arbitrary request identifier. The remainder is the XXH3 64-bit hash of the request
/// name: it must stay stable across process restarts and crate upgrades because it keys the
/// persisted snapshots and time series.
pub(crate) fn request_id(registry_name: &str, request_name: &str) -> String {
    let hash = xxh3_64(request_name.as_bytes());

    format!("{registry_name}{hash:016x}")
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn request_id_is_prefixed_by_registry() {
        let id = request_id("sql", "select * from users");

        assert!(id.starts_with("sql"));
        assert_eq!(id.len(), "sql".len() + REQUEST_HASH_LEN);
    }

    #[test]
    fn request_id_is_deterministic() {
        assert_eq!(request_id("http", "/home GET"), request_id("http", "/home GET"));
        assert_ne!(request_id("http", "/home GET"), request_id("http", "/home POST"));
        assert_ne!(request_id("http", "/home GET"), request_id("sql", "/home GET"));
    }

    #[test]
    fn request_id_uses_xxh3() {
        // Published XXH3 64-bit value for empty input.
        assert_eq!(request_id("x", ""), "x2d06800538d394c2");
        assert_eq!(
            request_id("sql", "select 1"),
            format!("sql{:016x}", xxh3_64(b"select 1"))
        );
    }

    #[test]
    fn duration_to_millis_truncates_fraction() {
        assert_eq!(duration_to_millis(Duration::from_micros(2_999)), 2);
        assert_eq!(duration_to_millis(Duration::MAX), Millis::MAX);
    }
}
