//! Wall-clock helpers. All protocol timestamps are signed nanoseconds since
//! the Unix epoch.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const NANOS_PER_MICRO: i64 = 1_000;
pub const NANOS_PER_MILLI: i64 = 1_000_000;

/// Current wall clock in ns since the Unix epoch. Clamps to 0 if the system
/// clock reads before 1970.
pub fn unix_nanos() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => duration_to_nanos(d),
        Err(_) => 0,
    }
}

/// Saturating conversion of a duration to i64 nanoseconds.
pub fn duration_to_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

pub fn nanos_to_millis_f64(nanos: i64) -> f64 {
    nanos as f64 / NANOS_PER_MILLI as f64
}

pub fn nanos_to_micros_f64(nanos: i64) -> f64 {
    nanos as f64 / NANOS_PER_MICRO as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_after_2020() {
        assert!(unix_nanos() > 1_577_836_800 * 1_000_000_000);
    }

    #[test]
    fn conversions() {
        assert_eq!(duration_to_nanos(Duration::from_millis(3)), 3_000_000);
        assert_eq!(duration_to_nanos(Duration::MAX), i64::MAX);
        assert_eq!(nanos_to_millis_f64(1_500_000), 1.5);
        assert_eq!(nanos_to_micros_f64(2_500), 2.5);
    }
}
