//! Monotonic and real-time clock helpers shared by the pipelines: interval
//! arithmetic, local-timezone ISO-8601 formatting and rational-timebase
//! rescaling.

use std::time::Instant;

use chrono::{DateTime, Local};
use ffmpeg_next::Rational;
use once_cell::sync::Lazy;

/// Timestamp value libavformat uses for "no timestamp". Rescaling passes it
/// through untouched.
pub const NO_PTS: i64 = i64::MIN;

pub const MICROSECOND: Rational = Rational(1, 1_000_000);
pub const NANOSECOND: Rational = Rational(1, 1_000_000_000);

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Whole milliseconds since a process-global monotonic epoch. Signed so
/// interval arithmetic against stored readings stays safe under skew.
pub fn monotonic_ms() -> i64 {
    EPOCH.elapsed().as_millis() as i64
}

/// Signed whole-millisecond interval between two monotonic readings.
pub fn interval_ms(begin: Instant, end: Instant) -> i64 {
    match end.checked_duration_since(begin) {
        Some(d) => d.as_millis() as i64,
        None => -(begin.duration_since(end).as_millis() as i64),
    }
}

pub fn realtime_now() -> DateTime<Local> {
    Local::now()
}

/// `YYYY-MM-DDTHH:MM:SS.mmm±HHMM`, local timezone. Fixed width, which the
/// recording end-time patch relies on.
pub fn iso8601(t: &DateTime<Local>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.3f%z").to_string()
}

/// Compact variant used in recording filenames: `YYYY-MM-DDTHHMMSS±HHMM`.
pub fn iso8601_compact(t: &DateTime<Local>) -> String {
    t.format("%Y-%m-%dT%H%M%S%z").to_string()
}

/// Translate a count from one rational timebase to another, rounding to
/// nearest with halves away from zero and saturating at the i64 range.
pub fn rescale_q(v: i64, from: Rational, to: Rational) -> i64 {
    if v == NO_PTS {
        return v;
    }
    let mut num = v as i128 * from.numerator() as i128 * to.denominator() as i128;
    let mut den = from.denominator() as i128 * to.numerator() as i128;
    if den == 0 {
        return 0;
    }
    if den < 0 {
        num = -num;
        den = -den;
    }
    let half = den / 2;
    let rounded = if num >= 0 {
        (num + half) / den
    } else {
        (num - half) / den
    };
    if rounded > i64::MAX as i128 {
        i64::MAX
    } else if rounded < i64::MIN as i128 {
        i64::MIN
    } else {
        rounded as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rescale_is_identity_for_equal_timebases() {
        assert_eq!(rescale_q(90_000, Rational(1, 90_000), Rational(1, 90_000)), 90_000);
    }

    #[test]
    fn rescale_rounds_half_away_from_zero() {
        // 1 tick of 1/2s is 500ms; 1 tick of 1/3s is 333.33..ms
        assert_eq!(rescale_q(1, Rational(1, 2), Rational(1, 1_000)), 500);
        assert_eq!(rescale_q(1, Rational(1, 3), Rational(1, 1_000)), 333);
        assert_eq!(rescale_q(1, Rational(1, 2_000_000), MICROSECOND), 1);
        assert_eq!(rescale_q(-1, Rational(1, 2_000_000), MICROSECOND), -1);
    }

    #[test]
    fn rescale_passes_no_pts_through() {
        assert_eq!(rescale_q(NO_PTS, Rational(1, 90_000), MICROSECOND), NO_PTS);
    }

    #[test]
    fn rescale_saturates() {
        assert_eq!(rescale_q(i64::MAX, Rational(1, 1), MICROSECOND), i64::MAX);
    }

    #[test]
    fn rescale_microseconds_to_stream_timebase() {
        // one second of microseconds lands on one second of 90kHz ticks
        assert_eq!(rescale_q(1_000_000, MICROSECOND, Rational(1, 90_000)), 90_000);
    }

    #[test]
    fn interval_is_signed() {
        let a = Instant::now();
        let b = a + Duration::from_millis(250);
        assert_eq!(interval_ms(a, b), 250);
        assert_eq!(interval_ms(b, a), -250);
    }

    #[test]
    fn iso8601_widths_are_stable() {
        let t = realtime_now();
        let full = iso8601(&t);
        let compact = iso8601_compact(&t);
        assert_eq!(full.len(), 28);
        assert_eq!(compact.len(), 22);
        assert!(full.contains('T'));
        assert!(!compact.contains(':'));
    }
}
