//! PromQL duration literals.
//!
//! Range-vector windows, scrape intervals and configuration values all use
//! the Prometheus duration syntax: one or more `<integer><unit>` pairs with
//! units in strictly decreasing order (`y`, `w`, `d`, `h`, `m`, `s`, `ms`),
//! e.g. `1h30m` or `15s`.

use std::time::Duration;

use crate::error::DurationError;

const MS: u64 = 1;
const SECOND: u64 = 1_000 * MS;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const WEEK: u64 = 7 * DAY;
const YEAR: u64 = 365 * DAY;

/// Units from largest to smallest, with their size in milliseconds.
const UNITS: [(&str, u64); 7] = [
    ("y", YEAR),
    ("w", WEEK),
    ("d", DAY),
    ("h", HOUR),
    ("m", MINUTE),
    ("s", SECOND),
    ("ms", MS),
];

/// Parses a PromQL duration literal.
///
/// # Errors
///
/// Returns [`DurationError`] if the text is empty, contains an unknown unit,
/// repeats a unit, or lists units out of order.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use capstan::duration::parse_duration;
///
/// assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
/// assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
/// assert!(parse_duration("30s1m").is_err());
/// ```
pub fn parse_duration(text: &str) -> Result<Duration, DurationError> {
    let invalid = |reason: &str| DurationError {
        value: text.to_string(),
        reason: reason.to_string(),
    };

    let s = text.trim();
    if s.is_empty() {
        return Err(invalid("empty duration"));
    }

    let mut rest = s;
    let mut total_ms: u64 = 0;
    // Index into UNITS of the last unit seen; the next one must come after it.
    let mut next_unit = 0;

    while !rest.is_empty() {
        let digits = rest.chars().take_while(char::is_ascii_digit).count();
        if digits == 0 {
            return Err(invalid("expected a number"));
        }
        let (num_str, tail) = rest.split_at(digits);
        let num: u64 = num_str.parse().map_err(|_| invalid("number out of range"))?;

        // "ms" must be tried before "m".
        let unit_index = UNITS
            .iter()
            .enumerate()
            .filter(|(_, (unit, _))| tail.starts_with(unit))
            .max_by_key(|(_, (unit, _))| unit.len())
            .map(|(i, _)| i)
            .ok_or_else(|| invalid("unknown unit, use y, w, d, h, m, s or ms"))?;

        if unit_index < next_unit {
            return Err(invalid("units must be in decreasing order and not repeated"));
        }
        next_unit = unit_index + 1;

        let (unit, size) = UNITS[unit_index];
        total_ms = num
            .checked_mul(size)
            .and_then(|v| total_ms.checked_add(v))
            .ok_or_else(|| invalid("duration too large"))?;
        rest = &tail[unit.len()..];
    }

    Ok(Duration::from_millis(total_ms))
}

/// Formats a duration in canonical PromQL form.
///
/// Sub-millisecond precision is dropped. A zero duration formats as `0s`.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use capstan::duration::format_duration;
///
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
/// assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
/// assert_eq!(format_duration(Duration::ZERO), "0s");
/// ```
#[allow(clippy::cast_possible_truncation)] // durations beyond u64 millis are not meaningful here
pub fn format_duration(duration: Duration) -> String {
    let mut ms = duration.as_millis() as u64;
    if ms == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    for (unit, size) in UNITS {
        let count = ms / size;
        if count > 0 {
            out.push_str(&count.to_string());
            out.push_str(unit);
            ms -= count * size;
        }
    }
    out
}

/// Rounds a duration to the nearest whole second.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn round_to_seconds(duration: Duration) -> Duration {
    Duration::from_secs(duration.as_secs_f64().round() as u64)
}

/// Serde support for duration fields written as PromQL literals.
///
/// Used by configuration types so files can say `"interval": "1h"`.
pub mod serde_promql {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes a duration as a PromQL literal.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    /// Deserializes a duration from a PromQL literal.
    ///
    /// # Errors
    ///
    /// Returns a deserializer error if the string is not a valid duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        super::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("1w").unwrap(), Duration::from_secs(604_800));
        assert_eq!(parse_duration("1y").unwrap(), Duration::from_secs(31_536_000));
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
    }

    #[test]
    fn test_parse_compound() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1m30s500ms").unwrap(), Duration::from_millis(90_500));
        assert_eq!(parse_duration(" 15s ").unwrap(), Duration::from_secs(15));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("30s1m").is_err());
        assert!(parse_duration("1m1m").is_err());
        assert!(parse_duration("*2").is_err());
        assert!(parse_duration("5m:1m").is_err());
    }

    #[test]
    fn test_format() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(60)), "1m");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(3660)), "1h1m");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1s500ms");
        assert_eq!(format_duration(Duration::from_secs(8 * 86400)), "1w1d");
    }

    #[test]
    fn test_format_parses_back() {
        for secs in [1u64, 59, 61, 3599, 86_401, 694_861] {
            let d = Duration::from_secs(secs);
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }

    #[test]
    fn test_round_to_seconds() {
        assert_eq!(round_to_seconds(Duration::from_millis(59_600)), Duration::from_secs(60));
        assert_eq!(round_to_seconds(Duration::from_millis(14_499)), Duration::from_secs(14));
    }
}
