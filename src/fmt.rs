//! Provides parsing and formatting helpers for durations and timestamps.
//!
//! Durations show up in two places: the configuration (refresh intervals and the tick period are
//! given as strings like `10m`) and the statistics (which report intervals and average producer
//! durations in a human readable way).
use std::fmt::Write;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Timestamp;

/// Units used by [format_duration] from the largest to the smallest one.
const UNITS: [(u128, &str); 5] = [
    (1000 * 60 * 60 * 24, "d"),
    (1000 * 60 * 60, "h"),
    (1000 * 60, "m"),
    (1000, "s"),
    (1, "ms"),
];

/// Formats a duration given in microseconds.
///
/// This picks a unit between microseconds and seconds and a precision of three significant
/// digits so that the output stays short.
///
/// Note that [format_short_duration] returns the result as String. This function also provides
/// some examples.
pub fn format_micros(micros: i32, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
    let value = micros as f64;
    match micros {
        i32::MIN..=999 => write!(f, "{} us", micros),
        1_000..=9_999 => write!(f, "{:.2} ms", value / 1_000.),
        10_000..=99_999 => write!(f, "{:.1} ms", value / 1_000.),
        100_000..=999_999 => write!(f, "{} ms", micros / 1_000),
        1_000_000..=9_999_999 => write!(f, "{:.2} s", value / 1_000_000.),
        10_000_000..=99_999_999 => write!(f, "{:.1} s", value / 1_000_000.),
        _ => write!(f, "{} s", micros / 1_000_000),
    }
}

/// Formats a duration given in microseconds and returns a String representation.
///
/// # Examples
///
/// ```
/// assert_eq!(interval_cache::fmt::format_short_duration(100), "100 us");
/// assert_eq!(interval_cache::fmt::format_short_duration(8_192), "8.19 ms");
/// assert_eq!(interval_cache::fmt::format_short_duration(32_768), "32.8 ms");
/// assert_eq!(interval_cache::fmt::format_short_duration(128_123), "128 ms");
/// assert_eq!(interval_cache::fmt::format_short_duration(1_128_123), "1.13 s");
/// assert_eq!(interval_cache::fmt::format_short_duration(10_128_123), "10.1 s");
/// assert_eq!(interval_cache::fmt::format_short_duration(101_000_000), "101 s");
/// ```
pub fn format_short_duration(duration_in_micros: i32) -> String {
    let mut result = String::new();
    let _ = format_micros(duration_in_micros, &mut result);
    result
}

/// Parses a duration from a given string.
///
/// This string can have the following suffixes:
/// * **ms** or **MS**: treats the value as milliseconds (this is also the default if no suffix
///   is present)
/// * **s** or **S**: treats the value as seconds
/// * **m** or **M**: treats the value as minutes
/// * **h** or **H**: treats the value as hours
/// * **d** or **D**: treats the value as days
///
/// Returns an **Err** if either a non-integer value is given or if an unknown suffix was provided.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(interval_cache::fmt::parse_duration("100").unwrap(), Duration::from_millis(100));
/// assert_eq!(interval_cache::fmt::parse_duration("100 ms").unwrap(), Duration::from_millis(100));
/// assert_eq!(interval_cache::fmt::parse_duration("12 s").unwrap(), Duration::from_secs(12));
/// assert_eq!(interval_cache::fmt::parse_duration("10m").unwrap(), Duration::from_secs(10 * 60));
/// assert_eq!(interval_cache::fmt::parse_duration("2 H").unwrap(), Duration::from_secs(2 * 60 * 60));
/// assert_eq!(interval_cache::fmt::parse_duration("5 d").unwrap(), Duration::from_secs(5 * 24 * 60 * 60));
///
/// // An invalid suffix results in an error...
/// assert_eq!(interval_cache::fmt::parse_duration("3 Y").is_err(), true);
///
/// // Decimal numbers result in an error...
/// assert_eq!(interval_cache::fmt::parse_duration("1.2s").is_err(), true);
///
/// // Negative numbers result in an error...
/// assert_eq!(interval_cache::fmt::parse_duration("-1m").is_err(), true);
/// ```
pub fn parse_duration(str: impl AsRef<str>) -> anyhow::Result<Duration> {
    lazy_static::lazy_static! {
        static ref NUMBER_AND_UNIT: regex::Regex =
            regex::Regex::new(r"^ *(\d+) *(ms|s|m|h|d|MS|S|M|H|D)? *$").unwrap();
    }

    let captures = NUMBER_AND_UNIT.captures(str.as_ref()).ok_or_else(|| {
        anyhow::anyhow!(
            "Cannot parse '{}' into a duration expression. \
             Expected a positive number and optionally 'ms', 's', 'm', 'h' or 'd' as suffix.",
            str.as_ref()
        )
    })?;

    let number = captures[1].parse::<u64>()?;
    let unit = captures
        .get(2)
        .map(|unit| unit.as_str().to_lowercase())
        .unwrap_or_default();

    Ok(match unit.as_str() {
        "s" => Duration::from_secs(number),
        "m" => Duration::from_secs(number.saturating_mul(60)),
        "h" => Duration::from_secs(number.saturating_mul(60 * 60)),
        "d" => Duration::from_secs(number.saturating_mul(60 * 60 * 24)),
        _ => Duration::from_millis(number),
    })
}

/// Formats a duration into a string like "5d 3h 17m 2s 12ms".
///
/// Units which are zero are skipped. A zero duration is rendered as "0ms".
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(interval_cache::fmt::format_duration(Duration::from_millis(0)), "0ms");
/// assert_eq!(interval_cache::fmt::format_duration(Duration::from_millis(13)), "13ms");
/// assert_eq!(interval_cache::fmt::format_duration(Duration::from_millis(1013)), "1s 13ms");
/// assert_eq!(interval_cache::fmt::format_duration(Duration::from_millis(62_013)), "1m 2s 13ms");
/// assert_eq!(interval_cache::fmt::format_duration(Duration::from_secs(60 * 10)), "10m");
/// assert_eq!(interval_cache::fmt::format_duration(Duration::from_secs(60 * 61)), "1h 1m");
/// assert_eq!(interval_cache::fmt::format_duration(Duration::from_secs(24 * 60 * 60 + 60 * 60 + 59)), "1d 1h 59s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let mut result = String::new();
    let mut remainder = duration.as_millis();

    for (millis_per_unit, unit) in UNITS {
        let amount = remainder / millis_per_unit;
        if amount > 0 {
            if !result.is_empty() {
                result.push(' ');
            }
            let _ = write!(result, "{}{}", amount, unit);
            remainder %= millis_per_unit;
        }
    }

    if result.is_empty() {
        result.push_str("0ms");
    }

    result
}

/// Formats a timestamp (milliseconds since the Unix epoch) as ISO-8601 date and time in UTC.
///
/// The epoch itself is used as "never" marker for tasks which have not been run yet and is
/// therefore rendered as such.
///
/// # Examples
///
/// ```
/// assert_eq!(interval_cache::fmt::format_timestamp(0), "never");
/// assert_eq!(interval_cache::fmt::format_timestamp(1_000), "1970-01-01T00:00:01.000");
/// ```
pub fn format_timestamp(timestamp: Timestamp) -> String {
    if timestamp == 0 {
        return "never".to_owned();
    }

    i64::try_from(timestamp)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|date| date.format("%Y-%m-%dT%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| format!("{} ms", timestamp))
}
