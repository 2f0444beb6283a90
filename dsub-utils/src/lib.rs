//! Small helpers shared by the dsub crates.
//!
//! - Duration strings such as `"1h30m"` or `"500ms"` via [`to_duration`], plus a serde
//!   deserializer for configuration fields
//! - Millisecond timestamps ([`timestamp_millis`], [`format_timestamp_millis`])
//! - [`Counter`], a lock-free current/peak statistic
//!
//! ```
//! use dsub_utils::{to_duration, timestamp_millis};
//!
//! assert_eq!(to_duration("1m30s").as_secs(), 90);
//! assert!(timestamp_millis() > 0);
//! ```

#![deny(unsafe_code)]

use std::time::Duration;

use serde::de::{Deserialize, Deserializer};

mod counter;

pub use counter::Counter;

/// Milliseconds since the Unix epoch
pub type TimestampMillis = i64;

/// Deserialize a [`Duration`] from a human readable string
#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

/// Convert a human readable duration string to [`Duration`].
///
/// Units: `ms`, `s`, `m`, `h`, `d`, `w`. Unknown or malformed segments count as zero.
///
/// ```
/// assert_eq!(dsub_utils::to_duration("60s").as_secs(), 60);
/// assert_eq!(dsub_utils::to_duration("1d2h").as_secs(), 93600);
/// assert_eq!(dsub_utils::to_duration("250ms").as_millis(), 250);
/// ```
#[inline]
pub fn to_duration(text: &str) -> Duration {
    // `ms` is the only two-letter unit, fold it into a single marker first
    let text = text.trim().to_lowercase().replace("ms", "Y");
    let ms: u64 = text
        .split_inclusive(['Y', 's', 'm', 'h', 'd', 'w'])
        .map(|part| {
            let mut chars = part.chars();
            let Some(unit) = chars.nth_back(0) else {
                return 0;
            };
            let Ok(v) = chars.as_str().trim().parse::<u64>() else {
                return 0;
            };
            let scale = match unit {
                'Y' => 1,
                's' => 1_000,
                'm' => 60_000,
                'h' => 3_600_000,
                'd' => 86_400_000,
                'w' => 604_800_000,
                _ => 0,
            };
            v.saturating_mul(scale)
        })
        .sum();
    Duration::from_millis(ms)
}

/// Current time in milliseconds
#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp_millis())
}

/// Format a millisecond timestamp as local time, empty for non-positive values
#[inline]
pub fn format_timestamp_millis(t: TimestampMillis) -> String {
    if t <= 0 {
        return "".into();
    }
    use chrono::TimeZone;
    match chrono::Local.timestamp_millis_opt(t) {
        chrono::LocalResult::Single(t) => t.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        _ => "".into(),
    }
}
