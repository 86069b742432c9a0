//! Lightweight UTC date/time utilities (no chrono dependency).
//!
//! Timestamps are Unix seconds (`i64`, negative before 1970). Uses Howard
//! Hinnant's civil calendar algorithms in both directions.

use std::time::{SystemTime, UNIX_EPOCH};

pub const SECS_PER_DAY: i64 = 86_400;

/// Current UTC time as Unix seconds.
pub fn now_unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Current UTC timestamp in ISO-8601 format.
pub fn now_iso8601() -> String {
    unix_to_iso8601(now_unix_secs())
}

/// Convert Unix seconds to ISO-8601 UTC string.
pub fn unix_to_iso8601(secs: i64) -> String {
    let days = secs.div_euclid(SECS_PER_DAY);
    let time_of_day = secs.rem_euclid(SECS_PER_DAY);
    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;

    let (y, m, d) = civil_from_days(days);
    format!("{y:04}-{m:02}-{d:02}T{hours:02}:{minutes:02}:{seconds:02}Z")
}

/// Date-only rendering, used when a timestamp falls on midnight.
pub fn unix_to_date(secs: i64) -> String {
    let (y, m, d) = civil_from_unix(secs);
    format!("{y:04}-{m:02}-{d:02}")
}

/// Compact rendering: date only at midnight, full timestamp otherwise.
pub fn format_compact(secs: i64) -> String {
    if secs.rem_euclid(SECS_PER_DAY) == 0 {
        unix_to_date(secs)
    } else {
        unix_to_iso8601(secs)
    }
}

/// Parse `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM[:SS][Z]` or the same with a space
/// separator. Fractional seconds and offsets other than `Z` are rejected.
pub fn parse_iso8601(s: &str) -> Option<i64> {
    let s = s.trim();
    let s = s.strip_suffix('Z').unwrap_or(s);
    let (date, time) = match s.find(['T', ' ']) {
        Some(i) => (&s[..i], Some(&s[i + 1..])),
        None => (s, None),
    };

    let mut parts = date.splitn(3, '-');
    let y: i64 = parts.next()?.parse().ok()?;
    let m: u32 = parts.next()?.parse().ok()?;
    let d: u32 = parts.next()?.parse().ok()?;
    if !(1..=12).contains(&m) || d == 0 || d > days_in_month(y, m) {
        return None;
    }

    let mut secs = days_from_civil(y, m, d)?.checked_mul(SECS_PER_DAY)?;
    if let Some(time) = time {
        let mut fields = time.split(':');
        let h: i64 = fields.next()?.parse().ok()?;
        let min: i64 = fields.next()?.parse().ok()?;
        let sec: i64 = match fields.next() {
            Some(f) => f.parse().ok()?,
            None => 0,
        };
        if fields.next().is_some()
            || !(0..=23).contains(&h)
            || !(0..=59).contains(&min)
            || !(0..=59).contains(&sec)
        {
            return None;
        }
        secs = secs.checked_add(h * 3600 + min * 60 + sec)?;
    }
    Some(secs)
}

/// Unix seconds → (year, month, day).
pub fn civil_from_unix(secs: i64) -> (i64, u32, u32) {
    civil_from_days(secs.div_euclid(SECS_PER_DAY))
}

/// Midnight of the given civil date as Unix seconds, saturating at the
/// ends of the `i64` range.
pub fn unix_from_civil(y: i64, m: u32, d: u32) -> i64 {
    days_from_civil(y, m, d)
        .and_then(|days| days.checked_mul(SECS_PER_DAY))
        .unwrap_or(if y < 0 { i64::MIN } else { i64::MAX })
}

/// ISO weekday, Monday = 0.
pub fn weekday(secs: i64) -> u32 {
    // 1970-01-01 was a Thursday.
    (secs.div_euclid(SECS_PER_DAY) + 3).rem_euclid(7) as u32
}

/// Howard Hinnant's civil_from_days: Unix epoch days → (year, month, day).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m as u32, d as u32)
}

/// Inverse of `civil_from_days`; `None` when the day count overflows.
fn days_from_civil(y: i64, m: u32, d: u32) -> Option<i64> {
    let y = if m <= 2 { y.checked_sub(1)? } else { y };
    let era = if y >= 0 { y } else { y.checked_sub(399)? } / 400;
    let yoe = (y - era * 400) as u64;
    let m = m as u64;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + d as u64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era.checked_mul(146097)?
        .checked_add(doe as i64)?
        .checked_sub(719468)
}

fn days_in_month(y: i64, m: u32) -> u32 {
    match m {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        _ if (y % 4 == 0 && y % 100 != 0) || y % 400 == 0 => 29,
        _ => 28,
    }
}
