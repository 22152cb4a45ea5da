//! Day-boundary helpers.
//!
//! Every counter is keyed by the epoch second of local midnight in one fixed
//! zone. These helpers are pure; "today" is computed on demand from the wall
//! clock instead of being cached.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};

/// Seconds in one calendar day.
pub const SECONDS_PER_DAY: i64 = 24 * 3600;

/// Epoch second of local midnight for the day containing `timestamp`.
pub fn date_floor(timestamp: i64, zone: FixedOffset) -> i64 {
    let shift = i64::from(zone.local_minus_utc());
    (timestamp + shift).div_euclid(SECONDS_PER_DAY) * SECONDS_PER_DAY - shift
}

/// Local hour of day (0..=23) for `timestamp`.
pub fn hour_of_day(timestamp: i64, zone: FixedOffset) -> u32 {
    let shift = i64::from(zone.local_minus_utc());
    // rem_euclid keeps the value in 0..86400, so the quotient fits in u32
    ((timestamp + shift).rem_euclid(SECONDS_PER_DAY) / 3600) as u32
}

/// The date `days` calendar days before `date`.
pub fn days_before(date: i64, days: i64) -> i64 {
    date - days * SECONDS_PER_DAY
}

/// Whole days between two dates, rounded towards zero.
pub fn days_between(earlier: i64, later: i64) -> i64 {
    (later - earlier) / SECONDS_PER_DAY
}

/// Local midnight of the current day.
pub fn today(zone: FixedOffset) -> i64 {
    date_floor(Utc::now().timestamp(), zone)
}

/// Renders a date key as `YYYY-MM-DD` in `zone`, falling back to the raw
/// number for out-of-range values.
pub fn format_date(date: i64, zone: FixedOffset) -> String {
    match DateTime::from_timestamp(date, 0) {
        Some(utc) => utc.with_timezone(&zone).format("%Y-%m-%d").to_string(),
        None => date.to_string(),
    }
}

/// Parses `YYYY-MM-DD` into the date key of that day in `zone`.
pub fn parse_date(text: &str, zone: FixedOffset) -> Option<i64> {
    let day = NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").ok()?;
    let utc_midnight = day.and_hms_opt(0, 0, 0)?.and_utc().timestamp();
    Some(utc_midnight - i64::from(zone.local_minus_utc()))
}

/// Builds a zone from a UTC offset in seconds.
pub fn zone_from_offset(utc_offset_secs: i32) -> Option<FixedOffset> {
    FixedOffset::east_opt(utc_offset_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shanghai() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    #[test]
    fn test_date_floor_utc() {
        let utc = FixedOffset::east_opt(0).unwrap();
        // 2024-03-10T13:45:00Z
        let ts = 1_710_078_300;
        assert_eq!(date_floor(ts, utc), 1_710_028_800);
        assert_eq!(date_floor(1_710_028_800, utc), 1_710_028_800);
    }

    #[test]
    fn test_date_floor_with_offset() {
        let zone = shanghai();
        // 2024-03-10T17:00:00Z is 2024-03-11T01:00:00+08:00
        let ts = 1_710_090_000;
        let date = date_floor(ts, zone);
        assert_eq!(format_date(date, zone), "2024-03-11");
        assert_eq!(hour_of_day(ts, zone), 1);
        assert_eq!(hour_of_day(date, zone), 0);
    }

    #[test]
    fn test_negative_timestamps_floor_down() {
        let utc = FixedOffset::east_opt(0).unwrap();
        assert_eq!(date_floor(-1, utc), -SECONDS_PER_DAY);
        assert_eq!(hour_of_day(-1, utc), 23);
    }

    #[test]
    fn test_day_arithmetic() {
        let date = 1_710_028_800;
        assert_eq!(days_before(date, 7), date - 7 * SECONDS_PER_DAY);
        assert_eq!(days_between(days_before(date, 30), date), 30);
        assert_eq!(days_between(date, date + SECONDS_PER_DAY - 1), 0);
    }

    #[test]
    fn test_today_is_a_day_boundary() {
        let zone = shanghai();
        let t = today(zone);
        assert_eq!(date_floor(t, zone), t);
    }

    #[test]
    fn test_parse_date_matches_floor() {
        let zone = shanghai();
        let date = parse_date("2024-03-11", zone).unwrap();
        assert_eq!(date, date_floor(1_710_090_000, zone));
        assert_eq!(format_date(date, zone), "2024-03-11");
        assert!(parse_date("11/03/2024", zone).is_none());
    }
}
