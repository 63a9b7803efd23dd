//! Five-minute bucket arithmetic and query time resolution.
//!
//! All internal instants are `DateTime<Utc>`. Client-supplied wall-clock
//! strings are parsed in their named IANA zone and converted to UTC at
//! the boundary; nothing downstream ever sees a local time.

use crate::errors::{MarketBreadthError, Result};
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Width of one candle bucket.
pub const BUCKET_MINUTES: i64 = 5;

/// Bucket width in milliseconds.
pub const BUCKET_MS: i64 = BUCKET_MINUTES * 60 * 1000;

/// Accepted wall-clock input formats for range queries.
const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

/// Floor an instant to its five-minute bucket start.
pub fn floor_five_minutes(t: DateTime<Utc>) -> DateTime<Utc> {
    let ms = t.timestamp_millis();
    let aligned = ms.div_euclid(BUCKET_MS) * BUCKET_MS;
    DateTime::from_timestamp_millis(aligned).unwrap_or(t)
}

/// The opening instant of the most recent fully closed bucket.
pub fn latest_closed_bucket(now: DateTime<Utc>) -> DateTime<Utc> {
    floor_five_minutes(now) - Duration::minutes(BUCKET_MINUTES)
}

/// Time selector for the distribution and uptrend queries: either a
/// look-back from now or an explicit wall-clock range in a named zone.
#[derive(Debug, Clone)]
pub enum TimeSpec {
    LookbackHours(f64),
    AbsoluteRange {
        start: NaiveDateTime,
        end: NaiveDateTime,
        zone: Tz,
    },
}

impl TimeSpec {
    /// Normalize to an aligned UTC `(start, end)` pair.
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        match self {
            TimeSpec::LookbackHours(hours) => {
                if !hours.is_finite() || *hours <= 0.0 {
                    return Err(MarketBreadthError::invalid_input(
                        "hours must be a positive number",
                    ));
                }
                let end = floor_five_minutes(now);
                let minutes = (hours * 60.0) as i64;
                let start = floor_five_minutes(end - Duration::minutes(minutes));
                Ok((start, end))
            }
            TimeSpec::AbsoluteRange { start, end, zone } => {
                let start_utc = local_to_utc(*start, *zone)?;
                let end_utc = local_to_utc(*end, *zone)?;
                if start_utc > end_utc {
                    return Err(MarketBreadthError::invalid_input(
                        "start must not be after end",
                    ));
                }
                Ok((floor_five_minutes(start_utc), floor_five_minutes(end_utc)))
            }
        }
    }
}

/// Parse a wall-clock string in one of the accepted formats.
pub fn parse_datetime(raw: &str) -> Result<NaiveDateTime> {
    for format in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(parsed);
        }
    }
    Err(MarketBreadthError::invalid_input(format!(
        "invalid time {raw:?}, expected format yyyy-MM-dd HH:mm"
    )))
}

/// Resolve an IANA zone name.
pub fn parse_zone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| MarketBreadthError::invalid_input(format!("unknown timezone {name:?}")))
}

/// Convert a wall-clock time in the given zone to UTC.
pub fn local_to_utc(local: NaiveDateTime, zone: Tz) -> Result<DateTime<Utc>> {
    zone.from_local_datetime(&local)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| {
            MarketBreadthError::invalid_input(format!(
                "time {local} does not exist in timezone {zone}"
            ))
        })
}

/// Time until the next collection tick, which fires 10 seconds past
/// every five-minute boundary so the exchange has finalized the
/// just-closed bucket.
pub fn delay_until_next_tick(now: DateTime<Utc>) -> std::time::Duration {
    let bucket = floor_five_minutes(now);
    let mut candidate = bucket + Duration::seconds(10);
    if candidate <= now {
        candidate = candidate + Duration::minutes(BUCKET_MINUTES);
    }
    (candidate - now).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_floor_five_minutes() {
        assert_eq!(
            floor_five_minutes(utc(2025, 1, 2, 9, 7, 31)),
            utc(2025, 1, 2, 9, 5, 0)
        );
        assert_eq!(
            floor_five_minutes(utc(2025, 1, 2, 9, 5, 0)),
            utc(2025, 1, 2, 9, 5, 0)
        );
        assert_eq!(
            floor_five_minutes(utc(2025, 1, 2, 0, 4, 59)),
            utc(2025, 1, 2, 0, 0, 0)
        );
    }

    #[test]
    fn test_latest_closed_bucket() {
        // 09:07 -> aligned 09:05 -> closed bucket opens at 09:00
        assert_eq!(
            latest_closed_bucket(utc(2025, 1, 2, 9, 7, 0)),
            utc(2025, 1, 2, 9, 0, 0)
        );
    }

    #[test]
    fn test_parse_datetime_formats() {
        for raw in [
            "2025-01-02 09:05",
            "2025-01-02 09:05:00",
            "2025-01-02T09:05",
            "2025-01-02T09:05:00",
        ] {
            let parsed = parse_datetime(raw).unwrap();
            assert_eq!(parsed.format("%H:%M").to_string(), "09:05");
        }
        assert!(parse_datetime("02/01/2025").is_err());
    }

    #[test]
    fn test_lookback_resolution_is_aligned() {
        let spec = TimeSpec::LookbackHours(1.5);
        let (start, end) = spec.resolve(utc(2025, 1, 2, 9, 7, 31)).unwrap();
        assert_eq!(end, utc(2025, 1, 2, 9, 5, 0));
        assert_eq!(start, utc(2025, 1, 2, 7, 35, 0));
    }

    #[test]
    fn test_lookback_rejects_non_positive_hours() {
        assert!(TimeSpec::LookbackHours(0.0).resolve(Utc::now()).is_err());
        assert!(TimeSpec::LookbackHours(-3.0).resolve(Utc::now()).is_err());
    }

    #[test]
    fn test_absolute_range_converts_zone_to_utc() {
        // 18:03 in Shanghai is 10:03 UTC, floored to 10:00
        let spec = TimeSpec::AbsoluteRange {
            start: parse_datetime("2025-01-02 18:03").unwrap(),
            end: parse_datetime("2025-01-02 20:00").unwrap(),
            zone: parse_zone("Asia/Shanghai").unwrap(),
        };
        let (start, end) = spec.resolve(Utc::now()).unwrap();
        assert_eq!(start, utc(2025, 1, 2, 10, 0, 0));
        assert_eq!(end, utc(2025, 1, 2, 12, 0, 0));
    }

    #[test]
    fn test_absolute_range_rejects_inverted_range() {
        let spec = TimeSpec::AbsoluteRange {
            start: parse_datetime("2025-01-02 20:00").unwrap(),
            end: parse_datetime("2025-01-02 18:00").unwrap(),
            zone: parse_zone("UTC").unwrap(),
        };
        assert!(spec.resolve(Utc::now()).is_err());
    }

    #[test]
    fn test_parse_zone_rejects_unknown_names() {
        assert!(parse_zone("Mars/Olympus").is_err());
        assert!(parse_zone("Asia/Shanghai").is_ok());
    }

    #[test]
    fn test_delay_until_next_tick() {
        // at 09:05:03 the tick at 09:05:10 is 7s away
        let d = delay_until_next_tick(utc(2025, 1, 2, 9, 5, 3));
        assert_eq!(d.as_secs(), 7);
        // at 09:05:10 exactly, the next tick is a full bucket away
        let d = delay_until_next_tick(utc(2025, 1, 2, 9, 5, 10));
        assert_eq!(d.as_secs(), 300);
        // at 09:07:00 the next tick is 09:10:10
        let d = delay_until_next_tick(utc(2025, 1, 2, 9, 7, 0));
        assert_eq!(d.as_secs(), 190);
    }
}
