//! Station civil-time rules.
//!
//! The upstream station reports naive local timestamps. Conversion to UTC
//! uses an explicit offset table (standard and daylight offsets plus the
//! transition instants computed per year) rather than the process
//! environment, so ingest behaves identically regardless of where the
//! service runs. `timestamp_local` is derived back from UTC with the same
//! rules.
//!
//! The station sits in the Central European zone: UTC+1 standard, UTC+2
//! daylight, switching at 01:00 UTC on the last Sundays of March and
//! October.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, Utc, Weekday};

/// Standard (winter) offset, minutes east of UTC.
const STANDARD_OFFSET_MIN: i32 = 60;

/// Daylight (summer) offset, minutes east of UTC.
const DAYLIGHT_OFFSET_MIN: i32 = 120;

/// UTC instants bounding the daylight-saving interval of a year:
/// last Sunday of March 01:00 UTC (inclusive) through last Sunday of
/// October 01:00 UTC (exclusive).
pub fn daylight_interval_utc(year: i32) -> (DateTime<Utc>, DateTime<Utc>) {
    (transition_instant(year, 3), transition_instant(year, 10))
}

fn transition_instant(year: i32, month: u32) -> DateTime<Utc> {
    let naive = last_sunday(year, month)
        .and_hms_opt(1, 0, 0)
        .expect("01:00:00 is a valid time");
    DateTime::from_naive_utc_and_offset(naive, Utc)
}

/// Last Sunday of a month. Only March and October (31 days each) are used.
fn last_sunday(year: i32, month: u32) -> NaiveDate {
    let last_day = NaiveDate::from_ymd_opt(year, month, 31)
        .expect("transition months have 31 days");
    let back = days_back_to_sunday(last_day.weekday());
    last_day - Duration::days(back)
}

fn days_back_to_sunday(weekday: Weekday) -> i64 {
    weekday.num_days_from_sunday() as i64
}

fn offset_minutes_at(utc: DateTime<Utc>) -> i32 {
    let (start, end) = daylight_interval_utc(utc.year());
    if utc >= start && utc < end {
        DAYLIGHT_OFFSET_MIN
    } else {
        STANDARD_OFFSET_MIN
    }
}

/// The station's UTC offset in effect at a UTC instant.
pub fn offset_at_utc(utc: DateTime<Utc>) -> FixedOffset {
    FixedOffset::east_opt(offset_minutes_at(utc) * 60).expect("offset within ±24h")
}

/// Convert a station-local naive timestamp to UTC.
///
/// Transition edge cases: a fall-back ambiguous time (valid under both
/// offsets) resolves to the standard offset; a spring-forward gap time
/// (valid under neither) resolves to the daylight offset.
pub fn utc_from_station_local(local: NaiveDateTime) -> DateTime<Utc> {
    let std_candidate = shift(local, STANDARD_OFFSET_MIN);
    let dst_candidate = shift(local, DAYLIGHT_OFFSET_MIN);

    if offset_minutes_at(std_candidate) == STANDARD_OFFSET_MIN {
        std_candidate
    } else if offset_minutes_at(dst_candidate) == DAYLIGHT_OFFSET_MIN {
        dst_candidate
    } else {
        // spring-forward gap
        dst_candidate
    }
}

fn shift(local: NaiveDateTime, offset_min: i32) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(local - Duration::minutes(offset_min as i64), Utc)
}

/// Derive the station-local civil time for a UTC instant.
pub fn station_local_from_utc(utc: DateTime<Utc>) -> NaiveDateTime {
    utc.with_timezone(&offset_at_utc(utc)).naive_local()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(s: &str) -> NaiveDateTime {
        s.parse::<NaiveDateTime>().unwrap()
    }

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse::<DateTime<Utc>>().unwrap()
    }

    #[test]
    fn test_daylight_interval_2024() {
        let (start, end) = daylight_interval_utc(2024);
        assert_eq!(start, utc("2024-03-31T01:00:00Z"));
        assert_eq!(end, utc("2024-10-27T01:00:00Z"));
    }

    #[test]
    fn test_summer_local_to_utc() {
        // June is daylight time: 14:00 local = 12:00 UTC
        assert_eq!(
            utc_from_station_local(naive("2024-06-01T14:00:00")),
            utc("2024-06-01T12:00:00Z")
        );
    }

    #[test]
    fn test_winter_local_to_utc() {
        // January is standard time: 14:00 local = 13:00 UTC
        assert_eq!(
            utc_from_station_local(naive("2024-01-15T14:00:00")),
            utc("2024-01-15T13:00:00Z")
        );
    }

    #[test]
    fn test_utc_to_local_round_trip_summer() {
        let t = utc("2024-06-01T12:00:00Z");
        assert_eq!(station_local_from_utc(t), naive("2024-06-01T14:00:00"));
    }

    #[test]
    fn test_local_derivation_across_spring_transition() {
        // One minute before the March transition: still standard (+1)
        assert_eq!(
            station_local_from_utc(utc("2024-03-31T00:59:00Z")),
            naive("2024-03-31T01:59:00")
        );
        // At the transition instant: daylight (+2), clocks jump 02:00 → 03:00
        assert_eq!(
            station_local_from_utc(utc("2024-03-31T01:00:00Z")),
            naive("2024-03-31T03:00:00")
        );
    }

    #[test]
    fn test_local_derivation_across_autumn_transition() {
        assert_eq!(
            station_local_from_utc(utc("2024-10-27T00:59:00Z")),
            naive("2024-10-27T02:59:00")
        );
        // Clocks fall back 03:00 → 02:00
        assert_eq!(
            station_local_from_utc(utc("2024-10-27T01:00:00Z")),
            naive("2024-10-27T02:00:00")
        );
    }

    #[test]
    fn test_spring_gap_resolves_to_daylight() {
        // 02:30 local on 2024-03-31 does not exist; resolved with +2
        assert_eq!(
            utc_from_station_local(naive("2024-03-31T02:30:00")),
            utc("2024-03-31T00:30:00Z")
        );
    }

    #[test]
    fn test_autumn_ambiguity_resolves_to_standard() {
        // 02:30 local on 2024-10-27 occurs twice; standard (+1) wins
        assert_eq!(
            utc_from_station_local(naive("2024-10-27T02:30:00")),
            utc("2024-10-27T01:30:00Z")
        );
    }

    #[test]
    fn test_unambiguous_times_round_trip() {
        for s in [
            "2024-01-01T00:00:00",
            "2024-04-15T09:10:00",
            "2024-07-31T23:50:00",
            "2024-12-24T18:00:00",
        ] {
            let local = naive(s);
            assert_eq!(station_local_from_utc(utc_from_station_local(local)), local);
        }
    }
}
