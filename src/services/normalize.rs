//! Payload normalization: raw upstream samples → canonical observations.
//!
//! Timestamps arrive as station-local naive datetimes and are converted to
//! UTC through the explicit offset table in `services::tz`; the civil
//! `timestamp_local` is then derived back from UTC. Field checks reject a
//! sample outright — out-of-range values are never clamped into validity,
//! and a sample too far from the ingest wall clock is dropped as skew.
//! Each rejection isolates one sample; it never fails the cycle.

use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

use crate::db::models::ObservationRecord;
use crate::helpers::f64_to_decimal_1dp;
use crate::services::tz;
use crate::services::upstream::RawSample;

/// Accepted measurement ranges. Values outside are upstream sensor faults or
/// encoding bugs; both are rejected, not repaired.
const TEMPERATURE_RANGE_C: (f64, f64) = (-60.0, 60.0);
const WIND_SPEED_RANGE_MS: (f64, f64) = (0.0, 75.0);
const WIND_DIR_MAX_DEG: f64 = 360.0; // exclusive; 360 encodes as 0
const HUMIDITY_RANGE_PCT: (f64, f64) = (0.0, 100.0);
const PRESSURE_RANGE_HPA: (f64, f64) = (850.0, 1100.0);

const LOCAL_TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Per-sample validation failure.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing or unparseable field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("timestamp {timestamp_utc} skewed {skew_secs}s from ingest clock")]
    ClockSkew {
        timestamp_utc: DateTime<Utc>,
        skew_secs: i64,
    },
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    station_id: String,
    max_clock_skew_secs: i64,
}

impl Normalizer {
    pub fn new(station_id: &str, max_clock_skew_secs: i64) -> Self {
        Self {
            station_id: station_id.to_string(),
            max_clock_skew_secs,
        }
    }

    /// Convert one raw sample to a canonical record, or reject it.
    ///
    /// `now` is the ingest wall clock, passed in rather than read here so
    /// skew checks are deterministic under test.
    pub fn normalize(
        &self,
        raw: &RawSample,
        now: DateTime<Utc>,
        ingest_id: Uuid,
    ) -> Result<ObservationRecord, ValidationError> {
        let local = parse_local_ts(raw.ts.as_deref())?;
        let timestamp_utc = tz::utc_from_station_local(local);

        let skew_secs = (timestamp_utc - now).num_seconds().abs();
        if skew_secs > self.max_clock_skew_secs {
            return Err(ValidationError::ClockSkew {
                timestamp_utc,
                skew_secs,
            });
        }

        let temperature_c = require("temperature_c", raw.temperature_c)?;
        check_range("temperature_c", temperature_c, TEMPERATURE_RANGE_C)?;

        let wind_speed_ms = require("wind_speed_ms", raw.wind_speed_ms)?;
        check_range("wind_speed_ms", wind_speed_ms, WIND_SPEED_RANGE_MS)?;

        let wind_dir_deg = require("wind_dir_deg", raw.wind_dir_deg)?;
        if !(0.0..WIND_DIR_MAX_DEG).contains(&wind_dir_deg) {
            return Err(ValidationError::OutOfRange {
                field: "wind_dir_deg",
                value: wind_dir_deg,
            });
        }

        let humidity_pct = require("humidity_pct", raw.humidity_pct)?;
        check_range("humidity_pct", humidity_pct, HUMIDITY_RANGE_PCT)?;

        let pressure_hpa = require("pressure_hpa", raw.pressure_hpa)?;
        check_range("pressure_hpa", pressure_hpa, PRESSURE_RANGE_HPA)?;

        Ok(ObservationRecord {
            station_id: self.station_id.clone(),
            timestamp_utc,
            timestamp_local: tz::station_local_from_utc(timestamp_utc),
            temperature_c: f64_to_decimal_1dp(temperature_c),
            wind_speed_ms: f64_to_decimal_1dp(wind_speed_ms),
            wind_dir_deg: f64_to_decimal_1dp(wind_dir_deg),
            humidity_pct: f64_to_decimal_1dp(humidity_pct),
            pressure_hpa: f64_to_decimal_1dp(pressure_hpa),
            source_ingest_id: ingest_id,
        })
    }
}

fn parse_local_ts(ts: Option<&str>) -> Result<NaiveDateTime, ValidationError> {
    let ts = ts.ok_or(ValidationError::MissingField("ts"))?;
    NaiveDateTime::parse_from_str(ts, LOCAL_TS_FORMAT)
        .map_err(|_| ValidationError::MissingField("ts"))
}

fn require(field: &'static str, value: Option<f64>) -> Result<f64, ValidationError> {
    match value {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(ValidationError::MissingField(field)),
    }
}

fn check_range(
    field: &'static str,
    value: f64,
    (lo, hi): (f64, f64),
) -> Result<(), ValidationError> {
    if value < lo || value > hi {
        return Err(ValidationError::OutOfRange { field, value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::dec_to_f64;

    fn sample() -> RawSample {
        RawSample {
            ts: Some("2024-06-01T14:00:00".to_string()),
            temperature_c: Some(21.4),
            wind_speed_ms: Some(3.2),
            wind_dir_deg: Some(180.0),
            humidity_pct: Some(55.0),
            pressure_hpa: Some(1013.2),
        }
    }

    fn now() -> DateTime<Utc> {
        "2024-06-01T12:05:00Z".parse().unwrap()
    }

    fn normalizer() -> Normalizer {
        Normalizer::new("zbf-01", 3 * 3600)
    }

    #[test]
    fn test_valid_sample_produces_canonical_record() {
        let rec = normalizer()
            .normalize(&sample(), now(), Uuid::new_v4())
            .unwrap();
        // June local time is UTC+2
        assert_eq!(
            rec.timestamp_utc,
            "2024-06-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(
            rec.timestamp_local,
            "2024-06-01T14:00:00".parse::<NaiveDateTime>().unwrap()
        );
        assert!((dec_to_f64(rec.temperature_c) - 21.4).abs() < 1e-9);
        assert!((dec_to_f64(rec.pressure_hpa) - 1013.2).abs() < 1e-9);
        assert_eq!(rec.station_id, "zbf-01");
    }

    #[test]
    fn test_winter_timestamp_uses_standard_offset() {
        let mut raw = sample();
        raw.ts = Some("2024-01-15T14:00:00".to_string());
        let winter_now = "2024-01-15T13:02:00Z".parse().unwrap();
        let rec = normalizer()
            .normalize(&raw, winter_now, Uuid::new_v4())
            .unwrap();
        assert_eq!(
            rec.timestamp_utc,
            "2024-01-15T13:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn test_missing_field_rejected() {
        let mut raw = sample();
        raw.humidity_pct = None;
        let err = normalizer()
            .normalize(&raw, now(), Uuid::new_v4())
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingField("humidity_pct"));
    }

    #[test]
    fn test_unparseable_timestamp_rejected() {
        let mut raw = sample();
        raw.ts = Some("01.06.2024 14:00".to_string());
        let err = normalizer()
            .normalize(&raw, now(), Uuid::new_v4())
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingField("ts"));
    }

    #[test]
    fn test_out_of_range_rejected_not_clamped() {
        let mut raw = sample();
        raw.humidity_pct = Some(100.3);
        let err = normalizer()
            .normalize(&raw, now(), Uuid::new_v4())
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::OutOfRange {
                field: "humidity_pct",
                value: 100.3
            }
        );
    }

    #[test]
    fn test_wind_direction_360_rejected() {
        let mut raw = sample();
        raw.wind_dir_deg = Some(360.0);
        let err = normalizer()
            .normalize(&raw, now(), Uuid::new_v4())
            .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::OutOfRange {
                field: "wind_dir_deg",
                ..
            }
        ));
    }

    #[test]
    fn test_non_finite_value_rejected() {
        let mut raw = sample();
        raw.temperature_c = Some(f64::NAN);
        let err = normalizer()
            .normalize(&raw, now(), Uuid::new_v4())
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingField("temperature_c"));
    }

    #[test]
    fn test_clock_skew_rejected() {
        let stale_now = "2024-06-01T16:00:01Z".parse().unwrap();
        let err = normalizer()
            .normalize(&sample(), stale_now, Uuid::new_v4())
            .unwrap_err();
        assert!(matches!(err, ValidationError::ClockSkew { .. }));
    }

    #[test]
    fn test_local_derivation_through_autumn_transition() {
        // 01:30 UTC on the October transition day is back on standard time
        let mut raw = sample();
        raw.ts = Some("2024-10-27T02:30:00".to_string());
        let transition_now = "2024-10-27T01:31:00Z".parse().unwrap();
        let rec = normalizer()
            .normalize(&raw, transition_now, Uuid::new_v4())
            .unwrap();
        assert_eq!(
            rec.timestamp_utc,
            "2024-10-27T01:30:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(
            rec.timestamp_local,
            "2024-10-27T02:30:00".parse::<NaiveDateTime>().unwrap()
        );
    }
}
