//! Shared Decimal ↔ f64 conversion helpers.
//!
//! Measurement values live as `Decimal` in the persistence layer and as `f64`
//! in the feature/model layer. Two f64→Decimal roundings exist because the
//! two record types carry different precision:
//!
//! - `f64_to_decimal_1dp`: observations (0.1 °C / 0.1 m/s resolution)
//! - `f64_to_decimal_2dp`: predictions and their bounds
//!
//! Both return `Decimal::ZERO` for non-finite inputs (NaN, ±Inf).

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Convert an f64 measurement to Decimal, rounded to 1 decimal place.
///
/// Consistent rounding keeps re-ingested slots byte-identical, so the
/// idempotent upsert stays a true no-op on replays.
pub(crate) fn f64_to_decimal_1dp(v: f64) -> Decimal {
    if !v.is_finite() {
        tracing::warn!(
            "f64_to_decimal_1dp received non-finite value {}, defaulting to 0",
            v
        );
        return Decimal::ZERO;
    }
    Decimal::from_str_exact(&format!("{:.1}", v)).unwrap_or_default()
}

/// Convert an f64 predicted value to Decimal, rounded to 2 decimal places.
pub(crate) fn f64_to_decimal_2dp(v: f64) -> Decimal {
    if !v.is_finite() {
        tracing::warn!(
            "f64_to_decimal_2dp received non-finite value {}, defaulting to 0",
            v
        );
        return Decimal::ZERO;
    }
    Decimal::from_str_exact(&format!("{:.2}", v)).unwrap_or_default()
}

/// Convert a Decimal to f64, defaulting to 0.0 for values that can't be
/// represented.
pub(crate) fn dec_to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_f64_to_decimal_1dp_rounds() {
        assert_eq!(f64_to_decimal_1dp(3.16), Decimal::from_str("3.2").unwrap());
        assert_eq!(
            f64_to_decimal_1dp(-4.74),
            Decimal::from_str("-4.7").unwrap()
        );
    }

    #[test]
    fn test_f64_to_decimal_1dp_non_finite() {
        assert_eq!(f64_to_decimal_1dp(f64::NAN), Decimal::ZERO);
        assert_eq!(f64_to_decimal_1dp(f64::INFINITY), Decimal::ZERO);
    }

    #[test]
    fn test_f64_to_decimal_2dp_rounds() {
        assert_eq!(
            f64_to_decimal_2dp(21.456),
            Decimal::from_str("21.46").unwrap()
        );
    }

    #[test]
    fn test_f64_to_decimal_2dp_non_finite() {
        assert_eq!(f64_to_decimal_2dp(f64::NEG_INFINITY), Decimal::ZERO);
    }

    #[test]
    fn test_dec_to_f64_round_trip() {
        let d = Decimal::from_str("1013.2").unwrap();
        assert!((dec_to_f64(d) - 1013.2).abs() < 1e-10);
    }
}
