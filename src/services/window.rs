//! Fixed-length feature windows over the observation series.
//!
//! The model adapter needs positional alignment, so a window always has
//! exactly the configured number of slots no matter how sparse the
//! underlying history is. Missing slots are carry-forward imputed up to a
//! bounded run length; beyond that they are absent — they keep their
//! position but are excluded from rolling statistics. A window with too
//! many absent slots is rejected as insufficient history, which callers
//! treat as "skip this forecast cycle".

use chrono::{DateTime, Duration, Utc};
use futures::TryStreamExt;

use crate::db::models::ObservationRecord;
use crate::db::store::{SeriesStore, StorageError};
use crate::helpers::dec_to_f64;

/// Lookback geometry and imputation bounds.
#[derive(Debug, Clone)]
pub struct WindowConfig {
    pub lookback_days: u32,
    pub slot_minutes: u32,
    /// Longest consecutive run of missing slots carry-forward may bridge.
    pub max_gap_slots: usize,
    /// Absent-slot fraction above which the window is too sparse to use.
    pub max_absent_fraction: f64,
}

impl WindowConfig {
    pub fn slot_count(&self) -> usize {
        (self.lookback_days as usize * 24 * 60) / self.slot_minutes as usize
    }

    fn slot_secs(&self) -> i64 {
        self.slot_minutes as i64 * 60
    }
}

/// One slot of the window. Absent slots carry zeroed values and
/// `present == false`; imputed slots repeat the last real observation.
#[derive(Debug, Clone)]
pub struct FeatureSlot {
    pub timestamp_utc: DateTime<Utc>,
    pub present: bool,
    pub imputed: bool,
    pub temperature_c: f64,
    pub wind_speed_ms: f64,
    pub wind_dir_deg: f64,
    pub humidity_pct: f64,
    pub pressure_hpa: f64,
}

impl FeatureSlot {
    fn observed(timestamp_utc: DateTime<Utc>, rec: &ObservationRecord) -> Self {
        Self::from_record(timestamp_utc, rec, false)
    }

    fn carried(timestamp_utc: DateTime<Utc>, rec: &ObservationRecord) -> Self {
        Self::from_record(timestamp_utc, rec, true)
    }

    fn from_record(timestamp_utc: DateTime<Utc>, rec: &ObservationRecord, imputed: bool) -> Self {
        Self {
            timestamp_utc,
            present: true,
            imputed,
            temperature_c: dec_to_f64(rec.temperature_c),
            wind_speed_ms: dec_to_f64(rec.wind_speed_ms),
            wind_dir_deg: dec_to_f64(rec.wind_dir_deg),
            humidity_pct: dec_to_f64(rec.humidity_pct),
            pressure_hpa: dec_to_f64(rec.pressure_hpa),
        }
    }

    fn absent(timestamp_utc: DateTime<Utc>) -> Self {
        Self {
            timestamp_utc,
            present: false,
            imputed: false,
            temperature_c: 0.0,
            wind_speed_ms: 0.0,
            wind_dir_deg: 0.0,
            humidity_pct: 0.0,
            pressure_hpa: 0.0,
        }
    }
}

/// Fixed-length ordered slot sequence ending at the (slot-aligned) as-of
/// instant. `slots.len()` always equals the configured window size.
#[derive(Debug, Clone)]
pub struct FeatureWindow {
    pub station_id: String,
    /// Slot-aligned end of the window (inclusive last slot).
    pub end_utc: DateTime<Utc>,
    pub slot_minutes: u32,
    pub slots: Vec<FeatureSlot>,
}

impl FeatureWindow {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn absent_fraction(&self) -> f64 {
        if self.is_empty() {
            return 1.0;
        }
        let absent = self.slots.iter().filter(|s| !s.present).count();
        absent as f64 / self.slots.len() as f64
    }

    /// Newest slot holding usable values (observed or imputed).
    pub fn last_present(&self) -> Option<&FeatureSlot> {
        self.slots.iter().rev().find(|s| s.present)
    }

    /// Mean of a feature over the newest `last_n` slots, absent slots
    /// excluded. `None` when every slot in the span is absent.
    pub fn rolling_mean<F>(&self, last_n: usize, feature: F) -> Option<f64>
    where
        F: Fn(&FeatureSlot) -> f64,
    {
        let start = self.slots.len().saturating_sub(last_n);
        let values: Vec<f64> = self.slots[start..]
            .iter()
            .filter(|s| s.present)
            .map(&feature)
            .collect();
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }

    /// Population variance of a feature over the newest `last_n` slots,
    /// absent slots excluded.
    pub fn rolling_variance<F>(&self, last_n: usize, feature: F) -> Option<f64>
    where
        F: Fn(&FeatureSlot) -> f64,
    {
        let start = self.slots.len().saturating_sub(last_n);
        let values: Vec<f64> = self.slots[start..]
            .iter()
            .filter(|s| s.present)
            .map(&feature)
            .collect();
        if values.is_empty() {
            return None;
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        Some(values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64)
    }

    /// Feature value `slots_back` positions before the window end, or `None`
    /// if that slot is absent (seasonal-lag features skip gaps).
    pub fn seasonal_lag<F>(&self, slots_back: usize, feature: F) -> Option<f64>
    where
        F: Fn(&FeatureSlot) -> f64,
    {
        if slots_back >= self.slots.len() {
            return None;
        }
        let slot = &self.slots[self.slots.len() - 1 - slots_back];
        slot.present.then(|| feature(slot))
    }
}

/// Raised when the window is too sparse to feed the model.
#[derive(Debug, thiserror::Error)]
#[error(
    "insufficient history: {absent_slots}/{total_slots} slots absent \
     (ceiling {max_absent_fraction})"
)]
pub struct InsufficientHistoryError {
    pub absent_slots: usize,
    pub total_slots: usize,
    pub max_absent_fraction: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum WindowError {
    #[error(transparent)]
    InsufficientHistory(#[from] InsufficientHistoryError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Align an instant down to its slot boundary.
pub fn align_to_slot(at: DateTime<Utc>, slot_minutes: u32) -> DateTime<Utc> {
    let slot_secs = slot_minutes as i64 * 60;
    let rem = at.timestamp().rem_euclid(slot_secs);
    at - Duration::seconds(rem)
        - Duration::nanoseconds(at.timestamp_subsec_nanos() as i64)
}

#[derive(Debug, Clone)]
pub struct WindowBuilder {
    store: SeriesStore,
    config: WindowConfig,
}

impl WindowBuilder {
    pub fn new(store: SeriesStore, config: WindowConfig) -> Self {
        Self { store, config }
    }

    /// Assemble the feature window ending at `as_of_utc` (aligned down to
    /// the slot grid) from the observation series.
    pub async fn build(
        &self,
        station_id: &str,
        as_of_utc: DateTime<Utc>,
    ) -> Result<FeatureWindow, WindowError> {
        let end = align_to_slot(as_of_utc, self.config.slot_minutes);
        let start = end - Duration::seconds((self.config.slot_count() as i64 - 1) * self.config.slot_secs());

        let mut records = Vec::new();
        {
            let mut stream = self.store.range(station_id, start, end);
            while let Some(rec) = stream.try_next().await? {
                records.push(rec);
            }
        }

        Ok(assemble(&self.config, station_id, end, &records)?)
    }
}

/// Pure assembly step: place records on the slot grid, impute bounded gaps,
/// enforce the sparsity ceiling. Split from `build` so it is testable
/// without a database.
fn assemble(
    config: &WindowConfig,
    station_id: &str,
    end: DateTime<Utc>,
    records: &[ObservationRecord],
) -> Result<FeatureWindow, InsufficientHistoryError> {
    let n = config.slot_count();
    let slot_secs = config.slot_secs();
    let start = end - Duration::seconds((n as i64 - 1) * slot_secs);

    // Nearest-slot placement; records are ascending, so on a collision the
    // newer record wins.
    let mut occupied: Vec<Option<&ObservationRecord>> = vec![None; n];
    for rec in records {
        let delta = (rec.timestamp_utc - start).num_seconds();
        let idx = (delta as f64 / slot_secs as f64).round();
        if idx < 0.0 || idx >= n as f64 {
            continue;
        }
        let idx = idx as usize;
        let slot_ts = start + Duration::seconds(idx as i64 * slot_secs);
        if (rec.timestamp_utc - slot_ts).num_seconds().abs() * 2 <= slot_secs {
            occupied[idx] = Some(rec);
        }
    }

    let mut slots = Vec::with_capacity(n);
    let mut carry: Option<&ObservationRecord> = None;
    let mut gap_run = 0usize;
    let mut absent = 0usize;
    for (i, slot_rec) in occupied.iter().enumerate() {
        let ts = start + Duration::seconds(i as i64 * slot_secs);
        match slot_rec {
            Some(rec) => {
                carry = Some(rec);
                gap_run = 0;
                slots.push(FeatureSlot::observed(ts, rec));
            }
            None => {
                gap_run += 1;
                match carry {
                    Some(rec) if gap_run <= config.max_gap_slots => {
                        slots.push(FeatureSlot::carried(ts, rec));
                    }
                    _ => {
                        absent += 1;
                        slots.push(FeatureSlot::absent(ts));
                    }
                }
            }
        }
    }

    if absent as f64 / n as f64 > config.max_absent_fraction {
        return Err(InsufficientHistoryError {
            absent_slots: absent,
            total_slots: n,
            max_absent_fraction: config.max_absent_fraction,
        });
    }

    Ok(FeatureWindow {
        station_id: station_id.to_string(),
        end_utc: end,
        slot_minutes: config.slot_minutes,
        slots,
    })
}
