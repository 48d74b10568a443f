//! Foundation-model adapter.
//!
//! The pretrained backbone is an opaque capability behind `FoundationModel`:
//! a fixed-shape tensor in, a fixed-length tensor of normalized per-horizon
//! deltas out. This module owns everything around that contract — laying
//! station features out in the model's channel order, z-scoring with channel
//! statistics frozen at adaptation time, inverting the transform on the way
//! back out, and attaching confidence bounds from held-out residual
//! quantiles computed once when the station adaptation was fitted. Nothing
//! here is recomputed per call.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::db::models::PredictionRecord;
use crate::helpers::f64_to_decimal_2dp;
use crate::services::window::{FeatureSlot, FeatureWindow};

/// Model input channel count and order: temperature, wind u, wind v,
/// humidity, pressure, presence.
pub const FEATURE_CHANNELS: usize = 6;

/// Channels that carry physical values (everything but presence).
const VALUE_CHANNELS: usize = FEATURE_CHANNELS - 1;

/// Slots pooled for the short-term trend feature.
const SHORT_POOL_SLOTS: usize = 6;

/// Variables the adapter issues predictions for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForecastVariable {
    Temperature,
    WindSpeed,
    Pressure,
}

impl ForecastVariable {
    pub const ALL: [ForecastVariable; 3] = [
        ForecastVariable::Temperature,
        ForecastVariable::WindSpeed,
        ForecastVariable::Pressure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ForecastVariable::Temperature => "temperature_c",
            ForecastVariable::WindSpeed => "wind_speed_ms",
            ForecastVariable::Pressure => "pressure_hpa",
        }
    }

    fn anchor(&self, slot: &FeatureSlot) -> f64 {
        match self {
            ForecastVariable::Temperature => slot.temperature_c,
            ForecastVariable::WindSpeed => slot.wind_speed_ms,
            ForecastVariable::Pressure => slot.pressure_hpa,
        }
    }
}

/// Row-major 2-D tensor. The only shape the model contract speaks.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        self.data[row * self.cols + col] = value;
    }
}

/// Inference failure. Both variants skip the forecast for the cycle; the
/// next scheduled ingest cycle tries again — never a synchronous retry.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model input shape mismatch: expected {expected:?}, got {actual:?}")]
    InputShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("inference exceeded {budget_ms} ms budget")]
    InferenceTimeout { budget_ms: u64 },
}

/// The pretrained backbone as this service sees it. Internals are opaque;
/// only the input/output contract matters here.
pub trait FoundationModel: Send + Sync {
    /// `(channels, slots)` the model consumes.
    fn input_shape(&self) -> (usize, usize);

    /// Flat output length: one normalized delta per (variable, horizon).
    fn output_len(&self) -> usize;

    fn predict(&self, input: &Tensor) -> Result<Tensor, ModelError>;
}

/// Artifact load/validation failure. Startup-fatal, like any other
/// configuration failure.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("failed to read adaptation artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse adaptation artifact: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid adaptation artifact: {0}")]
    Invalid(String),
}

/// Per-(variable, horizon) calibration fitted on held-out residuals.
#[derive(Debug, Clone, Deserialize)]
pub struct HorizonCalibration {
    pub horizon_minutes: u32,
    /// Symmetric confidence half-width in physical units.
    pub half_width: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariableCalibration {
    /// One of the `ForecastVariable` names.
    pub variable: String,
    /// Physical units per normalized model output unit.
    pub delta_scale: f64,
    pub horizons: Vec<HorizonCalibration>,
}

/// Everything fixed at adaptation time: channel statistics, the adapter
/// head weights, and the residual calibration. Loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct AdaptationArtifact {
    pub model_version: String,
    pub window_slots: usize,
    pub horizons_minutes: Vec<u32>,
    /// Mean/std per value channel (presence is not normalized).
    pub channel_means: Vec<f64>,
    pub channel_stds: Vec<f64>,
    /// `output_len × (2 * FEATURE_CHANNELS)` linear head over pooled
    /// channel features.
    pub head_weights: Vec<Vec<f64>>,
    pub variables: Vec<VariableCalibration>,
}

impl AdaptationArtifact {
    pub fn load(path: &str) -> Result<Self, ArtifactError> {
        let raw = std::fs::read_to_string(path)?;
        let artifact: AdaptationArtifact = serde_json::from_str(&raw)?;
        artifact.validate()?;
        Ok(artifact)
    }

    pub fn validate(&self) -> Result<(), ArtifactError> {
        if self.model_version.is_empty() {
            return Err(ArtifactError::Invalid("model_version is empty".into()));
        }
        if self.window_slots == 0 {
            return Err(ArtifactError::Invalid("window_slots is zero".into()));
        }
        if self.horizons_minutes.is_empty() {
            return Err(ArtifactError::Invalid("no horizons".into()));
        }
        if self.channel_means.len() != VALUE_CHANNELS || self.channel_stds.len() != VALUE_CHANNELS {
            return Err(ArtifactError::Invalid(format!(
                "channel stats must cover {VALUE_CHANNELS} channels"
            )));
        }
        if self.channel_stds.iter().any(|s| *s <= 0.0 || !s.is_finite()) {
            return Err(ArtifactError::Invalid(
                "channel stds must be positive and finite".into(),
            ));
        }
        let output_len = ForecastVariable::ALL.len() * self.horizons_minutes.len();
        if self.head_weights.len() != output_len {
            return Err(ArtifactError::Invalid(format!(
                "head must have {output_len} output rows, has {}",
                self.head_weights.len()
            )));
        }
        let feature_len = 2 * FEATURE_CHANNELS;
        if self.head_weights.iter().any(|row| row.len() != feature_len) {
            return Err(ArtifactError::Invalid(format!(
                "head rows must have {feature_len} weights"
            )));
        }
        for variable in ForecastVariable::ALL {
            let calib = self
                .variables
                .iter()
                .find(|v| v.variable == variable.as_str())
                .ok_or_else(|| {
                    ArtifactError::Invalid(format!("missing calibration for {}", variable.as_str()))
                })?;
            if !calib.delta_scale.is_finite() {
                return Err(ArtifactError::Invalid(format!(
                    "non-finite delta_scale for {}",
                    variable.as_str()
                )));
            }
            for horizon in &self.horizons_minutes {
                let hc = calib
                    .horizons
                    .iter()
                    .find(|h| h.horizon_minutes == *horizon)
                    .ok_or_else(|| {
                        ArtifactError::Invalid(format!(
                            "missing {}-minute calibration for {}",
                            horizon,
                            variable.as_str()
                        ))
                    })?;
                if hc.half_width < 0.0 || !hc.half_width.is_finite() {
                    return Err(ArtifactError::Invalid(format!(
                        "negative half_width for {} at {} minutes",
                        variable.as_str(),
                        horizon
                    )));
                }
            }
        }
        Ok(())
    }

    fn calibration(&self, variable: ForecastVariable) -> &VariableCalibration {
        // coverage enforced by validate() at load time
        self.variables
            .iter()
            .find(|v| v.variable == variable.as_str())
            .expect("artifact validated at startup")
    }
}

/// Linear head over pooled channel statistics — the adapter-visible face of
/// the frozen backbone. Weights come from the adaptation artifact.
pub struct AdapterHead {
    input_shape: (usize, usize),
    weights: Vec<Vec<f64>>,
}

impl AdapterHead {
    pub fn from_artifact(artifact: &AdaptationArtifact) -> Self {
        Self {
            input_shape: (FEATURE_CHANNELS, artifact.window_slots),
            weights: artifact.head_weights.clone(),
        }
    }
}

impl FoundationModel for AdapterHead {
    fn input_shape(&self) -> (usize, usize) {
        self.input_shape
    }

    fn output_len(&self) -> usize {
        self.weights.len()
    }

    fn predict(&self, input: &Tensor) -> Result<Tensor, ModelError> {
        if input.shape() != self.input_shape {
            return Err(ModelError::InputShapeMismatch {
                expected: self.input_shape,
                actual: input.shape(),
            });
        }

        // Pool each channel twice: mean over the newest SHORT_POOL_SLOTS and
        // mean over the full window.
        let (channels, slots) = input.shape();
        let short_n = SHORT_POOL_SLOTS.min(slots);
        let mut features = Vec::with_capacity(2 * channels);
        for c in 0..channels {
            let mut short_sum = 0.0f64;
            for s in (slots - short_n)..slots {
                short_sum += input.get(c, s) as f64;
            }
            features.push(short_sum / short_n as f64);
        }
        for c in 0..channels {
            let mut full_sum = 0.0f64;
            for s in 0..slots {
                full_sum += input.get(c, s) as f64;
            }
            features.push(full_sum / slots as f64);
        }

        let data = self
            .weights
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&features)
                    .map(|(w, f)| w * f)
                    .sum::<f64>() as f32
            })
            .collect::<Vec<f32>>();

        Ok(Tensor {
            rows: 1,
            cols: data.len(),
            data,
        })
    }
}

/// Maps feature windows to model input, runs time-boxed inference, and maps
/// raw output back to typed, bounded predictions.
#[derive(Clone)]
pub struct ForecastAdapter {
    model: Arc<dyn FoundationModel>,
    artifact: Arc<AdaptationArtifact>,
    inference_timeout: Duration,
}

impl ForecastAdapter {
    pub fn new(
        model: Arc<dyn FoundationModel>,
        artifact: AdaptationArtifact,
        inference_timeout_ms: u64,
    ) -> Result<Self, ArtifactError> {
        artifact.validate()?;
        let expected_outputs = ForecastVariable::ALL.len() * artifact.horizons_minutes.len();
        if model.output_len() != expected_outputs {
            return Err(ArtifactError::Invalid(format!(
                "model emits {} outputs, calibration covers {expected_outputs}",
                model.output_len()
            )));
        }
        Ok(Self {
            model,
            artifact: Arc::new(artifact),
            inference_timeout: Duration::from_millis(inference_timeout_ms),
        })
    }

    pub fn model_version(&self) -> &str {
        &self.artifact.model_version
    }

    /// Issue one PredictionRecord per (variable, horizon) pair, all sharing
    /// `issued_at` and the adaptation's model version.
    pub async fn predict(
        &self,
        window: &FeatureWindow,
        issued_at: DateTime<Utc>,
    ) -> Result<Vec<PredictionRecord>, ModelError> {
        let input = encode_window(window, &self.artifact);
        if input.shape() != self.model.input_shape() {
            return Err(ModelError::InputShapeMismatch {
                expected: self.model.input_shape(),
                actual: input.shape(),
            });
        }

        let anchor_slot = window.last_present().cloned().ok_or({
            // a window that passed the sparsity ceiling always has a present
            // slot; an all-absent window cannot be laid out for the model
            ModelError::InputShapeMismatch {
                expected: self.model.input_shape(),
                actual: (0, 0),
            }
        })?;

        tracing::debug!(
            "anchoring deltas at {} (imputed: {})",
            anchor_slot.timestamp_utc,
            anchor_slot.imputed,
        );

        let budget_ms = self.inference_timeout.as_millis() as u64;
        let model = Arc::clone(&self.model);
        let output = tokio::time::timeout(
            self.inference_timeout,
            tokio::task::spawn_blocking(move || model.predict(&input)),
        )
        .await
        .map_err(|_| ModelError::InferenceTimeout { budget_ms })?
        .map_err(|join_err| {
            // a crashed inference task is treated as a blown budget
            tracing::error!("inference task failed: {}", join_err);
            ModelError::InferenceTimeout { budget_ms }
        })??;

        let horizons = &self.artifact.horizons_minutes;
        let expected_len = ForecastVariable::ALL.len() * horizons.len();
        if output.data.len() != expected_len {
            return Err(ModelError::InputShapeMismatch {
                expected: (1, expected_len),
                actual: output.shape(),
            });
        }

        let mut records = Vec::with_capacity(expected_len);
        for (vi, variable) in ForecastVariable::ALL.iter().enumerate() {
            let calib = self.artifact.calibration(*variable);
            let anchor = variable.anchor(&anchor_slot);
            for (hi, horizon) in horizons.iter().enumerate() {
                let raw = output.data[vi * horizons.len() + hi] as f64;
                let mut value = anchor + raw * calib.delta_scale;
                if *variable == ForecastVariable::WindSpeed {
                    value = value.max(0.0);
                }
                let half_width = calib
                    .horizons
                    .iter()
                    .find(|h| h.horizon_minutes == *horizon)
                    .map(|h| h.half_width)
                    .unwrap_or(0.0);
                records.push(PredictionRecord {
                    station_id: window.station_id.clone(),
                    issued_at_utc: issued_at,
                    horizon_minutes: *horizon as i32,
                    variable: variable.as_str().to_string(),
                    predicted_value: f64_to_decimal_2dp(value),
                    lower_bound: f64_to_decimal_2dp(value - half_width),
                    upper_bound: f64_to_decimal_2dp(value + half_width),
                    model_version: self.artifact.model_version.clone(),
                });
            }
        }

        Ok(records)
    }
}

/// Lay a feature window out in the model's channel order, z-scored with the
/// adaptation-time channel statistics. Absent slots stay at the channel mean
/// (zero post-normalization) with presence 0; wind is decomposed into u/v
/// components so direction wraps cleanly.
fn encode_window(window: &FeatureWindow, artifact: &AdaptationArtifact) -> Tensor {
    let slots = window.len();
    let mut tensor = Tensor::zeros(FEATURE_CHANNELS, slots);

    for (i, slot) in window.slots.iter().enumerate() {
        if !slot.present {
            continue;
        }
        let dir_rad = slot.wind_dir_deg.to_radians();
        let wind_u = -slot.wind_speed_ms * dir_rad.sin();
        let wind_v = -slot.wind_speed_ms * dir_rad.cos();
        let values = [
            slot.temperature_c,
            wind_u,
            wind_v,
            slot.humidity_pct,
            slot.pressure_hpa,
        ];
        for (c, value) in values.iter().enumerate() {
            let z = (value - artifact.channel_means[c]) / artifact.channel_stds[c];
            tensor.set(c, i, z as f32);
        }
        tensor.set(VALUE_CHANNELS, i, 1.0);
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::dec_to_f64;
    use crate::services::window::FeatureSlot;
    use chrono::Duration as ChronoDuration;

    const TEST_SLOTS: usize = 36;

    fn test_artifact() -> AdaptationArtifact {
        let horizons = vec![30u32, 60, 120];
        let output_len = 3 * horizons.len();
        AdaptationArtifact {
            model_version: "zbf-adapter-2024.06".to_string(),
            window_slots: TEST_SLOTS,
            horizons_minutes: horizons,
            channel_means: vec![10.0, 0.0, 0.0, 60.0, 1010.0],
            channel_stds: vec![8.0, 4.0, 4.0, 20.0, 12.0],
            head_weights: vec![vec![0.1; 2 * FEATURE_CHANNELS]; output_len],
            variables: vec![
                VariableCalibration {
                    variable: "temperature_c".to_string(),
                    delta_scale: 1.5,
                    horizons: vec![
                        HorizonCalibration { horizon_minutes: 30, half_width: 0.8 },
                        HorizonCalibration { horizon_minutes: 60, half_width: 1.3 },
                        HorizonCalibration { horizon_minutes: 120, half_width: 2.1 },
                    ],
                },
                VariableCalibration {
                    variable: "wind_speed_ms".to_string(),
                    delta_scale: 1.0,
                    horizons: vec![
                        HorizonCalibration { horizon_minutes: 30, half_width: 0.9 },
                        HorizonCalibration { horizon_minutes: 60, half_width: 1.4 },
                        HorizonCalibration { horizon_minutes: 120, half_width: 2.0 },
                    ],
                },
                VariableCalibration {
                    variable: "pressure_hpa".to_string(),
                    delta_scale: 0.6,
                    horizons: vec![
                        HorizonCalibration { horizon_minutes: 30, half_width: 0.5 },
                        HorizonCalibration { horizon_minutes: 60, half_width: 0.9 },
                        HorizonCalibration { horizon_minutes: 120, half_width: 1.6 },
                    ],
                },
            ],
        }
    }

    fn full_window(slots: usize) -> FeatureWindow {
        let end: DateTime<Utc> = "2024-06-08T12:00:00Z".parse().unwrap();
        let slot_vec = (0..slots)
            .map(|i| FeatureSlot {
                timestamp_utc: end - ChronoDuration::minutes(10 * (slots as i64 - 1 - i as i64)),
                present: true,
                imputed: false,
                temperature_c: 21.4,
                wind_speed_ms: 3.2,
                wind_dir_deg: 180.0,
                humidity_pct: 55.0,
                pressure_hpa: 1013.2,
            })
            .collect();
        FeatureWindow {
            station_id: "zbf-01".to_string(),
            end_utc: end,
            slot_minutes: 10,
            slots: slot_vec,
        }
    }

    fn adapter() -> ForecastAdapter {
        ForecastAdapter::new(
            Arc::new(AdapterHead::from_artifact(&test_artifact())),
            test_artifact(),
            1_000,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_one_prediction_per_variable_horizon_pair() {
        let issued_at: DateTime<Utc> = "2024-06-08T12:00:00Z".parse().unwrap();
        let records = adapter()
            .predict(&full_window(TEST_SLOTS), issued_at)
            .await
            .unwrap();

        assert_eq!(records.len(), 9);
        for variable in ["temperature_c", "wind_speed_ms", "pressure_hpa"] {
            for horizon in [30, 60, 120] {
                assert_eq!(
                    records
                        .iter()
                        .filter(|r| r.variable == variable && r.horizon_minutes == horizon)
                        .count(),
                    1,
                    "expected exactly one record for {variable}@{horizon}"
                );
            }
        }
        assert!(records.iter().all(|r| r.issued_at_utc == issued_at));
        assert!(records
            .iter()
            .all(|r| r.model_version == "zbf-adapter-2024.06"));
    }

    #[tokio::test]
    async fn test_bounds_bracket_predicted_value() {
        let issued_at: DateTime<Utc> = "2024-06-08T12:00:00Z".parse().unwrap();
        let records = adapter()
            .predict(&full_window(TEST_SLOTS), issued_at)
            .await
            .unwrap();
        for r in &records {
            assert!(
                r.lower_bound <= r.predicted_value && r.predicted_value <= r.upper_bound,
                "bounds must bracket the value for {}@{}",
                r.variable,
                r.horizon_minutes
            );
        }
    }

    #[tokio::test]
    async fn test_predictions_are_anchored_deltas() {
        let issued_at: DateTime<Utc> = "2024-06-08T12:00:00Z".parse().unwrap();
        let records = adapter()
            .predict(&full_window(TEST_SLOTS), issued_at)
            .await
            .unwrap();
        let temp30 = records
            .iter()
            .find(|r| r.variable == "temperature_c" && r.horizon_minutes == 30)
            .unwrap();
        // delta-from-anchor: the prediction stays within its own calibrated
        // interval of the last observation
        let delta = (dec_to_f64(temp30.predicted_value) - 21.4).abs();
        assert!(delta < 10.0, "implausible temperature delta {delta}");
    }

    #[tokio::test]
    async fn test_wind_speed_never_negative() {
        // steer the head hard negative so the clamp has to act
        let mut artifact = test_artifact();
        let horizons = artifact.horizons_minutes.len();
        for row in artifact.head_weights[horizons..2 * horizons].iter_mut() {
            row.iter_mut().for_each(|w| *w = -50.0);
        }
        let adapter = ForecastAdapter::new(
            Arc::new(AdapterHead::from_artifact(&artifact)),
            artifact.clone(),
            1_000,
        )
        .unwrap();

        let issued_at: DateTime<Utc> = "2024-06-08T12:00:00Z".parse().unwrap();
        let records = adapter
            .predict(&full_window(TEST_SLOTS), issued_at)
            .await
            .unwrap();
        for r in records.iter().filter(|r| r.variable == "wind_speed_ms") {
            assert!(r.predicted_value >= rust_decimal::Decimal::ZERO);
        }
    }

    #[tokio::test]
    async fn test_shape_mismatch_is_reported() {
        let issued_at: DateTime<Utc> = "2024-06-08T12:00:00Z".parse().unwrap();
        let err = adapter()
            .predict(&full_window(TEST_SLOTS - 1), issued_at)
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::InputShapeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_inference_timeout() {
        struct SlowModel;
        impl FoundationModel for SlowModel {
            fn input_shape(&self) -> (usize, usize) {
                (FEATURE_CHANNELS, TEST_SLOTS)
            }
            fn output_len(&self) -> usize {
                9
            }
            fn predict(&self, _input: &Tensor) -> Result<Tensor, ModelError> {
                std::thread::sleep(Duration::from_millis(250));
                Ok(Tensor::zeros(1, 9))
            }
        }

        let adapter = ForecastAdapter::new(Arc::new(SlowModel), test_artifact(), 10).unwrap();
        let issued_at: DateTime<Utc> = "2024-06-08T12:00:00Z".parse().unwrap();
        let err = adapter
            .predict(&full_window(TEST_SLOTS), issued_at)
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::InferenceTimeout { budget_ms: 10 }));
    }

    #[test]
    fn test_artifact_validation_rejects_bad_stats() {
        let mut artifact = test_artifact();
        artifact.channel_stds[0] = 0.0;
        assert!(matches!(
            artifact.validate(),
            Err(ArtifactError::Invalid(_))
        ));

        let mut artifact = test_artifact();
        artifact.variables.remove(1);
        assert!(matches!(
            artifact.validate(),
            Err(ArtifactError::Invalid(_))
        ));

        let mut artifact = test_artifact();
        artifact.head_weights.pop();
        assert!(matches!(
            artifact.validate(),
            Err(ArtifactError::Invalid(_))
        ));
    }

    #[test]
    fn test_encode_window_masks_absent_slots() {
        let artifact = test_artifact();
        let mut window = full_window(TEST_SLOTS);
        window.slots[5].present = false;
        let tensor = encode_window(&window, &artifact);
        for c in 0..FEATURE_CHANNELS {
            assert_eq!(tensor.get(c, 5), 0.0);
        }
        assert_eq!(tensor.get(VALUE_CHANNELS, 6), 1.0);
        // a present slot carries z-scored values
        let z = (21.4 - artifact.channel_means[0]) / artifact.channel_stds[0];
        assert!((tensor.get(0, 6) as f64 - z).abs() < 1e-6);
    }
}
