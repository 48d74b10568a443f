//! Ingest cycle state machine and scheduler.
//!
//! One cycle walks Fetching → Normalizing → Writing and lands on a single
//! outcome; a forecast pass follows every cycle that wrote data. The loop
//! re-arms on a drift-corrected cadence: tick N fires at `anchor + N *
//! interval` computed from the wall clock, never from accumulated sleeps.
//! Exactly one cycle is in flight at a time — when a cycle overruns its
//! interval, the missed tick is coalesced (skipped), never queued.
//!
//! No cycle outcome terminates the process. Fetch failures record a gap and
//! move on; invalid samples are excluded one by one; a storage failure
//! fails the cycle and the next scheduled tick retries. Gaps in history are
//! an accepted, recoverable condition.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::db::store::SeriesStore;
use crate::services::model::ForecastAdapter;
use crate::services::normalize::Normalizer;
use crate::services::upstream::StationClient;
use crate::services::window::{WindowBuilder, WindowError};

/// Terminal state of one ingest cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub enum CycleOutcome {
    /// Every fetched sample validated and was written.
    Success,
    /// Some samples validated and were written; the rest were excluded.
    PartialSuccess,
    /// Nothing was written: fetch failed, upstream had no new samples, or
    /// every sample failed validation.
    Skipped,
    /// A storage write failed mid-cycle; retried at the next tick.
    Failed,
}

/// Bookkeeping for one cycle. Surfaced via logs and the status endpoint,
/// never persisted into the observation series.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IngestCycleResult {
    pub cycle_start: DateTime<Utc>,
    /// Upstream fetch attempts spent (0 if the cycle failed before fetching).
    pub attempts: u32,
    pub outcome: CycleOutcome,
    pub records_written: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

/// Explicit process-level scheduling state. Shared with the status route;
/// there are no ambient globals.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProcessState {
    pub active: bool,
    pub station_id: String,
    pub next_tick_at: Option<DateTime<Utc>>,
    pub last_cycle: Option<IngestCycleResult>,
    pub total_cycles: u64,
    /// Ticks skipped because the previous cycle overran into them.
    pub ticks_coalesced: u64,
    /// Cycles that left a gap in the series (failed or skipped with error).
    pub gap_count: u64,
    pub last_forecast_issued_at: Option<DateTime<Utc>>,
    pub last_forecast_outcome: Option<String>,
}

impl ProcessState {
    pub fn new(station_id: &str) -> Self {
        Self {
            active: true,
            station_id: station_id.to_string(),
            next_tick_at: None,
            last_cycle: None,
            total_cycles: 0,
            ticks_coalesced: 0,
            gap_count: 0,
            last_forecast_issued_at: None,
            last_forecast_outcome: None,
        }
    }
}

/// Shared process state handle.
pub type SharedProcessState = Arc<RwLock<ProcessState>>;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub station_id: String,
    pub poll_interval_secs: u64,
    /// How far back the first fetch reaches when the store is empty.
    pub backfill_lookback_hours: i64,
}

/// Owns one station's ingest pipeline: fetch → normalize → write, then
/// forecast.
pub struct Ingestor {
    store: SeriesStore,
    client: StationClient,
    normalizer: Normalizer,
    window_builder: WindowBuilder,
    adapter: ForecastAdapter,
    config: IngestConfig,
}

impl Ingestor {
    pub fn new(
        store: SeriesStore,
        client: StationClient,
        normalizer: Normalizer,
        window_builder: WindowBuilder,
        adapter: ForecastAdapter,
        config: IngestConfig,
    ) -> Self {
        Self {
            store,
            client,
            normalizer,
            window_builder,
            adapter,
            config,
        }
    }

    /// Run the ingest/forecast loop. Never returns; spawn it via
    /// `tokio::spawn`.
    pub async fn run(self, state: SharedProcessState) {
        tracing::info!(
            "ingest loop started for station {} (every {}s)",
            self.config.station_id,
            self.config.poll_interval_secs,
        );

        let anchor = Utc::now();
        let interval_secs = self.config.poll_interval_secs as i64;
        let mut last_tick: i64 = 0;

        loop {
            let cycle_start = Utc::now();
            let ingest_id = Uuid::new_v4();

            // Hard deadline: a cycle must finish before the next tick. The
            // stages inside carry their own timeouts; this is the backstop.
            // Cancelling mid-write is safe — upserts are idempotent.
            let deadline = std::time::Duration::from_secs(self.config.poll_interval_secs);
            let result = match tokio::time::timeout(deadline, self.run_cycle(ingest_id, cycle_start))
                .await
            {
                Ok(result) => result,
                Err(_) => IngestCycleResult {
                    cycle_start,
                    attempts: 0,
                    outcome: CycleOutcome::Failed,
                    records_written: 0,
                    error_detail: Some(format!(
                        "cycle exceeded {}s deadline",
                        self.config.poll_interval_secs
                    )),
                },
            };

            match result.outcome {
                CycleOutcome::Success | CycleOutcome::PartialSuccess => tracing::info!(
                    "cycle {:?}: wrote {} record(s) in {} attempt(s)",
                    result.outcome,
                    result.records_written,
                    result.attempts,
                ),
                CycleOutcome::Skipped | CycleOutcome::Failed => tracing::warn!(
                    "cycle {:?}: {}",
                    result.outcome,
                    result.error_detail.as_deref().unwrap_or("no new samples"),
                ),
            }

            let leaves_gap = matches!(result.outcome, CycleOutcome::Failed)
                || (matches!(result.outcome, CycleOutcome::Skipped)
                    && result.error_detail.is_some());
            let run_forecast = matches!(
                result.outcome,
                CycleOutcome::Success | CycleOutcome::PartialSuccess
            );

            {
                let mut s = state.write().await;
                s.total_cycles += 1;
                if leaves_gap {
                    s.gap_count += 1;
                }
                s.last_cycle = Some(result);
            }

            if run_forecast {
                let as_of = Utc::now();
                let (outcome, issued) = self.run_forecast(as_of).await;
                let mut s = state.write().await;
                if issued {
                    s.last_forecast_issued_at = Some(as_of);
                }
                s.last_forecast_outcome = Some(outcome);
            }

            // Drift-corrected re-arm against the wall clock.
            let (next_tick, coalesced, due) =
                next_tick_after(anchor, Utc::now(), interval_secs, last_tick);
            last_tick = next_tick;
            if coalesced > 0 {
                tracing::warn!("cycle overran its interval, coalescing {} tick(s)", coalesced);
            }

            {
                let mut s = state.write().await;
                s.next_tick_at = Some(due);
                s.ticks_coalesced += coalesced;
            }

            let sleep_ms = (due - Utc::now()).num_milliseconds().max(0) as u64;
            tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
        }
    }

    /// One pass of Fetching → Normalizing → Writing.
    async fn run_cycle(&self, ingest_id: Uuid, cycle_start: DateTime<Utc>) -> IngestCycleResult {
        let station = &self.config.station_id;

        // Fetching. `since` resumes from the newest stored slot; an empty
        // store backfills a bounded lookback instead of all of history.
        let since = match self.store.latest(station).await {
            Ok(Some(rec)) => rec.timestamp_utc,
            Ok(None) => cycle_start - Duration::hours(self.config.backfill_lookback_hours),
            Err(e) => {
                return IngestCycleResult {
                    cycle_start,
                    attempts: 0,
                    outcome: CycleOutcome::Failed,
                    records_written: 0,
                    error_detail: Some(format!("storage read failed: {e}")),
                }
            }
        };

        let reply = match self.client.fetch_samples(station, Some(since)).await {
            Ok(reply) => reply,
            Err(fetch_err) => {
                return IngestCycleResult {
                    cycle_start,
                    attempts: fetch_err.attempts,
                    outcome: CycleOutcome::Skipped,
                    records_written: 0,
                    error_detail: Some(fetch_err.to_string()),
                }
            }
        };

        if reply.samples.is_empty() {
            return IngestCycleResult {
                cycle_start,
                attempts: reply.attempts,
                outcome: CycleOutcome::Skipped,
                records_written: 0,
                error_detail: None,
            };
        }

        // Normalizing. A bad sample excludes only itself.
        let now = Utc::now();
        let total = reply.samples.len();
        let mut records = Vec::with_capacity(total);
        let mut rejected = 0usize;
        for raw in &reply.samples {
            match self.normalizer.normalize(raw, now, ingest_id) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!("sample rejected: {e}");
                    rejected += 1;
                }
            }
        }

        if records.is_empty() {
            return IngestCycleResult {
                cycle_start,
                attempts: reply.attempts,
                outcome: CycleOutcome::Skipped,
                records_written: 0,
                error_detail: Some(format!("all {total} sample(s) failed validation")),
            };
        }

        // Writing. A storage failure fails the cycle; whatever landed before
        // it stays (idempotent upserts make the retry safe).
        let mut written = 0usize;
        for record in &records {
            if let Err(e) = self.store.upsert(record).await {
                return IngestCycleResult {
                    cycle_start,
                    attempts: reply.attempts,
                    outcome: CycleOutcome::Failed,
                    records_written: written,
                    error_detail: Some(format!("storage write failed: {e}")),
                };
            }
            written += 1;
        }

        IngestCycleResult {
            cycle_start,
            attempts: reply.attempts,
            outcome: classify_written(written, rejected),
            records_written: written,
            error_detail: (rejected > 0)
                .then(|| format!("{rejected} of {total} sample(s) failed validation")),
        }
    }

    /// Forecast pass after a cycle that wrote data. Every failure here is
    /// skip-and-continue; the next cycle gets another chance.
    async fn run_forecast(&self, as_of: DateTime<Utc>) -> (String, bool) {
        let station = &self.config.station_id;

        let window = match self.window_builder.build(station, as_of).await {
            Ok(window) => window,
            Err(WindowError::InsufficientHistory(e)) => {
                tracing::info!("forecast skipped: {e}");
                return (format!("skipped: {e}"), false);
            }
            Err(WindowError::Storage(e)) => {
                tracing::warn!("forecast skipped: {e}");
                return (format!("skipped: {e}"), false);
            }
        };

        // Window diagnostics: recent level, noise, and yesterday's value at
        // this slot. Rolling statistics skip absent slots.
        let day_slots = (24 * 60 / window.slot_minutes) as usize;
        tracing::debug!(
            "window ready through {}: {} slots, {:.1}% absent, 1h temp mean {:?} (var {:?}), 24h lag {:?}",
            window.end_utc,
            window.len(),
            window.absent_fraction() * 100.0,
            window.rolling_mean(6, |s| s.temperature_c),
            window.rolling_variance(6, |s| s.temperature_c),
            window.seasonal_lag(day_slots, |s| s.temperature_c),
        );

        let predictions = match self.adapter.predict(&window, as_of).await {
            Ok(predictions) => predictions,
            Err(e) => {
                tracing::warn!("forecast skipped: {e}");
                return (format!("skipped: {e}"), false);
            }
        };

        let mut stored = 0usize;
        for prediction in &predictions {
            match self.store.append_prediction(prediction).await {
                Ok(()) => stored += 1,
                Err(e) => tracing::warn!(
                    "failed to store prediction {}@{}: {e}",
                    prediction.variable,
                    prediction.horizon_minutes,
                ),
            }
        }

        tracing::info!(
            "issued {}/{} prediction(s) at {} (model {})",
            stored,
            predictions.len(),
            as_of,
            self.adapter.model_version(),
        );
        (format!("issued {stored} prediction(s)"), stored > 0)
    }
}

/// Outcome from what survived normalization and writing.
fn classify_written(written: usize, rejected: usize) -> CycleOutcome {
    if written == 0 {
        CycleOutcome::Skipped
    } else if rejected > 0 {
        CycleOutcome::PartialSuccess
    } else {
        CycleOutcome::Success
    }
}

/// The next tick strictly after `now` on the `anchor + N * interval` grid,
/// plus how many scheduled ticks between `last_tick` and it were coalesced.
fn next_tick_after(
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
    interval_secs: i64,
    last_tick: i64,
) -> (i64, u64, DateTime<Utc>) {
    let elapsed = (now - anchor).num_seconds();
    let mut next = elapsed.div_euclid(interval_secs) + 1;
    if next <= last_tick {
        next = last_tick + 1;
    }
    let coalesced = (next - last_tick - 1).max(0) as u64;
    let due = anchor + Duration::seconds(next * interval_secs);
    (next, coalesced, due)
}
