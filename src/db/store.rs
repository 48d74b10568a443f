//! Append-only, idempotent time-series persistence.
//!
//! `SeriesStore` is the single owner of persistence and ordering guarantees
//! for observations and predictions. Everything else holds transient copies.
//! The pool inside is created once at startup and reused across ingest
//! cycles; cycles never run concurrently, so the handle is never contended
//! by two in-flight cycles.

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use sqlx::PgPool;

use super::models::{ObservationRecord, PredictionRecord};
use super::queries;

/// Storage failure. Cycle-fatal for the ingest loop (the cycle is retried at
/// the next scheduled tick), never process-fatal.
#[derive(Debug, thiserror::Error)]
#[error("storage error: {0}")]
pub struct StorageError(#[from] sqlx::Error);

#[derive(Debug, Clone)]
pub struct SeriesStore {
    pool: PgPool,
}

impl SeriesStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Write one observation, idempotent by `(station_id, timestamp_utc)`.
    /// Writing the same key twice leaves one record, with the second write's
    /// field values winning.
    pub async fn upsert(&self, record: &ObservationRecord) -> Result<(), StorageError> {
        queries::upsert_observation(&self.pool, record).await?;
        Ok(())
    }

    /// Stream observations in `[from_utc, to_utc]`, ascending by timestamp.
    ///
    /// Lazy and restartable: a plain range query with no cursor state, so a
    /// consumer that drops the stream can simply issue the range again. Never
    /// yields two records with the same key; gaps are absence, not
    /// placeholder records.
    pub fn range(
        &self,
        station_id: &str,
        from_utc: DateTime<Utc>,
        to_utc: DateTime<Utc>,
    ) -> BoxStream<'_, Result<ObservationRecord, StorageError>> {
        sqlx::query_as::<_, ObservationRecord>(queries::OBSERVATIONS_RANGE_SQL)
            .bind(station_id.to_owned())
            .bind(from_utc)
            .bind(to_utc)
            .fetch(&self.pool)
            .map_err(StorageError::from)
            .boxed()
    }

    /// The most recent observation for a station, if any.
    pub async fn latest(
        &self,
        station_id: &str,
    ) -> Result<Option<ObservationRecord>, StorageError> {
        Ok(queries::latest_observation(&self.pool, station_id).await?)
    }

    /// Append one prediction, idempotent by its full key.
    pub async fn append_prediction(&self, record: &PredictionRecord) -> Result<(), StorageError> {
        queries::insert_prediction(&self.pool, record).await?;
        Ok(())
    }
}
