//! Storage interface for cities, readings, and daily summaries.
//!
//! Two backends implement the same traits:
//! - [`PgStore`]: Postgres via sqlx, indexed on `(city_id, timestamp)`
//! - [`MemoryStore`]: per-city timestamp-sorted vectors, for tests and DB-less runs

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::config::{DatabaseConfig, StorageBackend};
use crate::db;
use crate::error::StorageError;
use crate::models::{City, DailySummary, NewCity, NewReading, Reading};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait CityStore: Send + Sync {
    async fn list_cities(&self) -> Result<Vec<City>, StorageError>;

    /// Returns the existing city with this name, or inserts it.
    async fn get_or_create_city(&self, city: &NewCity) -> Result<City, StorageError>;
}

/// Append-only observation log.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Duplicate timestamps are accepted.
    async fn append(&self, reading: NewReading) -> Result<Reading, StorageError>;

    /// Most recent reading by timestamp.
    async fn latest(&self, city_id: i64) -> Result<Option<Reading>, StorageError>;

    /// Readings with `timestamp >= from`, ascending.
    async fn since(&self, city_id: i64, from: DateTime<Utc>) -> Result<Vec<Reading>, StorageError>;

    /// Readings with `from <= timestamp < to`, ascending.
    async fn between(
        &self,
        city_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StorageError>;
}

#[async_trait]
pub trait SummaryStore: Send + Sync {
    /// Create-or-replace the summary for `(summary.city_id, summary.date)`.
    async fn upsert_summary(&self, summary: &DailySummary) -> Result<(), StorageError>;

    async fn summary(&self, city_id: i64, date: NaiveDate)
        -> Result<Option<DailySummary>, StorageError>;
}

/// Everything the refresh pipeline needs from persistence.
#[async_trait]
pub trait WeatherStore: CityStore + ReadingStore + SummaryStore {
    /// Backend name for logging and health output.
    fn name(&self) -> &str;

    async fn health_check(&self) -> Result<String, StorageError>;
}

/// Open the configured backend. Postgres connects and applies the schema.
pub async fn open_store(config: &DatabaseConfig) -> Result<Arc<dyn WeatherStore>, StorageError> {
    match config.backend {
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage, readings are lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Postgres => {
            let pool = db::create_pool(config).await?;
            db::run_migrations(&pool).await?;
            Ok(Arc::new(PgStore::new(pool)))
        }
    }
}
