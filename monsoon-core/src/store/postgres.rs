use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::PgPool;

use super::{CityStore, ReadingStore, SummaryStore, WeatherStore};
use crate::error::StorageError;
use crate::models::{City, DailySummary, NewCity, NewReading, Reading};

const READING_COLUMNS: &str =
    r#"id, city_id, temperature, feels_like, condition, humidity, wind_speed, "timestamp""#;

/// Postgres-backed store. Range queries ride the
/// `(city_id, "timestamp", id)` index, so cost follows the result size.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    city_id: i64,
    date: NaiveDate,
    avg_temperature: f64,
    max_temperature: f64,
    min_temperature: f64,
    dominant_condition: String,
    condition_distribution: Json<BTreeMap<String, u32>>,
    sample_count: i64,
}

impl TryFrom<SummaryRow> for DailySummary {
    type Error = StorageError;

    fn try_from(row: SummaryRow) -> Result<Self, Self::Error> {
        let sample_count = u32::try_from(row.sample_count).map_err(|_| {
            StorageError::Corrupt(format!(
                "daily_summaries({}, {}) has sample_count {}",
                row.city_id, row.date, row.sample_count
            ))
        })?;
        Ok(DailySummary {
            city_id: row.city_id,
            date: row.date,
            avg_temperature: row.avg_temperature,
            max_temperature: row.max_temperature,
            min_temperature: row.min_temperature,
            dominant_condition: row.dominant_condition,
            condition_distribution: row.condition_distribution.0,
            sample_count,
        })
    }
}

#[async_trait]
impl CityStore for PgStore {
    async fn list_cities(&self) -> Result<Vec<City>, StorageError> {
        let rows = sqlx::query_as::<_, City>(
            "SELECT id, name, latitude, longitude FROM cities ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_or_create_city(&self, city: &NewCity) -> Result<City, StorageError> {
        sqlx::query(
            r#"
            INSERT INTO cities (name, latitude, longitude)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&city.name)
        .bind(city.latitude)
        .bind(city.longitude)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, City>(
            "SELECT id, name, latitude, longitude FROM cities WHERE name = $1",
        )
        .bind(&city.name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl ReadingStore for PgStore {
    async fn append(&self, reading: NewReading) -> Result<Reading, StorageError> {
        let query = format!(
            r#"
            INSERT INTO weather_readings
                (city_id, temperature, feels_like, condition, humidity, wind_speed, "timestamp")
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {READING_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, Reading>(&query)
            .bind(reading.city_id)
            .bind(reading.temperature)
            .bind(reading.feels_like)
            .bind(&reading.condition)
            .bind(reading.humidity)
            .bind(reading.wind_speed)
            .bind(reading.timestamp)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn latest(&self, city_id: i64) -> Result<Option<Reading>, StorageError> {
        let query = format!(
            r#"
            SELECT {READING_COLUMNS}
            FROM weather_readings
            WHERE city_id = $1
            ORDER BY "timestamp" DESC, id DESC
            LIMIT 1
            "#
        );
        let row = sqlx::query_as::<_, Reading>(&query)
            .bind(city_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn since(&self, city_id: i64, from: DateTime<Utc>) -> Result<Vec<Reading>, StorageError> {
        let query = format!(
            r#"
            SELECT {READING_COLUMNS}
            FROM weather_readings
            WHERE city_id = $1 AND "timestamp" >= $2
            ORDER BY "timestamp" ASC, id ASC
            "#
        );
        let rows = sqlx::query_as::<_, Reading>(&query)
            .bind(city_id)
            .bind(from)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn between(
        &self,
        city_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StorageError> {
        let query = format!(
            r#"
            SELECT {READING_COLUMNS}
            FROM weather_readings
            WHERE city_id = $1 AND "timestamp" >= $2 AND "timestamp" < $3
            ORDER BY "timestamp" ASC, id ASC
            "#
        );
        let rows = sqlx::query_as::<_, Reading>(&query)
            .bind(city_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

#[async_trait]
impl SummaryStore for PgStore {
    async fn upsert_summary(&self, summary: &DailySummary) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO daily_summaries (
                city_id, date, avg_temperature, max_temperature, min_temperature,
                dominant_condition, condition_distribution, sample_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (city_id, date) DO UPDATE SET
                avg_temperature = EXCLUDED.avg_temperature,
                max_temperature = EXCLUDED.max_temperature,
                min_temperature = EXCLUDED.min_temperature,
                dominant_condition = EXCLUDED.dominant_condition,
                condition_distribution = EXCLUDED.condition_distribution,
                sample_count = EXCLUDED.sample_count,
                updated_at = NOW()
            "#,
        )
        .bind(summary.city_id)
        .bind(summary.date)
        .bind(summary.avg_temperature)
        .bind(summary.max_temperature)
        .bind(summary.min_temperature)
        .bind(&summary.dominant_condition)
        .bind(Json(&summary.condition_distribution))
        .bind(i64::from(summary.sample_count))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn summary(
        &self,
        city_id: i64,
        date: NaiveDate,
    ) -> Result<Option<DailySummary>, StorageError> {
        let row = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT city_id, date, avg_temperature, max_temperature, min_temperature,
                   dominant_condition, condition_distribution, sample_count
            FROM daily_summaries
            WHERE city_id = $1 AND date = $2
            "#,
        )
        .bind(city_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DailySummary::try_from).transpose()
    }
}

#[async_trait]
impl WeatherStore for PgStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn health_check(&self) -> Result<String, StorageError> {
        Ok(crate::db::health_check(&self.pool).await?)
    }
}
