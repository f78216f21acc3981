use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;

use super::{CityStore, ReadingStore, SummaryStore, WeatherStore};
use crate::error::StorageError;
use crate::models::{City, DailySummary, NewCity, NewReading, Reading};

/// In-process store. Readings are kept per city in a vector sorted by
/// timestamp, so in-order appends are amortized O(1) and range queries are a
/// binary search plus a copy of the matching slice.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cities: Vec<City>,
    readings: HashMap<i64, Vec<Reading>>,
    summaries: HashMap<(i64, NaiveDate), DailySummary>,
    next_city_id: i64,
    next_reading_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total readings held for a city.
    pub async fn reading_count(&self, city_id: i64) -> usize {
        let inner = self.inner.read().await;
        inner.readings.get(&city_id).map_or(0, Vec::len)
    }
}

fn lower_bound(log: &[Reading], at: DateTime<Utc>) -> usize {
    log.partition_point(|r| r.timestamp < at)
}

#[async_trait]
impl CityStore for MemoryStore {
    async fn list_cities(&self) -> Result<Vec<City>, StorageError> {
        Ok(self.inner.read().await.cities.clone())
    }

    async fn get_or_create_city(&self, city: &NewCity) -> Result<City, StorageError> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.cities.iter().find(|c| c.name == city.name) {
            return Ok(existing.clone());
        }
        inner.next_city_id += 1;
        let created = City {
            id: inner.next_city_id,
            name: city.name.clone(),
            latitude: city.latitude,
            longitude: city.longitude,
        };
        inner.cities.push(created.clone());
        Ok(created)
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn append(&self, reading: NewReading) -> Result<Reading, StorageError> {
        let mut inner = self.inner.write().await;
        if !inner.cities.iter().any(|c| c.id == reading.city_id) {
            return Err(StorageError::NotFound(format!("city {}", reading.city_id)));
        }
        inner.next_reading_id += 1;
        let stored = reading.into_reading(inner.next_reading_id);

        let log = inner.readings.entry(stored.city_id).or_default();
        match log.last() {
            Some(last) if last.timestamp > stored.timestamp => {
                // Late arrival: keep timestamp order, after any equal timestamps.
                let at = log.partition_point(|r| r.timestamp <= stored.timestamp);
                log.insert(at, stored.clone());
            }
            _ => log.push(stored.clone()),
        }
        Ok(stored)
    }

    async fn latest(&self, city_id: i64) -> Result<Option<Reading>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner.readings.get(&city_id).and_then(|log| log.last().cloned()))
    }

    async fn since(&self, city_id: i64, from: DateTime<Utc>) -> Result<Vec<Reading>, StorageError> {
        let inner = self.inner.read().await;
        Ok(match inner.readings.get(&city_id) {
            Some(log) => log[lower_bound(log, from)..].to_vec(),
            None => Vec::new(),
        })
    }

    async fn between(
        &self,
        city_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StorageError> {
        if to <= from {
            return Ok(Vec::new());
        }
        let inner = self.inner.read().await;
        Ok(match inner.readings.get(&city_id) {
            Some(log) => log[lower_bound(log, from)..lower_bound(log, to)].to_vec(),
            None => Vec::new(),
        })
    }
}

#[async_trait]
impl SummaryStore for MemoryStore {
    async fn upsert_summary(&self, summary: &DailySummary) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner
            .summaries
            .insert((summary.city_id, summary.date), summary.clone());
        Ok(())
    }

    async fn summary(
        &self,
        city_id: i64,
        date: NaiveDate,
    ) -> Result<Option<DailySummary>, StorageError> {
        Ok(self.inner.read().await.summaries.get(&(city_id, date)).cloned())
    }
}

#[async_trait]
impl WeatherStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn health_check(&self) -> Result<String, StorageError> {
        let inner = self.inner.read().await;
        Ok(format!("memory store: {} cities", inner.cities.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 1, h, m, 0).unwrap()
    }

    fn new_reading(city_id: i64, temperature: f64, timestamp: DateTime<Utc>) -> NewReading {
        NewReading {
            city_id,
            temperature,
            feels_like: temperature,
            condition: "clear sky".to_string(),
            humidity: 40.0,
            wind_speed: 2.5,
            timestamp,
        }
    }

    async fn store_with_city() -> (MemoryStore, City) {
        let store = MemoryStore::new();
        let city = store
            .get_or_create_city(&NewCity::new("Delhi", 28.6139, 77.2090))
            .await
            .unwrap();
        (store, city)
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent_by_name() {
        let store = MemoryStore::new();
        let a = store
            .get_or_create_city(&NewCity::new("Mumbai", 19.0760, 72.8777))
            .await
            .unwrap();
        let b = store
            .get_or_create_city(&NewCity::new("Mumbai", 0.0, 0.0))
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(store.list_cities().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_latest_is_most_recent_even_after_late_append() {
        let (store, city) = store_with_city().await;
        store.append(new_reading(city.id, 30.0, at(10, 0))).await.unwrap();
        store.append(new_reading(city.id, 31.0, at(12, 0))).await.unwrap();
        store.append(new_reading(city.id, 29.0, at(11, 0))).await.unwrap();

        let latest = store.latest(city.id).await.unwrap().unwrap();
        assert_eq!(latest.temperature, 31.0);

        let all = store.since(city.id, at(0, 0)).await.unwrap();
        let temps: Vec<f64> = all.iter().map(|r| r.temperature).collect();
        assert_eq!(temps, vec![30.0, 29.0, 31.0]);
    }

    #[tokio::test]
    async fn test_duplicate_timestamps_are_kept_in_insertion_order() {
        let (store, city) = store_with_city().await;
        store.append(new_reading(city.id, 1.0, at(9, 0))).await.unwrap();
        store.append(new_reading(city.id, 2.0, at(9, 0))).await.unwrap();
        store.append(new_reading(city.id, 3.0, at(9, 0))).await.unwrap();

        let temps: Vec<f64> = store
            .since(city.id, at(9, 0))
            .await
            .unwrap()
            .iter()
            .map(|r| r.temperature)
            .collect();
        assert_eq!(temps, vec![1.0, 2.0, 3.0]);
        assert_eq!(store.latest(city.id).await.unwrap().unwrap().temperature, 3.0);
    }

    #[tokio::test]
    async fn test_since_and_between_bounds() {
        let (store, city) = store_with_city().await;
        for h in 0..6 {
            store
                .append(new_reading(city.id, h as f64, at(h, 0)))
                .await
                .unwrap();
        }

        let since = store.since(city.id, at(3, 0)).await.unwrap();
        assert_eq!(since.len(), 3, "since is inclusive of the lower bound");
        assert_eq!(since[0].timestamp, at(3, 0));

        let window = store.between(city.id, at(1, 0), at(4, 0)).await.unwrap();
        let temps: Vec<f64> = window.iter().map(|r| r.temperature).collect();
        assert_eq!(temps, vec![1.0, 2.0, 3.0], "between is half-open");

        assert!(store.between(city.id, at(4, 0), at(1, 0)).await.unwrap().is_empty());
        assert!(store.since(999, at(0, 0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_for_unknown_city_fails() {
        let store = MemoryStore::new();
        let err = store.append(new_reading(42, 20.0, at(1, 0))).await;
        assert!(matches!(err, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_summary_upsert_replaces_row() {
        let (store, city) = store_with_city().await;
        let date = NaiveDate::from_ymd_opt(2024, 10, 1).unwrap();
        let mut summary = DailySummary {
            city_id: city.id,
            date,
            avg_temperature: 30.0,
            max_temperature: 30.0,
            min_temperature: 30.0,
            dominant_condition: "clear".to_string(),
            condition_distribution: BTreeMap::from([("clear".to_string(), 1)]),
            sample_count: 1,
        };
        store.upsert_summary(&summary).await.unwrap();

        summary.sample_count = 2;
        summary.condition_distribution.insert("clear".to_string(), 2);
        store.upsert_summary(&summary).await.unwrap();

        let stored = store.summary(city.id, date).await.unwrap().unwrap();
        assert_eq!(stored.sample_count, 2);
        assert!(store
            .summary(city.id, date.succ_opt().unwrap())
            .await
            .unwrap()
            .is_none());
    }
}
