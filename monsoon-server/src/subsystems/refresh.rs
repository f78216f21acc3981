//! Refresh orchestrator: per-city fetch, persist, aggregate
//!
//! One cycle walks every known city independently:
//! 1. Load the latest cached reading
//! 2. Serve it if the staleness gate says it is fresh
//! 3. Otherwise fetch upstream (bounded by a deadline)
//! 4. On success append the reading and recompute today's summary
//! 5. Load the history window and today's summary
//!
//! A recompute that fails after its reading was appended is queued and
//! retried at the start of the city's next cycle, so a summary never stays
//! behind the readings it covers.
//!
//! A failing city only affects its own slot in the result. Cities are
//! processed with bounded concurrency; `buffered` keeps result order equal to
//! city order so every city owns its slot.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use monsoon_core::config::MonsoonConfig;
use monsoon_core::models::{City, DailySummary, NewReading, Observation, Reading};
use monsoon_core::{
    Aggregator, FetchError, MonsoonError, StalenessGate, StorageError, WeatherFetcher,
    WeatherStore,
};

use super::seed;

// ============================================================================
// PUBLIC API
// ============================================================================

/// How a city's current reading was obtained in this cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CityStatus {
    /// Cached reading was inside the staleness window.
    Fresh,
    /// A new reading was fetched and stored.
    Refreshed,
    /// Fetch failed; the last known reading is served.
    Stale { reason: String },
    /// Nothing to serve: fetch failed with no cached reading, or storage failed.
    Unavailable { reason: String },
}

impl CityStatus {
    pub fn is_fresh_data(&self) -> bool {
        matches!(self, CityStatus::Fresh | CityStatus::Refreshed)
    }
}

#[derive(Debug, Clone)]
pub struct CityRefresh {
    pub city: City,
    pub status: CityStatus,
    pub current: Option<Reading>,
    /// Readings inside the history window, ascending.
    pub history: Vec<Reading>,
    /// Summary for the current calendar date, if any readings exist.
    pub summary: Option<DailySummary>,
}

impl CityRefresh {
    fn unavailable(city: City, reason: String) -> Self {
        Self {
            city,
            status: CityStatus::Unavailable { reason },
            current: None,
            history: Vec::new(),
            summary: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefreshResult {
    pub cycle_id: Uuid,
    pub generated_at: DateTime<Utc>,
    /// One slot per city, in store order.
    pub cities: Vec<CityRefresh>,
}

impl RefreshResult {
    pub fn count(&self, pred: impl Fn(&CityStatus) -> bool) -> usize {
        self.cities.iter().filter(|c| pred(&c.status)).count()
    }
}

pub struct RefreshOrchestrator {
    store: Arc<dyn WeatherStore>,
    fetcher: Arc<dyn WeatherFetcher>,
    gate: StalenessGate,
    aggregator: Aggregator,
    history_window: Duration,
    fetch_deadline: StdDuration,
    max_concurrent_fetches: usize,
    cycle_lock: Mutex<()>,
    /// `(city_id, date)` summaries whose recompute failed after an append.
    pending_summaries: Mutex<HashSet<(i64, NaiveDate)>>,
}

impl RefreshOrchestrator {
    pub fn new(
        store: Arc<dyn WeatherStore>,
        fetcher: Arc<dyn WeatherFetcher>,
        gate: StalenessGate,
        aggregator: Aggregator,
    ) -> Self {
        Self {
            store,
            fetcher,
            gate,
            aggregator,
            history_window: Duration::hours(24),
            fetch_deadline: StdDuration::from_secs(30),
            max_concurrent_fetches: 4,
            cycle_lock: Mutex::new(()),
            pending_summaries: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(
        store: Arc<dyn WeatherStore>,
        fetcher: Arc<dyn WeatherFetcher>,
        config: &MonsoonConfig,
    ) -> Result<Self, MonsoonError> {
        let refresh = &config.refresh;
        Ok(Self::new(
            store,
            fetcher,
            StalenessGate::new(refresh.staleness_window()),
            Aggregator::new(refresh.tz()?),
        )
        .with_history_window(refresh.history_window())
        .with_fetch_deadline(config.upstream.deadline())
        .with_max_concurrent_fetches(refresh.max_concurrent_fetches))
    }

    pub fn with_history_window(mut self, window: Duration) -> Self {
        self.history_window = window;
        self
    }

    pub fn with_fetch_deadline(mut self, deadline: StdDuration) -> Self {
        self.fetch_deadline = deadline;
        self
    }

    pub fn with_max_concurrent_fetches(mut self, limit: usize) -> Self {
        self.max_concurrent_fetches = limit.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn WeatherStore> {
        &self.store
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Run one refresh cycle for every city, seeding the default cities if
    /// the store has none.
    ///
    /// Only a failure to load the city set is an error; per-city failures are
    /// reported in the city's [`CityStatus`].
    pub async fn refresh_all(&self, now: DateTime<Utc>) -> Result<RefreshResult, StorageError> {
        let _cycle = self.cycle_lock.lock().await;
        let cycle_id = Uuid::new_v4();

        let cities = seed::ensure_cities(self.store.as_ref()).await?;
        tracing::debug!(%cycle_id, cities = cities.len(), "Refresh cycle started");

        let slots: Vec<CityRefresh> = stream::iter(cities)
            .map(|city| self.refresh_city(city, now))
            .buffered(self.max_concurrent_fetches)
            .collect()
            .await;

        let result = RefreshResult {
            cycle_id,
            generated_at: now,
            cities: slots,
        };

        tracing::info!(
            %cycle_id,
            refreshed = result.count(|s| matches!(s, CityStatus::Refreshed)),
            cached = result.count(|s| matches!(s, CityStatus::Fresh)),
            stale = result.count(|s| matches!(s, CityStatus::Stale { .. })),
            unavailable = result.count(|s| matches!(s, CityStatus::Unavailable { .. })),
            "Refresh cycle complete"
        );

        Ok(result)
    }

    async fn refresh_city(&self, city: City, now: DateTime<Utc>) -> CityRefresh {
        match self.try_refresh_city(&city, now).await {
            Ok(slot) => slot,
            Err(e) => {
                tracing::error!(city = %city.name, error = %e, "Storage error, city skipped this cycle");
                CityRefresh::unavailable(city, format!("storage error: {}", e))
            }
        }
    }

    async fn try_refresh_city(
        &self,
        city: &City,
        now: DateTime<Utc>,
    ) -> Result<CityRefresh, StorageError> {
        self.retry_pending_summaries(city).await;
        let latest = self.store.latest(city.id).await?;

        let (current, status) = if !self.gate.should_refresh(latest.as_ref(), now) {
            (latest, CityStatus::Fresh)
        } else {
            match self.fetch_with_deadline(city).await {
                Ok(observation) => {
                    let reading = self.persist(city, observation, now).await?;
                    (Some(reading), CityStatus::Refreshed)
                }
                Err(e) => {
                    let reason = e.to_string();
                    tracing::warn!(
                        city = %city.name,
                        provider = self.fetcher.name(),
                        error = %e,
                        has_cached = latest.is_some(),
                        "Upstream fetch failed, keeping cached state"
                    );
                    match latest {
                        Some(cached) => (Some(cached), CityStatus::Stale { reason }),
                        None => (None, CityStatus::Unavailable { reason }),
                    }
                }
            }
        };

        let history_start = now
            .checked_sub_signed(self.history_window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let history = self.store.since(city.id, history_start).await?;
        let summary = self
            .store
            .summary(city.id, self.aggregator.local_date(now))
            .await?;

        Ok(CityRefresh {
            city: city.clone(),
            status,
            current,
            history,
            summary,
        })
    }

    async fn fetch_with_deadline(&self, city: &City) -> Result<Observation, FetchError> {
        match tokio::time::timeout(self.fetch_deadline, self.fetcher.fetch(city)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        }
    }

    /// Append, then recompute the summary for the reading's calendar date.
    /// Only a failed append is an error: the reading is stored once `append`
    /// returns, and a failed recompute is queued for the next cycle.
    async fn persist(
        &self,
        city: &City,
        observation: Observation,
        now: DateTime<Utc>,
    ) -> Result<Reading, StorageError> {
        let reading = self
            .store
            .append(NewReading::from_observation(city.id, observation, now))
            .await?;

        let date = self.aggregator.local_date(reading.timestamp);
        self.recompute_or_defer(city, date).await;

        tracing::debug!(
            city = %city.name,
            temperature = reading.temperature,
            condition = %reading.condition,
            "Stored new reading"
        );
        Ok(reading)
    }

    async fn recompute_or_defer(&self, city: &City, date: NaiveDate) {
        if let Err(e) = self
            .aggregator
            .recompute(self.store.as_ref(), city.id, date)
            .await
        {
            tracing::warn!(
                city = %city.name,
                %date,
                error = %e,
                "Summary recompute failed, retrying next cycle"
            );
            self.pending_summaries.lock().await.insert((city.id, date));
        }
    }

    async fn retry_pending_summaries(&self, city: &City) {
        let dates: Vec<NaiveDate> = {
            let mut pending = self.pending_summaries.lock().await;
            let dates = pending
                .iter()
                .filter(|(id, _)| *id == city.id)
                .map(|&(_, date)| date)
                .collect::<Vec<_>>();
            for date in &dates {
                pending.remove(&(city.id, *date));
            }
            dates
        };

        for date in dates {
            self.recompute_or_defer(city, date).await;
        }
    }
}

/// Called from main.rs when `refresh.background_enabled` is set.
pub async fn run_refresh_loop(
    orchestrator: Arc<RefreshOrchestrator>,
    interval_seconds: u64,
    mut shutdown: broadcast::Receiver<()>,
) {
    let interval = tokio::time::Duration::from_secs(interval_seconds.max(1));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!("Background refresh loop started (interval: {}s)", interval_seconds);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = orchestrator.refresh_all(Utc::now()).await {
                    tracing::error!("Background refresh failed: {}", e);
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Background refresh loop shutting down");
                break;
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone};
    use monsoon_core::models::NewCity;
    use monsoon_core::store::{CityStore, MemoryStore, ReadingStore, SummaryStore};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    // ------------------------------------------------------------------
    // Mock fetchers (no HTTP)
    // ------------------------------------------------------------------

    /// Returns a fixed observation, except for cities listed as failing.
    struct ScriptedFetcher {
        temperature: StdMutex<f64>,
        condition: StdMutex<String>,
        failing: StdMutex<HashSet<String>>,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new(temperature: f64, condition: &str) -> Self {
            Self {
                temperature: StdMutex::new(temperature),
                condition: StdMutex::new(condition.to_string()),
                failing: StdMutex::new(HashSet::new()),
                calls: AtomicUsize::new(0),
            }
        }

        fn fail_for(&self, city: &str) {
            self.failing.lock().unwrap().insert(city.to_string());
        }

        fn set(&self, temperature: f64, condition: &str) {
            *self.temperature.lock().unwrap() = temperature;
            *self.condition.lock().unwrap() = condition.to_string();
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WeatherFetcher for ScriptedFetcher {
        async fn fetch(&self, city: &City) -> Result<Observation, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.lock().unwrap().contains(&city.name) {
                return Err(FetchError::Api {
                    code: 503,
                    message: "service unavailable".to_string(),
                });
            }
            let temperature = *self.temperature.lock().unwrap();
            Ok(Observation {
                temperature,
                feels_like: temperature + 1.0,
                condition: self.condition.lock().unwrap().clone(),
                humidity: 55.0,
                wind_speed: 4.1,
            })
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    /// Never answers within any reasonable deadline.
    struct HangingFetcher;

    #[async_trait]
    impl WeatherFetcher for HangingFetcher {
        async fn fetch(&self, _city: &City) -> Result<Observation, FetchError> {
            tokio::time::sleep(StdDuration::from_secs(30)).await;
            Err(FetchError::Malformed("unreachable".to_string()))
        }

        fn name(&self) -> &str {
            "hanging"
        }
    }

    /// Records the peak number of concurrent fetches.
    struct ProbeFetcher {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl WeatherFetcher for ProbeFetcher {
        async fn fetch(&self, _city: &City) -> Result<Observation, FetchError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Observation {
                temperature: 25.0,
                feels_like: 25.0,
                condition: "clear sky".to_string(),
                humidity: 30.0,
                wind_speed: 1.0,
            })
        }

        fn name(&self) -> &str {
            "probe"
        }
    }

    // ------------------------------------------------------------------
    // Store wrapper that fails appends for one city
    // ------------------------------------------------------------------

    struct FlakyStore {
        inner: MemoryStore,
        broken_city: StdMutex<Option<i64>>,
        failing_upserts: AtomicUsize,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                broken_city: StdMutex::new(None),
                failing_upserts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CityStore for FlakyStore {
        async fn list_cities(&self) -> Result<Vec<City>, StorageError> {
            self.inner.list_cities().await
        }
        async fn get_or_create_city(&self, city: &NewCity) -> Result<City, StorageError> {
            self.inner.get_or_create_city(city).await
        }
    }

    #[async_trait]
    impl ReadingStore for FlakyStore {
        async fn append(&self, reading: NewReading) -> Result<Reading, StorageError> {
            if *self.broken_city.lock().unwrap() == Some(reading.city_id) {
                return Err(StorageError::Unavailable("disk full".to_string()));
            }
            self.inner.append(reading).await
        }
        async fn latest(&self, city_id: i64) -> Result<Option<Reading>, StorageError> {
            self.inner.latest(city_id).await
        }
        async fn since(
            &self,
            city_id: i64,
            from: DateTime<Utc>,
        ) -> Result<Vec<Reading>, StorageError> {
            self.inner.since(city_id, from).await
        }
        async fn between(
            &self,
            city_id: i64,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<Reading>, StorageError> {
            self.inner.between(city_id, from, to).await
        }
    }

    #[async_trait]
    impl SummaryStore for FlakyStore {
        async fn upsert_summary(&self, summary: &DailySummary) -> Result<(), StorageError> {
            let remaining = self.failing_upserts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_upserts.store(remaining - 1, Ordering::SeqCst);
                return Err(StorageError::Unavailable("connection reset".to_string()));
            }
            self.inner.upsert_summary(summary).await
        }
        async fn summary(
            &self,
            city_id: i64,
            date: NaiveDate,
        ) -> Result<Option<DailySummary>, StorageError> {
            self.inner.summary(city_id, date).await
        }
    }

    #[async_trait]
    impl WeatherStore for FlakyStore {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn health_check(&self) -> Result<String, StorageError> {
            Ok("flaky".to_string())
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 1, 6, 0, 0).unwrap()
    }

    fn orchestrator(
        store: Arc<dyn WeatherStore>,
        fetcher: Arc<dyn WeatherFetcher>,
    ) -> RefreshOrchestrator {
        RefreshOrchestrator::new(
            store,
            fetcher,
            StalenessGate::new(Duration::minutes(1)),
            Aggregator::new(chrono_tz::UTC),
        )
    }

    fn slot<'a>(result: &'a RefreshResult, name: &str) -> &'a CityRefresh {
        result
            .cities
            .iter()
            .find(|c| c.city.name == name)
            .unwrap_or_else(|| panic!("no slot for {}", name))
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_first_cycle_seeds_and_fetches_every_city() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(ScriptedFetcher::new(30.0, "clear sky"));
        let orch = orchestrator(store.clone(), fetcher.clone());

        let result = orch.refresh_all(t0()).await.unwrap();

        assert_eq!(result.cities.len(), 6);
        assert_eq!(fetcher.calls(), 6);
        for slot in &result.cities {
            assert_eq!(slot.status, CityStatus::Refreshed);
            let current = slot.current.as_ref().unwrap();
            assert_eq!(current.timestamp, t0());
            assert_eq!(slot.history.len(), 1);
            let summary = slot.summary.as_ref().unwrap();
            assert_eq!(summary.sample_count, 1);
            assert_eq!(summary.dominant_condition, "clear sky");
        }
        assert_eq!(result.cities[0].city.name, "Delhi");
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_fetch_and_aggregation() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(ScriptedFetcher::new(30.0, "clear sky"));
        let orch = orchestrator(store.clone(), fetcher.clone());

        orch.refresh_all(t0()).await.unwrap();
        let result = orch.refresh_all(t0() + Duration::seconds(30)).await.unwrap();

        assert_eq!(fetcher.calls(), 6, "no fetches inside the staleness window");
        assert_eq!(store.list_cities().await.unwrap().len(), 6, "no duplicate seeding");
        for slot in &result.cities {
            assert_eq!(slot.status, CityStatus::Fresh);
            assert_eq!(slot.summary.as_ref().unwrap().sample_count, 1);
            assert_eq!(store.reading_count(slot.city.id).await, 1);
        }
    }

    #[tokio::test]
    async fn test_stale_cache_refetches_and_recomputes_summary() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(ScriptedFetcher::new(30.0, "clear"));
        let orch = orchestrator(store.clone(), fetcher.clone());

        orch.refresh_all(t0()).await.unwrap();
        fetcher.set(32.0, "clear");
        orch.refresh_all(t0() + Duration::minutes(2)).await.unwrap();
        fetcher.set(28.0, "rain");
        let result = orch.refresh_all(t0() + Duration::minutes(4)).await.unwrap();

        assert_eq!(fetcher.calls(), 18);
        let delhi = slot(&result, "Delhi");
        assert_eq!(delhi.status, CityStatus::Refreshed);
        assert_eq!(delhi.history.len(), 3);

        let summary = delhi.summary.as_ref().unwrap();
        assert_eq!(summary.avg_temperature, 30.0);
        assert_eq!(summary.max_temperature, 32.0);
        assert_eq!(summary.min_temperature, 28.0);
        assert_eq!(summary.dominant_condition, "clear");
        assert_eq!(summary.condition_distribution["clear"], 2);
        assert_eq!(summary.condition_distribution["rain"], 1);
        assert_eq!(summary.sample_count, 3);
    }

    #[tokio::test]
    async fn test_one_city_failure_keeps_last_known_and_others_refresh() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(ScriptedFetcher::new(30.0, "haze"));
        let orch = orchestrator(store.clone(), fetcher.clone());

        orch.refresh_all(t0()).await.unwrap();
        fetcher.fail_for("Delhi");
        fetcher.set(35.0, "haze");
        let later = t0() + Duration::minutes(5);
        let result = orch.refresh_all(later).await.unwrap();

        let delhi = slot(&result, "Delhi");
        assert!(matches!(delhi.status, CityStatus::Stale { .. }));
        let cached = delhi.current.as_ref().unwrap();
        assert_eq!(cached.temperature, 30.0);
        assert_eq!(cached.timestamp, t0());
        assert_eq!(store.reading_count(delhi.city.id).await, 1, "nothing persisted on failure");

        let mumbai = slot(&result, "Mumbai");
        assert_eq!(mumbai.status, CityStatus::Refreshed);
        assert_eq!(mumbai.current.as_ref().unwrap().temperature, 35.0);
    }

    #[tokio::test]
    async fn test_failure_without_cache_is_unavailable_and_persists_nothing() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(ScriptedFetcher::new(30.0, "haze"));
        fetcher.fail_for("Kolkata");
        let orch = orchestrator(store.clone(), fetcher.clone());

        let result = orch.refresh_all(t0()).await.unwrap();

        let kolkata = slot(&result, "Kolkata");
        assert!(matches!(kolkata.status, CityStatus::Unavailable { .. }));
        assert!(kolkata.current.is_none());
        assert!(kolkata.summary.is_none());
        assert_eq!(store.reading_count(kolkata.city.id).await, 0);
        assert_eq!(result.count(CityStatus::is_fresh_data), 5);
    }

    #[tokio::test]
    async fn test_fetch_deadline_is_treated_as_fetch_failure() {
        let store = Arc::new(MemoryStore::new());
        let orch = orchestrator(store.clone(), Arc::new(HangingFetcher))
            .with_fetch_deadline(StdDuration::from_millis(20))
            .with_max_concurrent_fetches(6);

        let result = orch.refresh_all(t0()).await.unwrap();

        for slot in &result.cities {
            match &slot.status {
                CityStatus::Unavailable { reason } => {
                    assert_eq!(reason, &FetchError::Timeout.to_string());
                }
                other => panic!("expected Unavailable, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_storage_failure_is_isolated_to_one_city() {
        let store = Arc::new(FlakyStore::new());
        let delhi = store
            .get_or_create_city(&NewCity::new("Delhi", 28.6139, 77.2090))
            .await
            .unwrap();
        store
            .get_or_create_city(&NewCity::new("Mumbai", 19.0760, 72.8777))
            .await
            .unwrap();
        *store.broken_city.lock().unwrap() = Some(delhi.id);

        let fetcher = Arc::new(ScriptedFetcher::new(29.0, "mist"));
        let orch = orchestrator(store.clone(), fetcher);
        let result = orch.refresh_all(t0()).await.unwrap();

        assert_eq!(result.cities.len(), 2);
        match &slot(&result, "Delhi").status {
            CityStatus::Unavailable { reason } => assert!(reason.contains("disk full")),
            other => panic!("expected Unavailable, got {:?}", other),
        }
        assert_eq!(slot(&result, "Mumbai").status, CityStatus::Refreshed);
    }

    #[tokio::test]
    async fn test_failed_recompute_keeps_reading_and_heals_next_cycle() {
        let store = Arc::new(FlakyStore::new());
        let city = store
            .get_or_create_city(&NewCity::new("Hyderabad", 17.3850, 78.4867))
            .await
            .unwrap();
        store.failing_upserts.store(1, Ordering::SeqCst);

        let fetcher = Arc::new(ScriptedFetcher::new(34.0, "clear sky"));
        let orch = orchestrator(store.clone(), fetcher.clone());

        let first = orch.refresh_all(t0()).await.unwrap();
        let slot1 = &first.cities[0];
        assert_eq!(slot1.status, CityStatus::Refreshed);
        assert_eq!(slot1.current.as_ref().unwrap().temperature, 34.0);
        assert!(slot1.summary.is_none());
        assert_eq!(store.inner.reading_count(city.id).await, 1);

        // Inside the staleness window: no fetch, but the queued recompute runs.
        let second = orch.refresh_all(t0() + Duration::seconds(20)).await.unwrap();
        let slot2 = &second.cities[0];
        assert_eq!(slot2.status, CityStatus::Fresh);
        assert_eq!(fetcher.calls(), 1);
        let summary = slot2.summary.as_ref().unwrap();
        assert_eq!(summary.sample_count, 1);
        assert_eq!(summary.avg_temperature, 34.0);
    }

    #[tokio::test]
    async fn test_recompute_stays_queued_while_store_keeps_failing() {
        let store = Arc::new(FlakyStore::new());
        let city = store
            .get_or_create_city(&NewCity::new("Bangalore", 12.9716, 77.5946))
            .await
            .unwrap();
        store.failing_upserts.store(2, Ordering::SeqCst);

        let orch = orchestrator(store.clone(), Arc::new(ScriptedFetcher::new(24.0, "mist")));
        orch.refresh_all(t0()).await.unwrap();
        let second = orch.refresh_all(t0() + Duration::seconds(10)).await.unwrap();
        assert!(second.cities[0].summary.is_none());

        let third = orch.refresh_all(t0() + Duration::seconds(20)).await.unwrap();
        assert_eq!(third.cities[0].summary.as_ref().unwrap().sample_count, 1);
        assert!(store.inner.summary(city.id, t0().date_naive()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_history_window_excludes_old_readings() {
        let store = Arc::new(MemoryStore::new());
        let city = store
            .get_or_create_city(&NewCity::new("Chennai", 13.0827, 80.2707))
            .await
            .unwrap();
        store
            .append(NewReading {
                city_id: city.id,
                temperature: 27.0,
                feels_like: 27.0,
                condition: "drizzle".to_string(),
                humidity: 90.0,
                wind_speed: 2.0,
                timestamp: t0() - Duration::hours(30),
            })
            .await
            .unwrap();

        let orch = orchestrator(store.clone(), Arc::new(ScriptedFetcher::new(31.0, "clear")))
            .with_history_window(Duration::hours(24));
        let result = orch.refresh_all(t0()).await.unwrap();

        let chennai = slot(&result, "Chennai");
        assert_eq!(chennai.history.len(), 1);
        assert_eq!(chennai.history[0].temperature, 31.0);
        assert_eq!(store.reading_count(city.id).await, 2);
    }

    #[tokio::test]
    async fn test_summary_date_uses_configured_timezone() {
        let store = Arc::new(MemoryStore::new());
        let orch = RefreshOrchestrator::new(
            store.clone(),
            Arc::new(ScriptedFetcher::new(26.0, "clear")),
            StalenessGate::new(Duration::minutes(1)),
            Aggregator::new(chrono_tz::Asia::Kolkata),
        );

        // 20:00 UTC is already the next day in IST.
        let now = Utc.with_ymd_and_hms(2024, 10, 1, 20, 0, 0).unwrap();
        let result = orch.refresh_all(now).await.unwrap();

        let summary = result.cities[0].summary.as_ref().unwrap();
        assert_eq!(summary.date, NaiveDate::from_ymd_opt(2024, 10, 2).unwrap());
    }

    #[tokio::test]
    async fn test_fan_out_respects_concurrency_limit() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(ProbeFetcher {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let orch = orchestrator(store, fetcher.clone()).with_max_concurrent_fetches(2);

        let result = orch.refresh_all(t0()).await.unwrap();

        assert_eq!(result.count(|s| *s == CityStatus::Refreshed), 6);
        let peak = fetcher.peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak concurrency {} exceeded limit", peak);
        assert!(peak >= 1);
    }
}
