//! Daily summary computation.
//!
//! A summary is always rebuilt from the full set of readings for its
//! `(city, date)`; there is no incremental delta. Calendar days are cut in
//! the configured timezone, never the host's local zone.
//!
//! Dominant condition tie-break: among labels sharing the highest count, the
//! lexicographically smallest label wins.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::StorageError;
use crate::models::{DailySummary, Reading};
use crate::store::{ReadingStore, SummaryStore};

#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    tz: Tz,
}

impl Aggregator {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    /// Calendar date of `instant` in the configured timezone.
    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.tz).date_naive()
    }

    /// UTC half-open range `[start, end)` covering `date` in the configured timezone.
    pub fn day_bounds(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.start_of_day(date);
        let end = match date.succ_opt() {
            Some(next) => self.start_of_day(next),
            None => start + Duration::days(1),
        };
        (start, end)
    }

    fn start_of_day(&self, date: NaiveDate) -> DateTime<Utc> {
        let midnight = date.and_time(chrono::NaiveTime::MIN);
        // DST transitions can skip local midnight; take the first instant that exists.
        let mut probe = midnight;
        for _ in 0..8 {
            match self.tz.from_local_datetime(&probe) {
                LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => {
                    return t.with_timezone(&Utc);
                }
                LocalResult::None => probe += Duration::minutes(15),
            }
        }
        Utc.from_utc_datetime(&midnight)
    }

    /// Rebuild and store the summary for `(city_id, date)`.
    ///
    /// Returns `Ok(None)` without touching the summary store when the day
    /// has no readings.
    pub async fn recompute<S>(
        &self,
        store: &S,
        city_id: i64,
        date: NaiveDate,
    ) -> Result<Option<DailySummary>, StorageError>
    where
        S: ReadingStore + SummaryStore + ?Sized,
    {
        let (start, end) = self.day_bounds(date);
        let readings = store.between(city_id, start, end).await?;

        let Some(summary) = summarize(city_id, date, &readings) else {
            tracing::debug!(city_id, %date, "No readings for day, summary left untouched");
            return Ok(None);
        };

        store.upsert_summary(&summary).await?;
        tracing::debug!(
            city_id,
            %date,
            samples = summary.sample_count,
            dominant = %summary.dominant_condition,
            "Daily summary recomputed"
        );
        Ok(Some(summary))
    }
}

/// Pure summary over `readings`, in the order given. `None` when empty.
pub fn summarize(city_id: i64, date: NaiveDate, readings: &[Reading]) -> Option<DailySummary> {
    let first = readings.first()?;

    let mut sum = 0.0;
    let mut max = first.temperature;
    let mut min = first.temperature;
    let mut histogram: BTreeMap<String, u32> = BTreeMap::new();

    for reading in readings {
        sum += reading.temperature;
        max = max.max(reading.temperature);
        min = min.min(reading.temperature);
        *histogram.entry(reading.condition.clone()).or_insert(0) += 1;
    }

    let sample_count = readings.len() as u32;

    Some(DailySummary {
        city_id,
        date,
        avg_temperature: sum / f64::from(sample_count),
        max_temperature: max,
        min_temperature: min,
        dominant_condition: dominant_condition(&histogram),
        condition_distribution: histogram,
        sample_count,
    })
}

/// Highest count wins; ties go to the smallest label since the map iterates
/// in ascending key order and only a strictly greater count replaces the pick.
fn dominant_condition(histogram: &BTreeMap<String, u32>) -> String {
    let mut best: Option<(&String, u32)> = None;
    for (label, &count) in histogram {
        match best {
            Some((_, best_count)) if count <= best_count => {}
            _ => best = Some((label, count)),
        }
    }
    best.map(|(label, _)| label.clone()).unwrap_or_default()
}
