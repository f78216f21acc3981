use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregate over every reading of one city on one calendar date.
/// At most one exists per `(city_id, date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub city_id: i64,
    pub date: NaiveDate,
    pub avg_temperature: f64,
    pub max_temperature: f64,
    pub min_temperature: f64,
    pub dominant_condition: String,
    pub condition_distribution: BTreeMap<String, u32>,
    pub sample_count: u32,
}
