use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One stored observation. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reading {
    pub id: i64,
    pub city_id: i64,
    pub temperature: f64,
    pub feels_like: f64,
    pub condition: String,
    pub humidity: f64,
    pub wind_speed: f64,
    pub timestamp: DateTime<Utc>,
}

/// Validated upstream observation. Temperatures in °C, humidity in percent,
/// wind speed in the provider's native unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub temperature: f64,
    pub feels_like: f64,
    pub condition: String,
    pub humidity: f64,
    pub wind_speed: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub city_id: i64,
    pub temperature: f64,
    pub feels_like: f64,
    pub condition: String,
    pub humidity: f64,
    pub wind_speed: f64,
    pub timestamp: DateTime<Utc>,
}

impl NewReading {
    pub fn from_observation(city_id: i64, obs: Observation, timestamp: DateTime<Utc>) -> Self {
        Self {
            city_id,
            temperature: obs.temperature,
            feels_like: obs.feels_like,
            condition: obs.condition,
            humidity: obs.humidity,
            wind_speed: obs.wind_speed,
            timestamp,
        }
    }

    pub fn into_reading(self, id: i64) -> Reading {
        Reading {
            id,
            city_id: self.city_id,
            temperature: self.temperature,
            feels_like: self.feels_like,
            condition: self.condition,
            humidity: self.humidity,
            wind_speed: self.wind_speed,
            timestamp: self.timestamp,
        }
    }
}
