//! Upstream weather provider.
//!
//! The refresh pipeline only sees the [`WeatherFetcher`] trait. The bundled
//! implementation talks to the OpenWeatherMap current-weather endpoint and
//! turns every non-2xx status or malformed body into a typed [`FetchError`];
//! it never produces a partially populated observation.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::UpstreamConfig;
use crate::models::{City, Observation};

// ============================================================================
// WeatherFetcher trait
// ============================================================================

#[async_trait]
pub trait WeatherFetcher: Send + Sync {
    /// Current observation for `city`.
    async fn fetch(&self, city: &City) -> Result<Observation, FetchError>;

    /// Provider name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Upstream request timed out")]
    Timeout,

    #[error("Malformed upstream payload: {0}")]
    Malformed(String),

    #[error("Missing API key")]
    MissingApiKey,

    #[error("All {attempts} attempts failed, last error: {last}")]
    RetryExhausted { attempts: usize, last: String },
}

impl FetchError {
    /// Network trouble, timeouts, rate limiting and 5xx are worth another try.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http(_) | FetchError::Timeout => true,
            FetchError::Api { code, .. } => *code == 429 || *code >= 500,
            FetchError::Malformed(_)
            | FetchError::MissingApiKey
            | FetchError::RetryExhausted { .. } => false,
        }
    }

    fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Http(err)
        }
    }
}

// ============================================================================
// OpenWeatherMap payload (private)
// ============================================================================

#[derive(Debug, Deserialize)]
struct OwmResponse {
    main: OwmMain,
    #[serde(default)]
    weather: Vec<OwmWeather>,
    wind: Option<OwmWind>,
}

#[derive(Debug, Deserialize)]
struct OwmMain {
    temp: f64,
    feels_like: f64,
    humidity: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwmWeather {
    description: String,
}

#[derive(Debug, Deserialize)]
struct OwmWind {
    speed: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwmErrorResponse {
    message: Option<String>,
}

impl OwmResponse {
    fn into_observation(self) -> Result<Observation, FetchError> {
        let condition = self
            .weather
            .into_iter()
            .next()
            .map(|w| w.description.trim().to_string())
            .filter(|d| !d.is_empty())
            .ok_or_else(|| FetchError::Malformed("missing weather description".to_string()))?;

        let humidity = self.main.humidity.unwrap_or(0.0);
        let wind_speed = self.wind.and_then(|w| w.speed).unwrap_or(0.0);

        for (field, value) in [
            ("main.temp", self.main.temp),
            ("main.feels_like", self.main.feels_like),
            ("main.humidity", humidity),
            ("wind.speed", wind_speed),
        ] {
            if !value.is_finite() {
                return Err(FetchError::Malformed(format!("{} is not finite", field)));
            }
        }
        if !(0.0..=100.0).contains(&humidity) {
            return Err(FetchError::Malformed(format!(
                "main.humidity {} outside 0-100",
                humidity
            )));
        }
        if wind_speed < 0.0 {
            return Err(FetchError::Malformed(format!(
                "wind.speed {} is negative",
                wind_speed
            )));
        }

        Ok(Observation {
            temperature: self.main.temp,
            feels_like: self.main.feels_like,
            condition,
            humidity,
            wind_speed,
        })
    }
}

// ============================================================================
// OpenWeatherClient
// ============================================================================

/// OpenWeatherMap current-weather client, metric units.
#[derive(Debug, Clone)]
pub struct OpenWeatherClient {
    client: Client,
    api_key: String,
    base_url: String,
    max_retries: usize,
    retry_delay_ms: u64,
}

impl OpenWeatherClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, FetchError> {
        Self::with_base_url(config, config.base_url.clone())
    }

    /// Create a client against a custom base URL (for testing / proxies).
    pub fn with_base_url(config: &UpstreamConfig, base_url: String) -> Result<Self, FetchError> {
        let api_key = config.resolved_api_key();
        if api_key.trim().is_empty() {
            return Err(FetchError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
        })
    }

    async fn fetch_once(&self, city: &City) -> Result<Observation, FetchError> {
        let url = format!("{}/data/2.5/weather", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("q", city.name.as_str()),
                ("appid", self.api_key.as_str()),
                ("units", "metric"),
            ])
            .send()
            .await
            .map_err(FetchError::from_transport)?;

        let status = response.status();
        let body = response.text().await.map_err(FetchError::from_transport)?;

        if !status.is_success() {
            let message = serde_json::from_str::<OwmErrorResponse>(&body)
                .ok()
                .and_then(|e| e.message)
                .unwrap_or(body);

            tracing::warn!(
                city = %city.name,
                code = status.as_u16(),
                message = %message,
                "OpenWeather API error"
            );

            return Err(FetchError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let payload: OwmResponse =
            serde_json::from_str(&body).map_err(|e| FetchError::Malformed(e.to_string()))?;

        payload.into_observation()
    }
}

/// Delays between attempts before jitter: `retry_delay_ms`, then doubling,
/// capped at 5s.
fn backoff_schedule(retry_delay_ms: u64) -> ExponentialBackoff {
    ExponentialBackoff::from_millis(2)
        .factor((retry_delay_ms / 2).max(1))
        .max_delay(Duration::from_secs(5))
}

#[async_trait]
impl WeatherFetcher for OpenWeatherClient {
    async fn fetch(&self, city: &City) -> Result<Observation, FetchError> {
        let retry_strategy = backoff_schedule(self.retry_delay_ms)
            .map(jitter)
            .take(self.max_retries);

        let result = RetryIf::spawn(
            retry_strategy,
            || self.fetch_once(city),
            |e: &FetchError| e.is_transient(),
        )
        .await;

        match result {
            Ok(observation) => Ok(observation),
            Err(e) if e.is_transient() && self.max_retries > 0 => {
                tracing::error!(
                    city = %city.name,
                    attempts = self.max_retries + 1,
                    error = %e,
                    "All upstream fetch attempts failed"
                );
                Err(FetchError::RetryExhausted {
                    attempts: self.max_retries + 1,
                    last: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &str {
        "openweathermap"
    }
}

// ============================================================================
// TESTS
// ============================================================================
