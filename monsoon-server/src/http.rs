//! Monsoon HTTP API
//!
//! Each endpoint has a thin axum handler that delegates to an inner function
//! returning `(StatusCode, serde_json::Value)`, so the logic is testable
//! without axum dispatch.
//!
//! Endpoints:
//! - GET /fetch_weather/ : refresh every city and return the dashboard payload
//! - GET /health         : store health
//! - GET /version        : server version info

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use monsoon_core::models::{City, DailySummary, Reading};
use monsoon_core::{MonsoonConfig, WeatherStore};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::subsystems::refresh::{CityStatus, RefreshOrchestrator, RefreshResult};

/// Shared state for all HTTP handlers
pub struct HttpState {
    pub orchestrator: Arc<RefreshOrchestrator>,
    pub config: MonsoonConfig,
}

pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/fetch_weather/", get(fetch_weather_handler))
        .route("/fetch_weather", get(fetch_weather_handler))
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .with_state(state)
}

/// Serve until the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Monsoon HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Response DTOs
// ============================================================================

#[derive(Debug, Serialize, PartialEq)]
pub struct CityRef {
    pub id: i64,
    pub name: String,
}

impl From<&City> for CityRef {
    fn from(city: &City) -> Self {
        Self {
            id: city.id,
            name: city.name.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CurrentWeather {
    pub city: CityRef,
    pub temperature: f64,
    pub feels_like: f64,
    pub condition: String,
    pub humidity: f64,
    pub wind_speed: f64,
    pub timestamp: String,
    /// True when the upstream fetch failed and this is the last known reading.
    pub stale: bool,
}

#[derive(Debug, Serialize)]
pub struct SummaryView {
    pub max_temperature: f64,
    pub min_temperature: f64,
    pub avg_temperature: f64,
    pub dominant_condition: String,
    pub condition_distribution: BTreeMap<String, u32>,
    pub sample_count: u32,
}

impl From<&DailySummary> for SummaryView {
    fn from(s: &DailySummary) -> Self {
        Self {
            max_temperature: s.max_temperature,
            min_temperature: s.min_temperature,
            avg_temperature: s.avg_temperature,
            dominant_condition: s.dominant_condition.clone(),
            condition_distribution: s.condition_distribution.clone(),
            sample_count: s.sample_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryPoint {
    /// `HH:MM` in the configured timezone.
    pub time: String,
    pub temperature: f64,
    pub humidity: f64,
    pub wind_speed: f64,
}

impl HistoryPoint {
    fn new(reading: &Reading, tz: Tz) -> Self {
        Self {
            time: reading.timestamp.with_timezone(&tz).format("%H:%M").to_string(),
            temperature: reading.temperature,
            humidity: reading.humidity,
            wind_speed: reading.wind_speed,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UnavailableCity {
    pub city: CityRef,
    pub reason: String,
}

/// Body of `GET /fetch_weather/`. Map keys are city ids.
#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    pub city_weather_data: Vec<CurrentWeather>,
    pub daily_summaries: BTreeMap<String, SummaryView>,
    pub historical_data: BTreeMap<String, Vec<HistoryPoint>>,
    pub unavailable_cities: Vec<UnavailableCity>,
}

/// Shape a refresh cycle into the dashboard payload.
pub fn dashboard_payload(result: &RefreshResult, tz: Tz) -> DashboardResponse {
    let mut response = DashboardResponse {
        city_weather_data: Vec::with_capacity(result.cities.len()),
        daily_summaries: BTreeMap::new(),
        historical_data: BTreeMap::new(),
        unavailable_cities: Vec::new(),
    };

    for slot in &result.cities {
        let key = slot.city.id.to_string();

        match (&slot.status, &slot.current) {
            (CityStatus::Unavailable { reason }, _) => {
                response.unavailable_cities.push(UnavailableCity {
                    city: CityRef::from(&slot.city),
                    reason: reason.clone(),
                });
            }
            (status, Some(reading)) => {
                response.city_weather_data.push(CurrentWeather {
                    city: CityRef::from(&slot.city),
                    temperature: reading.temperature,
                    feels_like: reading.feels_like,
                    condition: reading.condition.clone(),
                    humidity: reading.humidity,
                    wind_speed: reading.wind_speed,
                    timestamp: reading.timestamp.to_rfc3339(),
                    stale: matches!(status, CityStatus::Stale { .. }),
                });
            }
            (_, None) => {
                response.unavailable_cities.push(UnavailableCity {
                    city: CityRef::from(&slot.city),
                    reason: "no reading available".to_string(),
                });
            }
        }

        if let Some(summary) = &slot.summary {
            response
                .daily_summaries
                .insert(key.clone(), SummaryView::from(summary));
        }
        // Every served city gets a history entry, possibly empty.
        if slot.current.is_some() || !slot.history.is_empty() {
            let points = slot.history.iter().map(|r| HistoryPoint::new(r, tz)).collect();
            response.historical_data.insert(key, points);
        }
    }

    response
}

fn error_body(msg: impl Into<String>) -> serde_json::Value {
    serde_json::json!({
        "error": msg.into(),
        "status": "error",
    })
}

// ============================================================================
// Inner (directly testable) functions
// ============================================================================

/// Run one refresh cycle at `now`. 503 only when the city set cannot be loaded.
pub async fn fetch_weather_inner(
    orchestrator: &RefreshOrchestrator,
    now: DateTime<Utc>,
) -> (StatusCode, serde_json::Value) {
    let result = match orchestrator.refresh_all(now).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "Could not load cities");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                error_body(format!("city set unavailable: {}", e)),
            );
        }
    };

    let payload = dashboard_payload(&result, orchestrator.aggregator().tz());
    match serde_json::to_value(payload) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string())),
    }
}

pub async fn health_inner(store: &dyn WeatherStore) -> (StatusCode, serde_json::Value) {
    match store.health_check().await {
        Ok(detail) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "store": store.name(),
                "detail": detail,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "store": store.name(),
                "error": e.to_string(),
            }),
        ),
    }
}

pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "monsoon/1",
    })
}

// ============================================================================
// Axum handlers
// ============================================================================

pub async fn fetch_weather_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = fetch_weather_inner(&state.orchestrator, Utc::now()).await;
    (status, Json(body))
}

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(state.orchestrator.store().as_ref()).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}
