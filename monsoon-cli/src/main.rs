//! monsoon-cli: terminal client for the Monsoon weather dashboard API
//!
//! # Subcommands
//! - `dashboard [--json]` : trigger a refresh and print current conditions
//! - `status`             : show server health

use std::collections::BTreeMap;

use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8000";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "monsoon-cli", version, about = "Monsoon weather dashboard client")]
struct Cli {
    /// Monsoon HTTP server URL (overrides MONSOON_HTTP_URL env var)
    #[arg(long, env = "MONSOON_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh all cities and print the dashboard
    Dashboard {
        /// Print the raw JSON payload
        #[arg(long)]
        json: bool,
    },

    /// Show Monsoon server status
    Status,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CityRef {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CurrentWeather {
    pub city: CityRef,
    pub temperature: f64,
    pub feels_like: f64,
    pub condition: String,
    pub humidity: f64,
    pub wind_speed: f64,
    pub timestamp: String,
    #[serde(default)]
    pub stale: bool,
}

#[derive(Debug, Deserialize)]
pub struct SummaryView {
    pub max_temperature: f64,
    pub min_temperature: f64,
    pub avg_temperature: f64,
    pub dominant_condition: String,
    pub sample_count: u32,
}

#[derive(Debug, Deserialize)]
pub struct UnavailableCity {
    pub city: CityRef,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct DashboardResponse {
    pub city_weather_data: Vec<CurrentWeather>,
    #[serde(default)]
    pub daily_summaries: BTreeMap<String, SummaryView>,
    #[serde(default)]
    pub unavailable_cities: Vec<UnavailableCity>,
}

// ============================================================================
// Rendering
// ============================================================================

/// One dashboard line per city with data.
pub fn format_city_line(current: &CurrentWeather, summary: Option<&SummaryView>) -> String {
    let mut line = format!(
        "{:<12} {:>5.1}°C (feels {:>5.1}°C)  {:<18} hum {:>3.0}%  wind {:>4.1} m/s",
        current.city.name,
        current.temperature,
        current.feels_like,
        current.condition,
        current.humidity,
        current.wind_speed,
    );
    if let Some(s) = summary {
        line.push_str(&format!(
            "  today {:.1}/{:.1}/{:.1} ({}, n={})",
            s.min_temperature, s.avg_temperature, s.max_temperature, s.dominant_condition,
            s.sample_count
        ));
    }
    if current.stale {
        line.push_str(&format!("  [stale since {}]", current.timestamp));
    }
    line
}

fn client(timeout_secs: u64) -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()?)
}

fn do_dashboard(server: &str, json_output: bool) -> anyhow::Result<()> {
    // Long enough for a full refresh cycle with retries.
    let client = client(120)?;
    let url = format!("{}/fetch_weather/", server);

    let resp = match client.get(&url).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("monsoon-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        eprintln!("monsoon-cli: server returned {}: {}", status, body);
        std::process::exit(1);
    }

    if json_output {
        let body: serde_json::Value = resp.json()?;
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    let dashboard: DashboardResponse = match resp.json() {
        Ok(d) => d,
        Err(e) => {
            eprintln!("monsoon-cli: failed to parse dashboard response: {}", e);
            std::process::exit(1);
        }
    };

    for current in &dashboard.city_weather_data {
        let summary = dashboard.daily_summaries.get(&current.city.id.to_string());
        println!("{}", format_city_line(current, summary));
    }
    for missing in &dashboard.unavailable_cities {
        println!("{:<12} unavailable: {}", missing.city.name, missing.reason);
    }

    Ok(())
}

fn do_status(server: &str) -> anyhow::Result<()> {
    let client = client(10)?;
    let url = format!("{}/health", server);

    match client.get(&url).send() {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!("Monsoon server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:        {}", body["version"].as_str().unwrap_or("?"));
            println!("Store:          {}", body["store"].as_str().unwrap_or("?"));
            println!("Detail:         {}", body["detail"].as_str().unwrap_or("?"));
        }
        Ok(r) => {
            eprintln!("monsoon-cli: server unhealthy (HTTP {})", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("monsoon-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match cli.command {
        Commands::Dashboard { json } => do_dashboard(&server, json),
        Commands::Status => do_status(&server),
    };

    if let Err(e) = result {
        eprintln!("monsoon-cli: {}", e);
        std::process::exit(1);
    }
}
