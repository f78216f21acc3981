use std::sync::Arc;

use clap::Parser;
use monsoon_core::{MonsoonConfig, OpenWeatherClient, WeatherFetcher};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use monsoon_server::http::{self, HttpState};
use monsoon_server::subsystems::refresh::{self, RefreshOrchestrator};
use monsoon_server::subsystems::seed;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "monsoon.toml")]
    config: String,

    /// Check the store connection and exit
    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (OPENWEATHER_API_KEY in dev)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match MonsoonConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over service.log_level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.service.log_level.as_str()));
    fmt().with_env_filter(filter).init();

    let store = match monsoon_core::open_store(&config.database).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to open {:?} store: {}", config.database.backend, e);
            std::process::exit(1);
        }
    };

    if args.health {
        match store.health_check().await {
            Ok(v) => println!("✅ {} store reachable: {}", store.name(), v),
            Err(e) => {
                println!("❌ {} store check failed: {}", store.name(), e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let fetcher: Arc<dyn WeatherFetcher> = match OpenWeatherClient::new(&config.upstream) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("Failed to create upstream client: {}", e);
            std::process::exit(1);
        }
    };

    let orchestrator = Arc::new(RefreshOrchestrator::from_config(
        store.clone(),
        fetcher,
        &config,
    )?);

    let cities = seed::ensure_cities(store.as_ref()).await?;
    tracing::info!(
        store = store.name(),
        cities = cities.len(),
        timezone = %config.refresh.timezone,
        staleness_seconds = config.refresh.staleness_seconds,
        "Monsoon starting"
    );

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    if config.refresh.background_enabled {
        tokio::spawn(refresh::run_refresh_loop(
            orchestrator.clone(),
            config.refresh.background_interval_seconds,
            tx.subscribe(),
        ));
    }

    let state = Arc::new(HttpState {
        orchestrator,
        config,
    });
    http::start_http_server(state, tx.subscribe()).await?;

    Ok(())
}
