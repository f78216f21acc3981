use chrono_tz::Tz;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Environment variable consulted when `upstream.api_key` is empty.
pub const API_KEY_ENV: &str = "OPENWEATHER_API_KEY";

/// Largest accepted `refresh.staleness_seconds` (one week).
pub const MAX_STALENESS_SECONDS: u64 = 7 * 24 * 3600;

/// Largest accepted `refresh.history_hours` (one leap year).
pub const MAX_HISTORY_HOURS: u32 = 366 * 24;

#[derive(Debug, Deserialize, Clone)]
pub struct MonsoonConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub timeout_seconds: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openweathermap.org".to_string(),
            api_key: String::new(),
            timeout_seconds: 10,
            max_retries: 2,
            retry_delay_ms: 250,
        }
    }
}

impl UpstreamConfig {
    /// Configured key, falling back to `OPENWEATHER_API_KEY`.
    pub fn resolved_api_key(&self) -> String {
        if !self.api_key.trim().is_empty() {
            return self.api_key.clone();
        }
        std::env::var(API_KEY_ENV).unwrap_or_default()
    }

    /// Upper bound for one city's fetch including retries and backoff.
    pub fn deadline(&self) -> std::time::Duration {
        let attempts = self.max_retries as u64 + 1;
        let backoff_cap = 5 * self.max_retries as u64;
        std::time::Duration::from_secs(self.timeout_seconds * attempts + backoff_cap)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RefreshConfig {
    pub staleness_seconds: u64,
    pub history_hours: u32,
    pub timezone: String,
    pub max_concurrent_fetches: usize,
    #[serde(default)]
    pub background_enabled: bool,
    pub background_interval_seconds: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            staleness_seconds: 60,
            history_hours: 24,
            timezone: "UTC".to_string(),
            max_concurrent_fetches: 4,
            background_enabled: false,
            background_interval_seconds: 300,
        }
    }
}

impl RefreshConfig {
    /// Clamped to [`MAX_STALENESS_SECONDS`]; `validate` rejects larger values.
    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_seconds.min(MAX_STALENESS_SECONDS) as i64)
    }

    /// Clamped to [`MAX_HISTORY_HOURS`]; `validate` rejects larger values.
    pub fn history_window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.history_hours.min(MAX_HISTORY_HOURS)))
    }

    /// Timezone that defines calendar-day boundaries for daily summaries.
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone.parse::<Tz>().map_err(|e| {
            ConfigError::Message(format!("invalid refresh.timezone {:?}: {}", self.timezone, e))
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

impl MonsoonConfig {
    /// Load from a TOML file, then apply `MONSOON__SECTION__KEY` overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("MONSOON")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Self = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.refresh.tz()?;
        if self.refresh.staleness_seconds > MAX_STALENESS_SECONDS {
            return Err(ConfigError::Message(format!(
                "refresh.staleness_seconds must be at most {}",
                MAX_STALENESS_SECONDS
            )));
        }
        if self.refresh.history_hours == 0 || self.refresh.history_hours > MAX_HISTORY_HOURS {
            return Err(ConfigError::Message(format!(
                "refresh.history_hours must be between 1 and {}",
                MAX_HISTORY_HOURS
            )));
        }
        if self.refresh.max_concurrent_fetches == 0 {
            return Err(ConfigError::Message(
                "refresh.max_concurrent_fetches must be at least 1".to_string(),
            ));
        }
        if self.database.backend == StorageBackend::Postgres && self.database.url.is_empty() {
            return Err(ConfigError::Message(
                "database.url is required for the postgres backend".to_string(),
            ));
        }
        Ok(())
    }
}
