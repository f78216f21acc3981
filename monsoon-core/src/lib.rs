pub mod aggregator;
pub mod config;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod models;
pub mod staleness;
pub mod store;

pub use aggregator::{summarize, Aggregator};
pub use config::MonsoonConfig;
pub use error::{MonsoonError, StorageError};
pub use fetcher::{FetchError, OpenWeatherClient, WeatherFetcher};
pub use models::{City, DailySummary, NewCity, NewReading, Observation, Reading};
pub use staleness::StalenessGate;
pub use store::{open_store, CityStore, MemoryStore, PgStore, ReadingStore, SummaryStore, WeatherStore};
