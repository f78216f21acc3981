//! Default city set, created once when the store has no cities.

use monsoon_core::models::{City, NewCity};
use monsoon_core::store::CityStore;
use monsoon_core::StorageError;

pub const DEFAULT_CITIES: [(&str, f64, f64); 6] = [
    ("Delhi", 28.6139, 77.2090),
    ("Mumbai", 19.0760, 72.8777),
    ("Chennai", 13.0827, 80.2707),
    ("Bangalore", 12.9716, 77.5946),
    ("Kolkata", 22.5726, 88.3639),
    ("Hyderabad", 17.3850, 78.4867),
];

pub fn default_cities() -> Vec<NewCity> {
    DEFAULT_CITIES
        .iter()
        .map(|&(name, lat, lon)| NewCity::new(name, lat, lon))
        .collect()
}

/// Return the known cities, seeding the defaults first if there are none.
/// Seeding goes through get-or-create by name, so a concurrent or repeated
/// call cannot duplicate a city.
pub async fn ensure_cities<S>(store: &S) -> Result<Vec<City>, StorageError>
where
    S: CityStore + ?Sized,
{
    let cities = store.list_cities().await?;
    if !cities.is_empty() {
        return Ok(cities);
    }

    tracing::info!(count = DEFAULT_CITIES.len(), "No cities found, seeding defaults");
    for city in default_cities() {
        store.get_or_create_city(&city).await?;
    }
    store.list_cities().await
}
