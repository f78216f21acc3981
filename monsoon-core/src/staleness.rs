//! Freshness check for cached readings.

use chrono::{DateTime, Duration, Utc};

use crate::models::Reading;

/// Decides whether a city's latest cached reading can be served as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessGate {
    window: Duration,
}

impl StalenessGate {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// True when there is no cached reading or it is older than the window.
    /// A reading timestamped in the future (clock skew) counts as fresh.
    pub fn should_refresh(&self, latest: Option<&Reading>, now: DateTime<Utc>) -> bool {
        match latest {
            None => true,
            Some(reading) => now.signed_duration_since(reading.timestamp) > self.window,
        }
    }
}

impl Default for StalenessGate {
    fn default() -> Self {
        Self::new(Duration::minutes(1))
    }
}
