pub mod city;
pub mod reading;
pub mod summary;

pub use city::{City, NewCity};
pub use reading::{NewReading, Observation, Reading};
pub use summary::DailySummary;
