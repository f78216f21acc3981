pub mod refresh;
pub mod seed;
