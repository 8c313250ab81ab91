//! Durable storage for TuneBench experiments.

pub mod schema;
pub mod storage;

pub use schema::CURRENT_VERSION;
pub use storage::{NewExperiment, Storage};
