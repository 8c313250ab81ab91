//! # tb-optimizer
//!
//! The optimizer contract the scheduler drives (`suggest` / `register`)
//! and simple reference strategies: manual replay, grid search, seeded
//! random search and a one-shot optimizer.

mod builder;
mod grid;
mod manual;
mod observation;
mod optimizer;
mod random;

pub use builder::OptimizerSpec;
pub use grid::{GridConfig, GridSearchOptimizer};
pub use manual::{ManualOptimizer, OneShotOptimizer};
pub use observation::{BestObservation, Observation};
pub use optimizer::{Optimizer, OptimizerBase, OptimizerConfig};
pub use random::RandomOptimizer;
