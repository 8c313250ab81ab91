//! # tb-engine
//!
//! Runs TuneBench experiments: [`TrialRunner`]s drive environments through
//! trials and the [`Scheduler`] feeds them suggestions from an optimizer,
//! persisting every trial to storage.

pub mod cli;
pub mod scheduler;
pub mod trial_runner;

pub use scheduler::{RunSummary, Scheduler, SchedulerConfig, SchedulingPolicy};
pub use trial_runner::{TrialReport, TrialRunner, TrialRunnerConfig};
