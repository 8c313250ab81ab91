//! Experiment and trial records shared by storage, runners and the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::snapshot::TunableSnapshot;
use crate::status::Status;

/// Named numeric results of a trial (metric -> value).
pub type Metrics = BTreeMap<String, f64>;

/// Trial id, monotonic and unique within one experiment.
pub type TrialId = i64;

/// Id of a deduplicated tunable configuration row.
pub type ConfigId = i64;

/// Whether we are maximizing or minimizing the target metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationDirection {
    Min,
    Max,
}

impl Default for OptimizationDirection {
    fn default() -> Self {
        Self::Min
    }
}

impl OptimizationDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "min" | "minimize" => Some(Self::Min),
            "max" | "maximize" => Some(Self::Max),
            _ => None,
        }
    }

    /// Multiplier that turns a raw score into a value to minimize.
    pub fn sign(self) -> f64 {
        match self {
            Self::Min => 1.0,
            Self::Max => -1.0,
        }
    }

    /// `true` if `candidate` beats `incumbent` in this direction.
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Min => candidate < incumbent,
            Self::Max => candidate > incumbent,
        }
    }
}

impl fmt::Display for OptimizationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single telemetry sample reported by an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub timestamp: DateTime<Utc>,
    pub metric: String,
    pub value: f64,
}

impl TelemetryRecord {
    pub fn new(timestamp: DateTime<Utc>, metric: impl Into<String>, value: f64) -> Self {
        Self {
            timestamp,
            metric: metric.into(),
            value,
        }
    }

    pub fn now(metric: impl Into<String>, value: f64) -> Self {
        Self::new(Utc::now(), metric, value)
    }
}

/// A named optimization run with a fixed tunable schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub description: String,
    pub optimization_target: String,
    pub optimization_direction: OptimizationDirection,
    pub root_env: String,
    /// Tunable definitions as produced by `TunableGroups::to_json`.
    pub schema: serde_json::Value,
    pub schema_hash: String,
    pub schema_version: i64,
    pub created_at: DateTime<Utc>,
}

/// One execution of an environment under one fixed tunable snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub experiment_id: String,
    pub trial_id: TrialId,
    pub config_id: ConfigId,
    pub tunables: TunableSnapshot,
    pub runner_id: usize,
    pub repeat_i: u32,
    pub status: Status,
    pub result: Metrics,
    pub error: Option<String>,
    pub telemetry: Vec<TelemetryRecord>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Trial {
    pub fn new(
        experiment_id: impl Into<String>,
        trial_id: TrialId,
        config_id: ConfigId,
        tunables: TunableSnapshot,
        runner_id: usize,
    ) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            trial_id,
            config_id,
            tunables,
            runner_id,
            repeat_i: 1,
            status: Status::Pending,
            result: Metrics::new(),
            error: None,
            telemetry: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
    }

    pub fn mark_running(&mut self) {
        self.status = Status::Running;
    }

    /// Record the terminal outcome of the trial.
    pub fn mark_completed(&mut self, status: Status, result: Metrics, error: Option<String>) {
        self.status = status;
        self.result = result;
        self.error = error;
        self.completed_at = Some(Utc::now());
    }

    /// Target metric value, present only for succeeded trials.
    pub fn score(&self, target: &str) -> Option<f64> {
        if self.status.is_succeeded() {
            self.result.get(target).copied()
        } else {
            None
        }
    }
}

impl fmt::Display for Trial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}@runner{}",
            self.experiment_id, self.trial_id, self.config_id, self.runner_id
        )
    }
}
