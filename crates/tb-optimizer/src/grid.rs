//! Exhaustive grid search over the tunable space.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tb_types::{
    config_error, internal_error, Domain, Metrics, Status, TbResult, Tunable, TunableGroups, TunableMap,
    TunableSnapshot, TunableValue,
};

use crate::optimizer::{Optimizer, OptimizerBase, OptimizerConfig};

const LARGE_GRID: usize = 10_000;
const MAX_GRID: usize = 1_000_000;

fn default_steps() -> usize {
    5
}

/// Grid resolution for numeric tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Points per float range, and the cap for int ranges: an int range
    /// with more values than this is sampled at evenly spaced points.
    #[serde(default = "default_steps")]
    pub steps: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self { steps: default_steps() }
    }
}

fn linspace(low: f64, high: f64, steps: usize) -> impl Iterator<Item = f64> {
    let steps = steps.max(2);
    (0..steps).map(move |i| low + (high - low) * i as f64 / (steps - 1) as f64)
}

/// Grid points of a single tunable.
fn axis(tunable: &Tunable, steps: usize) -> Vec<TunableValue> {
    match tunable.domain() {
        Domain::Categorical { values } => values.iter().cloned().map(TunableValue::Categorical).collect(),
        Domain::Int { low, high, .. } => {
            let span = high.saturating_sub(*low).saturating_add(1);
            if span as u64 <= steps.max(2) as u64 {
                (*low..=*high).map(TunableValue::Int).collect()
            } else {
                let mut points: Vec<i64> = linspace(*low as f64, *high as f64, steps)
                    .map(|v| v.round() as i64)
                    .collect();
                points.dedup();
                points.into_iter().map(TunableValue::Int).collect()
            }
        }
        Domain::Float { low, high, .. } => linspace(*low, *high, steps).map(TunableValue::Float).collect(),
    }
}

/// Cartesian product of every tunable's axis, in tunable order.
fn build_grid(tunables: &TunableGroups, steps: usize) -> TbResult<VecDeque<TunableMap>> {
    let axes: Vec<(String, Vec<TunableValue>)> = tunables
        .iter()
        .map(|(tunable, _)| (tunable.name().to_string(), axis(tunable, steps)))
        .collect();

    let size = axes
        .iter()
        .try_fold(1usize, |acc, (_, values)| acc.checked_mul(values.len()))
        .filter(|size| *size <= MAX_GRID)
        .ok_or_else(|| config_error!("grid over {} tunables exceeds {MAX_GRID} points", axes.len()))?;
    if size > LARGE_GRID {
        warn!(size, "Large number of grid points requested");
    }

    let mut grid: Vec<TunableMap> = vec![TunableMap::new()];
    for (name, values) in &axes {
        let mut next = Vec::with_capacity(grid.len() * values.len());
        for existing in &grid {
            for value in values {
                let mut point = existing.clone();
                point.insert(name.clone(), value.clone());
                next.push(point);
            }
        }
        grid = next;
    }
    Ok(grid.into())
}

/// Suggests every grid point once, defaults first when configured.
#[derive(Debug, Clone)]
pub struct GridSearchOptimizer {
    base: OptimizerBase,
    pending: VecDeque<TunableMap>,
    in_flight: HashSet<TunableSnapshot>,
}

impl GridSearchOptimizer {
    pub fn new(tunables: TunableGroups, config: OptimizerConfig, grid: GridConfig) -> TbResult<Self> {
        let pending = build_grid(&tunables, grid.steps)?;
        info!(points = pending.len(), steps = grid.steps, "Built search grid");
        Ok(Self {
            base: OptimizerBase::new(tunables, config),
            pending,
            in_flight: HashSet::new(),
        })
    }

    pub fn pending_configs(&self) -> impl Iterator<Item = &TunableMap> {
        self.pending.iter()
    }

    /// Suggested but not yet registered.
    pub fn suggested_configs(&self) -> &HashSet<TunableSnapshot> {
        &self.in_flight
    }

    fn forget(&mut self, snapshot: &TunableSnapshot) {
        self.pending.retain(|point| TunableSnapshot::new(point.clone()) != *snapshot);
    }
}

impl Optimizer for GridSearchOptimizer {
    fn name(&self) -> &str {
        "grid_search"
    }

    fn base(&self) -> &OptimizerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OptimizerBase {
        &mut self.base
    }

    fn suggest(&mut self) -> TbResult<TunableGroups> {
        let mut tunables = self.base.tunables().clone();
        if self.base.take_defaults() {
            info!("Use default values for the first trial");
            tunables.restore_defaults();
        } else {
            let point = self
                .pending
                .pop_front()
                .ok_or_else(|| internal_error!("grid search has no configurations left"))?;
            tunables.assign(point.iter())?;
        }
        let snapshot = tunables.snapshot();
        self.forget(&snapshot);
        self.in_flight.insert(snapshot);
        let iteration = self.base.next_iteration();
        info!(iteration, "Suggest: {}", tunables.snapshot());
        Ok(tunables)
    }

    fn register(&mut self, tunables: &TunableGroups, status: Status, result: Option<&Metrics>) -> Option<f64> {
        let snapshot = tunables.snapshot();
        self.in_flight.remove(&snapshot);
        // Points already evaluated elsewhere (e.g. preloaded) are not re-suggested.
        self.forget(&snapshot);
        self.base.record(tunables, status, result)
    }

    fn not_converged(&self) -> bool {
        self.base.within_budget() && !self.pending.is_empty()
    }
}
