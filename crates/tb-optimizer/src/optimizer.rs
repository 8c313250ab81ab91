//! The optimizer contract consumed by the scheduler.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tb_types::{Metrics, OptimizationDirection, Status, TbResult, TunableGroups};

use crate::observation::{BestObservation, Observation};

fn default_target() -> String {
    "score".to_string()
}

fn default_max_suggestions() -> usize {
    100
}

fn default_seed() -> u64 {
    42
}

fn default_true() -> bool {
    true
}

/// Settings shared by every optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_target")]
    pub optimization_target: String,
    #[serde(default)]
    pub optimization_direction: OptimizationDirection,
    /// Convergence budget, counting preloaded observations.
    #[serde(default = "default_max_suggestions")]
    pub max_suggestions: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Suggest the tunables' defaults first unless prior data was loaded.
    #[serde(default = "default_true")]
    pub start_with_defaults: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            optimization_target: default_target(),
            optimization_direction: OptimizationDirection::default(),
            max_suggestions: default_max_suggestions(),
            seed: default_seed(),
            start_with_defaults: true,
        }
    }
}

impl OptimizerConfig {
    pub fn new(target: impl Into<String>, direction: OptimizationDirection) -> Self {
        Self {
            optimization_target: target.into(),
            optimization_direction: direction,
            ..Self::default()
        }
    }

    pub fn with_max_suggestions(mut self, max_suggestions: usize) -> Self {
        self.max_suggestions = max_suggestions;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_start_with_defaults(mut self, start_with_defaults: bool) -> Self {
        self.start_with_defaults = start_with_defaults;
        self
    }
}

/// State common to all optimizers: the search space, the budget and the
/// best observation.
#[derive(Debug, Clone)]
pub struct OptimizerBase {
    config: OptimizerConfig,
    tunables: TunableGroups,
    suggested: usize,
    registered: usize,
    start_with_defaults: bool,
    best: BestObservation,
}

impl OptimizerBase {
    pub fn new(tunables: TunableGroups, config: OptimizerConfig) -> Self {
        info!(
            tunables = tunables.len(),
            target = %config.optimization_target,
            direction = %config.optimization_direction,
            "Create optimizer"
        );
        Self {
            start_with_defaults: config.start_with_defaults,
            best: BestObservation::new(config.optimization_direction),
            config,
            tunables,
            suggested: 0,
            registered: 0,
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn tunables(&self) -> &TunableGroups {
        &self.tunables
    }

    pub fn suggested(&self) -> usize {
        self.suggested
    }

    pub fn registered(&self) -> usize {
        self.registered
    }

    /// Count a suggestion and return its 1-based iteration number.
    pub fn next_iteration(&mut self) -> usize {
        self.suggested += 1;
        self.suggested
    }

    /// `true` exactly once if the defaults should be suggested now.
    pub fn take_defaults(&mut self) -> bool {
        std::mem::take(&mut self.start_with_defaults)
    }

    pub fn within_budget(&self) -> bool {
        self.suggested + self.registered < self.config.max_suggestions
    }

    /// Target value for a completed trial, `None` for anything else.
    pub fn score(&self, status: Status, result: Option<&Metrics>) -> Option<f64> {
        if !status.is_succeeded() {
            return None;
        }
        let value = result.and_then(|r| r.get(&self.config.optimization_target)).copied();
        if value.is_none() {
            warn!(target = %self.config.optimization_target, "Succeeded trial did not report the target metric");
        }
        value
    }

    pub fn record(&mut self, tunables: &TunableGroups, status: Status, result: Option<&Metrics>) -> Option<f64> {
        let score = self.score(status, result);
        // Any history means the defaults no longer need a dedicated trial.
        self.start_with_defaults = false;
        if let Some(score) = score {
            if self.best.offer(tunables, score) {
                debug!(score, "New best observation");
            }
        }
        score
    }

    fn mark_preloaded(&mut self) {
        self.registered += 1;
    }

    pub fn best(&self) -> Option<(TunableGroups, f64)> {
        self.best.get()
    }
}

/// Proposes configurations and learns from their results.
///
/// Implementors provide [`Optimizer::base`] access plus `suggest`; the rest
/// is shared and may be overridden.
pub trait Optimizer: Send {
    fn name(&self) -> &str;

    fn base(&self) -> &OptimizerBase;

    fn base_mut(&mut self) -> &mut OptimizerBase;

    /// Next configuration to benchmark, as a copy of the search space with
    /// its values set.
    fn suggest(&mut self) -> TbResult<TunableGroups>;

    /// Feed back the outcome of `tunables`. Returns the target value for
    /// succeeded trials.
    fn register(&mut self, tunables: &TunableGroups, status: Status, result: Option<&Metrics>) -> Option<f64> {
        info!(
            optimizer = self.name(),
            iteration = self.base().suggested(),
            %status,
            "Register: {}",
            tunables.snapshot()
        );
        self.base_mut().record(tunables, status, result)
    }

    /// Warm start from earlier trials. Returns `true` if there was data.
    fn bulk_register(&mut self, observations: &[Observation]) -> TbResult<bool> {
        info!(optimizer = self.name(), count = observations.len(), "Warm-up the optimizer");
        for observation in observations {
            let mut tunables = self.tunable_params().clone();
            tunables.assign(observation.tunables.iter())?;
            self.register(&tunables, observation.status, observation.result.as_ref());
            self.base_mut().mark_preloaded();
        }
        Ok(!observations.is_empty())
    }

    fn not_converged(&self) -> bool {
        self.base().within_budget()
    }

    fn get_best_observation(&self) -> Option<(TunableGroups, f64)> {
        self.base().best()
    }

    fn tunable_params(&self) -> &TunableGroups {
        self.base().tunables()
    }

    fn target(&self) -> &str {
        &self.base().config().optimization_target
    }

    fn direction(&self) -> OptimizationDirection {
        self.base().config().optimization_direction
    }
}

impl std::fmt::Debug for dyn Optimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}({})", self.name(), self.direction(), self.target())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> TunableGroups {
        TunableGroups::from_json(&json!({
            "app": {"cost": 1, "params": {"workers": {"type": "int", "default": 4, "range": [1, 32]}}}
        }))
        .unwrap()
    }

    #[test]
    fn config_defaults_from_json() {
        let config: OptimizerConfig = serde_json::from_value(json!({"optimization_direction": "max"})).unwrap();
        assert_eq!(config.optimization_target, "score");
        assert_eq!(config.optimization_direction, OptimizationDirection::Max);
        assert_eq!(config.max_suggestions, 100);
        assert!(config.start_with_defaults);
    }

    #[test]
    fn score_only_for_succeeded_trials() {
        let base = OptimizerBase::new(schema(), OptimizerConfig::default());
        let result = Metrics::from([("score".to_string(), 3.0)]);
        assert_eq!(base.score(Status::Succeeded, Some(&result)), Some(3.0));
        assert_eq!(base.score(Status::Failed, Some(&result)), None);
        assert_eq!(base.score(Status::Succeeded, None), None);
        assert_eq!(base.score(Status::Running, Some(&result)), None);
    }

    #[test]
    fn budget_counts_suggestions_and_preloads() {
        let mut base = OptimizerBase::new(schema(), OptimizerConfig::default().with_max_suggestions(2));
        assert!(base.within_budget());
        assert_eq!(base.next_iteration(), 1);
        base.mark_preloaded();
        assert!(!base.within_budget());
    }

    #[test]
    fn defaults_taken_once_and_skipped_after_history() {
        let mut base = OptimizerBase::new(schema(), OptimizerConfig::default());
        assert!(base.take_defaults());
        assert!(!base.take_defaults());

        let mut base = OptimizerBase::new(schema(), OptimizerConfig::default());
        base.record(&schema(), Status::Failed, None);
        assert!(!base.take_defaults());
    }
}
