use serde::{Deserialize, Serialize};

use tb_types::{TbResult, TunableGroups, TunableMap};

use crate::grid::{GridConfig, GridSearchOptimizer};
use crate::manual::{ManualOptimizer, OneShotOptimizer};
use crate::optimizer::{Optimizer, OptimizerConfig};
use crate::random::RandomOptimizer;

fn one() -> usize {
    1
}

/// Declarative optimizer definition, selected by its `class` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum OptimizerSpec {
    Manual {
        #[serde(flatten)]
        config: OptimizerConfig,
        tunable_values_cycle: Vec<TunableMap>,
        #[serde(default = "one")]
        max_cycles: usize,
    },
    GridSearch {
        #[serde(flatten)]
        config: OptimizerConfig,
        #[serde(flatten)]
        grid: GridConfig,
    },
    Random {
        #[serde(flatten)]
        config: OptimizerConfig,
    },
    OneShot {
        #[serde(flatten)]
        config: OptimizerConfig,
    },
}

impl OptimizerSpec {
    pub fn config(&self) -> &OptimizerConfig {
        match self {
            OptimizerSpec::Manual { config, .. }
            | OptimizerSpec::GridSearch { config, .. }
            | OptimizerSpec::Random { config }
            | OptimizerSpec::OneShot { config } => config,
        }
    }

    pub fn build(&self, tunables: &TunableGroups) -> TbResult<Box<dyn Optimizer>> {
        let optimizer: Box<dyn Optimizer> = match self {
            OptimizerSpec::Manual {
                config,
                tunable_values_cycle,
                max_cycles,
            } => Box::new(ManualOptimizer::new(
                tunables.clone(),
                config.clone(),
                tunable_values_cycle.clone(),
                *max_cycles,
            )?),
            OptimizerSpec::GridSearch { config, grid } => {
                Box::new(GridSearchOptimizer::new(tunables.clone(), config.clone(), *grid)?)
            }
            OptimizerSpec::Random { config } => Box::new(RandomOptimizer::new(tunables.clone(), config.clone())),
            OptimizerSpec::OneShot { config } => Box::new(OneShotOptimizer::new(tunables.clone(), config.clone())),
        };
        Ok(optimizer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tb_types::OptimizationDirection;

    fn schema() -> TunableGroups {
        TunableGroups::from_json(&json!({
            "app": {"cost": 1, "params": {"workers": {"type": "int", "default": 2, "range": [1, 4]}}}
        }))
        .unwrap()
    }

    #[test]
    fn builds_from_json() {
        let spec: OptimizerSpec = serde_json::from_value(json!({
            "class": "grid_search",
            "optimization_target": "latency",
            "optimization_direction": "max",
            "steps": 3
        }))
        .unwrap();
        assert_eq!(spec.config().optimization_target, "latency");
        let opt = spec.build(&schema()).unwrap();
        assert_eq!(opt.name(), "grid_search");
        assert_eq!(opt.direction(), OptimizationDirection::Max);
        assert_eq!(format!("{opt:?}"), "grid_search:max(latency)");
    }

    #[test]
    fn manual_cycle_from_json() {
        let spec: OptimizerSpec = serde_json::from_value(json!({
            "class": "manual",
            "tunable_values_cycle": [{"workers": 1}, {"workers": 3}],
            "max_cycles": 2
        }))
        .unwrap();
        let mut opt = spec.build(&schema()).unwrap();
        let mut seen = Vec::new();
        while opt.not_converged() {
            seen.push(opt.suggest().unwrap().get("workers").unwrap().as_i64().unwrap());
        }
        assert_eq!(seen, [1, 3, 1, 3]);
    }
}
