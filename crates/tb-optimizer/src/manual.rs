//! Optimizers that replay fixed configurations.

use tracing::info;

use tb_types::{config_error, TbResult, TunableGroups, TunableMap};

use crate::optimizer::{Optimizer, OptimizerBase, OptimizerConfig};

/// Cycles through an explicit list of configurations `max_cycles` times.
///
/// Each entry is applied on top of the defaults, so `{}` stands for the
/// default configuration.
#[derive(Debug, Clone)]
pub struct ManualOptimizer {
    base: OptimizerBase,
    cycle: Vec<TunableMap>,
    max_cycles: usize,
}

impl ManualOptimizer {
    pub fn new(
        tunables: TunableGroups,
        config: OptimizerConfig,
        cycle: Vec<TunableMap>,
        max_cycles: usize,
    ) -> TbResult<Self> {
        if cycle.is_empty() {
            return Err(config_error!("manual optimizer needs at least one configuration"));
        }
        // Reject bad entries now rather than mid-run.
        for (idx, values) in cycle.iter().enumerate() {
            tunables
                .clone()
                .assign(values.iter())
                .map_err(|e| config_error!("manual configuration #{idx}: {e}"))?;
        }
        let config = OptimizerConfig {
            max_suggestions: config.max_suggestions.min(max_cycles.saturating_mul(cycle.len())),
            start_with_defaults: false,
            ..config
        };
        Ok(Self {
            base: OptimizerBase::new(tunables, config),
            cycle,
            max_cycles,
        })
    }

    pub fn max_cycles(&self) -> usize {
        self.max_cycles
    }
}

impl Optimizer for ManualOptimizer {
    fn name(&self) -> &str {
        "manual"
    }

    fn base(&self) -> &OptimizerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OptimizerBase {
        &mut self.base
    }

    fn suggest(&mut self) -> TbResult<TunableGroups> {
        let idx = self.base.suggested() % self.cycle.len();
        let mut tunables = self.base.tunables().clone();
        tunables.restore_defaults().assign(self.cycle[idx].iter())?;
        let iteration = self.base.next_iteration();
        info!(iteration, "Suggest: {}", tunables.snapshot());
        Ok(tunables)
    }
}

/// Suggests a single fixed configuration (the given tunables' current
/// values) and then reports convergence.
#[derive(Debug, Clone)]
pub struct OneShotOptimizer {
    base: OptimizerBase,
}

impl OneShotOptimizer {
    pub fn new(tunables: TunableGroups, config: OptimizerConfig) -> Self {
        let config = OptimizerConfig {
            max_suggestions: 1,
            start_with_defaults: false,
            ..config
        };
        Self {
            base: OptimizerBase::new(tunables, config),
        }
    }
}

impl Optimizer for OneShotOptimizer {
    fn name(&self) -> &str {
        "one_shot"
    }

    fn base(&self) -> &OptimizerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OptimizerBase {
        &mut self.base
    }

    fn suggest(&mut self) -> TbResult<TunableGroups> {
        let tunables = self.base.tunables().clone();
        let iteration = self.base.next_iteration();
        info!(iteration, "Suggest: {}", tunables.snapshot());
        Ok(tunables)
    }
}
