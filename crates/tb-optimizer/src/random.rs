//! Seeded uniform random search.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;

use tb_types::{Domain, TbResult, Tunable, TunableGroups, TunableValue};

use crate::optimizer::{Optimizer, OptimizerBase, OptimizerConfig};

/// Samples each tunable independently and uniformly from its domain.
#[derive(Debug, Clone)]
pub struct RandomOptimizer {
    base: OptimizerBase,
    rng: ChaCha8Rng,
}

impl RandomOptimizer {
    pub fn new(tunables: TunableGroups, config: OptimizerConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self {
            base: OptimizerBase::new(tunables, config),
            rng,
        }
    }

    fn sample(rng: &mut ChaCha8Rng, tunable: &Tunable) -> TunableValue {
        match tunable.domain() {
            Domain::Int { low, high, .. } => TunableValue::Int(rng.gen_range(*low..=*high)),
            Domain::Float { low, high, .. } => TunableValue::Float(rng.gen_range(*low..=*high)),
            Domain::Categorical { values } => TunableValue::Categorical(values[rng.gen_range(0..values.len())].clone()),
        }
    }
}

impl Optimizer for RandomOptimizer {
    fn name(&self) -> &str {
        "random"
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
            let values: Vec<(String, TunableValue)> = tunables
                .iter()
                .map(|(tunable, _)| (tunable.name().to_string(), Self::sample(&mut self.rng, tunable)))
                .collect();
            tunables.assign(values.iter().map(|(name, value)| (name, value)))?;
        }
        let iteration = self.base.next_iteration();
        info!(iteration, "Suggest: {}", tunables.snapshot());
        Ok(tunables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tb_types::{Metrics, Status};

    fn schema() -> TunableGroups {
        TunableGroups::from_json(&json!({
            "app": {"cost": 1, "params": {
                "workers": {"type": "int", "default": 4, "range": [1, 32]},
                "ratio": {"type": "float", "default": 0.5, "range": [0.1, 0.9]},
                "mode": {"type": "categorical", "default": "fast", "values": ["fast", "safe", "eco"]}
            }}
        }))
        .unwrap()
    }

    #[test]
    fn same_seed_same_sequence() {
        let config = OptimizerConfig::default().with_seed(7).with_start_with_defaults(false);
        let mut a = RandomOptimizer::new(schema(), config.clone());
        let mut b = RandomOptimizer::new(schema(), config);
        for _ in 0..10 {
            assert_eq!(a.suggest().unwrap().snapshot(), b.suggest().unwrap().snapshot());
        }
    }

    #[test]
    fn samples_stay_in_domain() {
        let mut opt = RandomOptimizer::new(schema(), OptimizerConfig::default().with_start_with_defaults(false));
        for _ in 0..50 {
            let s = opt.suggest().unwrap();
            let workers = s.get("workers").unwrap().as_i64().unwrap();
            assert!((1..=32).contains(&workers));
            let ratio = s.get("ratio").unwrap().as_f64().unwrap();
            assert!((0.1..=0.9).contains(&ratio));
        }
    }

    #[test]
    fn defaults_first_then_budget() {
        let config = OptimizerConfig::default().with_max_suggestions(3);
        let mut opt = RandomOptimizer::new(schema(), config);
        assert!(opt.suggest().unwrap().is_defaults());
        let mut n = 1;
        while opt.not_converged() {
            let s = opt.suggest().unwrap();
            opt.register(&s, Status::Succeeded, Some(&Metrics::from([("score".to_string(), n as f64)])));
            n += 1;
        }
        assert_eq!(n, 3);
        assert_eq!(opt.get_best_observation().unwrap().1, 1.0);
    }
}
