//! Build environment trees from declarative JSON definitions.

use serde::{Deserialize, Serialize};

use tb_services::Services;
use tb_types::TunableGroups;

use crate::composite::CompositeEnv;
use crate::environment::{EnvConfig, EnvResult, Environment};
use crate::local::{LocalEnv, LocalEnvOptions};
use crate::mock::{MockEnv, MockEnvOptions};
use crate::remote::{RemoteEnv, RemoteEnvOptions};

fn default_metric() -> String {
    "score".to_string()
}

/// One node of an environment definition, selected by its `class` field.
///
/// ```json
/// {"class": "composite", "name": "root", "children": [
///     {"class": "remote", "name": "vm", "tunable_params": ["vm"], "provision": true},
///     {"class": "local", "name": "bench", "run": ["./bench.sh"]}
/// ]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum EnvSpec {
    Mock {
        #[serde(flatten)]
        config: EnvConfig,
        #[serde(default)]
        seed: Option<u64>,
        #[serde(default)]
        range: Option<(f64, f64)>,
        #[serde(default = "default_metric")]
        metric: String,
    },
    Local {
        #[serde(flatten)]
        config: EnvConfig,
        #[serde(flatten)]
        options: LocalEnvOptions,
    },
    Remote {
        #[serde(flatten)]
        config: EnvConfig,
        #[serde(flatten)]
        options: RemoteEnvOptions,
    },
    Composite {
        name: String,
        children: Vec<EnvSpec>,
    },
}

impl EnvSpec {
    pub fn name(&self) -> &str {
        match self {
            EnvSpec::Mock { config, .. } | EnvSpec::Local { config, .. } | EnvSpec::Remote { config, .. } => {
                &config.name
            }
            EnvSpec::Composite { name, .. } => name,
        }
    }

    /// Instantiate the environment, checking its required capabilities
    /// against `services`.
    pub fn build(&self, tunables: &TunableGroups, services: &Services) -> EnvResult<Box<dyn Environment>> {
        let env: Box<dyn Environment> = match self {
            EnvSpec::Mock {
                config,
                seed,
                range,
                metric,
            } => {
                let options = MockEnvOptions {
                    seed: *seed,
                    range: *range,
                    metric: metric.clone(),
                    ..MockEnvOptions::default()
                };
                Box::new(MockEnv::new(config.clone(), tunables, options)?)
            }
            EnvSpec::Local { config, options } => {
                Box::new(LocalEnv::new(config.clone(), tunables, options.clone(), services)?)
            }
            EnvSpec::Remote { config, options } => {
                Box::new(RemoteEnv::new(config.clone(), tunables, options.clone(), services)?)
            }
            EnvSpec::Composite { name, children } => {
                let children = children
                    .iter()
                    .map(|child| child.build(tunables, services))
                    .collect::<EnvResult<Vec<_>>>()?;
                Box::new(CompositeEnv::new(name.clone(), children)?)
            }
        };
        Ok(env)
    }
}
