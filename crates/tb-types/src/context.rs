//! Per-run context passed explicitly to every environment and runner.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use uuid::Uuid;

use crate::errors::{TbError, TbResult};

/// Ambient parameters for one benchmarking run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub experiment_id: String,
    #[serde(default)]
    pub config_paths: Vec<PathBuf>,
    /// Global parameters (credentials, paths, ids) shared by all environments.
    #[serde(default)]
    pub globals: Map<String, Value>,
    /// Set once the context is handed to a specific runner.
    #[serde(default)]
    pub trial_runner_id: Option<usize>,
}

impl RunContext {
    pub fn new(experiment_id: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            experiment_id: experiment_id.into(),
            config_paths: Vec::new(),
            globals: Map::new(),
            trial_runner_id: None,
        }
    }

    pub fn with_global(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.globals.insert(key.into(), value.into());
        self
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_paths.push(path.into());
        self
    }

    pub fn global(&self, key: &str) -> Option<&Value> {
        self.globals.get(key)
    }

    /// Copy of this context bound to one trial runner.
    pub fn for_runner(&self, runner_id: usize) -> Self {
        let mut ctx = self.clone();
        ctx.trial_runner_id = Some(runner_id);
        ctx.globals
            .insert("trial_runner_id".to_string(), Value::from(runner_id as u64));
        ctx
    }

    /// Resolve an environment's constant arguments against the globals.
    ///
    /// Keys already present in `const_args` are overridden by a global of the
    /// same name. Every key in `required` must end up set, either locally or
    /// from the globals, otherwise this is a configuration error.
    pub fn merge_into(
        &self,
        const_args: &Map<String, Value>,
        required: &[String],
    ) -> TbResult<Map<String, Value>> {
        let mut merged = const_args.clone();
        for (key, value) in merged.iter_mut() {
            if let Some(global) = self.globals.get(key) {
                *value = global.clone();
            }
        }
        for key in required {
            if merged.contains_key(key) {
                continue;
            }
            match self.globals.get(key) {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    return Err(TbError::Config(format!("Missing required parameter: {key}")));
                }
            }
        }
        Ok(merged)
    }
}
