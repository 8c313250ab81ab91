//! Command-line launcher wiring.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{info, warn};

use tb_env::{EnvSpec, Environment};
use tb_optimizer::{OptimizerConfig, OptimizerSpec};
use tb_services::{LocalExecService, MockHostConfig, MockHostService, Services};
use tb_storage::Storage;
use tb_types::{RunContext, TunableGroups, TunableMap};

use crate::scheduler::{RunSummary, Scheduler, SchedulerConfig, SchedulingPolicy};
use crate::trial_runner::TrialRunnerConfig;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyArg {
    Sync,
    Cyclic,
}

impl From<PolicyArg> for SchedulingPolicy {
    fn from(value: PolicyArg) -> SchedulingPolicy {
        match value {
            PolicyArg::Sync => SchedulingPolicy::Sync,
            PolicyArg::Cyclic => SchedulingPolicy::Cyclic,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "tb-bench", about = "Closed-loop benchmarking and tuning")]
pub struct Cli {
    /// Tunable groups definition (JSON).
    #[arg(long)]
    pub tunables: PathBuf,

    /// Environment tree definition (JSON).
    #[arg(long)]
    pub environment: PathBuf,

    /// Optimizer definition (JSON). Runs the current tunable values once when omitted.
    #[arg(long)]
    pub optimizer: Option<PathBuf>,

    /// Flat name -> value overrides applied to the tunables before optimizing.
    #[arg(long)]
    pub tunable_values: Vec<PathBuf>,

    /// Global parameters shared by all environments (JSON object).
    #[arg(long)]
    pub globals: Vec<PathBuf>,

    #[arg(long, default_value = "tunebench")]
    pub experiment_id: String,

    #[arg(long, value_enum, default_value = "sync")]
    pub policy: PolicyArg,

    #[arg(long, default_value_t = 1)]
    pub trial_runners: usize,

    #[arg(long)]
    pub max_trials: Option<usize>,

    #[arg(long, default_value_t = 1)]
    pub trial_config_repeat_count: u32,

    /// Re-run this stored config id first.
    #[arg(long)]
    pub config_id: Option<i64>,

    /// Database file. Defaults to the platform data directory.
    #[arg(long)]
    pub storage: Option<PathBuf>,

    #[arg(long, default_value_t = 600)]
    pub setup_timeout_secs: u64,

    #[arg(long, default_value_t = false)]
    pub teardown_each_trial: bool,

    /// Leave environments up when the run ends.
    #[arg(long, default_value_t = false)]
    pub no_teardown: bool,

    /// Back remote environments with in-process mock hosts.
    #[arg(long, default_value_t = false)]
    pub mock_hosts: bool,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

impl Cli {
    pub fn load_tunables(&self) -> Result<TunableGroups> {
        let mut tunables = TunableGroups::from_json(&read_json::<Value>(&self.tunables)?)
            .with_context(|| format!("loading tunables from {}", self.tunables.display()))?;
        for path in &self.tunable_values {
            let values: TunableMap = read_json(path)?;
            tunables
                .assign(values.iter())
                .with_context(|| format!("applying {}", path.display()))?;
        }
        Ok(tunables)
    }

    pub fn run_context(&self) -> Result<RunContext> {
        let mut ctx = RunContext::new(self.experiment_id.clone());
        for path in &self.globals {
            let globals: Map<String, Value> = read_json(path)?;
            ctx.globals.extend(globals);
            ctx = ctx.with_config_path(path);
        }
        ctx = ctx.with_config_path(&self.tunables).with_config_path(&self.environment);
        Ok(ctx)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let mut config = SchedulerConfig::new(self.experiment_id.clone())
            .with_policy(self.policy.into())
            .with_repeat_count(self.trial_config_repeat_count)
            .with_runner_config(TrialRunnerConfig {
                setup_timeout_ms: self.setup_timeout_secs.saturating_mul(1000),
                run_timeout_ms: None,
                teardown_each_trial: self.teardown_each_trial,
            });
        config.max_trials = self.max_trials;
        config.start_config_id = self.config_id;
        config.teardown = !self.no_teardown;
        config
    }

    fn services(&self) -> Services {
        let services = Services::new().with_local_executor(Arc::new(LocalExecService::new()));
        if !self.mock_hosts {
            return services;
        }
        let hosts = Arc::new(MockHostService::new(MockHostConfig::default()));
        services
            .with_host_provisioner(hosts.clone())
            .with_host_ops(hosts.clone())
            .with_remote_executor(hosts.clone())
            .with_file_transfer(hosts)
    }

    fn runner_count(&self) -> usize {
        match self.policy {
            PolicyArg::Sync => 1,
            PolicyArg::Cyclic => self.trial_runners.max(1),
        }
    }

    /// One environment per trial runner, all from the same definition.
    pub fn build_environments(&self, tunables: &TunableGroups) -> Result<Vec<Box<dyn Environment>>> {
        let spec: EnvSpec = read_json(&self.environment)?;
        let services = self.services();
        (0..self.runner_count())
            .map(|_| {
                spec.build(tunables, &services)
                    .with_context(|| format!("building environment {}", spec.name()))
            })
            .collect()
    }

    pub fn optimizer_spec(&self) -> Result<OptimizerSpec> {
        match &self.optimizer {
            Some(path) => read_json(path),
            None => Ok(OptimizerSpec::OneShot {
                config: OptimizerConfig::default(),
            }),
        }
    }
}

/// Build everything from the command line and run it to completion.
pub async fn run_cli(cli: Cli) -> Result<RunSummary> {
    if cli.policy == PolicyArg::Sync && cli.trial_runners > 1 {
        warn!(trial_runners = cli.trial_runners, "Sync policy uses a single trial runner");
    }
    let tunables = cli.load_tunables()?;
    let ctx = cli.run_context()?;
    let envs = cli.build_environments(&tunables)?;
    let optimizer = cli.optimizer_spec()?.build(&tunables)?;

    let storage_path = cli.storage.clone().unwrap_or_else(Storage::default_path);
    let storage = Arc::new(Storage::open(&storage_path)?);
    let Some(root) = envs.first() else {
        bail!("no environments were built");
    };
    info!(storage = %storage_path.display(), root_env = %root.name(), "Launching");
    print!("{}", root.pprint(0));

    let scheduler = Scheduler::new(cli.scheduler_config(), storage, optimizer, envs, ctx)?;
    let cancel = scheduler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, canceling running trials");
            cancel.cancel();
        }
    });
    Ok(scheduler.run().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &Path, name: &str, value: Value) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, value.to_string()).unwrap();
        path
    }

    #[test]
    fn parses_arguments() {
        let cli = Cli::try_parse_from([
            "tb-bench",
            "--tunables",
            "t.json",
            "--environment",
            "e.json",
            "--policy",
            "cyclic",
            "--trial-runners",
            "4",
            "--max-trials",
            "20",
        ])
        .unwrap();
        assert_eq!(cli.policy, PolicyArg::Cyclic);
        assert_eq!(cli.runner_count(), 4);
        let config = cli.scheduler_config();
        assert_eq!(config.policy, SchedulingPolicy::Cyclic);
        assert_eq!(config.max_trials, Some(20));
        assert!(config.teardown);
    }

    #[test]
    fn loads_tunables_overrides_and_globals() {
        let dir = tempfile::tempdir().unwrap();
        let tunables = write(
            dir.path(),
            "tunables.json",
            json!({"app": {"cost": 1, "params": {"workers": {"type": "int", "default": 4, "range": [1, 32]}}}}),
        );
        let overrides = write(dir.path(), "values.json", json!({"workers": 16}));
        let globals = write(dir.path(), "globals.json", json!({"host": "db-1"}));
        let env = write(
            dir.path(),
            "env.json",
            json!({"class": "mock", "name": "bench", "tunable_params": ["app"]}),
        );
        let cli = Cli::try_parse_from([
            "tb-bench",
            "--tunables",
            tunables.to_str().unwrap(),
            "--environment",
            env.to_str().unwrap(),
            "--tunable-values",
            overrides.to_str().unwrap(),
            "--globals",
            globals.to_str().unwrap(),
        ])
        .unwrap();

        let loaded = cli.load_tunables().unwrap();
        assert_eq!(loaded.get("workers").unwrap().as_i64(), Some(16));
        let ctx = cli.run_context().unwrap();
        assert_eq!(ctx.global("host"), Some(&json!("db-1")));
        assert_eq!(cli.build_environments(&loaded).unwrap().len(), 1);
        assert!(matches!(cli.optimizer_spec().unwrap(), OptimizerSpec::OneShot { .. }));
    }
}
