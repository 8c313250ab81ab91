//! Drives one environment through the trials assigned to it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tb_env::{EnvState, Environment, RunOutcome};
use tb_storage::Storage;
use tb_types::{Metrics, RunContext, Status, TbError, TbResult, TelemetryRecord, Trial, TunableGroups};

fn default_setup_timeout_ms() -> u64 {
    600_000
}

/// Per-trial limits and teardown behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRunnerConfig {
    #[serde(default = "default_setup_timeout_ms")]
    pub setup_timeout_ms: u64,
    /// No limit when unset.
    #[serde(default)]
    pub run_timeout_ms: Option<u64>,
    /// Tear the environment down after every trial instead of reusing it.
    #[serde(default)]
    pub teardown_each_trial: bool,
}

impl Default for TrialRunnerConfig {
    fn default() -> Self {
        Self {
            setup_timeout_ms: default_setup_timeout_ms(),
            run_timeout_ms: None,
            teardown_each_trial: false,
        }
    }
}

impl TrialRunnerConfig {
    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }
}

/// A finished trial together with the configuration it ran.
#[derive(Debug, Clone)]
pub struct TrialReport {
    pub runner_id: usize,
    pub trial: Trial,
    pub tunables: TunableGroups,
}

impl TrialReport {
    pub fn status(&self) -> Status {
        self.trial.status
    }

    /// Results to hand to the optimizer; only succeeded trials carry any.
    pub fn result(&self) -> Option<&Metrics> {
        self.trial.status.is_succeeded().then_some(&self.trial.result)
    }
}

/// Owns one environment and executes trials on it sequentially.
pub struct TrialRunner {
    runner_id: usize,
    env: Box<dyn Environment>,
    storage: Arc<Storage>,
    config: TrialRunnerConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TrialRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrialRunner")
            .field("runner_id", &self.runner_id)
            .field("env", &self.env)
            .field("config", &self.config)
            .finish()
    }
}

impl TrialRunner {
    pub fn new(runner_id: usize, env: Box<dyn Environment>, storage: Arc<Storage>, config: TrialRunnerConfig) -> Self {
        Self {
            runner_id,
            env,
            storage,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn runner_id(&self) -> usize {
        self.runner_id
    }

    pub fn env(&self) -> &dyn Environment {
        self.env.as_ref()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `trial` with `tunables` to a terminal status and persist it.
    ///
    /// Operational failures end up in the trial's status and error text;
    /// only storage errors are returned.
    pub async fn run_trial(&mut self, mut trial: Trial, tunables: &TunableGroups, ctx: &RunContext) -> TbResult<TrialReport> {
        let ctx = ctx.for_runner(self.runner_id);
        let exp_id = trial.experiment_id.clone();
        info!(
            runner_id = self.runner_id,
            trial_id = trial.trial_id,
            config_id = trial.config_id,
            repeat_i = trial.repeat_i,
            "Starting trial"
        );

        self.storage
            .update_trial_status(&exp_id, trial.trial_id, Status::Running, &Metrics::new(), None, &[])?;
        trial.mark_running();
        trial.runner_id = self.runner_id;

        let outcome = self.execute(tunables, &ctx).await;

        let mut telemetry = outcome.telemetry;
        if telemetry.is_empty() && outcome.status.is_succeeded() {
            telemetry = self.env.telemetry().await;
        }

        let must_teardown = outcome.status.is_timed_out() || outcome.status.is_canceled();
        if must_teardown || self.config.teardown_each_trial {
            debug!(runner_id = self.runner_id, trial_id = trial.trial_id, "Tearing down after trial");
            self.env.teardown().await;
        }

        self.persist(&mut trial, outcome.status, outcome.results, outcome.error, telemetry)?;
        Ok(TrialReport {
            runner_id: self.runner_id,
            trial,
            tunables: tunables.clone(),
        })
    }

    async fn execute(&mut self, tunables: &TunableGroups, ctx: &RunContext) -> RunOutcome {
        let cancel = self.cancel.clone();
        if cancel.is_cancelled() {
            return RunOutcome::with_status(Status::Canceled, "canceled before setup");
        }

        let setup_timeout = self.config.setup_timeout();
        let set_up = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return RunOutcome::with_status(Status::Canceled, "canceled during setup");
            }
            set_up = tokio::time::timeout(setup_timeout, self.env.setup(tunables, ctx)) => set_up,
        };
        match set_up {
            Err(_) => {
                let error = TbError::ProvisionTimeout {
                    target: self.env.name().to_string(),
                    timeout_seconds: setup_timeout.as_secs(),
                };
                warn!(runner_id = self.runner_id, %error, "Setup timed out");
                return RunOutcome::with_status(Status::TimedOut, error.to_string());
            }
            Ok(false) => {
                let status = if self.env.state() == EnvState::TimedOut {
                    Status::TimedOut
                } else {
                    Status::Failed
                };
                let error = self
                    .env
                    .last_error()
                    .unwrap_or_else(|| format!("setup of {} failed", self.env.name()));
                warn!(runner_id = self.runner_id, %status, %error, "Setup failed");
                return RunOutcome::with_status(status, error);
            }
            Ok(true) => {}
        }

        let run_timeout = self.config.run_timeout();
        let env = &mut self.env;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => RunOutcome::with_status(Status::Canceled, "canceled while running"),
            outcome = async {
                match run_timeout {
                    Some(limit) => tokio::time::timeout(limit, env.run()).await.unwrap_or_else(|_| {
                        RunOutcome::with_status(
                            Status::TimedOut,
                            format!("run exceeded {} ms", limit.as_millis()),
                        )
                    }),
                    None => env.run().await,
                }
            } => outcome,
        }
    }

    fn persist(
        &self,
        trial: &mut Trial,
        status: Status,
        results: Metrics,
        error: Option<String>,
        telemetry: Vec<TelemetryRecord>,
    ) -> TbResult<()> {
        // A non-terminal outcome here means the environment misreported.
        let status = if status.is_completed() { status } else { Status::Failed };
        self.storage.update_trial_status(
            &trial.experiment_id,
            trial.trial_id,
            status,
            &results,
            error.as_deref(),
            &telemetry,
        )?;
        info!(
            runner_id = self.runner_id,
            trial_id = trial.trial_id,
            %status,
            error = error.as_deref().unwrap_or(""),
            "Trial finished"
        );
        trial.mark_completed(status, results, error);
        trial.telemetry = telemetry;
        Ok(())
    }

    /// Release the environment. Safe to call when nothing is set up.
    pub async fn teardown(&mut self) {
        info!(runner_id = self.runner_id, env = %self.env.name(), "Final teardown");
        self.env.teardown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tb_env::{EnvConfig, MockEnv, MockEnvOptions, MockProbe};
    use tb_storage::NewExperiment;

    fn schema() -> TunableGroups {
        TunableGroups::from_json(&json!({
            "app": {"cost": 1, "params": {"workers": {"type": "int", "default": 4, "range": [1, 32]}}}
        }))
        .unwrap()
    }

    fn setup(options: MockEnvOptions, config: TrialRunnerConfig) -> (TrialRunner, Arc<Storage>) {
        let storage = Arc::new(Storage::in_memory().unwrap());
        storage
            .create_experiment(&NewExperiment::new("exp", "score"), &schema())
            .unwrap();
        let env = MockEnv::new(EnvConfig::new("mock"), &schema(), options).unwrap();
        let runner = TrialRunner::new(0, Box::new(env), Arc::clone(&storage), config);
        (runner, storage)
    }

    #[tokio::test]
    async fn succeeded_trial_is_persisted() {
        let probe = MockProbe::new();
        let (mut runner, storage) = setup(
            MockEnvOptions::default().with_probe(Arc::clone(&probe)),
            TrialRunnerConfig::default(),
        );
        let trial = storage.new_trial("exp", &schema().snapshot(), 0, 1).unwrap();
        let report = runner.run_trial(trial, &schema(), &RunContext::new("exp")).await.unwrap();

        assert_eq!(report.status(), Status::Succeeded);
        assert!(report.result().unwrap().contains_key("score"));
        assert_eq!(report.trial.telemetry.len(), 1);
        let stored = &storage.load_trials("exp").unwrap()[0];
        assert_eq!(stored.status, Status::Succeeded);
        assert_eq!(stored.result, report.trial.result);
        assert_eq!(stored.telemetry.len(), 1);
        // Reused, not torn down.
        assert_eq!(probe.teardowns(), 0);
        assert_eq!(runner.env().state(), EnvState::Ready);
    }

    #[tokio::test]
    async fn failed_setup_is_recorded() {
        let (mut runner, storage) = setup(MockEnvOptions::default().failing_setup([1]), TrialRunnerConfig::default());
        let trial = storage.new_trial("exp", &schema().snapshot(), 0, 1).unwrap();
        let report = runner.run_trial(trial, &schema(), &RunContext::new("exp")).await.unwrap();
        assert_eq!(report.status(), Status::Failed);
        assert!(report.result().is_none());
        assert!(report.trial.error.unwrap().contains("scripted setup failure"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_setup_times_out_and_tears_down() {
        let probe = MockProbe::new();
        let options = MockEnvOptions::default()
            .with_setup_delay(Duration::from_secs(30))
            .with_probe(Arc::clone(&probe));
        let config = TrialRunnerConfig {
            setup_timeout_ms: 5_000,
            ..TrialRunnerConfig::default()
        };
        let (mut runner, storage) = setup(options, config);
        let trial = storage.new_trial("exp", &schema().snapshot(), 0, 1).unwrap();
        let report = runner.run_trial(trial, &schema(), &RunContext::new("exp")).await.unwrap();

        assert_eq!(report.status(), Status::TimedOut);
        assert!(report.trial.error.as_deref().unwrap().contains("timed out"));
        assert_eq!(probe.setups(), 1);
        assert_eq!(probe.teardowns(), 1);
        assert_eq!(probe.events(), vec!["mock:setup", "mock:teardown"]);
        assert_eq!(runner.env().state(), EnvState::NotSetUp);
        assert_eq!(storage.load_trials("exp").unwrap()[0].status, Status::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_setup_tears_down() {
        let probe = MockProbe::new();
        let options = MockEnvOptions::default()
            .with_setup_delay(Duration::from_secs(30))
            .with_probe(Arc::clone(&probe));
        let (runner, storage) = setup(options, TrialRunnerConfig::default());
        let cancel = CancellationToken::new();
        let mut runner = runner.with_cancellation(cancel.clone());
        let trial = storage.new_trial("exp", &schema().snapshot(), 0, 1).unwrap();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
        let report = runner.run_trial(trial, &schema(), &RunContext::new("exp")).await.unwrap();
        canceller.await.unwrap();

        assert_eq!(report.status(), Status::Canceled);
        assert_eq!(probe.runs(), 0);
        assert_eq!(probe.teardowns(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_run_times_out_and_tears_down() {
        let probe = MockProbe::new();
        let options = MockEnvOptions::default()
            .with_run_delay(Duration::from_secs(60))
            .with_probe(Arc::clone(&probe));
        let config = TrialRunnerConfig {
            run_timeout_ms: Some(1_000),
            ..TrialRunnerConfig::default()
        };
        let (mut runner, storage) = setup(options, config);
        let trial = storage.new_trial("exp", &schema().snapshot(), 0, 1).unwrap();
        let report = runner.run_trial(trial, &schema(), &RunContext::new("exp")).await.unwrap();

        assert_eq!(report.status(), Status::TimedOut);
        assert_eq!(probe.teardowns(), 1);
        assert_eq!(probe.events().last().map(String::as_str), Some("mock:teardown"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_run_and_tears_down() {
        let probe = MockProbe::new();
        let options = MockEnvOptions::default()
            .with_run_delay(Duration::from_secs(60))
            .with_probe(Arc::clone(&probe));
        let (runner, storage) = setup(options, TrialRunnerConfig::default());
        let cancel = CancellationToken::new();
        let mut runner = runner.with_cancellation(cancel.clone());
        let trial = storage.new_trial("exp", &schema().snapshot(), 0, 1).unwrap();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
        let report = runner.run_trial(trial, &schema(), &RunContext::new("exp")).await.unwrap();
        canceller.await.unwrap();

        assert_eq!(report.status(), Status::Canceled);
        assert_eq!(probe.teardowns(), 1);
        assert_eq!(storage.load_trials("exp").unwrap()[0].status, Status::Canceled);
    }

    #[tokio::test]
    async fn teardown_each_trial() {
        let probe = MockProbe::new();
        let config = TrialRunnerConfig {
            teardown_each_trial: true,
            ..TrialRunnerConfig::default()
        };
        let (mut runner, storage) = setup(MockEnvOptions::default().with_probe(Arc::clone(&probe)), config);
        for _ in 0..2 {
            let trial = storage.new_trial("exp", &schema().snapshot(), 0, 1).unwrap();
            runner.run_trial(trial, &schema(), &RunContext::new("exp")).await.unwrap();
        }
        assert_eq!(probe.teardowns(), 2);
        assert_eq!(probe.setups(), 2);
    }
}
