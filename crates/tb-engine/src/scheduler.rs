//! Trial scheduling: suggest, persist, dispatch to runners, register.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tb_env::Environment;
use tb_optimizer::{Observation, Optimizer};
use tb_storage::{NewExperiment, Storage};
use tb_types::{
    config_error, internal_error, ConfigId, Metrics, RunContext, Status, StorageError, TbError, TbResult, Trial,
    TunableGroups,
};

use crate::trial_runner::{TrialReport, TrialRunner, TrialRunnerConfig};

/// How trials are spread over runners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    /// One runner, one trial at a time.
    #[default]
    Sync,
    /// Every runner busy at once, trials handed out round-robin.
    Cyclic,
}

impl fmt::Display for SchedulingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulingPolicy::Sync => f.write_str("sync"),
            SchedulingPolicy::Cyclic => f.write_str("cyclic"),
        }
    }
}

fn default_repeat() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub experiment_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub policy: SchedulingPolicy,
    /// Trials started by this run, resumed ones included. Unlimited when unset.
    #[serde(default)]
    pub max_trials: Option<usize>,
    /// Each suggestion is scheduled this many times.
    #[serde(default = "default_repeat")]
    pub trial_config_repeat_count: u32,
    /// Re-run this stored configuration before asking the optimizer.
    #[serde(default)]
    pub start_config_id: Option<ConfigId>,
    /// Tear every environment down when the run ends.
    #[serde(default = "default_true")]
    pub teardown: bool,
    #[serde(default)]
    pub runner: TrialRunnerConfig,
}

impl SchedulerConfig {
    pub fn new(experiment_id: impl Into<String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            description: String::new(),
            policy: SchedulingPolicy::Sync,
            max_trials: None,
            trial_config_repeat_count: 1,
            start_config_id: None,
            teardown: true,
            runner: TrialRunnerConfig::default(),
        }
    }

    pub fn with_policy(mut self, policy: SchedulingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_trials(mut self, max_trials: usize) -> Self {
        self.max_trials = Some(max_trials);
        self
    }

    pub fn with_repeat_count(mut self, repeat: u32) -> Self {
        self.trial_config_repeat_count = repeat;
        self
    }

    pub fn with_start_config(mut self, config_id: ConfigId) -> Self {
        self.start_config_id = Some(config_id);
        self
    }

    pub fn with_runner_config(mut self, runner: TrialRunnerConfig) -> Self {
        self.runner = runner;
        self
    }
}

/// Outcome of a whole scheduling run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub experiment_id: String,
    pub target: String,
    pub trials: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub canceled: usize,
    pub best: Option<(TunableGroups, f64)>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    fn new(experiment_id: &str, target: &str) -> Self {
        let now = Utc::now();
        Self {
            experiment_id: experiment_id.to_string(),
            target: target.to_string(),
            trials: 0,
            succeeded: 0,
            failed: 0,
            timed_out: 0,
            canceled: 0,
            best: None,
            started_at: now,
            finished_at: now,
        }
    }

    fn count(&mut self, status: Status) {
        self.trials += 1;
        match status {
            Status::Succeeded => self.succeeded += 1,
            Status::TimedOut => self.timed_out += 1,
            Status::Canceled => self.canceled += 1,
            _ => self.failed += 1,
        }
    }

    /// A run fails only when it ran trials and none of them succeeded.
    pub fn is_success(&self) -> bool {
        self.trials == 0 || self.succeeded > 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} trials ({} succeeded, {} failed, {} timed out, {} canceled)",
            self.experiment_id, self.trials, self.succeeded, self.failed, self.timed_out, self.canceled
        )?;
        match &self.best {
            Some((tunables, score)) => write!(f, "; best {}={} at {}", self.target, score, tunables.snapshot()),
            None => write!(f, "; no successful observation"),
        }
    }
}

/// A trial waiting for a runner. Fresh trials get their storage row only
/// when they are dispatched.
enum Queued {
    Stored(Trial),
    Fresh { repeat_i: u32 },
}

struct Pending {
    queued: Queued,
    tunables: TunableGroups,
}

struct Assignment {
    trial: Trial,
    tunables: TunableGroups,
}

/// What a runner task sends back after each assignment.
struct Finished {
    runner_id: usize,
    trial: Trial,
    tunables: TunableGroups,
    report: TbResult<TrialReport>,
    /// The runner task panicked and will take no more trials.
    lost: bool,
}

struct RunnerSlot {
    tx: mpsc::Sender<Assignment>,
    handle: JoinHandle<Option<TrialRunner>>,
    busy: bool,
    lost: bool,
}

/// Runs the optimization loop over a set of trial runners.
///
/// All optimizer and bookkeeping calls happen on the task that awaits
/// [`Scheduler::run`]; each runner owns its environment on its own task.
pub struct Scheduler {
    config: SchedulerConfig,
    storage: Arc<Storage>,
    optimizer: Box<dyn Optimizer>,
    envs: Vec<Box<dyn Environment>>,
    ctx: RunContext,
    cancel: CancellationToken,
    queue: VecDeque<Pending>,
    started: usize,
}

impl Scheduler {
    /// `envs` holds one environment per runner: exactly one for the sync
    /// policy, at least one for cyclic.
    pub fn new(
        config: SchedulerConfig,
        storage: Arc<Storage>,
        optimizer: Box<dyn Optimizer>,
        envs: Vec<Box<dyn Environment>>,
        ctx: RunContext,
    ) -> TbResult<Self> {
        match (config.policy, envs.len()) {
            (_, 0) => return Err(config_error!("at least one trial runner environment is required")),
            (SchedulingPolicy::Sync, n) if n > 1 => {
                return Err(config_error!("sync scheduling uses one trial runner, got {n}"))
            }
            _ => {}
        }
        if config.trial_config_repeat_count == 0 {
            return Err(config_error!("trial_config_repeat_count must be at least 1"));
        }
        Ok(Self {
            config,
            storage,
            optimizer,
            envs,
            ctx,
            cancel: CancellationToken::new(),
            queue: VecDeque::new(),
            started: 0,
        })
    }

    /// Cancelling this token stops scheduling and interrupts running trials.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn schema(&self) -> &TunableGroups {
        self.optimizer.tunable_params()
    }

    fn tunables_for(&self, trial: &Trial) -> TbResult<TunableGroups> {
        let mut tunables = self.schema().clone();
        tunables.assign(trial.tunables.iter())?;
        Ok(tunables)
    }

    fn within_budget(&self) -> bool {
        self.config.max_trials.map_or(true, |max| self.started < max)
    }

    /// Register finished trials with the optimizer and queue the ones an
    /// interrupted run left behind.
    fn resume(&mut self) -> TbResult<()> {
        let exp_id = self.config.experiment_id.clone();
        let trials = self.storage.load_trials(&exp_id)?;
        let completed: Vec<Observation> = trials
            .iter()
            .filter(|t| t.is_completed())
            .map(Observation::from)
            .collect();
        if !completed.is_empty() {
            info!(experiment_id = %exp_id, trials = completed.len(), "Loading completed trials");
            self.optimizer.bulk_register(&completed)?;
        }
        for trial in trials.into_iter().filter(|t| !t.is_completed()) {
            info!(experiment_id = %exp_id, trial_id = trial.trial_id, status = %trial.status, "Resuming trial");
            let tunables = self.tunables_for(&trial)?;
            self.queue.push_back(Pending {
                queued: Queued::Stored(trial),
                tunables,
            });
        }

        if let Some(config_id) = self.config.start_config_id {
            let snapshot = self.storage.load_tunable_config(config_id)?;
            let mut tunables = self.schema().clone();
            tunables.assign(snapshot.iter())?;
            info!(config_id, "Starting from stored configuration");
            self.enqueue(tunables);
        }
        Ok(())
    }

    /// Queue `trial_config_repeat_count` trials for `tunables`.
    fn enqueue(&mut self, tunables: TunableGroups) {
        for repeat_i in 1..=self.config.trial_config_repeat_count {
            self.queue.push_back(Pending {
                queued: Queued::Fresh { repeat_i },
                tunables: tunables.clone(),
            });
        }
    }

    /// Next trial for runner `runner_id`, persisted and bound to that runner.
    fn next_assignment(&mut self, runner_id: usize) -> TbResult<Option<Assignment>> {
        if self.cancel.is_cancelled() || !self.within_budget() {
            return Ok(None);
        }
        if self.queue.is_empty() && self.optimizer.not_converged() {
            let tunables = self.optimizer.suggest()?;
            self.enqueue(tunables);
        }
        let Some(Pending { queued, tunables }) = self.queue.pop_front() else {
            return Ok(None);
        };
        let exp_id = &self.config.experiment_id;
        let trial = match queued {
            Queued::Fresh { repeat_i } => {
                self.storage.new_trial(exp_id, &tunables.snapshot(), runner_id, repeat_i)?
            }
            Queued::Stored(mut trial) => {
                if trial.runner_id != runner_id {
                    self.storage.set_trial_runner(exp_id, trial.trial_id, runner_id)?;
                    trial.runner_id = runner_id;
                }
                trial
            }
        };
        Ok(Some(Assignment { trial, tunables }))
    }

    /// Stored trials that will not run in this session are closed as
    /// canceled so no row is left pending.
    fn cancel_leftovers(&mut self) -> TbResult<()> {
        for pending in std::mem::take(&mut self.queue) {
            if let Queued::Stored(trial) = pending.queued {
                warn!(trial_id = trial.trial_id, "Canceling trial that was not started");
                self.storage.update_trial_status(
                    &self.config.experiment_id,
                    trial.trial_id,
                    Status::Canceled,
                    &Metrics::new(),
                    Some("not started before the scheduler stopped"),
                    &[],
                )?;
            }
        }
        Ok(())
    }

    /// Close a trial whose runner failed without persisting an outcome.
    fn fail_trial(&mut self, trial: &Trial, tunables: &TunableGroups, error: &TbError) -> TbResult<()> {
        let message = error.to_string();
        match self.storage.update_trial_status(
            &self.config.experiment_id,
            trial.trial_id,
            Status::Failed,
            &Metrics::new(),
            Some(&message),
            &[],
        ) {
            Ok(()) | Err(TbError::Storage(StorageError::AlreadyFinalized { .. })) => {}
            Err(e) => return Err(e),
        }
        self.optimizer.register(tunables, Status::Failed, None);
        Ok(())
    }

    fn spawn_runners(&mut self, results: &mpsc::Sender<Finished>) -> Vec<RunnerSlot> {
        std::mem::take(&mut self.envs)
            .into_iter()
            .enumerate()
            .map(|(runner_id, env)| {
                let mut runner = TrialRunner::new(
                    runner_id,
                    env,
                    Arc::clone(&self.storage),
                    self.config.runner.clone(),
                )
                .with_cancellation(self.cancel.child_token());
                let (tx, mut rx) = mpsc::channel::<Assignment>(1);
                let results = results.clone();
                let ctx = self.ctx.clone();
                let handle = tokio::spawn(async move {
                    while let Some(Assignment { trial, tunables }) = rx.recv().await {
                        // Each trial runs on its own task so a panic is
                        // reported back instead of silencing this runner.
                        let attempt = {
                            let (trial, tunables, ctx) = (trial.clone(), tunables.clone(), ctx.clone());
                            tokio::spawn(async move {
                                let report = runner.run_trial(trial, &tunables, &ctx).await;
                                (runner, report)
                            })
                        };
                        let (report, back) = match attempt.await {
                            Ok((back, report)) => (report, Some(back)),
                            Err(e) => (Err(internal_error!("trial runner {runner_id} panicked: {e}")), None),
                        };
                        let finished = Finished {
                            runner_id,
                            trial,
                            tunables,
                            report,
                            lost: back.is_none(),
                        };
                        let delivered = results.send(finished).await.is_ok();
                        match back {
                            Some(back) if delivered => runner = back,
                            back => return back,
                        }
                    }
                    Some(runner)
                });
                RunnerSlot {
                    tx,
                    handle,
                    busy: false,
                    lost: false,
                }
            })
            .collect()
    }

    /// Next idle runner at or after `cursor`, wrapping around.
    fn pick_runner(slots: &[RunnerSlot], cursor: usize) -> Option<usize> {
        (0..slots.len())
            .map(|offset| (cursor + offset) % slots.len())
            .find(|&idx| !slots[idx].busy && !slots[idx].lost)
    }

    pub async fn run(mut self) -> TbResult<RunSummary> {
        let exp_id = self.config.experiment_id.clone();
        let root_env = self.envs.first().map(|env| env.name().to_string()).unwrap_or_default();
        let new = NewExperiment::new(exp_id.clone(), self.optimizer.target())
            .with_description(self.config.description.clone())
            .with_direction(self.optimizer.direction())
            .with_root_env(root_env);
        self.storage.create_experiment(&new, self.schema())?;
        self.resume()?;

        info!(
            experiment_id = %exp_id,
            policy = %self.config.policy,
            runners = self.envs.len(),
            optimizer = self.optimizer.name(),
            "Scheduler started"
        );
        let mut summary = RunSummary::new(&exp_id, self.optimizer.target());

        let (results_tx, mut results_rx) = mpsc::channel::<Finished>(self.envs.len());
        let mut slots = self.spawn_runners(&results_tx);
        drop(results_tx);

        let mut cursor = 0;
        let mut in_flight = 0;
        let mut fatal: Option<TbError> = None;
        loop {
            while fatal.is_none() {
                let Some(idx) = Self::pick_runner(&slots, cursor) else { break };
                let assignment = match self.next_assignment(idx) {
                    Ok(Some(assignment)) => assignment,
                    Ok(None) => break,
                    Err(e) => {
                        fatal = Some(e);
                        break;
                    }
                };
                let trial_id = assignment.trial.trial_id;
                if slots[idx].tx.send(assignment).await.is_err() {
                    fatal = Some(internal_error!("trial runner {idx} stopped unexpectedly"));
                    break;
                }
                info!(trial_id, runner_id = idx, "Assigned trial");
                slots[idx].busy = true;
                in_flight += 1;
                self.started += 1;
                cursor = (idx + 1) % slots.len();
            }
            let work_left = self.within_budget()
                && !self.cancel.is_cancelled()
                && (!self.queue.is_empty() || self.optimizer.not_converged());
            if fatal.is_none() && in_flight == 0 && work_left && slots.iter().all(|slot| slot.lost) {
                fatal = Some(internal_error!("every trial runner was lost"));
            }
            if fatal.is_some() {
                self.cancel.cancel();
            }
            if in_flight == 0 {
                break;
            }

            let Some(finished) = results_rx.recv().await else {
                if fatal.is_none() {
                    fatal = Some(internal_error!("all trial runners stopped unexpectedly"));
                }
                break;
            };
            let Finished {
                runner_id,
                trial,
                tunables,
                report,
                lost,
            } = finished;
            slots[runner_id].busy = false;
            slots[runner_id].lost = lost;
            in_flight -= 1;
            match report {
                Ok(report) => {
                    summary.count(report.status());
                    let score = self.optimizer.register(&report.tunables, report.status(), report.result());
                    info!(
                        trial_id = report.trial.trial_id,
                        runner_id,
                        status = %report.status(),
                        score = score.unwrap_or(f64::NAN),
                        "Registered trial"
                    );
                }
                Err(e) if e.is_fatal() => {
                    error!(runner_id, trial_id = trial.trial_id, error = %e, "Fatal error from trial runner");
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
                Err(e) => {
                    warn!(runner_id, trial_id = trial.trial_id, lost, error = %e, "Trial failed in its runner");
                    summary.count(Status::Failed);
                    if let Err(e) = self.fail_trial(&trial, &tunables, &e) {
                        fatal.get_or_insert(e);
                    }
                }
            }
        }

        if let Err(e) = self.cancel_leftovers() {
            fatal.get_or_insert(e);
        }

        // Dropping the senders ends every runner loop.
        let handles: Vec<JoinHandle<Option<TrialRunner>>> = slots.into_iter().map(|slot| slot.handle).collect();
        for handle in handles {
            match handle.await {
                Ok(Some(mut runner)) if self.config.teardown => runner.teardown().await,
                Ok(Some(_)) => {}
                Ok(None) => warn!("Trial runner was lost to a panic, its environment was not torn down"),
                Err(e) => warn!(error = %e, "Trial runner task panicked"),
            }
        }

        summary.best = self.optimizer.get_best_observation();
        summary.finished_at = Utc::now();
        if let Some(e) = fatal {
            error!(experiment_id = %exp_id, error = %e, "Scheduler stopped");
            return Err(e);
        }
        info!(experiment_id = %exp_id, "{summary}");
        Ok(summary)
    }
}
