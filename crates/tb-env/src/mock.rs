//! Scheduler-side environment that synthesizes benchmark results.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use tb_types::{Metrics, RunContext, Status, TelemetryRecord, TunableGroups};

use crate::environment::{EnvBase, EnvConfig, EnvResult, EnvState, Environment, RunOutcome};

/// Standard deviation of the noise added to the synthetic score.
const NOISE_STDDEV: f64 = 0.2;

/// Shared counters for observing mock environments from a test.
#[derive(Debug, Default)]
pub struct MockProbe {
    setups: AtomicUsize,
    runs: AtomicUsize,
    teardowns: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    events: Mutex<Vec<String>>,
}

impl MockProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn setups(&self) -> usize {
        self.setups.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    /// Highest number of environments seen inside setup or run at once.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// `"<env>:<event>"` entries in the order they happened.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn record(&self, env: &str, event: &str) {
        self.events.lock().push(format!("{env}:{event}"));
    }

    fn enter(self: &Arc<Self>) -> ActiveGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        ActiveGuard(Arc::clone(self))
    }
}

/// Decrements the active count even when the enclosing future is dropped.
struct ActiveGuard(Arc<MockProbe>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Knobs of a [`MockEnv`].
#[derive(Debug, Clone)]
pub struct MockEnvOptions {
    /// Seed for the score noise; no noise without a seed.
    pub seed: Option<u64>,
    /// Map the score from `[0, 1]` onto this range.
    pub range: Option<(f64, f64)>,
    pub metric: String,
    /// 1-based setup calls that fail.
    pub fail_setup_calls: BTreeSet<u32>,
    /// 1-based run calls that fail.
    pub fail_run_calls: BTreeSet<u32>,
    /// 1-based run calls that panic, for exercising runner supervision.
    pub panic_run_calls: BTreeSet<u32>,
    pub setup_delay: Duration,
    pub run_delay: Duration,
    pub probe: Option<Arc<MockProbe>>,
}

impl Default for MockEnvOptions {
    fn default() -> Self {
        Self {
            seed: None,
            range: None,
            metric: "score".to_string(),
            fail_setup_calls: BTreeSet::new(),
            fail_run_calls: BTreeSet::new(),
            panic_run_calls: BTreeSet::new(),
            setup_delay: Duration::ZERO,
            run_delay: Duration::ZERO,
            probe: None,
        }
    }
}

impl MockEnvOptions {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_range(mut self, low: f64, high: f64) -> Self {
        self.range = Some((low, high));
        self
    }

    pub fn failing_setup(mut self, calls: impl IntoIterator<Item = u32>) -> Self {
        self.fail_setup_calls.extend(calls);
        self
    }

    pub fn failing_run(mut self, calls: impl IntoIterator<Item = u32>) -> Self {
        self.fail_run_calls.extend(calls);
        self
    }

    pub fn panicking_run(mut self, calls: impl IntoIterator<Item = u32>) -> Self {
        self.panic_run_calls.extend(calls);
        self
    }

    pub fn with_setup_delay(mut self, delay: Duration) -> Self {
        self.setup_delay = delay;
        self
    }

    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    pub fn with_probe(mut self, probe: Arc<MockProbe>) -> Self {
        self.probe = Some(probe);
        self
    }
}

/// Produces a deterministic score from the normalized tunable values: the
/// mean of their squares, optionally with seeded Gaussian noise.
#[derive(Debug)]
pub struct MockEnv {
    base: EnvBase,
    options: MockEnvOptions,
    rng: Option<ChaCha8Rng>,
    setup_calls: u32,
    run_calls: u32,
}

impl MockEnv {
    pub fn new(config: EnvConfig, tunables: &TunableGroups, options: MockEnvOptions) -> EnvResult<Self> {
        let base = EnvBase::new(config, tunables)?;
        let rng = options.seed.map(ChaCha8Rng::seed_from_u64);
        Ok(Self {
            base,
            options,
            rng,
            setup_calls: 0,
            run_calls: 0,
        })
    }

    fn score(&mut self) -> f64 {
        let normalized: Vec<f64> = self
            .base
            .tunables()
            .iter()
            .map(|(tunable, _)| tunable.normalized())
            .collect();
        let mut score = if normalized.is_empty() {
            0.0
        } else {
            normalized.iter().map(|v| v * v).sum::<f64>() / normalized.len() as f64
        };
        if let Some(rng) = self.rng.as_mut() {
            score += gaussian(rng) * NOISE_STDDEV;
        }
        let score = score.clamp(0.0, 1.0);
        match self.options.range {
            Some((low, high)) => low + score * (high - low),
            None => score,
        }
    }

    fn record(&self, event: &str) {
        if let Some(probe) = &self.options.probe {
            probe.record(self.base.name(), event);
        }
    }
}

/// Standard normal sample via the Box-Muller transform.
fn gaussian(rng: &mut ChaCha8Rng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

#[async_trait]
impl Environment for MockEnv {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn tunable_params(&self) -> &TunableGroups {
        self.base.tunables()
    }

    fn state(&self) -> EnvState {
        self.base.state()
    }

    fn status(&self) -> (Status, DateTime<Utc>) {
        self.base.status()
    }

    fn last_error(&self) -> Option<String> {
        self.base.last_error()
    }

    async fn setup(&mut self, tunables: &TunableGroups, ctx: &RunContext) -> bool {
        self.setup_calls += 1;
        let _active = self.options.probe.as_ref().map(MockProbe::enter);
        if let Some(probe) = &self.options.probe {
            probe.setups.fetch_add(1, Ordering::SeqCst);
        }
        self.record("setup");

        let reconfigure = match self.base.apply(tunables, ctx) {
            Ok(reconfigure) => reconfigure,
            Err(e) => return self.base.fail(EnvState::Failed, e.to_string()),
        };
        self.base.begin_setup();
        if !self.options.setup_delay.is_zero() {
            tokio::time::sleep(self.options.setup_delay).await;
        }
        if self.options.fail_setup_calls.contains(&self.setup_calls) {
            self.record("setup_failed");
            return self
                .base
                .fail(EnvState::Failed, format!("scripted setup failure #{}", self.setup_calls));
        }
        info!(env = %self.base.name(), reconfigure, "Mock setup");
        self.base.mark_deployed();
        true
    }

    async fn run(&mut self) -> RunOutcome {
        if self.base.state() != EnvState::Ready {
            return RunOutcome::failed(format!("environment {} is not ready", self.base.name()));
        }
        self.run_calls += 1;
        let _active = self.options.probe.as_ref().map(MockProbe::enter);
        if let Some(probe) = &self.options.probe {
            probe.runs.fetch_add(1, Ordering::SeqCst);
        }
        self.record("run");
        self.base.set_state(EnvState::Running);

        if !self.options.run_delay.is_zero() {
            tokio::time::sleep(self.options.run_delay).await;
        }
        if self.options.panic_run_calls.contains(&self.run_calls) {
            panic!("scripted run panic #{}", self.run_calls);
        }
        if self.options.fail_run_calls.contains(&self.run_calls) {
            self.base.fail(EnvState::Failed, format!("scripted run failure #{}", self.run_calls));
            return RunOutcome::failed(self.base.last_error().unwrap_or_default());
        }

        let score = self.score();
        let telemetry = vec![TelemetryRecord::now(self.options.metric.clone(), score)];
        self.base.set_telemetry(telemetry.clone());
        // Ready again so the next trial can reuse the environment.
        self.base.set_state(EnvState::Ready);

        let mut results = Metrics::new();
        results.insert(self.options.metric.clone(), score);
        RunOutcome::succeeded(results).with_telemetry(telemetry)
    }

    async fn telemetry(&mut self) -> Vec<TelemetryRecord> {
        self.base.telemetry()
    }

    async fn teardown(&mut self) {
        if self.base.state() == EnvState::NotSetUp {
            return;
        }
        if let Some(probe) = &self.options.probe {
            probe.teardowns.fetch_add(1, Ordering::SeqCst);
        }
        self.record("teardown");
        self.base.mark_torn_down();
    }
}
