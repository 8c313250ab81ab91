//! Ordered composition of environments (e.g. VM, then OS, then app).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use tb_types::{Metrics, RunContext, Status, TelemetryRecord, TunableGroups};

use crate::environment::{EnvError, EnvResult, EnvState, Environment, RunOutcome};

/// Runs its children in order and reports them as one environment.
///
/// Setup stops at the first failing child and tears down, in reverse order,
/// the children already set up. `set_up_count` is the number of leading
/// children that are currently set up.
pub struct CompositeEnv {
    name: String,
    children: Vec<Box<dyn Environment>>,
    tunables: TunableGroups,
    set_up_count: usize,
    state: EnvState,
    changed_at: DateTime<Utc>,
    last_error: Option<String>,
}

impl std::fmt::Debug for CompositeEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeEnv")
            .field("name", &self.name)
            .field("children", &self.children)
            .field("set_up_count", &self.set_up_count)
            .field("state", &self.state)
            .finish()
    }
}

impl CompositeEnv {
    pub fn new(name: impl Into<String>, children: Vec<Box<dyn Environment>>) -> EnvResult<Self> {
        let name = name.into();
        if children.is_empty() {
            return Err(EnvError::Composition {
                env: name,
                message: "a composite environment needs at least one child".into(),
            });
        }
        let mut tunables = TunableGroups::new();
        for child in &children {
            tunables.merge(child.tunable_params())?;
        }
        Ok(Self {
            name,
            children,
            tunables,
            set_up_count: 0,
            state: EnvState::NotSetUp,
            changed_at: Utc::now(),
            last_error: None,
        })
    }

    pub fn children(&self) -> impl Iterator<Item = &dyn Environment> {
        self.children.iter().map(|c| c.as_ref())
    }

    pub fn set_up_count(&self) -> usize {
        self.set_up_count
    }

    fn set_state(&mut self, state: EnvState) {
        if self.state != state {
            self.state = state;
            self.changed_at = Utc::now();
        }
    }

    /// Tear down children `[0, upto)` in reverse order.
    async fn teardown_prefix(&mut self, upto: usize) {
        for child in self.children[..upto].iter_mut().rev() {
            child.teardown().await;
        }
    }
}

#[async_trait]
impl Environment for CompositeEnv {
    fn name(&self) -> &str {
        &self.name
    }

    fn tunable_params(&self) -> &TunableGroups {
        &self.tunables
    }

    fn state(&self) -> EnvState {
        self.state
    }

    fn status(&self) -> (Status, DateTime<Utc>) {
        (self.state.status(), self.changed_at)
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }

    async fn setup(&mut self, tunables: &TunableGroups, ctx: &RunContext) -> bool {
        info!(env = %self.name, children = self.children.len(), "Composite setup");
        self.last_error = None;
        let previously = self.set_up_count;
        self.set_up_count = 0;

        for idx in 0..self.children.len() {
            if self.children[idx].setup(tunables, ctx).await {
                self.set_up_count = idx + 1;
                continue;
            }
            let child = &self.children[idx];
            let (child_status, _) = child.status();
            let error = format!(
                "child {} failed to set up: {}",
                child.name(),
                child.last_error().unwrap_or_else(|| "no details".into())
            );
            warn!(env = %self.name, child = %child.name(), status = %child_status, "Composite setup failed");

            // Roll back this pass plus anything still up from an earlier one.
            self.teardown_prefix(previously.max(idx)).await;
            self.set_up_count = 0;
            self.last_error = Some(error);
            let state = if child_status.is_timed_out() {
                EnvState::TimedOut
            } else {
                EnvState::Failed
            };
            self.set_state(state);
            return false;
        }
        self.set_state(EnvState::Ready);
        true
    }

    async fn run(&mut self) -> RunOutcome {
        if self.state != EnvState::Ready {
            return RunOutcome::failed(format!("environment {} is not ready", self.name));
        }
        self.set_state(EnvState::Running);

        let mut results = Metrics::new();
        let mut telemetry = Vec::new();
        let mut failure = None;
        for child in self.children.iter_mut() {
            let outcome = child.run().await;
            results.extend(outcome.results);
            telemetry.extend(outcome.telemetry);
            if !outcome.status.is_succeeded() {
                let error = format!(
                    "child {} finished {}: {}",
                    child.name(),
                    outcome.status,
                    outcome.error.unwrap_or_default()
                );
                failure = Some((outcome.status, error));
                break;
            }
        }
        if let Some((status, error)) = failure {
            self.last_error = Some(error.clone());
            self.set_state(EnvState::Failed);
            return RunOutcome {
                status,
                results,
                telemetry,
                error: Some(error),
            };
        }
        self.set_state(EnvState::Ready);
        RunOutcome::succeeded(results).with_telemetry(telemetry)
    }

    async fn telemetry(&mut self) -> Vec<TelemetryRecord> {
        let mut telemetry = Vec::new();
        for child in self.children.iter_mut() {
            telemetry.extend(child.telemetry().await);
        }
        telemetry
    }

    async fn teardown(&mut self) {
        info!(env = %self.name, "Composite teardown");
        // Every child, not just the set-up prefix: teardown is idempotent and
        // a child may have been left running by an interrupted run.
        let all = self.children.len();
        self.teardown_prefix(all).await;
        self.set_up_count = 0;
        self.set_state(EnvState::NotSetUp);
    }

    fn pprint(&self, indent: usize) -> String {
        let mut out = format!("{:indent$}{}\n", "", self.name, indent = indent);
        for child in &self.children {
            out.push_str(&child.pprint(indent + 2));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvConfig;
    use crate::mock::{MockEnv, MockEnvOptions, MockProbe};
    use serde_json::json;
    use std::sync::Arc;

    fn schema() -> TunableGroups {
        TunableGroups::from_json(&json!({
            "vm": {"cost": 100, "params": {"cores": {"type": "int", "default": 2, "range": [1, 16]}}},
            "os": {"cost": 10, "params": {"swappiness": {"type": "int", "default": 60, "range": [0, 100]}}},
            "app": {"cost": 1, "params": {"workers": {"type": "int", "default": 4, "range": [1, 32]}}}
        }))
        .unwrap()
    }

    fn child(name: &str, group: &str, options: MockEnvOptions) -> Box<dyn Environment> {
        let config = EnvConfig::new(name).with_groups([group]);
        Box::new(MockEnv::new(config, &schema(), options).unwrap())
    }

    fn three_layers(probe: &Arc<MockProbe>, failing_child: Option<&str>) -> CompositeEnv {
        let opts = |name: &str| {
            let base = MockEnvOptions::default().with_probe(Arc::clone(probe));
            if failing_child == Some(name) {
                base.failing_setup([1])
            } else {
                base
            }
        };
        CompositeEnv::new(
            "root",
            vec![
                child("vm", "vm", opts("vm")),
                child("os", "os", opts("os")),
                child("app", "app", opts("app")),
            ],
        )
        .unwrap()
    }

    #[test]
    fn empty_composite_is_rejected() {
        let err = CompositeEnv::new("root", Vec::new()).unwrap_err();
        assert!(matches!(err, EnvError::Composition { .. }));
    }

    #[test]
    fn tunables_are_merged_from_children() {
        let env = three_layers(&MockProbe::new(), None);
        assert_eq!(env.tunable_params().len(), 3);
        assert!(env.tunable_params().contains("swappiness"));
        assert_eq!(env.pprint(0), "root\n  vm\n  os\n  app\n");
    }

    #[tokio::test]
    async fn failing_middle_child_rolls_back_prefix_only() {
        let probe = MockProbe::new();
        let mut env = three_layers(&probe, Some("os"));

        assert!(!env.setup(&schema(), &RunContext::new("exp")).await);
        assert_eq!(
            probe.events(),
            vec!["vm:setup", "os:setup", "os:setup_failed", "vm:teardown"]
        );
        assert_eq!(env.set_up_count(), 0);
        assert_eq!(env.state(), EnvState::Failed);
        assert!(env.last_error().unwrap().contains("os"));
    }

    #[tokio::test]
    async fn runs_all_children_and_merges_results() {
        let probe = MockProbe::new();
        let vm = child(
            "vm",
            "vm",
            MockEnvOptions {
                metric: "vm_score".into(),
                ..MockEnvOptions::default().with_probe(Arc::clone(&probe))
            },
        );
        let app = child("app", "app", MockEnvOptions::default().with_probe(Arc::clone(&probe)));
        let mut env = CompositeEnv::new("root", vec![vm, app]).unwrap();

        assert!(env.setup(&schema(), &RunContext::new("exp")).await);
        assert_eq!(env.set_up_count(), 2);
        let outcome = env.run().await;
        assert_eq!(outcome.status, Status::Succeeded);
        assert!(outcome.results.contains_key("vm_score"));
        assert!(outcome.results.contains_key("score"));
        assert_eq!(outcome.telemetry.len(), 2);

        env.teardown().await;
        assert_eq!(probe.teardowns(), 2);
        let events = probe.events();
        assert_eq!(&events[events.len() - 2..], ["app:teardown", "vm:teardown"]);
    }

    #[tokio::test]
    async fn failing_child_run_short_circuits() {
        let probe = MockProbe::new();
        let vm = child(
            "vm",
            "vm",
            MockEnvOptions::default().failing_run([1]).with_probe(Arc::clone(&probe)),
        );
        let app = child("app", "app", MockEnvOptions::default().with_probe(Arc::clone(&probe)));
        let mut env = CompositeEnv::new("root", vec![vm, app]).unwrap();

        assert!(env.setup(&schema(), &RunContext::new("exp")).await);
        let outcome = env.run().await;
        assert_eq!(outcome.status, Status::Failed);
        assert!(!probe.events().contains(&"app:run".to_string()));
    }
}
