//! The environment state machine and the bookkeeping every environment shares.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

use tb_services::{Capability, Params, Services};
use tb_types::{
    Metrics, RunContext, Status, TbError, TbResult, TelemetryRecord, TunableError, TunableGroups,
    TunableMap, TunableValue,
};

/// Errors raised while building an environment.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("environment {env} requires the {capability} service")]
    MissingCapability { env: String, capability: Capability },

    #[error("invalid configuration for environment {env}: {message}")]
    InvalidConfig { env: String, message: String },

    #[error("composite environment {env}: {message}")]
    Composition { env: String, message: String },

    #[error(transparent)]
    Tunable(#[from] TunableError),
}

pub type EnvResult<T> = Result<T, EnvError>;

impl From<EnvError> for TbError {
    fn from(err: EnvError) -> Self {
        match err {
            EnvError::Tunable(e) => TbError::Tunable(e),
            other @ EnvError::Composition { .. } => TbError::Composition(other.to_string()),
            other => TbError::Config(other.to_string()),
        }
    }
}

/// Lifecycle state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvState {
    NotSetUp,
    /// Setup has started touching the target but has not finished.
    SettingUp,
    Ready,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Canceled,
}

impl EnvState {
    pub fn status(self) -> Status {
        match self {
            EnvState::NotSetUp | EnvState::SettingUp => Status::Pending,
            EnvState::Ready => Status::Ready,
            EnvState::Running => Status::Running,
            EnvState::Succeeded => Status::Succeeded,
            EnvState::Failed => Status::Failed,
            EnvState::TimedOut => Status::TimedOut,
            EnvState::Canceled => Status::Canceled,
        }
    }

    /// The target is deployed and can accept a run.
    pub fn is_set_up(self) -> bool {
        !matches!(
            self,
            EnvState::NotSetUp | EnvState::SettingUp | EnvState::Failed | EnvState::TimedOut
        )
    }
}

/// Result of one [`Environment::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: Status,
    pub results: Metrics,
    pub telemetry: Vec<TelemetryRecord>,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn succeeded(results: Metrics) -> Self {
        Self {
            status: Status::Succeeded,
            results,
            telemetry: Vec::new(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::with_status(Status::Failed, error)
    }

    pub fn with_status(status: Status, error: impl Into<String>) -> Self {
        Self {
            status,
            results: Metrics::new(),
            telemetry: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Vec<TelemetryRecord>) -> Self {
        self.telemetry = telemetry;
        self
    }
}

/// Declarative part of an environment definition shared by all kinds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Constant parameters. Globals of the same name take precedence.
    #[serde(default)]
    pub const_args: Map<String, Value>,
    /// Parameters that must be supplied by `const_args` or the globals.
    #[serde(default)]
    pub required_args: Vec<String>,
    /// Covariant groups this environment owns. Empty means all of them.
    #[serde(default)]
    pub tunable_params: Vec<String>,
}

impl EnvConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_groups<S: Into<String>>(mut self, groups: impl IntoIterator<Item = S>) -> Self {
        self.tunable_params = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_const_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.const_args.insert(key.into(), value.into());
        self
    }

    pub fn with_required_arg(mut self, key: impl Into<String>) -> Self {
        self.required_args.push(key.into());
        self
    }
}

/// A benchmark target driven through setup, run and teardown.
///
/// Operational failures never surface as `Err` or panics: `setup` answers
/// `false` and `run` answers a non-succeeded [`RunOutcome`].
#[async_trait]
pub trait Environment: Send + Sync {
    fn name(&self) -> &str;

    /// The covariant groups this environment is configured by.
    fn tunable_params(&self) -> &TunableGroups;

    fn state(&self) -> EnvState;

    /// Current status and the time it was entered.
    fn status(&self) -> (Status, DateTime<Utc>);

    /// Why the last setup or run failed.
    fn last_error(&self) -> Option<String>;

    async fn setup(&mut self, tunables: &TunableGroups, ctx: &RunContext) -> bool;

    async fn run(&mut self) -> RunOutcome;

    /// Telemetry collected by the last run.
    async fn telemetry(&mut self) -> Vec<TelemetryRecord>;

    /// Release the target. A no-op when nothing is set up.
    async fn teardown(&mut self);

    fn pprint(&self, indent: usize) -> String {
        format!("{:indent$}{}\n", "", self.name(), indent = indent)
    }
}

impl fmt::Debug for dyn Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Environment({})", self.name())
    }
}

/// State shared by every environment implementation.
#[derive(Debug, Clone)]
pub struct EnvBase {
    config: EnvConfig,
    tunables: TunableGroups,
    params: Params,
    state: EnvState,
    changed_at: DateTime<Utc>,
    last_error: Option<String>,
    telemetry: Vec<TelemetryRecord>,
    deployed: bool,
}

impl EnvBase {
    pub fn new(config: EnvConfig, tunables: &TunableGroups) -> EnvResult<Self> {
        if config.name.trim().is_empty() {
            return Err(EnvError::InvalidConfig {
                env: config.name.clone(),
                message: "environment name must not be empty".into(),
            });
        }
        let own = if config.tunable_params.is_empty() {
            tunables.clone()
        } else {
            tunables.subgroup(&config.tunable_params)?
        };
        Ok(Self {
            config,
            tunables: own,
            params: Params::new(),
            state: EnvState::NotSetUp,
            changed_at: Utc::now(),
            last_error: None,
            telemetry: Vec::new(),
            deployed: false,
        })
    }

    /// Fail construction if `services` lacks any of `required`.
    pub fn require(&self, services: &Services, required: &[Capability]) -> EnvResult<()> {
        match services.first_missing(required) {
            Some(capability) => Err(EnvError::MissingCapability {
                env: self.config.name.clone(),
                capability,
            }),
            None => Ok(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn tunables(&self) -> &TunableGroups {
        &self.tunables
    }

    /// Tunable values merged with the resolved constant arguments.
    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn state(&self) -> EnvState {
        self.state
    }

    pub fn status(&self) -> (Status, DateTime<Utc>) {
        (self.state.status(), self.changed_at)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }

    pub fn telemetry(&self) -> Vec<TelemetryRecord> {
        self.telemetry.clone()
    }

    pub fn set_telemetry(&mut self, telemetry: Vec<TelemetryRecord>) {
        self.telemetry = telemetry;
    }

    pub fn set_state(&mut self, state: EnvState) {
        if self.state != state {
            debug!(env = %self.config.name, from = ?self.state, to = ?state, "State change");
            self.state = state;
            self.changed_at = Utc::now();
        }
    }

    /// Record a setup or run failure. Always returns `false`.
    pub fn fail(&mut self, state: EnvState, error: impl Into<String>) -> bool {
        let error = error.into();
        info!(env = %self.config.name, state = ?state, error = %error, "Environment failed");
        self.last_error = Some(error);
        self.set_state(state);
        false
    }

    /// Take this environment's tunables from `tunables` and resolve the
    /// parameters against `ctx`.
    ///
    /// Returns `true` when the target has to be (re)configured: nothing is
    /// deployed yet or one of the owned groups changed since the last
    /// [`mark_deployed`](Self::mark_deployed).
    pub fn apply(&mut self, tunables: &TunableGroups, ctx: &RunContext) -> TbResult<bool> {
        self.last_error = None;
        let incoming: TunableMap = tunables
            .values()
            .into_iter()
            .filter(|(name, _)| self.tunables.contains(name))
            .collect();
        self.tunables.assign(&incoming)?;

        let mut params = ctx.merge_into(&self.config.const_args, &self.config.required_args)?;
        for (name, value) in self.tunables.values() {
            params.insert(name, tunable_json(&value));
        }
        self.params = params;
        Ok(!self.deployed || self.tunables.is_updated())
    }

    /// Call before the first side effect of a setup, so that a setup which
    /// is interrupted part way still gets torn down.
    pub fn begin_setup(&mut self) {
        if !self.state.is_set_up() {
            self.set_state(EnvState::SettingUp);
        }
    }

    /// The current tunables are now live on the target.
    pub fn mark_deployed(&mut self) {
        self.tunables.reset();
        self.deployed = true;
        self.set_state(EnvState::Ready);
    }

    /// Forget the deployment; the next setup reconfigures from scratch.
    pub fn mark_torn_down(&mut self) {
        self.deployed = false;
        self.set_state(EnvState::NotSetUp);
    }

    /// Parameters rendered as environment variables for scripts.
    pub fn env_vars(&self) -> BTreeMap<String, String> {
        self.params
            .iter()
            .map(|(k, v)| {
                let text = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), text)
            })
            .collect()
    }
}

fn tunable_json(value: &TunableValue) -> Value {
    match value {
        TunableValue::Int(v) => Value::from(*v),
        TunableValue::Float(v) => Value::from(*v),
        TunableValue::Categorical(v) => Value::from(v.as_str()),
    }
}

/// Parse benchmark output into metrics.
///
/// Accepts `name=value` lines and lines holding a JSON object; anything
/// that does not yield a number is ignored.
pub fn parse_results(stdout: &str) -> Metrics {
    let mut metrics = Metrics::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.starts_with('{') {
            if let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(line) {
                for (name, value) in fields {
                    if let Some(v) = value.as_f64() {
                        metrics.insert(name, v);
                    }
                }
            }
            continue;
        }
        if let Some((name, value)) = line.split_once('=') {
            if let Ok(v) = value.trim().parse::<f64>() {
                metrics.insert(name.trim().to_string(), v);
            }
        }
    }
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> TunableGroups {
        TunableGroups::from_json(&json!({
            "os": {
                "cost": 10,
                "params": {
                    "swappiness": {"type": "int", "default": 60, "range": [0, 100]}
                }
            },
            "app": {
                "cost": 1,
                "params": {
                    "mode": {"type": "categorical", "default": "fast", "values": ["fast", "safe"]}
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn base_owns_only_named_groups() {
        let base = EnvBase::new(EnvConfig::new("os-env").with_groups(["os"]), &schema()).unwrap();
        assert!(base.tunables().contains("swappiness"));
        assert!(!base.tunables().contains("mode"));

        let err = EnvBase::new(EnvConfig::new("bad").with_groups(["gpu"]), &schema()).unwrap_err();
        assert!(matches!(err, EnvError::Tunable(TunableError::UnknownGroup { .. })));
    }

    #[test]
    fn apply_reports_reconfiguration_need() {
        let schema = schema();
        let ctx = RunContext::new("exp");
        let mut base = EnvBase::new(EnvConfig::new("os-env").with_groups(["os"]), &schema).unwrap();

        assert!(base.apply(&schema, &ctx).unwrap());
        base.mark_deployed();
        assert!(!base.apply(&schema, &ctx).unwrap());

        // A change in a group the environment does not own is invisible.
        let mut other = schema.clone();
        other.set("mode", "safe").unwrap();
        assert!(!base.apply(&other, &ctx).unwrap());

        other.set("swappiness", 10).unwrap();
        assert!(base.apply(&other, &ctx).unwrap());
        assert_eq!(base.params()["swappiness"], json!(10));

        base.mark_torn_down();
        base.apply(&other, &ctx).unwrap();
        base.mark_deployed();
        base.mark_torn_down();
        assert!(base.apply(&other, &ctx).unwrap());
    }

    #[test]
    fn apply_resolves_required_args() {
        let schema = schema();
        let config = EnvConfig::new("vm")
            .with_groups(["os"])
            .with_const_arg("region", "west")
            .with_required_arg("subscription");
        let mut base = EnvBase::new(config, &schema).unwrap();

        let err = base.apply(&schema, &RunContext::new("exp")).unwrap_err();
        assert!(matches!(err, TbError::Config(_)));

        let ctx = RunContext::new("exp").with_global("subscription", "sub-1");
        base.apply(&schema, &ctx).unwrap();
        let vars = base.env_vars();
        assert_eq!(vars["subscription"], "sub-1");
        assert_eq!(vars["region"], "west");
        assert_eq!(vars["swappiness"], "60");
    }

    #[test]
    fn missing_capability_is_rejected() {
        let base = EnvBase::new(EnvConfig::new("remote"), &schema()).unwrap();
        let err = base
            .require(&Services::new(), &[Capability::HostProvisioner])
            .unwrap_err();
        assert!(matches!(
            err,
            EnvError::MissingCapability { capability: Capability::HostProvisioner, .. }
        ));
    }

    #[test]
    fn parses_key_value_and_json_lines() {
        let metrics = parse_results("starting\nlatency=12.5\n{\"throughput\": 900, \"host\": \"a\"}\nbad=x\n");
        assert_eq!(metrics["latency"], 12.5);
        assert_eq!(metrics["throughput"], 900.0);
        assert!(!metrics.contains_key("bad"));
        assert!(!metrics.contains_key("host"));
    }
}
