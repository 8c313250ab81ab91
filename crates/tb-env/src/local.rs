//! Environment that runs its setup, run and teardown scripts on the
//! scheduler host.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use tb_services::{Capability, LocalExecutor, Services};
use tb_types::{Metrics, RunContext, Status, TbError, TbResult, TelemetryRecord, TunableGroups};

use crate::environment::{
    parse_results, EnvBase, EnvConfig, EnvError, EnvResult, EnvState, Environment, RunOutcome,
};

/// Scripts and files of a [`LocalEnv`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalEnvOptions {
    #[serde(default)]
    pub setup: Vec<String>,
    #[serde(default)]
    pub run: Vec<String>,
    #[serde(default)]
    pub teardown: Vec<String>,
    /// Working directory for all scripts.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Write the tunable values as JSON to this file (relative to `cwd`)
    /// before the setup script runs.
    #[serde(default)]
    pub dump_params_file: Option<String>,
    /// CSV with the benchmark results, read after the run script.
    #[serde(default)]
    pub read_results_file: Option<String>,
    /// CSV with `timestamp,metric,value` rows, read after the run script.
    #[serde(default)]
    pub read_telemetry_file: Option<String>,
}

pub struct LocalEnv {
    base: EnvBase,
    options: LocalEnvOptions,
    exec: Arc<dyn LocalExecutor>,
}

impl std::fmt::Debug for LocalEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEnv")
            .field("base", &self.base)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl LocalEnv {
    pub fn new(
        config: EnvConfig,
        tunables: &TunableGroups,
        options: LocalEnvOptions,
        services: &Services,
    ) -> EnvResult<Self> {
        let base = EnvBase::new(config, tunables)?;
        base.require(services, &[Capability::LocalExecutor])?;
        let invalid = |message: &str| EnvError::InvalidConfig {
            env: base.name().to_string(),
            message: message.to_string(),
        };
        if options.setup.is_empty() && options.run.is_empty() && options.teardown.is_empty() {
            return Err(invalid("at least one of setup, run, teardown must be present"));
        }
        if options.setup.is_empty() && options.dump_params_file.is_some() {
            return Err(invalid("dump_params_file requires a setup script"));
        }
        if options.run.is_empty()
            && (options.read_results_file.is_some() || options.read_telemetry_file.is_some())
        {
            return Err(invalid("reading results or telemetry requires a run script"));
        }
        let exec = services
            .local_executor
            .clone()
            .ok_or_else(|| EnvError::MissingCapability {
                env: base.name().to_string(),
                capability: Capability::LocalExecutor,
            })?;
        Ok(Self { base, options, exec })
    }

    fn resolve(&self, file: &str) -> PathBuf {
        match &self.options.cwd {
            Some(dir) => dir.join(file),
            None => PathBuf::from(file),
        }
    }

    async fn exec(&self, script: &[String]) -> Result<String, String> {
        let env = self.base.env_vars();
        match self.exec.local_exec(script, self.options.cwd.as_deref(), &env).await {
            Ok(out) if out.is_success() => Ok(out.stdout),
            Ok(out) => Err(format!(
                "script exited with code {}: {}",
                out.exit_code,
                out.stderr.trim()
            )),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn dump_params(&self, file: &str) -> TbResult<()> {
        let text = serde_json::to_string_pretty(&self.base.tunables().values())?;
        tokio::fs::write(self.resolve(file), text).await?;
        Ok(())
    }
}

/// Read benchmark results from a CSV file.
///
/// Two layouts are accepted: a long `metric,value` table, or a wide table
/// whose header names the metrics and whose first row holds the values.
pub fn read_results_csv(path: &Path) -> TbResult<Metrics> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| TbError::Config(format!("cannot open results file {}: {e}", path.display())))?;
    let headers = rdr
        .headers()
        .map_err(|e| TbError::Config(format!("cannot read results header: {e}")))?
        .clone();

    let mut metrics = Metrics::new();
    let long = headers.len() == 2 && &headers[0] == "metric" && &headers[1] == "value";
    for (line, record) in rdr.records().enumerate() {
        let record = record.map_err(|e| TbError::Config(format!("bad results row {}: {e}", line + 2)))?;
        if long {
            if let (Some(name), Some(value)) = (record.get(0), record.get(1)) {
                match value.parse::<f64>() {
                    Ok(v) => {
                        metrics.insert(name.to_string(), v);
                    }
                    Err(_) => warn!(metric = name, value, "Skipping non-numeric result"),
                }
            }
        } else {
            for (name, value) in headers.iter().zip(record.iter()) {
                if let Ok(v) = value.parse::<f64>() {
                    metrics.insert(name.to_string(), v);
                }
            }
            break;
        }
    }
    Ok(metrics)
}

/// Read `timestamp,metric,value` telemetry rows from a CSV file.
pub fn read_telemetry_csv(path: &Path) -> TbResult<Vec<TelemetryRecord>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| TbError::Config(format!("cannot open telemetry file {}: {e}", path.display())))?;

    let mut telemetry = Vec::new();
    for (line, record) in rdr.records().enumerate() {
        let record = record.map_err(|e| TbError::Config(format!("bad telemetry row {}: {e}", line + 2)))?;
        let parsed = (record.get(0), record.get(1), record.get(2));
        let (Some(ts), Some(metric), Some(value)) = parsed else {
            warn!(line = line + 2, "Skipping short telemetry row");
            continue;
        };
        let timestamp = match DateTime::parse_from_rfc3339(ts) {
            Ok(ts) => ts.with_timezone(&Utc),
            Err(e) => {
                warn!(line = line + 2, error = %e, "Skipping telemetry row with bad timestamp");
                continue;
            }
        };
        match value.parse::<f64>() {
            Ok(v) => telemetry.push(TelemetryRecord::new(timestamp, metric, v)),
            Err(_) => warn!(line = line + 2, metric, "Skipping non-numeric telemetry value"),
        }
    }
    Ok(telemetry)
}

#[async_trait]
impl Environment for LocalEnv {
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
        let reconfigure = match self.base.apply(tunables, ctx) {
            Ok(reconfigure) => reconfigure,
            Err(e) => return self.base.fail(EnvState::Failed, e.to_string()),
        };
        if !reconfigure && self.base.state().is_set_up() {
            info!(env = %self.base.name(), "Tunables unchanged, skipping local setup");
            self.base.set_state(EnvState::Ready);
            return true;
        }
        self.base.begin_setup();
        if let Some(file) = self.options.dump_params_file.clone() {
            if let Err(e) = self.dump_params(&file).await {
                return self.base.fail(EnvState::Failed, format!("cannot write {file}: {e}"));
            }
        }
        if !self.options.setup.is_empty() {
            info!(env = %self.base.name(), "Local setup");
            if let Err(e) = self.exec(&self.options.setup).await {
                return self.base.fail(EnvState::Failed, format!("setup failed: {e}"));
            }
        }
        self.base.mark_deployed();
        true
    }

    async fn run(&mut self) -> RunOutcome {
        if self.base.state() != EnvState::Ready {
            return RunOutcome::failed(format!("environment {} is not ready", self.base.name()));
        }
        if self.options.run.is_empty() {
            return RunOutcome::succeeded(Metrics::new());
        }
        self.base.set_state(EnvState::Running);
        info!(env = %self.base.name(), "Local run");

        let stdout = match self.exec(&self.options.run).await {
            Ok(stdout) => stdout,
            Err(e) => {
                self.base.fail(EnvState::Failed, format!("run failed: {e}"));
                return RunOutcome::failed(self.base.last_error().unwrap_or_default());
            }
        };

        let results = match &self.options.read_results_file {
            Some(file) => read_results_csv(&self.resolve(file)),
            None => Ok(parse_results(&stdout)),
        };
        let telemetry = match &self.options.read_telemetry_file {
            Some(file) => read_telemetry_csv(&self.resolve(file)),
            None => Ok(Vec::new()),
        };
        match (results, telemetry) {
            (Ok(results), Ok(telemetry)) => {
                self.base.set_telemetry(telemetry.clone());
                self.base.set_state(EnvState::Ready);
                RunOutcome::succeeded(results).with_telemetry(telemetry)
            }
            (Err(e), _) | (_, Err(e)) => {
                self.base.fail(EnvState::Failed, e.to_string());
                RunOutcome::failed(e.to_string())
            }
        }
    }

    async fn telemetry(&mut self) -> Vec<TelemetryRecord> {
        self.base.telemetry()
    }

    async fn teardown(&mut self) {
        if self.base.state() == EnvState::NotSetUp {
            return;
        }
        if !self.options.teardown.is_empty() {
            info!(env = %self.base.name(), "Local teardown");
            if let Err(e) = self.exec(&self.options.teardown).await {
                warn!(env = %self.base.name(), error = %e, "Local teardown failed");
            }
        }
        self.base.mark_torn_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tb_services::LocalExecService;

    fn schema() -> TunableGroups {
        TunableGroups::from_json(&json!({
            "app": {
                "cost": 1,
                "params": {
                    "threads": {"type": "int", "default": 4, "range": [1, 64]}
                }
            }
        }))
        .unwrap()
    }

    fn services() -> Services {
        Services::new().with_local_executor(Arc::new(LocalExecService::new()))
    }

    fn lines(script: &[&str]) -> Vec<String> {
        script.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn requires_local_executor_and_scripts() {
        let err = LocalEnv::new(
            EnvConfig::new("app"),
            &schema(),
            LocalEnvOptions {
                run: lines(&["true"]),
                ..Default::default()
            },
            &Services::new(),
        )
        .unwrap_err();
        assert!(matches!(err, EnvError::MissingCapability { .. }));

        let err = LocalEnv::new(EnvConfig::new("app"), &schema(), LocalEnvOptions::default(), &services())
            .unwrap_err();
        assert!(matches!(err, EnvError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn runs_scripts_with_tunables_in_env() {
        let dir = tempfile::tempdir().unwrap();
        let options = LocalEnvOptions {
            setup: lines(&["echo configured > setup.txt"]),
            run: lines(&["echo latency=$((100 / threads))", "echo '{\"ops\": 42}'"]),
            teardown: lines(&["rm -f setup.txt"]),
            cwd: Some(dir.path().to_path_buf()),
            dump_params_file: Some("params.json".into()),
            ..Default::default()
        };
        let tunables = schema();
        let mut env = LocalEnv::new(EnvConfig::new("app"), &tunables, options, &services()).unwrap();

        assert!(env.setup(&tunables, &RunContext::new("exp")).await);
        assert!(dir.path().join("setup.txt").exists());
        let dumped: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("params.json")).unwrap()).unwrap();
        assert_eq!(dumped, json!({"threads": 4}));

        let outcome = env.run().await;
        assert_eq!(outcome.status, Status::Succeeded);
        assert_eq!(outcome.results["latency"], 25.0);
        assert_eq!(outcome.results["ops"], 42.0);

        env.teardown().await;
        assert!(!dir.path().join("setup.txt").exists());
        assert_eq!(env.state(), EnvState::NotSetUp);
    }

    #[tokio::test]
    async fn failing_setup_script_fails_setup() {
        let options = LocalEnvOptions {
            setup: lines(&["echo broken >&2", "exit 1"]),
            run: lines(&["echo score=1"]),
            ..Default::default()
        };
        let tunables = schema();
        let mut env = LocalEnv::new(EnvConfig::new("app"), &tunables, options, &services()).unwrap();
        assert!(!env.setup(&tunables, &RunContext::new("exp")).await);
        assert_eq!(env.status().0, Status::Failed);
        assert!(env.last_error().unwrap().contains("broken"));
        assert_eq!(env.run().await.status, Status::Failed);
    }

    #[tokio::test]
    async fn interrupted_setup_still_runs_teardown_script() {
        let dir = tempfile::tempdir().unwrap();
        let options = LocalEnvOptions {
            setup: lines(&["echo started > setup.txt", "sleep 5"]),
            run: lines(&["echo score=1"]),
            teardown: lines(&["echo cleaned > teardown.txt"]),
            cwd: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let tunables = schema();
        let mut env = LocalEnv::new(EnvConfig::new("app"), &tunables, options, &services()).unwrap();

        let ctx = RunContext::new("exp");
        let setup = tokio::time::timeout(std::time::Duration::from_millis(500), env.setup(&tunables, &ctx)).await;
        assert!(setup.is_err());
        assert_eq!(env.state(), EnvState::SettingUp);

        env.teardown().await;
        assert!(dir.path().join("teardown.txt").exists());
        assert_eq!(env.state(), EnvState::NotSetUp);
    }

    #[tokio::test]
    async fn reads_result_and_telemetry_files() {
        let dir = tempfile::tempdir().unwrap();
        let options = LocalEnvOptions {
            run: lines(&[
                "printf 'metric,value\\nscore,0.9\\nlatency,12\\n' > results.csv",
                "printf 'timestamp,metric,value\\n2024-01-01T00:00:00Z,cpu,0.5\\n2024-01-01T00:00:01Z,cpu,0.7\\n' > telemetry.csv",
            ]),
            cwd: Some(dir.path().to_path_buf()),
            read_results_file: Some("results.csv".into()),
            read_telemetry_file: Some("telemetry.csv".into()),
            ..Default::default()
        };
        let tunables = schema();
        let mut env = LocalEnv::new(EnvConfig::new("app"), &tunables, options, &services()).unwrap();
        assert!(env.setup(&tunables, &RunContext::new("exp")).await);

        let outcome = env.run().await;
        assert_eq!(outcome.status, Status::Succeeded);
        assert_eq!(outcome.results["score"], 0.9);
        assert_eq!(outcome.results["latency"], 12.0);
        assert_eq!(outcome.telemetry.len(), 2);
        assert_eq!(outcome.telemetry[1].value, 0.7);
    }

    #[test]
    fn wide_results_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.csv");
        std::fs::write(&path, "score,latency,host\n0.25,30,a\n").unwrap();
        let metrics = read_results_csv(&path).unwrap();
        assert_eq!(metrics["score"], 0.25);
        assert_eq!(metrics["latency"], 30.0);
        assert!(!metrics.contains_key("host"));
    }
}
