//! Environment that provisions a host and runs its scripts there.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tb_services::{
    Capability, FileTransfer, HostOps, HostProvisioner, RemoteExecutor, RetryPolicy,
    ServiceResponse, Services,
};
use tb_types::{Metrics, RunContext, Status, TbError, TelemetryRecord, TunableGroups};

use crate::environment::{
    parse_results, EnvBase, EnvConfig, EnvError, EnvResult, EnvState, Environment, RunOutcome,
};

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_poll_timeout_ms() -> u64 {
    300_000
}

/// A local path paired with a location on the remote share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMapping {
    pub local: PathBuf,
    pub remote: String,
}

/// Behaviour of a [`RemoteEnv`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEnvOptions {
    #[serde(default)]
    pub setup: Vec<String>,
    #[serde(default)]
    pub run: Vec<String>,
    #[serde(default)]
    pub teardown: Vec<String>,
    /// Deploy the host during setup.
    #[serde(default)]
    pub provision: bool,
    /// Power on an existing host during setup and off during teardown.
    #[serde(default)]
    pub wait_boot: bool,
    #[serde(default = "default_true")]
    pub deprovision_on_teardown: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub uploads: Vec<FileMapping>,
    #[serde(default)]
    pub downloads: Vec<FileMapping>,
}

impl Default for RemoteEnvOptions {
    fn default() -> Self {
        Self {
            setup: Vec::new(),
            run: Vec::new(),
            teardown: Vec::new(),
            provision: false,
            wait_boot: false,
            deprovision_on_teardown: true,
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            retry: RetryPolicy::default(),
            uploads: Vec::new(),
            downloads: Vec::new(),
        }
    }
}

impl RemoteEnvOptions {
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    fn required_capabilities(&self) -> Vec<Capability> {
        let mut required = Vec::new();
        if self.provision {
            required.push(Capability::HostProvisioner);
        }
        if self.wait_boot {
            required.push(Capability::HostOps);
        }
        if !(self.setup.is_empty() && self.run.is_empty() && self.teardown.is_empty()) {
            required.push(Capability::RemoteExecutor);
        }
        if !(self.uploads.is_empty() && self.downloads.is_empty()) {
            required.push(Capability::FileTransfer);
        }
        required
    }
}

pub struct RemoteEnv {
    base: EnvBase,
    options: RemoteEnvOptions,
    provisioner: Option<Arc<dyn HostProvisioner>>,
    host_ops: Option<Arc<dyn HostOps>>,
    remote: Option<Arc<dyn RemoteExecutor>>,
    files: Option<Arc<dyn FileTransfer>>,
    provisioned: bool,
}

impl std::fmt::Debug for RemoteEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEnv")
            .field("base", &self.base)
            .field("options", &self.options)
            .field("provisioned", &self.provisioned)
            .finish_non_exhaustive()
    }
}

/// Why a remote step did not succeed.
enum StepError {
    TimedOut(String),
    Failed(String),
}

impl StepError {
    fn from_response(step: &str, response: &ServiceResponse) -> Self {
        let detail = response.error().unwrap_or("no details");
        if response.status.is_timed_out() {
            StepError::TimedOut(format!("{step} timed out: {detail}"))
        } else {
            StepError::Failed(format!("{step} failed ({}): {detail}", response.status))
        }
    }
}

impl RemoteEnv {
    pub fn new(
        config: EnvConfig,
        tunables: &TunableGroups,
        options: RemoteEnvOptions,
        services: &Services,
    ) -> EnvResult<Self> {
        let base = EnvBase::new(config, tunables)?;
        let required = options.required_capabilities();
        if required.is_empty() {
            return Err(EnvError::InvalidConfig {
                env: base.name().to_string(),
                message: "at least one of setup, run, teardown, provision, wait_boot must be present"
                    .into(),
            });
        }
        base.require(services, &required)?;
        Ok(Self {
            base,
            provisioner: services.host_provisioner.clone().filter(|_| options.provision),
            host_ops: services.host_ops.clone().filter(|_| options.wait_boot),
            remote: services.remote_executor.clone(),
            files: services.file_transfer.clone(),
            options,
            provisioned: false,
        })
    }

    /// Poll the provisioner until the pending operation resolves or the
    /// polling timeout passes.
    async fn wait_host(&self, provisioner: &dyn HostProvisioner, is_setup: bool) -> ServiceResponse {
        let deadline = Instant::now() + self.options.poll_timeout();
        loop {
            let response = match provisioner.wait_host_ready(self.base.params(), is_setup).await {
                Ok(response) => response,
                Err(e) => return ServiceResponse::failed(e.to_string()),
            };
            if !response.status.is_pending() {
                return response;
            }
            if Instant::now() >= deadline {
                let timeout = TbError::ProvisionTimeout {
                    target: self.base.name().to_string(),
                    timeout_seconds: self.options.poll_timeout().as_secs(),
                };
                return ServiceResponse::new(Status::TimedOut).with_payload("error", timeout.to_string());
            }
            debug!(env = %self.base.name(), is_setup, "Host operation pending");
            tokio::time::sleep(self.options.poll_interval()).await;
        }
    }

    /// Deploy the host. `provisioned` is raised before the request goes out
    /// and lowered again only if the provisioner refused it outright, so a
    /// deployment that has started is always deprovisioned on teardown, even
    /// when this future is dropped part way.
    async fn provision(&mut self, provisioner: &Arc<dyn HostProvisioner>) -> Result<(), StepError> {
        self.provisioned = true;
        let requested = self
            .options
            .retry
            .run("provision_host", || provisioner.provision_host(self.base.params()))
            .await;
        let mut response = match requested {
            Ok(response) if response.status.is_pending() || response.is_success() => response,
            Ok(response) => {
                self.provisioned = false;
                return Err(StepError::from_response("provisioning", &response));
            }
            Err(e) => {
                self.provisioned = false;
                return Err(StepError::Failed(e.to_string()));
            }
        };
        if response.status.is_pending() {
            response = self.wait_host(provisioner.as_ref(), true).await;
        }
        if response.is_success() {
            Ok(())
        } else {
            Err(StepError::from_response("provisioning", &response))
        }
    }

    async fn boot(&self, ops: &Arc<dyn HostOps>) -> Result<(), StepError> {
        let params = self.base.params();
        let mut response = self
            .options
            .retry
            .run("start_host", || ops.start_host(params))
            .await
            .map_err(|e| StepError::Failed(e.to_string()))?;
        if response.status.is_pending() {
            if let Some(provisioner) = &self.provisioner {
                response = self.wait_host(provisioner.as_ref(), true).await;
            }
        }
        if response.is_success() {
            Ok(())
        } else {
            Err(StepError::from_response("host start", &response))
        }
    }

    async fn upload_files(&self) -> Result<(), StepError> {
        let Some(files) = &self.files else {
            return Ok(());
        };
        for mapping in &self.options.uploads {
            let response = files
                .upload(self.base.params(), &mapping.local, &mapping.remote)
                .await
                .map_err(|e| StepError::Failed(e.to_string()))?;
            if !response.is_success() {
                return Err(StepError::from_response("upload", &response));
            }
        }
        Ok(())
    }

    async fn download_files(&self) -> Result<(), StepError> {
        let Some(files) = &self.files else {
            return Ok(());
        };
        for mapping in &self.options.downloads {
            let response = files
                .download(self.base.params(), &mapping.remote, &mapping.local)
                .await
                .map_err(|e| StepError::Failed(e.to_string()))?;
            if !response.is_success() {
                return Err(StepError::from_response("download", &response));
            }
        }
        Ok(())
    }

    /// Submit `script` and poll for its output. Returns the remote stdout.
    async fn remote_script(&self, step: &str, script: &[String]) -> Result<String, StepError> {
        let Some(remote) = &self.remote else {
            return Err(StepError::Failed(format!("{step}: no remote executor")));
        };
        let params = self.base.params();
        let env = self.base.env_vars();
        let submitted = self
            .options
            .retry
            .run("remote_exec", || remote.remote_exec(script, params, &env))
            .await
            .map_err(|e| StepError::Failed(e.to_string()))?;
        if !(submitted.status.is_pending() || submitted.status.is_succeeded()) {
            return Err(StepError::from_response(step, &submitted));
        }

        let deadline = Instant::now() + self.options.poll_timeout();
        loop {
            let response = remote
                .get_remote_exec_results(&submitted.payload)
                .await
                .map_err(|e| StepError::Failed(e.to_string()))?;
            if response.is_success() {
                let stdout = response
                    .payload
                    .get("stdout")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                return Ok(stdout.to_string());
            }
            if !response.status.is_pending() {
                return Err(StepError::from_response(step, &response));
            }
            if Instant::now() >= deadline {
                return Err(StepError::TimedOut(format!("{step} timed out")));
            }
            tokio::time::sleep(self.options.poll_interval()).await;
        }
    }

    fn fail_step(&mut self, err: StepError) -> bool {
        match err {
            StepError::TimedOut(msg) => self.base.fail(EnvState::TimedOut, msg),
            StepError::Failed(msg) => self.base.fail(EnvState::Failed, msg),
        }
    }
}

#[async_trait]
impl Environment for RemoteEnv {
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
            info!(env = %self.base.name(), "Tunables unchanged, reusing remote environment");
            self.base.set_state(EnvState::Ready);
            return true;
        }
        self.base.begin_setup();

        if let Some(provisioner) = self.provisioner.clone() {
            if !self.provisioned {
                info!(env = %self.base.name(), "Provisioning host");
                if let Err(e) = self.provision(&provisioner).await {
                    return self.fail_step(e);
                }
            }
        }
        if let Some(ops) = self.host_ops.clone() {
            info!(env = %self.base.name(), "Waiting for host to boot");
            if let Err(e) = self.boot(&ops).await {
                return self.fail_step(e);
            }
        }
        if let Err(e) = self.upload_files().await {
            return self.fail_step(e);
        }
        if !self.options.setup.is_empty() {
            info!(env = %self.base.name(), "Remote setup");
            if let Err(e) = self.remote_script("setup", &self.options.setup).await {
                return self.fail_step(e);
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
        info!(env = %self.base.name(), "Remote run");

        let outcome = match self.remote_script("run", &self.options.run).await {
            Ok(stdout) => self.download_files().await.map(|_| parse_results(&stdout)),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(results) => {
                self.base.set_state(EnvState::Ready);
                RunOutcome::succeeded(results)
            }
            Err(e) => {
                let status = match &e {
                    StepError::TimedOut(_) => Status::TimedOut,
                    StepError::Failed(_) => Status::Failed,
                };
                self.fail_step(e);
                RunOutcome::with_status(status, self.base.last_error().unwrap_or_default())
            }
        }
    }

    async fn telemetry(&mut self) -> Vec<TelemetryRecord> {
        self.base.telemetry()
    }

    async fn teardown(&mut self) {
        if self.base.state() == EnvState::NotSetUp && !self.provisioned {
            return;
        }
        if !self.options.teardown.is_empty() {
            info!(env = %self.base.name(), "Remote teardown");
            if let Err(StepError::Failed(e) | StepError::TimedOut(e)) =
                self.remote_script("teardown", &self.options.teardown).await
            {
                warn!(env = %self.base.name(), error = %e, "Remote teardown script failed");
            }
        }
        if let Some(ops) = self.host_ops.clone() {
            if let Err(e) = ops.stop_host(self.base.params()).await {
                warn!(env = %self.base.name(), error = %e, "Stopping host failed");
            }
        }
        if self.provisioned && self.options.deprovision_on_teardown {
            if let Some(provisioner) = self.provisioner.clone() {
                info!(env = %self.base.name(), "Deprovisioning host");
                match provisioner.deprovision_host(self.base.params()).await {
                    Ok(response) if response.status.is_pending() => {
                        let done = self.wait_host(provisioner.as_ref(), false).await;
                        if !done.is_success() {
                            warn!(env = %self.base.name(), status = %done.status, "Deprovisioning did not finish");
                        }
                    }
                    Ok(response) if !response.is_success() => {
                        warn!(env = %self.base.name(), status = %response.status, "Deprovisioning failed");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(env = %self.base.name(), error = %e, "Deprovisioning failed"),
                }
            }
            self.provisioned = false;
        }
        self.base.mark_torn_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tb_services::{MockHostConfig, MockHostService};

    fn schema() -> TunableGroups {
        TunableGroups::from_json(&json!({
            "vm": {
                "cost": 100,
                "params": {
                    "vm_size": {"type": "categorical", "default": "small", "values": ["small", "large"]}
                }
            }
        }))
        .unwrap()
    }

    fn services(host: Arc<MockHostService>) -> Services {
        Services::new()
            .with_host_provisioner(host.clone())
            .with_host_ops(host.clone())
            .with_remote_executor(host.clone())
            .with_file_transfer(host)
    }

    fn options() -> RemoteEnvOptions {
        RemoteEnvOptions {
            run: vec!["./bench.sh".into()],
            provision: true,
            poll_interval_ms: 10,
            poll_timeout_ms: 1_000,
            ..RemoteEnvOptions::default()
        }
    }

    #[test]
    fn needs_the_capabilities_it_uses() {
        let err = RemoteEnv::new(EnvConfig::new("vm"), &schema(), options(), &Services::new()).unwrap_err();
        assert!(matches!(
            err,
            EnvError::MissingCapability { capability: Capability::HostProvisioner, .. }
        ));

        let err = RemoteEnv::new(
            EnvConfig::new("vm"),
            &schema(),
            RemoteEnvOptions::default(),
            &Services::new(),
        )
        .unwrap_err();
        assert!(matches!(err, EnvError::InvalidConfig { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn provisions_runs_and_deprovisions() {
        let host = Arc::new(MockHostService::new(MockHostConfig {
            pending_polls: 3,
            transient_provision_failures: 1,
            remote_stdout: "score=0.8\nlatency=4\n".into(),
            ..MockHostConfig::default()
        }));
        let tunables = schema();
        let mut env = RemoteEnv::new(EnvConfig::new("vm"), &tunables, options(), &services(host.clone())).unwrap();

        assert!(env.setup(&tunables, &RunContext::new("exp")).await);
        assert!(host.is_provisioned());
        assert_eq!(host.call_count("provision_host"), 2);
        assert_eq!(host.call_count("wait_host_ready"), 4);

        let outcome = env.run().await;
        assert_eq!(outcome.status, Status::Succeeded);
        assert_eq!(outcome.results["score"], 0.8);

        // Same tunables: nothing is provisioned again.
        assert!(env.setup(&tunables, &RunContext::new("exp")).await);
        assert_eq!(host.call_count("provision_host"), 2);

        env.teardown().await;
        assert_eq!(host.call_count("deprovision_host"), 1);
        assert!(!host.is_provisioned());
        assert_eq!(env.state(), EnvState::NotSetUp);
    }

    #[tokio::test(start_paused = true)]
    async fn provisioning_poll_times_out() {
        let host = Arc::new(MockHostService::new(MockHostConfig {
            pending_polls: u32::MAX,
            ..MockHostConfig::default()
        }));
        let tunables = schema();
        let mut env = RemoteEnv::new(EnvConfig::new("vm"), &tunables, options(), &services(host)).unwrap();

        assert!(!env.setup(&tunables, &RunContext::new("exp")).await);
        assert_eq!(env.status().0, Status::TimedOut);
        assert!(env.last_error().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_deployment_is_deprovisioned() {
        let host = Arc::new(MockHostService::new(MockHostConfig {
            pending_polls: u32::MAX,
            ..MockHostConfig::default()
        }));
        let tunables = schema();
        let mut env = RemoteEnv::new(EnvConfig::new("vm"), &tunables, options(), &services(host.clone())).unwrap();

        assert!(!env.setup(&tunables, &RunContext::new("exp")).await);
        env.teardown().await;
        assert_eq!(host.call_count("provision_host"), 1);
        assert_eq!(host.call_count("deprovision_host"), 1);
        assert_eq!(env.state(), EnvState::NotSetUp);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_setup_still_deprovisions() {
        let host = Arc::new(MockHostService::new(MockHostConfig {
            pending_polls: u32::MAX,
            ..MockHostConfig::default()
        }));
        let tunables = schema();
        let mut env = RemoteEnv::new(EnvConfig::new("vm"), &tunables, options(), &services(host.clone())).unwrap();

        let ctx = RunContext::new("exp");
        let setup = tokio::time::timeout(Duration::from_millis(100), env.setup(&tunables, &ctx)).await;
        assert!(setup.is_err());
        env.teardown().await;
        assert_eq!(host.call_count("deprovision_host"), 1);
    }

    #[tokio::test]
    async fn failed_provisioning_fails_setup() {
        let host = Arc::new(MockHostService::new(MockHostConfig {
            fail_provision: true,
            ..MockHostConfig::default()
        }));
        let tunables = schema();
        let mut env = RemoteEnv::new(EnvConfig::new("vm"), &tunables, options(), &services(host.clone())).unwrap();

        assert!(!env.setup(&tunables, &RunContext::new("exp")).await);
        assert_eq!(env.status().0, Status::Failed);
        assert!(env.last_error().unwrap().contains("cannot provision"));
        assert_eq!(host.call_count("wait_host_ready"), 0);

        // Refused outright: nothing to release.
        env.teardown().await;
        assert_eq!(host.call_count("deprovision_host"), 0);
    }
}
