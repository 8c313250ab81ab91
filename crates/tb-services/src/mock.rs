//! In-process service doubles for tests and dry runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::capabilities::{
    require_str, FileTransfer, HostOps, HostProvisioner, Params, RemoteExecutor, ServiceResponse,
    ServiceResult,
};

/// Scripted behaviour for [`MockHostService`].
#[derive(Debug, Clone, Default)]
pub struct MockHostConfig {
    /// How many readiness polls answer PENDING before SUCCEEDED.
    pub pending_polls: u32,
    /// Artificial latency of every call.
    pub latency: Duration,
    /// Provisioning answers FAILED.
    pub fail_provision: bool,
    /// Number of leading provisioning calls that fail transiently.
    pub transient_provision_failures: u32,
    /// Lines printed by every remote script.
    pub remote_stdout: String,
}

#[derive(Debug, Default)]
struct MockHostState {
    calls: Vec<String>,
    polls_left: u32,
    transient_left: u32,
    provisioned: bool,
    files: BTreeMap<String, Vec<u8>>,
}

/// Simulated host that records every call it receives.
#[derive(Debug, Default)]
pub struct MockHostService {
    config: MockHostConfig,
    state: Mutex<MockHostState>,
}

impl MockHostService {
    pub fn new(config: MockHostConfig) -> Self {
        let state = MockHostState {
            transient_left: config.transient_provision_failures,
            ..MockHostState::default()
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Call log in order, e.g. `["provision_host", "wait_host_ready"]`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == name).count()
    }

    pub fn is_provisioned(&self) -> bool {
        self.state.lock().provisioned
    }

    async fn enter(&self, name: &str) {
        self.state.lock().calls.push(name.to_string());
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
    }
}

#[async_trait]
impl HostProvisioner for MockHostService {
    async fn provision_host(&self, params: &Params) -> ServiceResult<ServiceResponse> {
        self.enter("provision_host").await;
        let host = require_str(params, "host_name").unwrap_or("mock-host").to_string();
        let mut state = self.state.lock();
        if state.transient_left > 0 {
            state.transient_left -= 1;
            return Ok(ServiceResponse::transient_failure("provisioning throttled"));
        }
        if self.config.fail_provision {
            return Ok(ServiceResponse::failed(format!("cannot provision {host}")));
        }
        state.polls_left = self.config.pending_polls;
        Ok(ServiceResponse::pending().with_payload("host_name", host))
    }

    async fn wait_host_ready(&self, _params: &Params, is_setup: bool) -> ServiceResult<ServiceResponse> {
        self.enter("wait_host_ready").await;
        let mut state = self.state.lock();
        if state.polls_left > 0 {
            state.polls_left -= 1;
            return Ok(ServiceResponse::pending());
        }
        state.provisioned = is_setup;
        Ok(ServiceResponse::succeeded())
    }

    async fn deprovision_host(&self, _params: &Params) -> ServiceResult<ServiceResponse> {
        self.enter("deprovision_host").await;
        self.state.lock().provisioned = false;
        Ok(ServiceResponse::succeeded())
    }
}

#[async_trait]
impl HostOps for MockHostService {
    async fn start_host(&self, _params: &Params) -> ServiceResult<ServiceResponse> {
        self.enter("start_host").await;
        Ok(ServiceResponse::succeeded())
    }

    async fn stop_host(&self, _params: &Params) -> ServiceResult<ServiceResponse> {
        self.enter("stop_host").await;
        Ok(ServiceResponse::succeeded())
    }

    async fn restart_host(&self, _params: &Params) -> ServiceResult<ServiceResponse> {
        self.enter("restart_host").await;
        Ok(ServiceResponse::succeeded())
    }
}

#[async_trait]
impl RemoteExecutor for MockHostService {
    async fn remote_exec(
        &self,
        script: &[String],
        _params: &Params,
        _env: &BTreeMap<String, String>,
    ) -> ServiceResult<ServiceResponse> {
        self.enter("remote_exec").await;
        Ok(ServiceResponse::pending().with_payload("lines", script.len() as u64))
    }

    async fn get_remote_exec_results(&self, _submission: &Params) -> ServiceResult<ServiceResponse> {
        self.enter("get_remote_exec_results").await;
        Ok(ServiceResponse::succeeded()
            .with_payload("stdout", Value::from(self.config.remote_stdout.clone())))
    }
}

#[async_trait]
impl FileTransfer for MockHostService {
    async fn upload(&self, _params: &Params, local: &Path, remote: &str) -> ServiceResult<ServiceResponse> {
        self.enter("upload").await;
        let bytes = tokio::fs::read(local).await.unwrap_or_default();
        self.state.lock().files.insert(remote.to_string(), bytes);
        Ok(ServiceResponse::succeeded())
    }

    async fn download(&self, _params: &Params, remote: &str, local: &Path) -> ServiceResult<ServiceResponse> {
        self.enter("download").await;
        let bytes = self.state.lock().files.get(remote).cloned();
        match bytes {
            Some(bytes) => {
                tokio::fs::write(local, bytes).await?;
                Ok(ServiceResponse::succeeded())
            }
            None => Ok(ServiceResponse::failed(format!("no such remote file: {remote}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tb_types::Status;

    #[tokio::test]
    async fn provisioning_polls_then_succeeds() {
        let service = MockHostService::new(MockHostConfig {
            pending_polls: 2,
            ..MockHostConfig::default()
        });
        let params = Params::new();
        assert_eq!(service.provision_host(&params).await.unwrap().status, Status::Pending);
        assert_eq!(service.wait_host_ready(&params, true).await.unwrap().status, Status::Pending);
        assert_eq!(service.wait_host_ready(&params, true).await.unwrap().status, Status::Pending);
        assert!(service.wait_host_ready(&params, true).await.unwrap().is_success());
        assert!(service.is_provisioned());
        assert_eq!(service.call_count("wait_host_ready"), 3);
    }

    #[tokio::test]
    async fn transient_failures_are_flagged() {
        let service = MockHostService::new(MockHostConfig {
            transient_provision_failures: 1,
            ..MockHostConfig::default()
        });
        let first = service.provision_host(&Params::new()).await.unwrap();
        assert!(first.transient);
        let second = service.provision_host(&Params::new()).await.unwrap();
        assert_eq!(second.status, Status::Pending);
    }
}
