//! Service capability traits consumed by environments.
//!
//! Each capability is a narrow async trait. Concrete cloud or SSH backends
//! live outside this workspace; environments only see the traits, injected
//! through a [`Services`] bundle.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tb_types::Status;

/// Flat parameter map handed to services (tunables merged with const args).
pub type Params = Map<String, Value>;

/// Outcome of a service operation.
///
/// Operational failures (host refused, script exited non-zero, quota hit)
/// are reported through `status`; `transient` marks the ones worth retrying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub status: Status,
    #[serde(default)]
    pub payload: Params,
    #[serde(default)]
    pub transient: bool,
}

impl ServiceResponse {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            payload: Params::new(),
            transient: false,
        }
    }

    pub fn succeeded() -> Self {
        Self::new(Status::Succeeded)
    }

    pub fn pending() -> Self {
        Self::new(Status::Pending)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(Status::Failed).with_payload("error", message.into())
    }

    /// A failure that may succeed if the same call is repeated.
    pub fn transient_failure(message: impl Into<String>) -> Self {
        let mut response = Self::failed(message);
        response.transient = true;
        response
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_succeeded()
    }

    /// Error text carried in the payload, if any.
    pub fn error(&self) -> Option<&str> {
        self.payload.get("error").and_then(Value::as_str)
    }
}

/// Output of a finished local command sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors a service reports when it is misused, as opposed to an
/// operational failure carried in a [`ServiceResponse`].
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("missing required service parameter: {name}")]
    MissingParameter { name: String },
    #[error("invalid service parameter {name}: {message}")]
    InvalidParameter { name: String, message: String },
    #[error("service I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("service internal error: {message}")]
    Internal { message: String },
}

/// Result alias for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

impl From<ServiceError> for tb_types::TbError {
    fn from(err: ServiceError) -> Self {
        tb_types::TbError::ServiceFailure {
            message: err.to_string(),
        }
    }
}

/// Look up a string parameter or fail with [`ServiceError::MissingParameter`].
pub fn require_str<'a>(params: &'a Params, name: &str) -> ServiceResult<&'a str> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::MissingParameter {
            name: name.to_string(),
        })
}

/// Run commands on the machine hosting the scheduler.
#[async_trait]
pub trait LocalExecutor: Send + Sync {
    /// Run `script` line by line, stopping at the first non-zero exit.
    async fn local_exec(
        &self,
        script: &[String],
        cwd: Option<&Path>,
        env: &BTreeMap<String, String>,
    ) -> ServiceResult<ExecOutput>;
}

/// Provision and release hosts (VMs, containers, cloud instances).
#[async_trait]
pub trait HostProvisioner: Send + Sync {
    /// Start deploying a host. Usually answers PENDING.
    async fn provision_host(&self, params: &Params) -> ServiceResult<ServiceResponse>;

    /// Check on a pending provisioning (`is_setup`) or deprovisioning
    /// operation. Answers PENDING while the operation is still in flight.
    async fn wait_host_ready(&self, params: &Params, is_setup: bool) -> ServiceResult<ServiceResponse>;

    async fn deprovision_host(&self, params: &Params) -> ServiceResult<ServiceResponse>;
}

/// Power operations on an already provisioned host.
#[async_trait]
pub trait HostOps: Send + Sync {
    async fn start_host(&self, params: &Params) -> ServiceResult<ServiceResponse>;
    async fn stop_host(&self, params: &Params) -> ServiceResult<ServiceResponse>;
    async fn restart_host(&self, params: &Params) -> ServiceResult<ServiceResponse>;
}

/// Run scripts on a remote host.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Submit `script`. The response payload identifies the submission and is
    /// passed back to [`get_remote_exec_results`](Self::get_remote_exec_results).
    async fn remote_exec(
        &self,
        script: &[String],
        params: &Params,
        env: &BTreeMap<String, String>,
    ) -> ServiceResult<ServiceResponse>;

    /// Poll a submission. On success the payload carries `stdout`.
    async fn get_remote_exec_results(&self, submission: &Params) -> ServiceResult<ServiceResponse>;
}

/// Move files between the scheduler host and a shared location.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    async fn upload(&self, params: &Params, local: &Path, remote: &str) -> ServiceResult<ServiceResponse>;
    async fn download(&self, params: &Params, remote: &str, local: &Path) -> ServiceResult<ServiceResponse>;
}

/// Capability names, used when an environment is built without one it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    LocalExecutor,
    HostProvisioner,
    HostOps,
    RemoteExecutor,
    FileTransfer,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::LocalExecutor => "LocalExecutor",
            Capability::HostProvisioner => "HostProvisioner",
            Capability::HostOps => "HostOps",
            Capability::RemoteExecutor => "RemoteExecutor",
            Capability::FileTransfer => "FileTransfer",
        };
        f.write_str(name)
    }
}

/// The set of capabilities available to environments of one run.
#[derive(Clone, Default)]
pub struct Services {
    pub local_executor: Option<Arc<dyn LocalExecutor>>,
    pub host_provisioner: Option<Arc<dyn HostProvisioner>>,
    pub host_ops: Option<Arc<dyn HostOps>>,
    pub remote_executor: Option<Arc<dyn RemoteExecutor>>,
    pub file_transfer: Option<Arc<dyn FileTransfer>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_executor(mut self, service: Arc<dyn LocalExecutor>) -> Self {
        self.local_executor = Some(service);
        self
    }

    pub fn with_host_provisioner(mut self, service: Arc<dyn HostProvisioner>) -> Self {
        self.host_provisioner = Some(service);
        self
    }

    pub fn with_host_ops(mut self, service: Arc<dyn HostOps>) -> Self {
        self.host_ops = Some(service);
        self
    }

    pub fn with_remote_executor(mut self, service: Arc<dyn RemoteExecutor>) -> Self {
        self.remote_executor = Some(service);
        self
    }

    pub fn with_file_transfer(mut self, service: Arc<dyn FileTransfer>) -> Self {
        self.file_transfer = Some(service);
        self
    }

    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::LocalExecutor => self.local_executor.is_some(),
            Capability::HostProvisioner => self.host_provisioner.is_some(),
            Capability::HostOps => self.host_ops.is_some(),
            Capability::RemoteExecutor => self.remote_executor.is_some(),
            Capability::FileTransfer => self.file_transfer.is_some(),
        }
    }

    /// The first capability from `required` that is not available.
    pub fn first_missing(&self, required: &[Capability]) -> Option<Capability> {
        required.iter().copied().find(|c| !self.has(*c))
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("local_executor", &self.local_executor.is_some())
            .field("host_provisioner", &self.host_provisioner.is_some())
            .field("host_ops", &self.host_ops.is_some())
            .field("remote_executor", &self.remote_executor.is_some())
            .field("file_transfer", &self.file_transfer.is_some())
            .finish()
    }
}
