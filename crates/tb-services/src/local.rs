//! Services that act on the scheduler host itself.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::capabilities::{
    ExecOutput, FileTransfer, LocalExecutor, Params, ServiceResponse, ServiceResult,
};

/// Runs each script line through `sh -c` in a child process.
#[derive(Debug, Clone)]
pub struct LocalExecService {
    shell: String,
    abort_on_error: bool,
}

impl Default for LocalExecService {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            abort_on_error: true,
        }
    }
}

impl LocalExecService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Keep running the remaining lines after a non-zero exit.
    pub fn continue_on_error(mut self) -> Self {
        self.abort_on_error = false;
        self
    }

    async fn exec_line(
        &self,
        line: &str,
        cwd: Option<&Path>,
        env: &BTreeMap<String, String>,
    ) -> ServiceResult<ExecOutput> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(line).envs(env).kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let output = cmd.output().await?;
        Ok(ExecOutput {
            // Killed by a signal: no exit code.
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl LocalExecutor for LocalExecService {
    async fn local_exec(
        &self,
        script: &[String],
        cwd: Option<&Path>,
        env: &BTreeMap<String, String>,
    ) -> ServiceResult<ExecOutput> {
        let mut total = ExecOutput::default();
        for line in script.iter().filter(|l| !l.trim().is_empty()) {
            debug!(command = %line, "Local exec");
            let out = self.exec_line(line, cwd, env).await?;
            total.exit_code = out.exit_code;
            total.stdout.push_str(&out.stdout);
            total.stderr.push_str(&out.stderr);
            if out.exit_code != 0 {
                warn!(command = %line, exit_code = out.exit_code, "Local command failed");
                if self.abort_on_error {
                    break;
                }
            }
        }
        Ok(total)
    }
}

/// File transfer to a directory on the local filesystem standing in for a
/// remote share.
#[derive(Debug, Clone)]
pub struct LocalFileShare {
    root: PathBuf,
}

impl LocalFileShare {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, remote: &str) -> PathBuf {
        self.root.join(remote.trim_start_matches('/'))
    }
}

async fn copy_file(from: &Path, to: &Path) -> ServiceResponse {
    if let Some(parent) = to.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return ServiceResponse::failed(format!("cannot create {}: {e}", parent.display()));
        }
    }
    match tokio::fs::copy(from, to).await {
        Ok(bytes) => ServiceResponse::succeeded().with_payload("bytes", bytes),
        Err(e) => ServiceResponse::failed(format!(
            "copy {} -> {} failed: {e}",
            from.display(),
            to.display()
        )),
    }
}

#[async_trait]
impl FileTransfer for LocalFileShare {
    async fn upload(&self, _params: &Params, local: &Path, remote: &str) -> ServiceResult<ServiceResponse> {
        let target = self.resolve(remote);
        debug!(from = %local.display(), to = %target.display(), "Upload");
        Ok(copy_file(local, &target).await)
    }

    async fn download(&self, _params: &Params, remote: &str, local: &Path) -> ServiceResult<ServiceResponse> {
        let source = self.resolve(remote);
        debug!(from = %source.display(), to = %local.display(), "Download");
        Ok(copy_file(&source, local).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(script: &[&str]) -> Vec<String> {
        script.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn exec_collects_stdout_and_env() {
        let service = LocalExecService::new();
        let mut env = BTreeMap::new();
        env.insert("THREADS".to_string(), "8".to_string());
        let out = service
            .local_exec(&lines(&["echo threads=$THREADS", "echo done"]), None, &env)
            .await
            .unwrap();
        assert!(out.is_success());
        assert_eq!(out.stdout, "threads=8\ndone\n");
    }

    #[tokio::test]
    async fn exec_stops_at_first_failure() {
        let service = LocalExecService::new();
        let out = service
            .local_exec(&lines(&["echo one", "exit 3", "echo never"]), None, &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout, "one\n");
    }

    #[tokio::test]
    async fn exec_runs_in_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalExecService::new();
        service
            .local_exec(&lines(&["echo hi > marker.txt"]), Some(dir.path()), &BTreeMap::new())
            .await
            .unwrap();
        assert!(dir.path().join("marker.txt").exists());
    }

    #[tokio::test]
    async fn file_share_round_trip() {
        let share_dir = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        let share = LocalFileShare::new(share_dir.path());

        let local = work_dir.path().join("config.ini");
        tokio::fs::write(&local, "threads=4\n").await.unwrap();

        let up = share.upload(&Params::new(), &local, "/configs/config.ini").await.unwrap();
        assert!(up.is_success());
        assert!(share_dir.path().join("configs/config.ini").exists());

        let back = work_dir.path().join("copy.ini");
        let down = share.download(&Params::new(), "configs/config.ini", &back).await.unwrap();
        assert!(down.is_success());
        assert_eq!(tokio::fs::read_to_string(&back).await.unwrap(), "threads=4\n");

        let missing = share
            .download(&Params::new(), "nope.ini", &work_dir.path().join("x"))
            .await
            .unwrap();
        assert_eq!(missing.status, tb_types::Status::Failed);
    }
}
