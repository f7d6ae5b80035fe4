//! Transport that runs probe commands through `kubectl exec`

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{ExecOutput, Transport, TransportError};
use crate::workload::Workload;

/// Default deadline for a single exec
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs commands in pods with `kubectl exec`
#[derive(Clone, Debug)]
pub struct KubectlTransport {
    kubeconfig: Option<PathBuf>,
    timeout: Duration,
}

impl KubectlTransport {
    /// Create a transport using the given kubeconfig (or kubectl's default)
    pub fn new(kubeconfig: Option<PathBuf>) -> Self {
        Self {
            kubeconfig,
            timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }

    /// Override the per-exec deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Full kubectl argument list for `command` in `source`
    pub fn args(&self, source: &Workload, command: &[String]) -> Vec<String> {
        let mut args = Vec::with_capacity(command.len() + 9);
        if let Some(path) = &self.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(path.display().to_string());
        }
        args.extend(
            [
                "exec",
                "-n",
                source.namespace.as_str(),
                source.name.as_str(),
                "-c",
                source.container.as_str(),
                "--",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.extend(command.iter().cloned());
        args
    }
}

/// kubectl reports the remote exit status on stderr; drop that line so only
/// the command's own stderr is kept.
fn strip_exit_notice(stderr: &str) -> String {
    stderr
        .lines()
        .filter(|l| !l.starts_with("command terminated with exit code"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Transport for KubectlTransport {
    async fn exec(
        &self,
        source: &Workload,
        command: &[String],
    ) -> Result<ExecOutput, TransportError> {
        let args = self.args(source, command);
        debug!(source = %source, command = ?command, "kubectl exec");

        let child = Command::new("kubectl")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(TransportError::other(format!(
                    "failed to run kubectl exec: {}",
                    e
                )))
            }
            Err(_) => {
                return Err(TransportError::timeout(format!(
                    "kubectl exec in {} timed out after {:?}",
                    source, self.timeout
                )))
            }
        };

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: strip_exit_notice(&String::from_utf8_lossy(&output.stderr)),
            // None means killed by a signal
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}
