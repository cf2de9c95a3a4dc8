//! Remote executor backed by the `adb` command-line tool.

use std::{path::Path, path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use remote_trace_core::{
    ExecutorError, RemoteCommand, RemoteExecutor, RunOutcome, TargetDescriptor,
    spec::duration_secs,
};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::resolve::resolve_executable_path;

const READ_CHUNK: usize = 8 * 1024;
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// ADB executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdbConfig {
    /// `adb` executable name or path.
    pub adb_binary: String,
    /// Upper bound for a single push.
    #[serde(with = "duration_secs")]
    pub push_timeout: Duration,
    /// Extra time past the budget before the run is killed locally.
    #[serde(with = "duration_secs")]
    pub grace_period: Duration,
    /// Upper bound for `adb devices`.
    #[serde(with = "duration_secs")]
    pub list_timeout: Duration,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            adb_binary: "adb".to_string(),
            push_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(10),
            list_timeout: Duration::from_secs(10),
        }
    }
}

/// Runs trace artifacts on Android targets over ADB.
#[derive(Debug, Clone)]
pub struct AdbExecutor {
    adb: PathBuf,
    config: AdbConfig,
}

impl AdbExecutor {
    /// Create an executor, resolving the `adb` binary.
    ///
    /// # Errors
    /// Returns error if `adb` cannot be found.
    pub async fn new(config: AdbConfig) -> Result<Self, ExecutorError> {
        let adb = resolve_executable_path(&config.adb_binary)
            .await
            .ok_or_else(|| ExecutorError::ExecutableNotFound(config.adb_binary.clone()))?;
        tracing::debug!(adb = %adb.display(), "Resolved adb");
        Ok(Self { adb, config })
    }

    #[must_use]
    pub const fn config(&self) -> &AdbConfig {
        &self.config
    }

    fn adb(&self, target_id: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.adb);
        if let Some(target) = target_id {
            cmd.arg("-s").arg(target);
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// Kill the local transport and reap the remote process.
    async fn terminate(&self, child: &mut AsyncGroupChild, target_id: &str, command: &RemoteCommand) {
        if let Err(e) = child.kill().await {
            tracing::debug!(target = target_id, "Failed to kill adb process group: {e}");
        }

        let Ok(pattern) = shlex::try_quote(&command.artifact_path) else {
            return;
        };
        let mut reap = self.adb(Some(target_id));
        reap.arg("shell")
            .arg(format!("pkill -f {pattern}"))
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match tokio::time::timeout(REAP_TIMEOUT, reap.status()).await {
            Ok(Ok(status)) => tracing::debug!(target = target_id, ?status, "Reaped remote tracer"),
            Ok(Err(e)) => tracing::debug!(target = target_id, "Failed to reap remote tracer: {e}"),
            Err(_) => tracing::debug!(target = target_id, "Timed out reaping remote tracer"),
        }
    }
}

#[async_trait]
impl RemoteExecutor for AdbExecutor {
    async fn list_targets(&self) -> Result<Vec<TargetDescriptor>, ExecutorError> {
        let mut cmd = self.adb(None);
        cmd.args(["devices", "-l"]);
        let output = tokio::time::timeout(self.config.list_timeout, cmd.output())
            .await
            .map_err(|_| ExecutorError::CommandFailed("adb devices timed out".to_string()))??;
        if !output.status.success() {
            return Err(ExecutorError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let targets = parse_device_list(&String::from_utf8_lossy(&output.stdout));
        tracing::info!(count = targets.len(), "Detected targets");
        Ok(targets)
    }

    async fn push(
        &self,
        target_id: &str,
        local: &Path,
        remote_path: &str,
    ) -> Result<(), ExecutorError> {
        let mut cmd = self.adb(Some(target_id));
        cmd.arg("push").arg(local).arg(remote_path);

        let output = match tokio::time::timeout(self.config.push_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ExecutorError::PushFailed(e.to_string())),
            Err(_) => {
                return Err(ExecutorError::PushFailed(format!(
                    "push timed out after {:?}",
                    self.config.push_timeout
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::error!(target = target_id, "Failed to push artifact: {stderr}");
            return Err(ExecutorError::PushFailed(stderr));
        }

        tracing::info!(target = target_id, remote_path, "Artifact pushed");
        Ok(())
    }

    async fn run(
        &self,
        target_id: &str,
        command: &RemoteCommand,
        budget: Duration,
        output: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, ExecutorError> {
        if cancel.is_cancelled() {
            tracing::info!(target = target_id, "Run cancelled before start");
            return Ok(RunOutcome::Cancelled);
        }
        let mut cmd = self.adb(Some(target_id));
        cmd.arg("shell")
            .arg(&command.command_line)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::debug!(target = target_id, command = %command.command_line, "Spawning remote command");
        let mut child = cmd
            .group_spawn()
            .map_err(|e| ExecutorError::CommandFailed(format!("failed to spawn adb: {e}")))?;

        let stdout = child.inner().stdout.take();
        let stderr = child.inner().stderr.take();
        let pump = tokio::spawn(pump_output(stdout, output));
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            String::from_utf8_lossy(&buf).trim().to_string()
        });

        let deadline = budget + self.config.grace_period;
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::info!(target = target_id, "Remote command cancelled");
                self.terminate(&mut child, target_id, command).await;
                RunOutcome::Cancelled
            }
            status = child.wait() => RunOutcome::Exited(status?.code().unwrap_or(-1)),
            () = tokio::time::sleep(deadline) => {
                tracing::warn!(target = target_id, ?deadline, "Remote command timed out");
                self.terminate(&mut child, target_id, command).await;
                RunOutcome::TimedOut
            }
        };

        // Output already read stays delivered; wait briefly for the tail.
        match tokio::time::timeout(self.config.grace_period, pump).await {
            Ok(Ok(bytes)) => tracing::debug!(target = target_id, bytes, "Output stream closed"),
            Ok(Err(e)) => tracing::error!(target = target_id, "Output pump failed: {e}"),
            Err(_) => tracing::warn!(target = target_id, "Output pump did not finish"),
        }

        if let RunOutcome::Exited(code) = outcome {
            if code != 0 {
                let stderr = stderr_task.await.unwrap_or_default();
                tracing::error!(target = target_id, code, "Remote command failed: {stderr}");
            }
        } else {
            stderr_task.abort();
        }

        Ok(outcome)
    }
}

/// Forward a pipe to the output channel until EOF or the receiver goes away.
async fn pump_output<R>(pipe: Option<R>, output: mpsc::Sender<Bytes>) -> u64
where
    R: AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return 0;
    };
    let mut total = 0u64;
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                if output.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::error!("Error reading remote output: {e}");
                break;
            }
        }
    }
    total
}

/// Parse `adb devices -l` output.
#[must_use]
pub fn parse_device_list(output: &str) -> Vec<TargetDescriptor> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('*') && !line.starts_with("List of"))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?;
            let state = parts.next()?;
            let mut target = TargetDescriptor {
                id: id.to_string(),
                state: state.to_string(),
                model: None,
                product: None,
                device: None,
                transport_id: None,
            };
            for (key, value) in parts.filter_map(|p| p.split_once(':')) {
                let slot = match key {
                    "model" => &mut target.model,
                    "product" => &mut target.product,
                    "device" => &mut target.device,
                    "transport_id" => &mut target.transport_id,
                    _ => continue,
                };
                *slot = Some(value.to_string());
            }
            Some(target)
        })
        .collect()
}
