//! In-process executor that replays canned output.
//!
//! Behaves like a real transport with respect to budgets, grace periods and
//! cancellation, which makes it suitable for dry runs and tests.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use remote_trace_core::{
    ExecutorError, RemoteCommand, RemoteExecutor, RunOutcome, TargetDescriptor,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How a scripted run ends after its chunks are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedFinish {
    /// Exit with this status code.
    Exit(i32),
    /// Never exit; only the deadline or cancellation ends the run.
    Hang,
    /// Fail before producing output.
    SpawnError(String),
}

/// A call observed by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedCall {
    Push {
        target_id: String,
        local: PathBuf,
        remote_path: String,
    },
    Run {
        target_id: String,
        command_line: String,
    },
}

/// Executor that replays a fixed script.
#[derive(Debug, Clone)]
pub struct ScriptedExecutor {
    targets: Vec<TargetDescriptor>,
    push_error: Option<String>,
    chunks: Vec<Bytes>,
    chunk_delay: Duration,
    finish: ScriptedFinish,
    grace_period: Duration,
    calls: Arc<Mutex<Vec<ScriptedCall>>>,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExecutor {
    /// Executor that exits 0 without output.
    #[must_use]
    pub fn new() -> Self {
        Self {
            targets: Vec::new(),
            push_error: None,
            chunks: Vec::new(),
            chunk_delay: Duration::ZERO,
            finish: ScriptedFinish::Exit(0),
            grace_period: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn with_targets(mut self, targets: Vec<TargetDescriptor>) -> Self {
        self.targets = targets;
        self
    }

    /// Make every push fail with `message`.
    #[must_use]
    pub fn with_push_error(mut self, message: impl Into<String>) -> Self {
        self.push_error = Some(message.into());
        self
    }

    /// Output chunks, sent in order.
    #[must_use]
    pub fn with_chunks<I, B>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.chunks = chunks.into_iter().map(Into::into).collect();
        self
    }

    /// Delay before each chunk.
    #[must_use]
    pub const fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    #[must_use]
    pub fn with_finish(mut self, finish: ScriptedFinish) -> Self {
        self.finish = finish;
        self
    }

    #[must_use]
    pub const fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Calls observed so far, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, call: ScriptedCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    async fn replay(&self, output: mpsc::Sender<Bytes>) -> Result<RunOutcome, ExecutorError> {
        for chunk in &self.chunks {
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            if output.send(chunk.clone()).await.is_err() {
                break;
            }
        }
        drop(output);
        match &self.finish {
            ScriptedFinish::Exit(code) => Ok(RunOutcome::Exited(*code)),
            ScriptedFinish::Hang => std::future::pending().await,
            ScriptedFinish::SpawnError(message) => Err(ExecutorError::CommandFailed(message.clone())),
        }
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn list_targets(&self) -> Result<Vec<TargetDescriptor>, ExecutorError> {
        Ok(self.targets.clone())
    }

    async fn push(
        &self,
        target_id: &str,
        local: &Path,
        remote_path: &str,
    ) -> Result<(), ExecutorError> {
        self.record(ScriptedCall::Push {
            target_id: target_id.to_string(),
            local: local.to_path_buf(),
            remote_path: remote_path.to_string(),
        });
        if let Some(ref message) = self.push_error {
            return Err(ExecutorError::PushFailed(message.clone()));
        }
        if !local.is_file() {
            return Err(ExecutorError::PushFailed(format!(
                "local artifact missing: {}",
                local.display()
            )));
        }
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
        self.record(ScriptedCall::Run {
            target_id: target_id.to_string(),
            command_line: command.command_line.clone(),
        });
        if let ScriptedFinish::SpawnError(ref message) = self.finish {
            return Err(ExecutorError::CommandFailed(message.clone()));
        }

        let deadline = budget + self.grace_period;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Ok(RunOutcome::Cancelled),
            outcome = self.replay(output) => outcome,
            () = tokio::time::sleep(deadline) => {
                tracing::warn!(target = target_id, ?deadline, "Scripted command timed out");
                Ok(RunOutcome::TimedOut)
            }
        }
    }
}
