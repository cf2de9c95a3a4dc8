//! Core traits for session storage and remote execution.

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::session::{Session, SessionFilter, SessionId, SessionStatus, Termination};

/// Storage error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Session already exists: {0}")]
    Duplicate(SessionId),
    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Registry of session records.
///
/// Records are never removed. Implementations must reject transitions that
/// are not edges of the session state machine.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session.
    async fn insert(&self, session: Session) -> Result<(), StoreError>;

    /// Get a session by ID.
    async fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError>;

    /// List sessions with optional filter, newest first.
    async fn list(&self, filter: SessionFilter) -> Result<Vec<Session>, StoreError>;

    /// Move a session to a non-terminal status.
    async fn transition(&self, id: &SessionId, status: SessionStatus) -> Result<(), StoreError>;

    /// Move a session to a terminal status, recording end time and byte count.
    async fn finish(&self, id: &SessionId, termination: Termination) -> Result<Session, StoreError>;
}

/// Remote target as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    /// Serial or address used to address the target.
    pub id: String,
    /// Connection state (`device`, `offline`, `unauthorized`, ...).
    pub state: String,
    pub model: Option<String>,
    pub product: Option<String>,
    pub device: Option<String>,
    pub transport_id: Option<String>,
}

impl TargetDescriptor {
    /// Whether the target accepts commands.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.state == "device"
    }
}

/// Command to run on a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    /// Shell command line, already quoted.
    pub command_line: String,
    /// Remote path of the pushed artifact, used to reap stray processes.
    pub artifact_path: String,
}

/// How a remote run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Process exited with this status code.
    Exited(i32),
    /// Budget plus grace period expired; the process was killed.
    TimedOut,
    /// Cancellation token fired; the process was killed.
    Cancelled,
}

/// Executor error.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Push failed: {0}")]
    PushFailed(String),
    #[error("Command failed: {0}")]
    CommandFailed(String),
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pushes artifacts to targets and runs commands on them.
///
/// Holds no session state.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Enumerate reachable targets.
    async fn list_targets(&self) -> Result<Vec<TargetDescriptor>, ExecutorError>;

    /// Copy a local file to `remote_path` on the target.
    async fn push(
        &self,
        target_id: &str,
        local: &Path,
        remote_path: &str,
    ) -> Result<(), ExecutorError>;

    /// Run a command, sending stdout chunks to `output` as they arrive.
    ///
    /// Chunks carry no line framing. The run is killed once `budget` plus the
    /// executor's grace period has elapsed, or when `cancel` fires.
    async fn run(
        &self,
        target_id: &str,
        command: &RemoteCommand,
        budget: Duration,
        output: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, ExecutorError>;
}
