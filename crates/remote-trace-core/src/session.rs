//! Session records and the session state machine.

use std::{fmt, path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::spec::{TraceKind, duration_secs};

/// Opaque session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session status.
///
/// `Pending -> Running -> {Completed, Failed, TimedOut}`, plus
/// `Pending -> Failed` when the session never reaches the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, no command started yet.
    Pending,
    /// Remote command is running.
    Running,
    /// Remote command exited successfully.
    Completed,
    /// Session failed; see the failure record.
    Failed,
    /// Wall-clock budget exceeded.
    TimedOut,
}

impl SessionStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    /// Whether `self -> next` is an edge of the state machine.
    ///
    /// `Pending -> Failed` is taken only when staging, command building, push
    /// or opening the output file fails before the command starts.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Failed)
                | (Self::Running, Self::Completed | Self::Failed | Self::TimedOut)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Why a session ended unsuccessfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// Artifact absent locally.
    ScriptNotFound,
    /// Transfer to the target failed.
    PushFailed,
    /// Remote command exited non-zero or could not be started.
    CommandFailed,
    /// Wall-clock budget exceeded.
    CommandTimeout,
    /// Output could not be persisted locally.
    Io,
    /// Session was cancelled by the caller.
    Cancelled,
}

/// Failure cause plus a human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub cause: FailureCause,
    pub message: String,
}

impl Failure {
    #[must_use]
    pub fn new(cause: FailureCause, message: impl Into<String>) -> Self {
        Self {
            cause,
            message: message.into(),
        }
    }
}

/// One entry of a session's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: SessionStatus,
    pub at: DateTime<Utc>,
}

/// Persisted session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// Target the artifact runs on.
    pub target_id: String,
    /// Logical trace kind.
    pub kind: TraceKind,
    /// Current status.
    pub status: SessionStatus,
    /// Creation time.
    pub started_at: DateTime<Utc>,
    /// Set when the session becomes terminal.
    pub ended_at: Option<DateTime<Utc>>,
    /// Local artifact the output is written to.
    pub output_path: PathBuf,
    /// Configured duration budget.
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    /// Bytes persisted; written once, on the terminal transition.
    pub bytes_written: u64,
    /// Set for `Failed` and `TimedOut` sessions.
    pub failure: Option<Failure>,
    /// Every status entered, oldest first.
    pub history: Vec<StatusChange>,
}

impl Session {
    /// Create a record in `Pending`.
    #[must_use]
    pub fn pending(
        id: SessionId,
        target_id: impl Into<String>,
        kind: TraceKind,
        duration: Duration,
        output_path: PathBuf,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            target_id: target_id.into(),
            kind,
            status: SessionStatus::Pending,
            started_at,
            ended_at: None,
            output_path,
            duration,
            bytes_written: 0,
            failure: None,
            history: vec![StatusChange {
                status: SessionStatus::Pending,
                at: started_at,
            }],
        }
    }

    /// Create a record that failed before reaching the target.
    #[must_use]
    pub fn failed_at_creation(
        id: SessionId,
        target_id: impl Into<String>,
        kind: TraceKind,
        duration: Duration,
        output_path: PathBuf,
        failure: Failure,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            target_id: target_id.into(),
            kind,
            status: SessionStatus::Failed,
            started_at: now,
            ended_at: Some(now),
            output_path,
            duration,
            bytes_written: 0,
            failure: Some(failure),
            history: vec![StatusChange {
                status: SessionStatus::Failed,
                at: now,
            }],
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Statuses entered so far, oldest first.
    pub fn status_path(&self) -> impl Iterator<Item = SessionStatus> + '_ {
        self.history.iter().map(|c| c.status)
    }
}

/// Terminal outcome applied by [`crate::SessionStore::finish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub status: SessionStatus,
    pub bytes_written: u64,
    pub failure: Option<Failure>,
}

impl Termination {
    #[must_use]
    pub const fn completed(bytes_written: u64) -> Self {
        Self {
            status: SessionStatus::Completed,
            bytes_written,
            failure: None,
        }
    }

    #[must_use]
    pub const fn failed(bytes_written: u64, failure: Failure) -> Self {
        Self {
            status: SessionStatus::Failed,
            bytes_written,
            failure: Some(failure),
        }
    }

    #[must_use]
    pub const fn timed_out(bytes_written: u64, failure: Failure) -> Self {
        Self {
            status: SessionStatus::TimedOut,
            bytes_written,
            failure: Some(failure),
        }
    }
}

/// Session filter for queries.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Filter by status.
    pub status: Option<SessionStatus>,
    /// Filter by target.
    pub target_id: Option<String>,
    /// Limit results.
    pub limit: Option<usize>,
}

impl SessionFilter {
    /// Whether a session passes the status and target filters.
    #[must_use]
    pub fn matches(&self, session: &Session) -> bool {
        if self.status.is_some_and(|s| s != session.status) {
            return false;
        }
        if let Some(ref target) = self.target_id {
            if session.target_id != *target {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_edges() {
        use SessionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(TimedOut));
        for terminal in [Completed, Failed, TimedOut] {
            assert!(Running.can_transition_to(terminal));
            assert!(terminal.is_terminal());
            for next in [Pending, Running, Completed, Failed, TimedOut] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!Running.can_transition_to(Pending));
    }

    #[test]
    fn test_failed_at_creation_skips_running() {
        let s = Session::failed_at_creation(
            SessionId::generate(),
            "dev",
            TraceKind::Memory,
            Duration::from_secs(1),
            PathBuf::from("out.json"),
            Failure::new(FailureCause::ScriptNotFound, "missing"),
        );
        assert_eq!(s.status_path().collect::<Vec<_>>(), vec![SessionStatus::Failed]);
        assert!(s.ended_at.is_some());
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }
}
