//! Trace session orchestration.
//!
//! A session moves `Pending -> Running -> {Completed, Failed, TimedOut}`, or
//! `Pending -> Failed` when it never reaches the target. Sessions whose
//! artifact cannot be found are stored directly as `Failed`.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use chrono::Utc;
use remote_trace_core::{
    ArtifactRef, ExecutorError, Failure, FailureCause, RemoteExecutor, RunOutcome, Session,
    SessionId, SessionStatus, SessionStore, StoreError, Termination, TraceSpec,
};
use remote_trace_executor::trace_command;
use tokio::{
    sync::{RwLock, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::OrchestratorConfig,
    sink::{ArtifactSink, PathAllocator, artifact_file_name},
};

/// Subdirectory of the output directory holding inline scripts before push.
const STAGING_DIR: &str = ".staging";

/// Orchestrator error.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Target already has a live session: {0}")]
    TargetBusy(String),
    #[error("Session task failed: {0}")]
    Task(String),
}

/// A session that has been accepted and is running in its own task.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    task: JoinHandle<Result<Session, OrchestratorError>>,
}

impl SessionHandle {
    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    /// Wait for the session to become terminal.
    ///
    /// # Errors
    /// Returns error if the store rejects an update or the task panicked.
    pub async fn wait(self) -> Result<Session, OrchestratorError> {
        self.task
            .await
            .map_err(|e| OrchestratorError::Task(e.to_string()))?
    }
}

struct LiveSession {
    target_id: String,
    cancel: CancellationToken,
}

struct PreparedRun {
    id: SessionId,
    spec: TraceSpec,
    script: PathBuf,
    remote_path: String,
    staged: Option<PathBuf>,
    output_path: PathBuf,
    cancel: CancellationToken,
}

enum Prepared {
    Run(PreparedRun),
    Failed(Session),
}

struct Shared<S, E> {
    store: S,
    executor: E,
    config: OrchestratorConfig,
    live: RwLock<HashMap<SessionId, LiveSession>>,
    paths: PathAllocator,
}

/// Runs trace sessions against remote targets and persists their output.
pub struct TraceOrchestrator<S, E> {
    shared: Arc<Shared<S, E>>,
}

impl<S, E> Clone for TraceOrchestrator<S, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S, E> TraceOrchestrator<S, E>
where
    S: SessionStore + 'static,
    E: RemoteExecutor + 'static,
{
    /// Create a new orchestrator.
    #[must_use]
    pub fn new(store: S, executor: E, config: OrchestratorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                executor,
                config,
                live: RwLock::new(HashMap::new()),
                paths: PathAllocator::new(),
            }),
        }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.shared.store
    }

    #[must_use]
    pub fn executor(&self) -> &E {
        &self.shared.executor
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    /// Create a session and run it in a background task.
    ///
    /// # Errors
    /// Returns error if the target is busy or the store rejects the session.
    pub async fn start_session(&self, spec: TraceSpec) -> Result<SessionHandle, OrchestratorError> {
        let handle = match self.prepare(spec).await? {
            Prepared::Failed(session) => SessionHandle {
                id: session.id.clone(),
                task: tokio::spawn(async move { Ok(session) }),
            },
            Prepared::Run(run) => {
                let id = run.id.clone();
                let this = self.clone();
                SessionHandle {
                    id,
                    task: tokio::spawn(async move { this.execute(run).await }),
                }
            }
        };
        Ok(handle)
    }

    /// Create a session and drive it to a terminal state.
    ///
    /// # Errors
    /// Returns error if the target is busy or the store rejects an update.
    pub async fn run_session(&self, spec: TraceSpec) -> Result<Session, OrchestratorError> {
        match self.prepare(spec).await? {
            Prepared::Failed(session) => Ok(session),
            Prepared::Run(run) => self.execute(run).await,
        }
    }

    /// Look up a session; unknown ids yield `None`.
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, OrchestratorError> {
        Ok(self.shared.store.get(id).await?)
    }

    /// Cancel a live session. Returns whether one was found.
    pub async fn cancel_session(&self, id: &SessionId) -> bool {
        let live = self.shared.live.read().await;
        match live.get(id) {
            Some(session) => {
                tracing::info!(session_id = %id, target = %session.target_id, "Cancelling session");
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Sessions not yet terminal.
    pub async fn live_sessions(&self) -> Vec<SessionId> {
        self.shared.live.read().await.keys().cloned().collect()
    }

    async fn register(
        &self,
        id: &SessionId,
        target_id: &str,
        cancel: CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let mut live = self.shared.live.write().await;
        if !self.shared.config.allow_concurrent_target_sessions
            && live.values().any(|s| s.target_id == target_id)
        {
            tracing::warn!(target = target_id, "Rejected session: target busy");
            return Err(OrchestratorError::TargetBusy(target_id.to_string()));
        }
        live.insert(
            id.clone(),
            LiveSession {
                target_id: target_id.to_string(),
                cancel,
            },
        );
        Ok(())
    }

    async fn unregister(&self, id: &SessionId) {
        self.shared.live.write().await.remove(id);
    }

    async fn prepare(&self, spec: TraceSpec) -> Result<Prepared, OrchestratorError> {
        let id = SessionId::generate();
        let cancel = CancellationToken::new();
        self.register(&id, spec.target_id(), cancel.clone()).await?;

        let prepared = self.create_record(id.clone(), spec, cancel).await;
        if !matches!(prepared, Ok(Prepared::Run(_))) {
            self.unregister(&id).await;
        }
        prepared
    }

    async fn create_record(
        &self,
        id: SessionId,
        spec: TraceSpec,
        cancel: CancellationToken,
    ) -> Result<Prepared, OrchestratorError> {
        let config = &self.shared.config;
        let now = Utc::now();
        let file_name = artifact_file_name(&spec.trace_name(), spec.target_id(), now);
        let output_path = self.shared.paths.allocate(&config.output_dir, &file_name);

        let (script, staged) = match self.resolve_artifact(&id, &spec).await {
            Ok(resolved) => resolved,
            Err(failure) => {
                tracing::warn!(
                    session_id = %id,
                    target = spec.target_id(),
                    cause = ?failure.cause,
                    "Session failed before start: {}",
                    failure.message
                );
                let session = Session::failed_at_creation(
                    id,
                    spec.target_id(),
                    spec.kind().clone(),
                    spec.duration(),
                    output_path,
                    failure,
                );
                self.shared.store.insert(session.clone()).await?;
                return Ok(Prepared::Failed(session));
            }
        };

        let session = Session::pending(
            id.clone(),
            spec.target_id(),
            spec.kind().clone(),
            spec.duration(),
            output_path.clone(),
            now,
        );
        if let Err(e) = self.shared.store.insert(session).await {
            remove_staged(staged.as_deref()).await;
            return Err(e.into());
        }
        tracing::info!(
            session_id = %id,
            target = spec.target_id(),
            kind = %spec.kind(),
            output = %output_path.display(),
            "Session created"
        );

        let script_name = script
            .file_name()
            .map_or_else(|| format!("{id}.bt"), |n| n.to_string_lossy().into_owned());
        Ok(Prepared::Run(PreparedRun {
            remote_path: config.remote_path(&script_name),
            id,
            spec,
            script,
            staged,
            output_path,
            cancel,
        }))
    }

    /// Local script for the request, plus the staging directory to clean up.
    async fn resolve_artifact(
        &self,
        id: &SessionId,
        spec: &TraceSpec,
    ) -> Result<(PathBuf, Option<PathBuf>), Failure> {
        let config = &self.shared.config;
        match spec.artifact() {
            ArtifactRef::Default => {
                let Some(name) = spec.kind().default_script() else {
                    return Err(Failure::new(
                        FailureCause::ScriptNotFound,
                        format!("no default script for kind {}", spec.kind()),
                    ));
                };
                existing_script(config.scripts_dir.join(name)).await
            }
            ArtifactRef::Path { path } => existing_script(path.clone()).await,
            ArtifactRef::Inline { name, content } => {
                let dir = config.output_dir.join(STAGING_DIR).join(id.as_str());
                let path = dir.join(name);
                let staged = async {
                    tokio::fs::create_dir_all(&dir).await?;
                    tokio::fs::write(&path, content).await
                };
                match staged.await {
                    Ok(()) => Ok((path, Some(dir))),
                    Err(e) => {
                        remove_staged(Some(&dir)).await;
                        Err(Failure::new(
                            FailureCause::Io,
                            format!("failed to stage {name}: {e}"),
                        ))
                    }
                }
            }
        }
    }

    async fn execute(&self, run: PreparedRun) -> Result<Session, OrchestratorError> {
        let termination = self.drive(&run).await;
        remove_staged(run.staged.as_deref()).await;

        let result = match termination {
            Ok(termination) => self
                .shared
                .store
                .finish(&run.id, termination)
                .await
                .map_err(OrchestratorError::from),
            Err(e) => Err(e),
        };
        let result = match result {
            Ok(session) => Ok(session),
            Err(e) => self.abandon(&run.id, e).await,
        };
        self.unregister(&run.id).await;

        if let Ok(ref session) = result {
            log_terminal(session);
        }
        result
    }

    /// Best-effort terminal record for a session whose normal finish failed.
    async fn abandon(
        &self,
        id: &SessionId,
        error: OrchestratorError,
    ) -> Result<Session, OrchestratorError> {
        tracing::error!(session_id = %id, "Failed to finalize session: {error}");
        let termination = Termination::failed(
            0,
            Failure::new(FailureCause::Io, format!("session abandoned: {error}")),
        );
        match self.shared.store.finish(id, termination).await {
            Ok(session) => Ok(session),
            Err(e) => {
                tracing::error!(session_id = %id, "Session abandoned in a non-terminal state: {e}");
                Err(error)
            }
        }
    }

    async fn drive(&self, run: &PreparedRun) -> Result<Termination, OrchestratorError> {
        let shared = &self.shared;
        let target = run.spec.target_id();
        let budget = run.spec.duration();

        let command = match trace_command(
            &shared.config.command_options(),
            &run.remote_path,
            budget,
            run.spec.filter(),
        ) {
            Ok(command) => command,
            Err(e) => {
                return Ok(Termination::failed(
                    0,
                    Failure::new(FailureCause::CommandFailed, format!("invalid command: {e}")),
                ));
            }
        };

        if let Err(e) = shared.executor.push(target, &run.script, &run.remote_path).await {
            tracing::warn!(session_id = %run.id, target = %target, "Push failed: {e}");
            return Ok(Termination::failed(
                0,
                Failure::new(FailureCause::PushFailed, e.to_string()),
            ));
        }

        let mut sink = match ArtifactSink::create(&run.output_path).await {
            Ok(sink) => sink,
            Err(e) => {
                tracing::error!(session_id = %run.id, output = %run.output_path.display(), "Failed to open sink: {e}");
                return Ok(Termination::failed(
                    0,
                    Failure::new(
                        FailureCause::Io,
                        format!("failed to open {}: {e}", run.output_path.display()),
                    ),
                ));
            }
        };

        if let Err(e) = shared.store.transition(&run.id, SessionStatus::Running).await {
            drop(sink);
            if let Err(rm) = tokio::fs::remove_file(&run.output_path).await {
                tracing::debug!(output = %run.output_path.display(), "Failed to remove unused sink: {rm}");
            }
            return Err(e.into());
        }
        tracing::info!(session_id = %run.id, target = %target, command = %command.command_line, "Session running");

        let (tx, rx) = mpsc::channel::<Bytes>(shared.config.chunk_buffer.max(1));
        let (outcome, write_error) = tokio::join!(
            shared
                .executor
                .run(target, &command, budget, tx, run.cancel.clone()),
            drain(&mut sink, rx),
        );

        let bytes = sink.bytes_written();
        let finished = sink.finish().await;
        let persist_error = write_error.or_else(|| finished.err());
        Ok(termination_for(outcome, bytes, persist_error, budget))
    }
}

/// Write every chunk to the sink; after a failed write keep receiving so the
/// executor never blocks on a full channel.
async fn drain(sink: &mut ArtifactSink, mut rx: mpsc::Receiver<Bytes>) -> Option<io::Error> {
    let mut error = None;
    while let Some(chunk) = rx.recv().await {
        if error.is_some() {
            continue;
        }
        if let Err(e) = sink.write_chunk(&chunk).await {
            tracing::error!(output = %sink.path().display(), "Failed to write output: {e}");
            error = Some(e);
        }
    }
    error
}

/// Map a remote outcome to the session's terminal state.
///
/// A local persistence failure wins over whatever happened remotely.
fn termination_for(
    outcome: Result<RunOutcome, ExecutorError>,
    bytes: u64,
    persist_error: Option<io::Error>,
    budget: Duration,
) -> Termination {
    if let Some(e) = persist_error {
        return Termination::failed(
            bytes,
            Failure::new(FailureCause::Io, format!("failed to persist output: {e}")),
        );
    }
    match outcome {
        Ok(RunOutcome::Exited(0)) => Termination::completed(bytes),
        Ok(RunOutcome::Exited(code)) => Termination::failed(
            bytes,
            Failure::new(
                FailureCause::CommandFailed,
                format!("remote command exited with status {code}"),
            ),
        ),
        Ok(RunOutcome::TimedOut) => Termination::timed_out(
            bytes,
            Failure::new(
                FailureCause::CommandTimeout,
                format!("exceeded budget of {:.1}s", budget.as_secs_f64()),
            ),
        ),
        Ok(RunOutcome::Cancelled) => Termination::failed(
            bytes,
            Failure::new(FailureCause::Cancelled, "cancelled by request"),
        ),
        Err(e) => Termination::failed(bytes, Failure::new(FailureCause::CommandFailed, e.to_string())),
    }
}

async fn existing_script(path: PathBuf) -> Result<(PathBuf, Option<PathBuf>), Failure> {
    if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file()) {
        Ok((path, None))
    } else {
        Err(Failure::new(
            FailureCause::ScriptNotFound,
            format!("script not found: {}", path.display()),
        ))
    }
}

async fn remove_staged(dir: Option<&Path>) {
    let Some(dir) = dir else {
        return;
    };
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::debug!(dir = %dir.display(), "Failed to remove staged script: {e}");
        }
    }
}

fn log_terminal(session: &Session) {
    match session.failure {
        None => tracing::info!(
            session_id = %session.id,
            target = %session.target_id,
            status = %session.status,
            bytes = session.bytes_written,
            "Session finished"
        ),
        Some(ref failure) => tracing::warn!(
            session_id = %session.id,
            target = %session.target_id,
            status = %session.status,
            bytes = session.bytes_written,
            cause = ?failure.cause,
            "Session ended: {}",
            failure.message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUDGET: Duration = Duration::from_secs(5);

    #[test]
    fn test_exit_codes() {
        let t = termination_for(Ok(RunOutcome::Exited(0)), 10, None, BUDGET);
        assert_eq!(t, Termination::completed(10));

        let t = termination_for(Ok(RunOutcome::Exited(2)), 10, None, BUDGET);
        assert_eq!(t.status, SessionStatus::Failed);
        assert_eq!(t.failure.unwrap().cause, FailureCause::CommandFailed);
    }

    #[test]
    fn test_timeout_and_cancel() {
        let t = termination_for(Ok(RunOutcome::TimedOut), 3, None, BUDGET);
        assert_eq!(t.status, SessionStatus::TimedOut);
        assert_eq!(t.bytes_written, 3);
        assert_eq!(t.failure.unwrap().cause, FailureCause::CommandTimeout);

        let t = termination_for(Ok(RunOutcome::Cancelled), 0, None, BUDGET);
        assert_eq!(t.status, SessionStatus::Failed);
        assert_eq!(t.failure.unwrap().cause, FailureCause::Cancelled);
    }

    #[test]
    fn test_persist_error_overrides_success() {
        let t = termination_for(
            Ok(RunOutcome::Exited(0)),
            7,
            Some(io::Error::other("disk full")),
            BUDGET,
        );
        assert_eq!(t.status, SessionStatus::Failed);
        let failure = t.failure.unwrap();
        assert_eq!(failure.cause, FailureCause::Io);
        assert!(failure.message.contains("disk full"));
    }

    #[test]
    fn test_executor_error_is_command_failure() {
        let t = termination_for(
            Err(ExecutorError::CommandFailed("no shell".into())),
            0,
            None,
            BUDGET,
        );
        assert_eq!(t.failure.unwrap().cause, FailureCause::CommandFailed);
    }
}
