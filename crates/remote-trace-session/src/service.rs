//! Boundary facade over orchestration, storage and analysis.

use std::{collections::BTreeMap, io, num::NonZeroUsize, path::PathBuf};

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use remote_trace_analysis::{
    EventStream, GroupKey, Summary, TraceStatistics, TypeTimeline, export_tabular, parse_file,
    statistics, summary, timeline,
};
use remote_trace_core::{
    ExecutorError, RemoteExecutor, Session, SessionFilter, SessionId, SessionStore, StoreError,
    TargetDescriptor, TraceSpec,
};
use tokio_util::io::ReaderStream;

use crate::orchestrator::{OrchestratorError, TraceOrchestrator};

/// Service error.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("No artifact on disk for session {0}")]
    ArtifactMissing(SessionId),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The operations exposed to callers.
pub struct TraceService<S, E> {
    orchestrator: TraceOrchestrator<S, E>,
}

impl<S, E> Clone for TraceService<S, E> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
        }
    }
}

impl<S, E> TraceService<S, E>
where
    S: SessionStore + 'static,
    E: RemoteExecutor + 'static,
{
    #[must_use]
    pub const fn new(orchestrator: TraceOrchestrator<S, E>) -> Self {
        Self { orchestrator }
    }

    #[must_use]
    pub const fn orchestrator(&self) -> &TraceOrchestrator<S, E> {
        &self.orchestrator
    }

    /// Accept a trace request; the session runs in the background.
    ///
    /// # Errors
    /// Returns error if the target is busy or the session cannot be stored.
    pub async fn create_session(&self, spec: TraceSpec) -> Result<SessionId, ServiceError> {
        let handle = self.orchestrator.start_session(spec).await?;
        Ok(handle.id().clone())
    }

    /// # Errors
    /// Returns error if the store fails.
    pub async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, ServiceError> {
        Ok(self.orchestrator.store().get(id).await?)
    }

    /// # Errors
    /// Returns error if the store fails.
    pub async fn list_sessions(&self, filter: SessionFilter) -> Result<Vec<Session>, ServiceError> {
        Ok(self.orchestrator.store().list(filter).await?)
    }

    /// # Errors
    /// Returns error if the session or its artifact is missing.
    pub async fn get_summary(&self, id: &SessionId, top_n: NonZeroUsize) -> Result<Summary, ServiceError> {
        let stream = self.load_events(id).await?;
        Ok(summary(&stream, top_n))
    }

    /// # Errors
    /// Returns error if the session or its artifact is missing.
    pub async fn get_statistics(&self, id: &SessionId) -> Result<TraceStatistics, ServiceError> {
        let stream = self.load_events(id).await?;
        Ok(statistics(&stream))
    }

    /// # Errors
    /// Returns error if the session or its artifact is missing.
    pub async fn get_timeline(
        &self,
        id: &SessionId,
    ) -> Result<BTreeMap<GroupKey<String>, TypeTimeline>, ServiceError> {
        let stream = self.load_events(id).await?;
        Ok(timeline(&stream))
    }

    /// # Errors
    /// Returns error if the session or its artifact is missing.
    pub async fn export_csv(&self, id: &SessionId) -> Result<String, ServiceError> {
        let stream = self.load_events(id).await?;
        Ok(export_tabular(&stream).to_csv())
    }

    /// Raw artifact bytes.
    ///
    /// # Errors
    /// Returns error if the session or its artifact is missing.
    pub async fn download_artifact(
        &self,
        id: &SessionId,
    ) -> Result<BoxStream<'static, io::Result<Bytes>>, ServiceError> {
        let path = self.artifact_path(id).await?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ServiceError::ArtifactMissing(id.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(ReaderStream::new(file).boxed())
    }

    /// Cancel a session. Returns `false` when it is no longer running.
    ///
    /// # Errors
    /// Returns error if the session does not exist.
    pub async fn cancel_session(&self, id: &SessionId) -> Result<bool, ServiceError> {
        let session = self
            .orchestrator
            .store()
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(id.clone()))?;
        if session.is_terminal() {
            return Ok(false);
        }
        Ok(self.orchestrator.cancel_session(id).await)
    }

    /// # Errors
    /// Returns error if the transport cannot enumerate targets.
    pub async fn list_targets(&self) -> Result<Vec<TargetDescriptor>, ServiceError> {
        Ok(self.orchestrator.executor().list_targets().await?)
    }

    async fn artifact_path(&self, id: &SessionId) -> Result<PathBuf, ServiceError> {
        let session = self
            .orchestrator
            .store()
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(id.clone()))?;
        if tokio::fs::metadata(&session.output_path)
            .await
            .is_ok_and(|m| m.is_file())
        {
            Ok(session.output_path)
        } else {
            Err(ServiceError::ArtifactMissing(id.clone()))
        }
    }

    async fn load_events(&self, id: &SessionId) -> Result<EventStream, ServiceError> {
        let path = self.artifact_path(id).await?;
        tokio::task::spawn_blocking(move || parse_file(path))
            .await
            .map_err(io::Error::other)?
            .map_err(ServiceError::from)
    }
}
