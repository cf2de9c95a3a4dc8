//! In-memory session store.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use chrono::Utc;
use remote_trace_core::{
    Session, SessionFilter, SessionId, SessionStatus, SessionStore, StatusChange, StoreError,
    Termination,
};

/// In-memory store implementation.
///
/// Suitable for single-process deployments. Records are lost on restart.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl MemorySessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_edge(session: &Session, to: SessionStatus) -> Result<(), StoreError> {
    if session.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            id: session.id.clone(),
            from: session.status,
            to,
        })
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: Session) -> Result<(), StoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        if sessions.contains_key(&session.id) {
            return Err(StoreError::Duplicate(session.id));
        }
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self
            .sessions
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .get(id)
            .cloned())
    }

    async fn list(&self, filter: SessionFilter) -> Result<Vec<Session>, StoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let mut result: Vec<Session> = sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();

        // Newest first
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }

        Ok(result)
    }

    async fn transition(&self, id: &SessionId, status: SessionStatus) -> Result<(), StoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        // Terminal statuses carry an end time and byte count; they go through `finish`.
        if status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                id: id.clone(),
                from: session.status,
                to: status,
            });
        }
        check_edge(session, status)?;

        session.status = status;
        session.history.push(StatusChange {
            status,
            at: Utc::now(),
        });
        Ok(())
    }

    async fn finish(&self, id: &SessionId, termination: Termination) -> Result<Session, StoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        if !termination.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                id: id.clone(),
                from: session.status,
                to: termination.status,
            });
        }
        check_edge(session, termination.status)?;

        let now = Utc::now();
        session.status = termination.status;
        session.ended_at = Some(now);
        session.bytes_written = termination.bytes_written;
        session.failure = termination.failure;
        session.history.push(StatusChange {
            status: termination.status,
            at: now,
        });
        Ok(session.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use chrono::TimeDelta;
    use remote_trace_core::{Failure, FailureCause, TraceKind};

    use super::*;

    fn pending(target: &str, offset_secs: i64) -> Session {
        Session::pending(
            SessionId::generate(),
            target,
            TraceKind::Syscall,
            Duration::from_secs(10),
            PathBuf::from(format!("{target}.json")),
            Utc::now() + TimeDelta::seconds(offset_secs),
        )
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let store = MemorySessionStore::new();
        let s = pending("dev", 0);
        let id = s.id.clone();
        store.insert(s).await.unwrap();

        store.transition(&id, SessionStatus::Running).await.unwrap();
        let done = store.finish(&id, Termination::completed(42)).await.unwrap();

        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.bytes_written, 42);
        assert!(done.ended_at.is_some());
        assert_eq!(
            done.status_path().collect::<Vec<_>>(),
            vec![SessionStatus::Pending, SessionStatus::Running, SessionStatus::Completed]
        );
    }

    #[tokio::test]
    async fn test_rejects_invalid_transitions() {
        let store = MemorySessionStore::new();
        let s = pending("dev", 0);
        let id = s.id.clone();
        store.insert(s).await.unwrap();

        let err = store
            .finish(&id, Termination::completed(0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let err = store.transition(&id, SessionStatus::Failed).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        store
            .finish(
                &id,
                Termination::failed(0, Failure::new(FailureCause::PushFailed, "offline")),
            )
            .await
            .unwrap();
        let err = store.transition(&id, SessionStatus::Running).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_ids() {
        let store = MemorySessionStore::new();
        let s = pending("dev", 0);
        store.insert(s.clone()).await.unwrap();
        assert!(matches!(store.insert(s).await, Err(StoreError::Duplicate(_))));

        let unknown = SessionId::from("nope");
        assert!(store.get(&unknown).await.unwrap().is_none());
        assert!(matches!(
            store.transition(&unknown, SessionStatus::Running).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let store = MemorySessionStore::new();
        store.insert(pending("a", 0)).await.unwrap();
        store.insert(pending("b", 5)).await.unwrap();
        store.insert(pending("a", 10)).await.unwrap();

        let all = store.list(SessionFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].started_at >= w[1].started_at));

        let only_a = store
            .list(SessionFilter {
                target_id: Some("a".into()),
                limit: Some(1),
                ..SessionFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].started_at, all[0].started_at);
    }
}
