use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use remote_trace_core::{
    ArtifactRef, FailureCause, Session, SessionFilter, SessionId, SessionStatus, SessionStore,
    StoreError, Termination, TraceKind, TraceSpec,
};
use remote_trace_executor::{ScriptedCall, ScriptedExecutor, ScriptedFinish};
use remote_trace_session::{
    MemorySessionStore, OrchestratorConfig, OrchestratorError, TraceOrchestrator,
};
use tempfile::TempDir;

type Orchestrator = TraceOrchestrator<MemorySessionStore, ScriptedExecutor>;

fn config_in(dir: &Path) -> OrchestratorConfig {
    let scripts = dir.join("scripts");
    std::fs::create_dir_all(&scripts).unwrap();
    std::fs::write(scripts.join("syscall_trace.bt"), "tracepoint:raw_syscalls:sys_enter {}").unwrap();
    OrchestratorConfig {
        output_dir: dir.join("out"),
        scripts_dir: scripts,
        ..OrchestratorConfig::default()
    }
}

fn setup_with(exec: ScriptedExecutor, allow_concurrent: bool) -> (TempDir, Orchestrator) {
    let dir = tempfile::tempdir().unwrap();
    let config = OrchestratorConfig {
        allow_concurrent_target_sessions: allow_concurrent,
        ..config_in(dir.path())
    };
    let orch = TraceOrchestrator::new(MemorySessionStore::new(), exec, config);
    (dir, orch)
}

fn setup(exec: ScriptedExecutor) -> (TempDir, Orchestrator) {
    setup_with(exec, true)
}

fn syscall(target: &str, secs: u64) -> TraceSpec {
    TraceSpec::new(target, TraceKind::Syscall, Duration::from_secs(secs)).unwrap()
}

async fn wait_for_status(orch: &Orchestrator, id: &SessionId, status: SessionStatus) {
    for _ in 0..200 {
        let session = orch.get_session(id).await.unwrap().unwrap();
        if session.status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session {id} never reached {status}");
}

#[tokio::test]
async fn test_completed_session_persists_output() {
    let exec = ScriptedExecutor::new().with_chunks([
        &b"{\"event\":\"open\",\"pid\":1,\"comm\":\"a\",\"timestamp\":100}\n{\"event\":\"op"[..],
        &b"en\",\"pid\":2,\"comm\":\"b\",\"timestamp\":105}\n"[..],
    ]);
    let (_dir, orch) = setup(exec);

    let session = orch
        .run_session(syscall("emulator-5554", 5).with_filter("com.example"))
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.failure.is_none());
    assert!(session.ended_at.is_some());
    assert_eq!(
        session.status_path().collect::<Vec<_>>(),
        vec![SessionStatus::Pending, SessionStatus::Running, SessionStatus::Completed]
    );

    let written = std::fs::read(&session.output_path).unwrap();
    assert_eq!(session.bytes_written, written.len() as u64);
    let stream = remote_trace_analysis::parse_bytes(&written);
    assert_eq!(stream.len(), 2);
    assert_eq!(stream.failed_lines, 0);

    let name = session.output_path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("syscall_trace_com.example_emulator-5554_"));
    assert!(name.ends_with(".json"));

    let calls = orch.executor().calls();
    assert_eq!(
        calls[0],
        ScriptedCall::Push {
            target_id: "emulator-5554".into(),
            local: orch.config().scripts_dir.join("syscall_trace.bt"),
            remote_path: "/data/local/tmp/syscall_trace.bt".into(),
        }
    );
    assert_eq!(
        calls[1],
        ScriptedCall::Run {
            target_id: "emulator-5554".into(),
            command_line: "timeout --preserve-status -s INT 5 bpftrace -f json /data/local/tmp/syscall_trace.bt com.example".into(),
        }
    );
    assert!(orch.live_sessions().await.is_empty());
}

#[tokio::test]
async fn test_missing_script_fails_at_creation() {
    let (_dir, orch) = setup(ScriptedExecutor::new());

    let spec = TraceSpec::new("dev", TraceKind::Custom("heap".into()), Duration::from_secs(5))
        .unwrap();
    let session = orch.run_session(spec).await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.failure.as_ref().unwrap().cause, FailureCause::ScriptNotFound);
    assert_eq!(session.status_path().collect::<Vec<_>>(), vec![SessionStatus::Failed]);

    let spec = syscall("dev", 5)
        .with_artifact(ArtifactRef::Path {
            path: PathBuf::from("/nonexistent/trace.bt"),
        })
        .unwrap();
    let handle = orch.start_session(spec).await.unwrap();
    let session = handle.wait().await.unwrap();
    assert_eq!(session.failure.as_ref().unwrap().cause, FailureCause::ScriptNotFound);

    assert!(orch.executor().calls().is_empty());
    assert!(!session.output_path.exists());
}

#[tokio::test]
async fn test_push_failure_never_runs() {
    let (_dir, orch) = setup(ScriptedExecutor::new().with_push_error("device offline"));

    let session = orch.run_session(syscall("dev", 5)).await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    let failure = session.failure.as_ref().unwrap();
    assert_eq!(failure.cause, FailureCause::PushFailed);
    assert!(failure.message.contains("device offline"));
    assert_eq!(
        session.status_path().collect::<Vec<_>>(),
        vec![SessionStatus::Pending, SessionStatus::Failed]
    );
    assert_eq!(orch.executor().calls().len(), 1);
    assert!(!session.output_path.exists());
}

#[tokio::test]
async fn test_timeout_keeps_partial_output() {
    let exec = ScriptedExecutor::new()
        .with_chunks([Bytes::from_static(b"{\"event\":\"read\"}\n{\"eve")])
        .with_finish(ScriptedFinish::Hang)
        .with_grace_period(Duration::from_millis(20));
    let (_dir, orch) = setup(exec);

    let spec = TraceSpec::new("dev", TraceKind::Syscall, Duration::from_millis(50)).unwrap();
    let session = orch.run_session(spec).await.unwrap();

    assert_eq!(session.status, SessionStatus::TimedOut);
    assert_eq!(session.failure.as_ref().unwrap().cause, FailureCause::CommandTimeout);
    assert_eq!(session.bytes_written, 22);
    let written = std::fs::read(&session.output_path).unwrap();
    assert_eq!(written, b"{\"event\":\"read\"}\n{\"eve");

    let stream = remote_trace_analysis::parse_bytes(&written);
    assert_eq!(stream.len(), 1);
    assert_eq!(stream.failed_lines, 1);
}

#[tokio::test]
async fn test_nonzero_exit_fails_but_flushes() {
    let exec = ScriptedExecutor::new()
        .with_chunks([&b"{\"event\":\"exec\"}\n"[..]])
        .with_finish(ScriptedFinish::Exit(1));
    let (_dir, orch) = setup(exec);

    let session = orch.run_session(syscall("dev", 5)).await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.failure.as_ref().unwrap().cause, FailureCause::CommandFailed);
    assert_eq!(std::fs::read(&session.output_path).unwrap(), b"{\"event\":\"exec\"}\n");
    assert_eq!(session.bytes_written, 17);
}

#[tokio::test]
async fn test_spawn_error_is_command_failure() {
    let exec = ScriptedExecutor::new().with_finish(ScriptedFinish::SpawnError("no shell".into()));
    let (_dir, orch) = setup(exec);

    let session = orch.run_session(syscall("dev", 5)).await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    let failure = session.failure.unwrap();
    assert_eq!(failure.cause, FailureCause::CommandFailed);
    assert!(failure.message.contains("no shell"));
}

#[tokio::test]
async fn test_cancel_running_session() {
    let (_dir, orch) = setup(ScriptedExecutor::new().with_finish(ScriptedFinish::Hang));

    let handle = orch.start_session(syscall("dev", 600)).await.unwrap();
    let id = handle.id().clone();
    wait_for_status(&orch, &id, SessionStatus::Running).await;

    assert!(orch.cancel_session(&id).await);
    let session = handle.wait().await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.failure.as_ref().unwrap().cause, FailureCause::Cancelled);

    assert!(!orch.cancel_session(&id).await);
    assert!(!orch.cancel_session(&SessionId::from("unknown")).await);
}

#[tokio::test]
async fn test_target_busy_when_concurrency_disabled() {
    let (_dir, orch) = setup_with(ScriptedExecutor::new().with_finish(ScriptedFinish::Hang), false);

    let first = orch.start_session(syscall("dev", 600)).await.unwrap();
    let err = orch.start_session(syscall("dev", 5)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::TargetBusy(ref t) if t == "dev"));

    let other = orch.start_session(syscall("other", 600)).await.unwrap();
    assert_eq!(orch.live_sessions().await.len(), 2);

    assert!(orch.cancel_session(first.id()).await);
    assert!(orch.cancel_session(other.id()).await);
    first.wait().await.unwrap();
    other.wait().await.unwrap();

    let again = orch.start_session(syscall("dev", 600)).await.unwrap();
    assert!(orch.cancel_session(again.id()).await);
    again.wait().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_sessions_use_distinct_sinks() {
    let exec = ScriptedExecutor::new().with_chunks([&b"{\"event\":\"x\"}\n"[..]]);
    let (_dir, orch) = setup(exec);

    let a = orch.start_session(syscall("dev", 5)).await.unwrap();
    let b = orch.start_session(syscall("dev", 5)).await.unwrap();
    let (a, b) = (a.wait().await.unwrap(), b.wait().await.unwrap());

    assert_ne!(a.id, b.id);
    assert_ne!(a.output_path, b.output_path);
    assert_eq!(a.status, SessionStatus::Completed);
    assert_eq!(b.status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_inline_artifact_is_staged_and_removed() {
    let (dir, orch) = setup(ScriptedExecutor::new());

    let spec = TraceSpec::new("dev", TraceKind::Custom("binder_trace".into()), Duration::from_secs(3))
        .unwrap()
        .with_artifact(ArtifactRef::Inline {
            name: "binder.bt".into(),
            content: Bytes::from_static(b"kprobe:binder_transaction {}"),
        })
        .unwrap();
    let session = orch.run_session(spec).await.unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    let name = session.output_path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("binder_trace_dev_"));
    match &orch.executor().calls()[0] {
        ScriptedCall::Push { local, remote_path, .. } => {
            assert!(local.ends_with("binder.bt"));
            assert_eq!(remote_path, "/data/local/tmp/binder.bt");
            assert!(!local.exists());
        }
        other => panic!("unexpected call {other:?}"),
    }
    let staging = dir.path().join("out/.staging");
    assert!(std::fs::read_dir(staging).map_or(true, |mut d| d.next().is_none()));
}

#[tokio::test]
async fn test_unknown_session_is_none() {
    let (_dir, orch) = setup(ScriptedExecutor::new());
    assert!(orch.get_session(&SessionId::from("missing")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unwritable_output_dir_fails_with_io() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("blocker"), b"").unwrap();
    let config = OrchestratorConfig {
        output_dir: dir.path().join("blocker/out"),
        ..config_in(dir.path())
    };
    let orch = TraceOrchestrator::new(MemorySessionStore::new(), ScriptedExecutor::new(), config);

    let session = tokio::time::timeout(Duration::from_secs(5), orch.run_session(syscall("dev", 5)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.failure.as_ref().unwrap().cause, FailureCause::Io);
    assert_eq!(
        session.status_path().collect::<Vec<_>>(),
        vec![SessionStatus::Pending, SessionStatus::Failed]
    );

    let again = tokio::time::timeout(Duration::from_secs(5), orch.run_session(syscall("dev", 5)))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(again.output_path, session.output_path);
    assert!(orch.live_sessions().await.is_empty());
}

/// Store that refuses to mark sessions as running.
struct NoRunningStore(MemorySessionStore);

#[async_trait]
impl SessionStore for NoRunningStore {
    async fn insert(&self, session: Session) -> Result<(), StoreError> {
        self.0.insert(session).await
    }

    async fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        self.0.get(id).await
    }

    async fn list(&self, filter: SessionFilter) -> Result<Vec<Session>, StoreError> {
        self.0.list(filter).await
    }

    async fn transition(&self, _id: &SessionId, _status: SessionStatus) -> Result<(), StoreError> {
        Err(StoreError::Internal("disk full".into()))
    }

    async fn finish(&self, id: &SessionId, termination: Termination) -> Result<Session, StoreError> {
        self.0.finish(id, termination).await
    }
}

#[tokio::test]
async fn test_store_failure_leaves_terminal_record() {
    let dir = tempfile::tempdir().unwrap();
    let orch = TraceOrchestrator::new(
        NoRunningStore(MemorySessionStore::new()),
        ScriptedExecutor::new(),
        config_in(dir.path()),
    );

    let session = orch.run_session(syscall("dev", 5)).await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    let failure = session.failure.as_ref().unwrap();
    assert_eq!(failure.cause, FailureCause::Io);
    assert!(failure.message.contains("disk full"));
    assert!(!session.output_path.exists());
    assert!(orch.live_sessions().await.is_empty());

    let stored = orch.get_session(&session.id).await.unwrap().unwrap();
    assert!(stored.is_terminal());
}
