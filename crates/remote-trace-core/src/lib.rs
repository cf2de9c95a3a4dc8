//! Core abstractions for remote trace sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `TraceSpec` - Immutable description of a requested trace
//! - `Session` - Session record and state machine
//! - Storage and remote executor traits

pub mod session;
pub mod spec;
pub mod traits;

pub use session::{
    Failure, FailureCause, Session, SessionFilter, SessionId, SessionStatus, StatusChange,
    Termination,
};
pub use spec::{ArtifactRef, SpecError, TraceKind, TraceSpec};
pub use traits::{
    ExecutorError, RemoteCommand, RemoteExecutor, RunOutcome, SessionStore, StoreError,
    TargetDescriptor,
};
