//! Trace session orchestration and storage.
//!
//! Provides:
//! - `TraceOrchestrator` - Drive sessions from request to persisted artifact
//! - `TraceService` - Boundary operations, including analysis of artifacts
//! - Storage implementations (memory)

pub mod config;
pub mod orchestrator;
pub mod service;
pub mod sink;
pub mod storage;

pub use config::{ConfigError, OrchestratorConfig, Settings};
pub use orchestrator::{OrchestratorError, SessionHandle, TraceOrchestrator};
pub use service::{ServiceError, TraceService};
#[cfg(feature = "memory")]
pub use storage::MemorySessionStore;
