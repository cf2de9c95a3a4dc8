//! Remote executors for trace artifacts.
//!
//! Provides:
//! - Remote command building (`timeout` + `bpftrace`)
//! - `AdbExecutor` - push and run over ADB
//! - `ScriptedExecutor` - in-process replay for dry runs and tests

pub mod adb;
pub mod command;
pub mod resolve;
pub mod scripted;

pub use adb::{AdbConfig, AdbExecutor};
pub use command::{CommandBuildError, CommandBuilder, CommandParts, TraceCommandOptions, trace_command};
pub use resolve::resolve_executable_path;
pub use scripted::{ScriptedCall, ScriptedExecutor, ScriptedFinish};
