//! Offline analysis of trace artifacts.
//!
//! Provides:
//! - `parser` - NDJSON decoding with per-line recovery
//! - `aggregate` - filters, grouping, summaries and profiles
//! - `timeline` - per-type timing and interval statistics
//! - `export` - flat tables and CSV

pub mod aggregate;
pub mod event;
pub mod export;
pub mod parser;
pub mod timeline;

pub use aggregate::{
    CommStats, DEFAULT_TOP_N, EventFilter, PidStats, ProcessCount, ProcessProfile, Summary,
    TraceStatistics, TypeCount, count_by_type, filter_by_comm, filter_by_pid, filter_by_type,
    group_by_comm, group_by_pid, process_profiles, statistics, summary,
};
pub use event::{Event, GroupKey, Scalar, UNKNOWN_LABEL};
pub use export::{Table, export_tabular};
pub use parser::{DecodeError, EventStream, LineFailure, decode_line, parse_bytes, parse_file, parse_reader};
pub use timeline::{IntervalStats, TypeTimeline, timeline, timeline_for};
