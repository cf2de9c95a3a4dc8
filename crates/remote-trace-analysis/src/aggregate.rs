//! Filtering, grouping and summary views over an event stream.
//!
//! All functions are pure and borrow the stream. Keyed outputs use
//! `BTreeMap` so that serialized views are byte-stable; rankings break ties
//! by first-seen order.

use std::{
    collections::{BTreeMap, HashSet},
    hash::Hash,
    num::NonZeroUsize,
};

use indexmap::IndexMap;
use serde::Serialize;

use crate::{
    event::{Event, GroupKey},
    parser::EventStream,
};

/// Default length of ranked lists.
pub const DEFAULT_TOP_N: NonZeroUsize = match NonZeroUsize::new(10) {
    Some(n) => n,
    None => unreachable!(),
};

/// Event types listed per process profile.
const PROFILE_TOP_TYPES: usize = 5;

// =============================================================================
// FILTERS
// =============================================================================

/// Events whose `event` tag equals `event_type`.
#[must_use]
pub fn filter_by_type(stream: &EventStream, event_type: &str) -> EventStream {
    EventFilter::new().event_type(event_type).apply(stream)
}

/// Events whose `pid` equals `pid`.
#[must_use]
pub fn filter_by_pid(stream: &EventStream, pid: i64) -> EventStream {
    EventFilter::new().pid(pid).apply(stream)
}

/// Events whose `comm` contains `needle`.
#[must_use]
pub fn filter_by_comm(stream: &EventStream, needle: &str) -> EventStream {
    EventFilter::new().comm(needle).apply(stream)
}

/// Conjunction of optional type, pid and comm-substring criteria.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub event_type: Option<String>,
    pub pid: Option<i64>,
    pub comm: Option<String>,
}

impl EventFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    #[must_use]
    pub const fn pid(mut self, pid: i64) -> Self {
        self.pid = Some(pid);
        self
    }

    #[must_use]
    pub fn comm(mut self, needle: impl Into<String>) -> Self {
        self.comm = Some(needle.into());
        self
    }

    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref t) = self.event_type {
            if event.event_type() != Some(t.as_str()) {
                return false;
            }
        }
        if self.pid.is_some() && event.pid() != self.pid {
            return false;
        }
        if let Some(ref needle) = self.comm {
            if !event.comm().is_some_and(|c| c.contains(needle.as_str())) {
                return false;
            }
        }
        true
    }

    /// Matching events in their original order.
    ///
    /// The result carries no parse diagnostics of its own.
    #[must_use]
    pub fn apply(&self, stream: &EventStream) -> EventStream {
        let events: Vec<Event> = stream.iter().filter(|e| self.matches(e)).cloned().collect();
        tracing::debug!(matched = events.len(), total = stream.len(), "Filtered events");
        EventStream::from_events(events)
    }
}

// =============================================================================
// GROUPING
// =============================================================================

fn type_key(event: &Event) -> GroupKey<String> {
    GroupKey::from_label(event.event_type().map(str::to_string))
}

fn comm_key(event: &Event) -> GroupKey<String> {
    GroupKey::from_label(event.comm().map(str::to_string))
}

fn pid_key(event: &Event) -> GroupKey<i64> {
    GroupKey::from_option(event.pid())
}

/// Event count per type; untagged events count under `Unknown`.
#[must_use]
pub fn count_by_type(stream: &EventStream) -> BTreeMap<GroupKey<String>, usize> {
    let mut counts = BTreeMap::new();
    for event in stream {
        *counts.entry(type_key(event)).or_insert(0) += 1;
    }
    counts
}

/// Events grouped by pid.
#[must_use]
pub fn group_by_pid(stream: &EventStream) -> BTreeMap<GroupKey<i64>, Vec<&Event>> {
    let mut groups: BTreeMap<_, Vec<&Event>> = BTreeMap::new();
    for event in stream {
        groups.entry(pid_key(event)).or_default().push(event);
    }
    groups
}

/// Events grouped by process name.
#[must_use]
pub fn group_by_comm(stream: &EventStream) -> BTreeMap<GroupKey<&str>, Vec<&Event>> {
    let mut groups: BTreeMap<_, Vec<&Event>> = BTreeMap::new();
    for event in stream {
        groups
            .entry(GroupKey::from_label(event.comm()))
            .or_default()
            .push(event);
    }
    groups
}

/// Sort first-seen counts by count, descending, keeping first-seen order on ties.
fn rank<K: Hash + Eq>(counts: IndexMap<K, usize>, top_n: usize) -> Vec<(K, usize)> {
    let mut ranked: Vec<(K, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked.truncate(top_n);
    ranked
}

fn first_seen_counts<K, F>(stream: &EventStream, key: F) -> IndexMap<K, usize>
where
    K: Hash + Eq,
    F: Fn(&Event) -> K,
{
    let mut counts = IndexMap::new();
    for event in stream {
        *counts.entry(key(event)).or_insert(0) += 1;
    }
    counts
}

// =============================================================================
// SUMMARY
// =============================================================================

/// Event count for one process name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessCount {
    pub comm: GroupKey<String>,
    pub count: usize,
}

/// Headline numbers for a trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total_events: usize,
    pub failed_lines: usize,
    pub event_type_counts: BTreeMap<GroupKey<String>, usize>,
    pub unique_pid_count: usize,
    pub unique_comm_count: usize,
    pub top_processes: Vec<ProcessCount>,
    pub events_by_pid: BTreeMap<GroupKey<i64>, usize>,
}

/// Summarize a stream.
#[must_use]
pub fn summary(stream: &EventStream, top_n: NonZeroUsize) -> Summary {
    let unique_pid_count = stream.iter().filter_map(Event::pid).collect::<HashSet<_>>().len();
    let unique_comm_count = stream.iter().filter_map(Event::comm).collect::<HashSet<_>>().len();

    let top_processes = rank(first_seen_counts(stream, comm_key), top_n.get())
        .into_iter()
        .map(|(comm, count)| ProcessCount { comm, count })
        .collect();

    let events_by_pid = group_by_pid(stream)
        .into_iter()
        .map(|(pid, events)| (pid, events.len()))
        .collect();

    Summary {
        total_events: stream.len(),
        failed_lines: stream.failed_lines,
        event_type_counts: count_by_type(stream),
        unique_pid_count,
        unique_comm_count,
        top_processes,
        events_by_pid,
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Per-pid statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PidStats {
    pub count: usize,
    /// Process name of the first event seen for this pid.
    pub first_comm: GroupKey<String>,
}

/// Per-process-name statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommStats {
    pub count: usize,
}

/// Detailed breakdown by type, pid and process name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceStatistics {
    pub total_events: usize,
    pub failed_lines: usize,
    pub event_types: BTreeMap<GroupKey<String>, usize>,
    pub by_pid: BTreeMap<GroupKey<i64>, PidStats>,
    pub by_comm: BTreeMap<GroupKey<String>, CommStats>,
}

#[must_use]
pub fn statistics(stream: &EventStream) -> TraceStatistics {
    let by_pid = group_by_pid(stream)
        .into_iter()
        .map(|(pid, events)| {
            let first_comm = events.first().map_or(GroupKey::Unknown, |e| comm_key(e));
            (
                pid,
                PidStats {
                    count: events.len(),
                    first_comm,
                },
            )
        })
        .collect();

    let by_comm = group_by_comm(stream)
        .into_iter()
        .map(|(comm, events)| {
            let comm = GroupKey::from_label(comm.known().map(|c| (*c).to_string()));
            (comm, CommStats { count: events.len() })
        })
        .collect();

    TraceStatistics {
        total_events: stream.len(),
        failed_lines: stream.failed_lines,
        event_types: count_by_type(stream),
        by_pid,
        by_comm,
    }
}

// =============================================================================
// PROCESS PROFILES
// =============================================================================

/// Event count for one type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeCount {
    pub event_type: GroupKey<String>,
    pub count: usize,
}

/// What one process name did during the trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessProfile {
    pub comm: GroupKey<String>,
    /// Pid of the last event seen for this name.
    pub pid: Option<i64>,
    pub event_count: usize,
    pub top_event_types: Vec<TypeCount>,
}

/// Profiles per process name, busiest first.
#[must_use]
pub fn process_profiles(stream: &EventStream) -> Vec<ProcessProfile> {
    let mut by_comm: IndexMap<GroupKey<String>, Vec<&Event>> = IndexMap::new();
    for event in stream {
        by_comm.entry(comm_key(event)).or_default().push(event);
    }

    let mut profiles: Vec<ProcessProfile> = by_comm
        .into_iter()
        .map(|(comm, events)| {
            let mut types = IndexMap::new();
            for event in &events {
                *types.entry(type_key(event)).or_insert(0) += 1;
            }
            ProcessProfile {
                comm,
                pid: events.last().and_then(|e| e.pid()),
                event_count: events.len(),
                top_event_types: rank(types, PROFILE_TOP_TYPES)
                    .into_iter()
                    .map(|(event_type, count)| TypeCount { event_type, count })
                    .collect(),
            }
        })
        .collect();
    profiles.sort_by(|a, b| b.event_count.cmp(&a.event_count));
    profiles
}
