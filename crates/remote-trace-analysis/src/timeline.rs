//! Per-type timing views.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::{
    event::{Event, GroupKey},
    parser::EventStream,
};

/// Gaps between consecutive timestamped events of one type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IntervalStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

/// Timing for one event type.
///
/// `first`, `last` and `range` are present once any event carries a
/// timestamp; `intervals` needs at least two.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeTimeline {
    pub count: usize,
    pub timestamped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intervals: Option<IntervalStats>,
}

impl TypeTimeline {
    fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut count = 0;
        let mut stamps = Vec::new();
        for event in events {
            count += 1;
            if let Some(ts) = event.timestamp() {
                stamps.push(ts);
            }
        }
        stamps.sort_by(f64::total_cmp);

        let first = stamps.first().copied();
        let last = stamps.last().copied();
        Self {
            count,
            timestamped: stamps.len(),
            first,
            last,
            range: first.zip(last).map(|(a, b)| b - a),
            intervals: interval_stats(&stamps),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn interval_stats(sorted: &[f64]) -> Option<IntervalStats> {
    if sorted.len() < 2 {
        return None;
    }
    let gaps: Vec<f64> = sorted.windows(2).map(|w| w[1] - w[0]).collect();
    let sum: f64 = gaps.iter().sum();
    let min = gaps.iter().copied().fold(f64::INFINITY, f64::min);
    let max = gaps.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(IntervalStats {
        mean: sum / gaps.len() as f64,
        min,
        max,
    })
}

/// Timeline for every event type in the stream.
#[must_use]
pub fn timeline(stream: &EventStream) -> BTreeMap<GroupKey<String>, TypeTimeline> {
    let mut by_type: BTreeMap<GroupKey<String>, Vec<&Event>> = BTreeMap::new();
    for event in stream {
        by_type
            .entry(GroupKey::from_label(event.event_type().map(str::to_string)))
            .or_default()
            .push(event);
    }
    by_type
        .into_iter()
        .map(|(key, events)| (key, TypeTimeline::from_events(events)))
        .collect()
}

/// Timeline for one event type, or `None` when the type never occurs.
#[must_use]
pub fn timeline_for(stream: &EventStream, event_type: &str) -> Option<TypeTimeline> {
    let mut matching = stream
        .iter()
        .filter(|e| e.event_type() == Some(event_type))
        .peekable();
    matching.peek()?;
    Some(TypeTimeline::from_events(matching))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{aggregate::count_by_type, parser::parse_bytes};

    #[test]
    fn test_open_scenario() {
        let stream = parse_bytes(
            br#"{"event":"open","pid":1,"comm":"a","timestamp":100}
{"event":"open","pid":2,"comm":"b","timestamp":105}
not json
"#,
        );
        assert_eq!(stream.len(), 2);
        assert_eq!(stream.failed_lines, 1);

        let counts = count_by_type(&stream);
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[&GroupKey::Known("open".into())], 2);

        let open = timeline_for(&stream, "open").unwrap();
        assert_eq!(open.count, 2);
        assert_eq!(open.first, Some(100.0));
        assert_eq!(open.last, Some(105.0));
        assert_eq!(open.range, Some(5.0));
        assert_eq!(open.intervals.unwrap().mean, 5.0);
        assert_eq!(timeline(&stream)[&GroupKey::Known("open".into())], open);
    }

    #[test]
    fn test_intervals_omitted_below_two_timestamps() {
        let stream = parse_bytes(
            br#"{"event":"write","timestamp":7}
{"event":"write"}
{"event":"exit"}
"#,
        );
        let all = timeline(&stream);

        let write = &all[&GroupKey::Known("write".into())];
        assert_eq!(write.count, 2);
        assert_eq!(write.timestamped, 1);
        assert_eq!(write.range, Some(0.0));
        assert!(write.intervals.is_none());

        let exit = &all[&GroupKey::Known("exit".into())];
        assert_eq!(exit.timestamped, 0);
        assert!(exit.first.is_none());
        let json = serde_json::to_value(exit).unwrap();
        assert!(json.get("intervals").is_none());
        assert!(json.get("first").is_none());
    }

    #[test]
    fn test_out_of_order_timestamps_are_sorted() {
        let stream = parse_bytes(
            br#"{"event":"tick","timestamp":30}
{"event":"tick","timestamp":10}
{"event":"tick","timestamp":15.5}
"#,
        );
        let tick = timeline_for(&stream, "tick").unwrap();
        assert_eq!(tick.first, Some(10.0));
        assert_eq!(tick.last, Some(30.0));
        let iv = tick.intervals.unwrap();
        assert_eq!(iv.min, 5.5);
        assert_eq!(iv.max, 14.5);
        assert_eq!(iv.mean, 10.0);
    }

    #[test]
    fn test_untyped_events_group_as_unknown() {
        let stream = parse_bytes(b"{\"timestamp\":1}\n{\"timestamp\":4}\n");
        let all = timeline(&stream);
        assert_eq!(all[&GroupKey::Unknown].intervals.unwrap().max, 3.0);
        assert!(timeline_for(&stream, "open").is_none());
    }
}
