//! Line-oriented event decoding with per-line recovery.

use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Value, error::Category};
use thiserror::Error;

use crate::event::{Event, Scalar};

/// Failure diagnostics kept per stream.
pub const MAX_RECORDED_FAILURES: usize = 16;

const PREVIEW_CHARS: usize = 100;

/// Why a line did not decode.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("JSON value is not an object")]
    NotAnObject,
}

/// A line that failed to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineFailure {
    /// 1-based line number.
    pub line: usize,
    pub reason: String,
}

/// Decoded events in input order, plus what could not be decoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventStream {
    pub events: Vec<Event>,
    /// Lines that failed to decode.
    pub failed_lines: usize,
    /// The first few failures, for diagnostics.
    pub failures: Vec<LineFailure>,
}

impl EventStream {
    /// Stream of already-decoded events with no failures.
    #[must_use]
    pub const fn from_events(events: Vec<Event>) -> Self {
        Self {
            events,
            failed_lines: 0,
            failures: Vec::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events.iter()
    }

    fn push_line(&mut self, line_no: usize, raw: &[u8]) {
        let raw = raw.trim_ascii();
        if raw.is_empty() {
            return;
        }
        match std::str::from_utf8(raw)
            .map_err(|_| DecodeError::InvalidUtf8)
            .and_then(decode_line)
        {
            Ok(event) => self.events.push(event),
            Err(e) => {
                let preview: String = String::from_utf8_lossy(raw).chars().take(PREVIEW_CHARS).collect();
                tracing::debug!(line = line_no, %preview, "Failed to decode line: {e}");
                self.failed_lines += 1;
                if self.failures.len() < MAX_RECORDED_FAILURES {
                    self.failures.push(LineFailure {
                        line: line_no,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    fn finish(self) -> Self {
        if self.failed_lines > 0 {
            tracing::warn!(
                events = self.events.len(),
                failed = self.failed_lines,
                "Skipped undecodable lines"
            );
        }
        self
    }
}

impl<'a> IntoIterator for &'a EventStream {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

/// Decode one line into an event.
///
/// The line must be a JSON object. Nested objects and arrays are flattened
/// into dotted keys (`data.count`, `args.0`); empty containers become `Null`.
///
/// # Errors
/// Returns error if the line is not a JSON object.
pub fn decode_line(line: &str) -> Result<Event, DecodeError> {
    let object: IndexMap<String, Value> = serde_json::from_str(line).map_err(|e| match e.classify() {
        Category::Data => DecodeError::NotAnObject,
        _ => DecodeError::InvalidJson(e),
    })?;

    let mut fields = IndexMap::with_capacity(object.len());
    for (key, value) in object {
        flatten_into(&mut fields, key, value);
    }
    Ok(Event::from_fields(fields))
}

fn flatten_into(fields: &mut IndexMap<String, Scalar>, key: String, value: Value) {
    match value {
        Value::Null => {
            fields.insert(key, Scalar::Null);
        }
        Value::Bool(b) => {
            fields.insert(key, Scalar::Bool(b));
        }
        Value::Number(n) => {
            let scalar = n
                .as_i64()
                .map_or_else(|| Scalar::Float(n.as_f64().unwrap_or(f64::NAN)), Scalar::Int);
            fields.insert(key, scalar);
        }
        Value::String(s) => {
            fields.insert(key, Scalar::Str(s));
        }
        Value::Array(items) if items.is_empty() => {
            fields.insert(key, Scalar::Null);
        }
        Value::Object(map) if map.is_empty() => {
            fields.insert(key, Scalar::Null);
        }
        Value::Array(items) => {
            for (i, item) in items.into_iter().enumerate() {
                flatten_into(fields, format!("{key}.{i}"), item);
            }
        }
        Value::Object(map) => {
            for (child, item) in map {
                flatten_into(fields, format!("{key}.{child}"), item);
            }
        }
    }
}

/// Parse a complete byte buffer.
#[must_use]
pub fn parse_bytes(bytes: &[u8]) -> EventStream {
    let mut stream = EventStream::default();
    for (i, line) in bytes.split(|b| *b == b'\n').enumerate() {
        stream.push_line(i + 1, line);
    }
    stream.finish()
}

/// Parse from a buffered reader, line by line.
///
/// # Errors
/// Returns error only if reading fails; undecodable lines are counted.
pub fn parse_reader<R: BufRead>(mut reader: R) -> io::Result<EventStream> {
    let mut stream = EventStream::default();
    let mut buf = Vec::new();
    let mut line_no = 0;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        line_no += 1;
        stream.push_line(line_no, &buf);
    }
    Ok(stream.finish())
}

/// Parse an artifact file.
///
/// # Errors
/// Returns error if the file cannot be opened or read.
pub fn parse_file(path: impl AsRef<Path>) -> io::Result<EventStream> {
    let path = path.as_ref();
    let stream = parse_reader(BufReader::new(File::open(path)?))?;
    tracing::info!(file = %path.display(), events = stream.len(), "Parsed trace");
    Ok(stream)
}
