//! Schema-less event records.
//!
//! Every decoded line becomes an [`Event`]: an insertion-ordered map from
//! key to [`Scalar`]. A handful of keys carry meaning for aggregation
//! (`event`, `pid`, `comm`, `timestamp`) and get typed accessors; everything
//! else is carried through untouched.

use std::fmt;

use indexmap::IndexMap;
use serde::{Serialize, Serializer};

/// Key holding the event type tag.
pub const EVENT_KEY: &str = "event";
/// Key holding the process id.
pub const PID_KEY: &str = "pid";
/// Key holding the process name.
pub const COMM_KEY: &str = "comm";
/// Key holding the event timestamp.
pub const TIMESTAMP_KEY: &str = "timestamp";

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    /// Numeric view, for integers and floats.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Renders the value as a table cell; `Null` is empty.
impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

/// One decoded trace record.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct Event {
    fields: IndexMap<String, Scalar>,
}

impl Event {
    /// Build from already-flattened fields.
    #[must_use]
    pub const fn from_fields(fields: IndexMap<String, Scalar>) -> Self {
        Self { fields }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Scalar> {
        self.fields.get(key)
    }

    /// Keys in source order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Scalar)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The `event` tag, when it is a string.
    #[must_use]
    pub fn event_type(&self) -> Option<&str> {
        self.get(EVENT_KEY).and_then(Scalar::as_str)
    }

    /// The `pid`, when it is an integer.
    #[must_use]
    pub fn pid(&self) -> Option<i64> {
        self.get(PID_KEY).and_then(Scalar::as_i64)
    }

    /// The `comm`, when it is a string.
    #[must_use]
    pub fn comm(&self) -> Option<&str> {
        self.get(COMM_KEY).and_then(Scalar::as_str)
    }

    /// The `timestamp`, when it is numeric.
    #[must_use]
    pub fn timestamp(&self) -> Option<f64> {
        self.get(TIMESTAMP_KEY).and_then(Scalar::as_f64)
    }
}

/// Grouping key with an explicit bucket for events lacking the field.
///
/// `Known` keys sort before `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupKey<T> {
    Known(T),
    Unknown,
}

impl<T> GroupKey<T> {
    #[must_use]
    pub fn from_option(value: Option<T>) -> Self {
        value.map_or(Self::Unknown, Self::Known)
    }

    #[must_use]
    pub const fn known(&self) -> Option<&T> {
        match self {
            Self::Known(v) => Some(v),
            Self::Unknown => None,
        }
    }
}

/// Label used for the `Unknown` bucket when rendered.
pub const UNKNOWN_LABEL: &str = "unknown";

impl<T: AsRef<str>> GroupKey<T> {
    /// Like [`GroupKey::from_option`], but a value spelled [`UNKNOWN_LABEL`]
    /// lands in the `Unknown` bucket so rendered keys stay distinct.
    #[must_use]
    pub fn from_label(value: Option<T>) -> Self {
        match value {
            Some(v) if v.as_ref() != UNKNOWN_LABEL => Self::Known(v),
            _ => Self::Unknown,
        }
    }
}

impl<T: fmt::Display> fmt::Display for GroupKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(v) => v.fmt(f),
            Self::Unknown => f.write_str(UNKNOWN_LABEL),
        }
    }
}

// Serialized as a plain string so it can key JSON objects.
impl<T: fmt::Display> Serialize for GroupKey<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(pairs: &[(&str, Scalar)]) -> Event {
        Event::from_fields(pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect())
    }

    #[test]
    fn test_distinguished_fields() {
        let e = event(&[
            ("event", Scalar::Str("open".into())),
            ("pid", Scalar::Int(42)),
            ("comm", Scalar::Str("zygote".into())),
            ("timestamp", Scalar::Float(1.5)),
        ]);
        assert_eq!(e.event_type(), Some("open"));
        assert_eq!(e.pid(), Some(42));
        assert_eq!(e.comm(), Some("zygote"));
        assert_eq!(e.timestamp(), Some(1.5));
    }

    #[test]
    fn test_mistyped_fields_are_absent() {
        let e = event(&[
            ("event", Scalar::Int(3)),
            ("pid", Scalar::Str("42".into())),
            ("timestamp", Scalar::Bool(true)),
        ]);
        assert_eq!(e.event_type(), None);
        assert_eq!(e.pid(), None);
        assert_eq!(e.timestamp(), None);
    }

    #[test]
    fn test_group_key_order_and_display() {
        let mut keys = vec![GroupKey::Unknown, GroupKey::Known(2), GroupKey::Known(1)];
        keys.sort();
        assert_eq!(keys, vec![GroupKey::Known(1), GroupKey::Known(2), GroupKey::Unknown]);
        assert_eq!(GroupKey::<i64>::Unknown.to_string(), "unknown");
        assert_eq!(serde_json::to_string(&GroupKey::Known(7)).unwrap(), "\"7\"");
    }

    #[test]
    fn test_literal_unknown_label_folds_into_unknown() {
        assert_eq!(GroupKey::from_label(Some("unknown")), GroupKey::Unknown);
        assert_eq!(GroupKey::from_label(Some("Unknown")), GroupKey::Known("Unknown"));
        assert_eq!(GroupKey::<String>::from_label(None), GroupKey::Unknown);
    }

    #[test]
    fn test_scalar_display() {
        assert_eq!(Scalar::Null.to_string(), "");
        assert_eq!(Scalar::Float(0.25).to_string(), "0.25");
        assert_eq!(Scalar::Bool(false).to_string(), "false");
    }
}
