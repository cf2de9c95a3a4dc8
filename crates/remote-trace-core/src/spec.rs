//! Trace session requests.

use std::{fmt, path::PathBuf, time::Duration};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Logical kind of trace to run on a target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum TraceKind {
    /// System call tracing.
    Syscall,
    /// File open/read/write tracing.
    FileAccess,
    /// Memory allocation tracing.
    Memory,
    /// Caller-supplied program with its own trace name.
    Custom(String),
}

impl TraceKind {
    /// Default script file for built-in kinds.
    #[must_use]
    pub const fn default_script(&self) -> Option<&'static str> {
        match self {
            Self::Syscall => Some("syscall_trace.bt"),
            Self::FileAccess => Some("file_access.bt"),
            Self::Memory => Some("memory_trace.bt"),
            Self::Custom(_) => None,
        }
    }

    /// Trace name used for artifact naming.
    ///
    /// Syscall traces embed the filter hint so that per-process captures are
    /// distinguishable on disk.
    #[must_use]
    pub fn trace_name(&self, filter: Option<&str>) -> String {
        match self {
            Self::Syscall => format!("syscall_trace_{}", filter.unwrap_or("all")),
            Self::FileAccess => "file_access_trace".to_string(),
            Self::Memory => "memory_trace".to_string(),
            Self::Custom(name) => name.clone(),
        }
    }
}

impl fmt::Display for TraceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syscall => f.write_str("syscall"),
            Self::FileAccess => f.write_str("file_access"),
            Self::Memory => f.write_str("memory"),
            Self::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

/// Where the tracing program comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ArtifactRef {
    /// The kind's default script in the configured scripts directory.
    Default,
    /// A script file on the local filesystem.
    Path { path: PathBuf },
    /// Script content supplied by the caller.
    Inline { name: String, content: Bytes },
}

/// Invalid trace request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("Target id must not be empty")]
    EmptyTarget,
    #[error("Duration budget must be greater than zero")]
    ZeroDuration,
    #[error("Inline artifact name must be a plain file name: {0:?}")]
    InvalidArtifactName(String),
}

/// Immutable description of a requested trace session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTraceSpec")]
pub struct TraceSpec {
    target_id: String,
    artifact: ArtifactRef,
    kind: TraceKind,
    #[serde(with = "duration_secs")]
    duration: Duration,
    filter: Option<String>,
}

impl TraceSpec {
    /// Create a trace request using the kind's default script.
    ///
    /// # Errors
    /// Returns error if the target is empty or the duration is zero.
    pub fn new(
        target_id: impl Into<String>,
        kind: TraceKind,
        duration: Duration,
    ) -> Result<Self, SpecError> {
        let target_id = target_id.into();
        if target_id.trim().is_empty() {
            return Err(SpecError::EmptyTarget);
        }
        if duration.is_zero() {
            return Err(SpecError::ZeroDuration);
        }
        Ok(Self {
            target_id,
            artifact: ArtifactRef::Default,
            kind,
            duration,
            filter: None,
        })
    }

    /// Use a specific artifact instead of the kind's default.
    ///
    /// # Errors
    /// Returns error if an inline artifact name is not a plain file name.
    pub fn with_artifact(mut self, artifact: ArtifactRef) -> Result<Self, SpecError> {
        if let ArtifactRef::Inline { name, .. } = &artifact {
            let plain = !name.is_empty()
                && !name.contains(['/', '\\'])
                && name != "."
                && name != "..";
            if !plain {
                return Err(SpecError::InvalidArtifactName(name.clone()));
            }
        }
        self.artifact = artifact;
        Ok(self)
    }

    /// Attach a filter hint passed to the remote program.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        let filter = filter.into();
        self.filter = (!filter.is_empty()).then_some(filter);
        self
    }

    #[must_use]
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    #[must_use]
    pub const fn artifact(&self) -> &ArtifactRef {
        &self.artifact
    }

    #[must_use]
    pub const fn kind(&self) -> &TraceKind {
        &self.kind
    }

    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    #[must_use]
    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    /// Trace name for this request.
    #[must_use]
    pub fn trace_name(&self) -> String {
        self.kind.trace_name(self.filter())
    }
}

#[derive(Deserialize)]
struct RawTraceSpec {
    target_id: String,
    #[serde(default = "default_artifact")]
    artifact: ArtifactRef,
    kind: TraceKind,
    #[serde(with = "duration_secs")]
    duration: Duration,
    #[serde(default)]
    filter: Option<String>,
}

const fn default_artifact() -> ArtifactRef {
    ArtifactRef::Default
}

impl TryFrom<RawTraceSpec> for TraceSpec {
    type Error = SpecError;

    fn try_from(raw: RawTraceSpec) -> Result<Self, Self::Error> {
        let spec = Self::new(raw.target_id, raw.kind, raw.duration)?.with_artifact(raw.artifact)?;
        Ok(match raw.filter {
            Some(filter) => spec.with_filter(filter),
            None => spec,
        })
    }
}

/// Serialize durations as fractional seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
