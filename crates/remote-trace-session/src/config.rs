//! Orchestrator settings and their loading from JSON or the environment.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use remote_trace_executor::{AdbConfig, TraceCommandOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix shared by every environment variable read here.
pub const ENV_PREFIX: &str = "REMOTE_TRACE_";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
    #[error("Invalid configuration file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Settings for session orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Local directory receiving one artifact per session.
    pub output_dir: PathBuf,
    /// Directory holding the built-in kinds' default scripts.
    pub scripts_dir: PathBuf,
    /// Directory on the target that scripts are pushed to.
    pub remote_staging_dir: String,
    /// Tracer invoked on the target.
    pub tracer: String,
    /// Ask the tracer for NDJSON output.
    pub json_output: bool,
    /// Capacity of the chunk channel between executor and sink.
    pub chunk_buffer: usize,
    /// Permit several live sessions on one target.
    pub allow_concurrent_target_sessions: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./output"),
            scripts_dir: PathBuf::from("./bpftrace_scripts"),
            remote_staging_dir: "/data/local/tmp".to_string(),
            tracer: "bpftrace".to_string(),
            json_output: true,
            chunk_buffer: 64,
            allow_concurrent_target_sessions: true,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overridden by `REMOTE_TRACE_*` variables.
    ///
    /// # Errors
    /// Returns error if a variable holds an unparsable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Settings::from_env().map(|s| s.orchestrator)
    }

    #[must_use]
    pub fn command_options(&self) -> TraceCommandOptions {
        TraceCommandOptions {
            tracer: self.tracer.clone(),
            json_output: self.json_output,
        }
    }

    /// Remote location for a script with this file name.
    #[must_use]
    pub fn remote_path(&self, file_name: &str) -> String {
        format!("{}/{file_name}", self.remote_staging_dir.trim_end_matches('/'))
    }
}

/// Everything a deployment configures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub orchestrator: OrchestratorConfig,
    pub adb: AdbConfig,
}

impl Settings {
    /// Parse from a JSON document; absent fields keep their defaults.
    ///
    /// # Errors
    /// Returns error if the document is not valid.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a JSON file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Defaults overridden by the process environment.
    ///
    /// # Errors
    /// Returns error if a variable holds an unparsable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Override fields from `lookup`, which maps full variable names to values.
    ///
    /// # Errors
    /// Returns error if a variable holds an unparsable value.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let o = &mut self.orchestrator;
        if let Some(v) = env.string("OUTPUT_DIR") {
            o.output_dir = v.into();
        }
        if let Some(v) = env.string("SCRIPTS_DIR") {
            o.scripts_dir = v.into();
        }
        if let Some(v) = env.string("STAGING_DIR") {
            o.remote_staging_dir = v;
        }
        if let Some(v) = env.string("TRACER") {
            o.tracer = v;
        }
        if let Some(v) = env.bool("JSON_OUTPUT")? {
            o.json_output = v;
        }
        if let Some(v) = env.parse::<usize>("CHUNK_BUFFER")? {
            if v == 0 {
                return Err(env.invalid("CHUNK_BUFFER", "0", "must be at least 1"));
            }
            o.chunk_buffer = v;
        }
        if let Some(v) = env.bool("ALLOW_CONCURRENT")? {
            o.allow_concurrent_target_sessions = v;
        }

        let a = &mut self.adb;
        if let Some(v) = env.string("ADB") {
            a.adb_binary = v;
        }
        if let Some(v) = env.seconds("PUSH_TIMEOUT")? {
            a.push_timeout = v;
        }
        if let Some(v) = env.seconds("GRACE_PERIOD")? {
            a.grace_period = v;
        }
        if let Some(v) = env.seconds("LIST_TIMEOUT")? {
            a.list_timeout = v;
        }
        Ok(())
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty())
    }

    fn invalid(&self, name: &str, value: &str, reason: impl Into<String>) -> ConfigError {
        ConfigError::Invalid {
            key: format!("{ENV_PREFIX}{name}"),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(name)
            .map(|v| v.trim().parse().map_err(|e: T::Err| self.invalid(name, &v, e.to_string())))
            .transpose()
    }

    fn bool(&self, name: &str) -> Result<Option<bool>, ConfigError> {
        self.string(name)
            .map(|v| match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(self.invalid(name, &v, "expected a boolean")),
            })
            .transpose()
    }

    fn seconds(&self, name: &str) -> Result<Option<Duration>, ConfigError> {
        let Some(secs) = self.parse::<f64>(name)? else {
            return Ok(None);
        };
        Duration::try_from_secs_f64(secs)
            .map(Some)
            .map_err(|e| self.invalid(name, &secs.to_string(), e.to_string()))
    }
}
