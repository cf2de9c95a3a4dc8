//! Remote command building.

use std::time::Duration;

use remote_trace_core::RemoteCommand;
use thiserror::Error;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Base command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Base command is empty after parsing")]
    EmptyCommand,
    #[error("Failed to quote command: {0}")]
    QuoteError(#[from] shlex::QuoteError),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Wrap in the target's `timeout` utility.
    ///
    /// The program receives SIGINT when the budget expires so that it can
    /// flush its output; `--preserve-status` keeps its own exit code instead
    /// of the wrapper's 124.
    #[must_use]
    pub fn with_remote_timeout(self, budget: Duration) -> Self {
        let mut args = vec![
            "--preserve-status".to_string(),
            "-s".to_string(),
            "INT".to_string(),
            whole_seconds(budget).to_string(),
            self.program,
        ];
        args.extend(self.args);
        Self::new("timeout".to_string(), args)
    }

    /// Render as a single POSIX shell line.
    ///
    /// # Errors
    /// Returns error if an argument cannot be quoted.
    pub fn to_shell_line(&self) -> Result<String, CommandBuildError> {
        let words = std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        Ok(shlex::try_join(words)?)
    }
}

/// Assembles a program invocation from a base command and parameters.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Program, possibly with a prefix such as `su 0`; split shell-style.
    pub base: String,
    /// Parameters placed after the base.
    pub params: Vec<String>,
}

impl CommandBuilder {
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            params: Vec::new(),
        }
    }

    /// Replace the parameters.
    #[must_use]
    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    /// Append parameters.
    #[must_use]
    pub fn extend_params<I>(mut self, more: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params.extend(more.into_iter().map(Into::into));
        self
    }

    /// Build the command with trailing arguments.
    ///
    /// # Errors
    /// Returns error if the base cannot be split or the result is empty.
    pub fn build(&self, trailing: &[String]) -> Result<CommandParts, CommandBuildError> {
        let mut words = shlex::split(&self.base)
            .ok_or_else(|| CommandBuildError::InvalidBase(self.base.clone()))?
            .into_iter()
            .chain(self.params.iter().cloned())
            .chain(trailing.iter().cloned());

        let program = words.next().ok_or(CommandBuildError::EmptyCommand)?;
        Ok(CommandParts::new(program, words.collect()))
    }
}

/// Options for a bpftrace invocation.
#[derive(Debug, Clone)]
pub struct TraceCommandOptions {
    /// Tracer command on the target, may include a prefix such as `su 0`.
    pub tracer: String,
    /// Request NDJSON output.
    pub json_output: bool,
}

impl Default for TraceCommandOptions {
    fn default() -> Self {
        Self {
            tracer: "bpftrace".to_string(),
            json_output: true,
        }
    }
}

/// Build the remote command for a pushed script.
///
/// The filter hint is passed as the script's first positional parameter.
///
/// # Errors
/// Returns error if the tracer command is invalid or cannot be quoted.
pub fn trace_command(
    opts: &TraceCommandOptions,
    remote_script: &str,
    budget: Duration,
    filter: Option<&str>,
) -> Result<RemoteCommand, CommandBuildError> {
    let mut builder = CommandBuilder::new(opts.tracer.as_str());
    if opts.json_output {
        builder = builder.params(["-f", "json"]);
    }
    let mut trailing = vec![remote_script.to_string()];
    trailing.extend(filter.map(str::to_string));

    let command_line = builder
        .build(&trailing)?
        .with_remote_timeout(budget)
        .to_shell_line()?;
    Ok(RemoteCommand {
        command_line,
        artifact_path: remote_script.to_string(),
    })
}

/// Budget in whole seconds, rounded up, at least one.
fn whole_seconds(budget: Duration) -> u64 {
    let secs = budget.as_secs() + u64::from(budget.subsec_nanos() > 0);
    secs.max(1)
}
