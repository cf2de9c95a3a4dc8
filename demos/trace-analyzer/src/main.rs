//! Command-line front end for trace capture and offline analysis.
//!
//! `run` and `targets` read their settings from `REMOTE_TRACE_*` environment
//! variables.

use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use remote_trace_analysis::{
    DEFAULT_TOP_N, EventFilter, EventStream, export_tabular, parse_file, process_profiles,
    summary, timeline,
};
use remote_trace_core::{ArtifactRef, RemoteExecutor, TraceKind, TraceSpec};
use remote_trace_executor::AdbExecutor;
use remote_trace_session::{MemorySessionStore, Settings, TraceOrchestrator};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "trace-analyzer",
    about = "Capture kernel traces from remote targets and analyze NDJSON trace files",
    after_help = "\
EXAMPLES:
    trace-analyzer analyze trace.json --type open --top 5
    trace-analyzer analyze trace.json --comm surfaceflinger --csv
    trace-analyzer run emulator-5554 syscall 30 com.example.app"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Summarize a trace file
    Analyze {
        /// NDJSON trace file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Keep only events of this type
        #[arg(long = "type", value_name = "TYPE")]
        event_type: Option<String>,

        /// Keep only events from this pid
        #[arg(long)]
        pid: Option<i64>,

        /// Keep only events whose process name contains this text
        #[arg(long)]
        comm: Option<String>,

        /// Length of ranked lists
        #[arg(long, default_value_t = DEFAULT_TOP_N)]
        top: NonZeroUsize,

        /// Print the events as CSV instead of a report
        #[arg(long)]
        csv: bool,
    },

    /// List reachable targets
    Targets,

    /// Capture a trace and print its report
    Run {
        /// Target serial or address
        target: String,

        /// Kind of trace to capture
        #[arg(value_enum)]
        kind: Kind,

        /// Trace duration in seconds
        seconds: f64,

        /// Process filter passed to the trace script
        filter: Option<String>,

        /// Local script to run instead of the kind's default
        #[arg(long, value_name = "FILE")]
        script: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Syscall,
    FileAccess,
    Memory,
}

impl From<Kind> for TraceKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Syscall => Self::Syscall,
            Kind::FileAccess => Self::FileAccess,
            Kind::Memory => Self::Memory,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match Cli::parse().command {
        Command::Analyze {
            file,
            event_type,
            pid,
            comm,
            top,
            csv,
        } => {
            let filter = EventFilter {
                event_type,
                pid,
                comm,
            };
            analyze(&file, &filter, top, csv)
        }
        Command::Targets => targets().await,
        Command::Run {
            target,
            kind,
            seconds,
            filter,
            script,
        } => {
            let mut spec = TraceSpec::new(target, kind.into(), Duration::try_from_secs_f64(seconds)?)?;
            if let Some(filter) = filter {
                spec = spec.with_filter(filter);
            }
            if let Some(path) = script {
                spec = spec.with_artifact(ArtifactRef::Path { path })?;
            }
            run(spec).await
        }
    }
}

fn analyze(file: &Path, filter: &EventFilter, top: NonZeroUsize, csv: bool) -> Result<()> {
    let stream = parse_file(file).with_context(|| format!("failed to read {}", file.display()))?;
    let stream = if *filter == EventFilter::default() {
        stream
    } else {
        filter.apply(&stream)
    };

    if csv {
        export_tabular(&stream).write_csv(std::io::stdout().lock())?;
        return Ok(());
    }
    print_report(&stream, top)
}

fn print_report(stream: &EventStream, top_n: NonZeroUsize) -> Result<()> {
    let report = serde_json::json!({
        "summary": summary(stream, top_n),
        "timeline": timeline(stream),
        "processes": process_profiles(stream),
        "failures": stream.failures,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn targets() -> Result<()> {
    let settings = Settings::from_env()?;
    let executor = AdbExecutor::new(settings.adb).await?;
    let targets = executor.list_targets().await?;
    println!("{}", serde_json::to_string_pretty(&targets)?);
    Ok(())
}

async fn run(spec: TraceSpec) -> Result<()> {
    let settings = Settings::from_env()?;
    let executor = AdbExecutor::new(settings.adb).await?;
    let orchestrator = TraceOrchestrator::new(MemorySessionStore::new(), executor, settings.orchestrator);

    let session = orchestrator.run_session(spec).await?;
    println!("{}", serde_json::to_string_pretty(&session)?);

    if session.output_path.is_file() {
        let stream = parse_file(&session.output_path)?;
        print_report(&stream, DEFAULT_TOP_N)?;
    }
    Ok(())
}
