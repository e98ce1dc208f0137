//! Argument parsing, error rendering, and exit-code mapping.

use clap::{Parser, Subcommand};
use gantry_engine::ExecutionMode;
use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// All tasks terminal, none failed.
pub const EXIT_OK: i32 = 0;
/// At least one task failed; the trace is still valid.
pub const EXIT_TASK_FAILED: i32 = 1;
/// Malformed invocation or graph parse failure.
pub const EXIT_PARSE: i32 = 2;
/// Semantic configuration error (paths, cache dir, resume ineligible).
pub const EXIT_CONFIG: i32 = 3;
/// Internal or system error (panic, I/O failure, cache corruption).
pub const EXIT_INTERNAL: i32 = 4;

/// CLI-level errors with their exit-code mapping.
#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    /// Malformed invocation or graph file (exit code 2).
    #[error("Parse error: {message}")]
    #[diagnostic(code(gantry::cli::parse))]
    Parse {
        /// The error message.
        message: String,
        /// Optional help text.
        #[help]
        help: Option<String>,
    },
    /// Semantic configuration error (exit code 3).
    #[error("Configuration error: {message}")]
    #[diagnostic(code(gantry::cli::config))]
    Config {
        /// The error message.
        message: String,
        /// Optional help text.
        #[help]
        help: Option<String>,
    },
    /// A task failed; the run itself is valid (exit code 1).
    #[error("Run failed: {message}")]
    #[diagnostic(code(gantry::run::task_failed))]
    TaskFailure {
        /// The error message.
        message: String,
    },
    /// Internal or system error (exit code 4).
    #[error("Internal error: {message}")]
    #[diagnostic(code(gantry::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl CliError {
    /// Create a parse error.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            help: None,
        }
    }

    /// Create a parse error with help text.
    #[must_use]
    pub fn parse_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<gantry_core::Error> for CliError {
    fn from(error: gantry_core::Error) -> Self {
        use gantry_core::FailureClass;
        match error.class() {
            FailureClass::Graph | FailureClass::Workspace => Self::Config {
                message: error.to_string(),
                help: None,
            },
            FailureClass::Execution => Self::TaskFailure {
                message: error.to_string(),
            },
            FailureClass::System => Self::Internal {
                message: error.to_string(),
            },
        }
    }
}

/// Map an error to the process exit code.
#[must_use]
pub fn exit_code_for(error: &CliError) -> i32 {
    match error {
        CliError::Parse { .. } => EXIT_PARSE,
        CliError::Config { .. } => EXIT_CONFIG,
        CliError::TaskFailure { .. } => EXIT_TASK_FAILED,
        CliError::Internal { .. } => EXIT_INTERNAL,
    }
}

/// Render an error to stderr through miette.
pub fn render_error(error: CliError) {
    eprintln!("{:?}", miette::Report::new(error));
}

/// Deterministic task-execution engine for declarative build workloads.
#[derive(Debug, Parser)]
#[command(name = "gantry", version, about)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Execute a task graph against a workspace.
    Run(RunArgs),
    /// Print the canonical graph hash for a graph file.
    Hash(HashArgs),
}

/// Arguments for `gantry run`.
#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Workspace directory tasks run in. Relative paths below resolve
    /// against it, never against the process working directory.
    #[arg(long, default_value = ".")]
    pub workdir: PathBuf,

    /// Graph file (strict JSON).
    #[arg(long)]
    pub graph: PathBuf,

    /// Cache root directory.
    #[arg(long, default_value = ".gantry-cache")]
    pub cache_dir: PathBuf,

    /// Output directory, wiped at run start.
    #[arg(long, default_value = "out")]
    pub output_dir: PathBuf,

    /// Execution mode: clean, incremental, or resume-only.
    #[arg(long, default_value = "incremental")]
    pub mode: ExecutionMode,

    /// Write the canonical trace to this path.
    #[arg(long)]
    pub trace: Option<PathBuf>,

    /// Worker pool width. 1 is serial execution.
    #[arg(long, default_value_t = 1)]
    pub jobs: usize,

    /// Resume from a specific prior run instead of auto-detecting.
    #[arg(long)]
    pub resume_from: Option<String>,
}

/// Arguments for `gantry hash`.
#[derive(Debug, Parser)]
pub struct HashArgs {
    /// Workspace directory.
    #[arg(long, default_value = ".")]
    pub workdir: PathBuf,

    /// Graph file (strict JSON).
    #[arg(long)]
    pub graph: PathBuf,
}
