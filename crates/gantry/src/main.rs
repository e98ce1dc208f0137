//! gantry CLI: deterministic task-execution engine for declarative
//! build-style workloads.

// The CLI binary talks to stdout/stderr on purpose.
#![allow(clippy::print_stdout, clippy::print_stderr)]

mod cli;
mod graph_file;

use crate::cli::{Cli, CliError, Command, EXIT_INTERNAL, HashArgs, RunArgs, exit_code_for, render_error};
use clap::Parser;
use gantry_engine::run::{Invocation, execute_run};
use gantry_task_graph::TaskGraph;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    // Logging is diagnostics only; the canonical trace is the record.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    // Set up error handling first: panics anywhere in the run are
    // internal errors (exit code 4), not aborts.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Application panicked: {panic_info}");
        eprintln!("Internal error occurred. Run with RUST_LOG=debug for more information.");
    }));

    // Spawning hands the panic back as a JoinError, so the process still
    // leaves through the normal exit-code path after the hook has printed.
    let exit_code = match tokio::spawn(real_main()).await {
        Ok(code) => code,
        Err(join_error) if join_error.is_panic() => EXIT_INTERNAL,
        Err(join_error) => {
            render_error(CliError::internal(format!("run task failed: {join_error}")));
            EXIT_INTERNAL
        }
    };
    std::process::exit(exit_code);
}

async fn real_main() -> i32 {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Hash(args) => hash(&args),
    };
    match result {
        Ok(code) => code,
        Err(error) => {
            let code = exit_code_for(&error);
            render_error(error);
            code
        }
    }
}

/// Resolve a path against the invocation working directory, never the
/// process CWD.
fn resolve_against(workdir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workdir.join(path)
    }
}

fn absolutize_workdir(workdir: &Path) -> Result<PathBuf, CliError> {
    let absolute = if workdir.is_absolute() {
        workdir.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| CliError::config(format!("cannot resolve working directory: {e}")))?
            .join(workdir)
    };
    absolute
        .canonicalize()
        .map_err(|e| CliError::config(format!("invalid working directory '{}': {e}", workdir.display())))
}

fn build_graph(workdir: &Path, graph_path: &Path) -> Result<Arc<TaskGraph>, CliError> {
    let graph_path = resolve_against(workdir, graph_path);
    let (tasks, edges) = graph_file::load(&graph_path)?;
    let graph = TaskGraph::build(tasks, &edges).map_err(CliError::from)?;
    Ok(Arc::new(graph))
}

async fn run(args: RunArgs) -> Result<i32, CliError> {
    if args.jobs == 0 {
        return Err(CliError::parse_with_help(
            "--jobs must be at least 1",
            "use --jobs 1 for serial execution",
        ));
    }

    let workdir = absolutize_workdir(&args.workdir)?;
    let graph = build_graph(&workdir, &args.graph)?;

    let invocation = Invocation {
        cache_dir: resolve_against(&workdir, &args.cache_dir),
        output_dir: resolve_against(&workdir, &args.output_dir),
        trace_path: args.trace.as_ref().map(|path| resolve_against(&workdir, path)),
        workdir,
        mode: args.mode,
        concurrency: args.jobs,
        previous_run_id: args.resume_from,
    };

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            signal_token.cancel();
        }
    });

    let summary = execute_run(graph, &invocation, cancel).await.map_err(CliError::from)?;

    println!("run {} finished: graph {}", summary.run_id, summary.graph_hash);
    for (name, state) in &summary.final_states {
        println!("  {name}: {state}");
    }
    println!("trace {}", summary.trace_hash);
    Ok(summary.exit_code)
}

fn hash(args: &HashArgs) -> Result<i32, CliError> {
    let workdir = absolutize_workdir(&args.workdir)?;
    let graph = build_graph(&workdir, &args.graph)?;
    println!("{}", graph.graph_hash());
    Ok(cli::EXIT_OK)
}
