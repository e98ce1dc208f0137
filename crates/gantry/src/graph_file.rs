//! Strict JSON graph file loading.
//!
//! The format is deliberately strict: unknown fields and trailing data are
//! rejected so two tools never disagree about what a graph file means.

use crate::cli::CliError;
use gantry_core::Task;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskDecl {
    name: String,
    #[serde(default)]
    inputs: Vec<String>,
    run: String,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    outputs: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EdgeDecl {
    from: String,
    to: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GraphFile {
    tasks: Vec<TaskDecl>,
    #[serde(default)]
    edges: Vec<EdgeDecl>,
}

/// Load a graph file into tasks and `(from, to)` edges.
///
/// A missing or unreadable file is a configuration error; malformed JSON
/// or unknown fields are parse errors (exit code 2).
pub fn load(path: &Path) -> Result<(Vec<Task>, Vec<(String, String)>), CliError> {
    let raw = std::fs::read(path).map_err(|e| {
        CliError::config(format!("cannot read graph file '{}': {e}", path.display()))
    })?;
    let file: GraphFile = serde_json::from_slice(&raw).map_err(|e| {
        CliError::parse_with_help(
            format!("invalid graph file '{}': {e}", path.display()),
            "expected {\"tasks\":[{\"name\",\"inputs\",\"run\",\"env\"?,\"outputs\"?}],\"edges\":[{\"from\",\"to\"}]}",
        )
    })?;

    let tasks = file
        .tasks
        .into_iter()
        .map(|decl| Task {
            name: decl.name,
            inputs: decl.inputs,
            run: decl.run,
            env: decl.env,
            outputs: decl.outputs,
        })
        .collect();
    let edges = file
        .edges
        .into_iter()
        .map(|edge| (edge.from, edge.to))
        .collect();
    Ok((tasks, edges))
}
