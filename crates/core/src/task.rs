//! The declarative task unit.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A declaratively defined unit of work.
///
/// `name` is a logical identifier only; identity for caching purposes is
/// derived from content (see [`crate::hash`]). `env` is an exhaustive
/// allowlist: the child process sees these variables and nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Logical identifier, unique within a graph.
    pub name: String,
    /// Ordered list of glob or literal input paths.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Command string, executed by a POSIX shell.
    pub run: String,
    /// Environment allowlist for the child process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Ordered list of declared output paths (files or directories).
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl Task {
    /// Validate the structural requirements: non-empty `name` and `run`.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::graph("task name must not be empty"));
        }
        if self.run.is_empty() {
            return Err(Error::graph(format!(
                "task '{}' has an empty run command",
                self.name
            )));
        }
        Ok(())
    }
}
