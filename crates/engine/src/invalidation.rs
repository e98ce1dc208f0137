//! The invalidation engine: root-cause attribution between graph
//! snapshots.
//!
//! The map is a pure function of two snapshots; runtime completion order
//! has no effect. Propagation carries the *root cause* downstream, so in a
//! chain `A -> B -> C` where only `A` changed, `C`'s reason references
//! `A`, not `B`.

use gantry_core::{Result, inputs};
use gantry_task_graph::TaskGraph;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

/// Fixed reason taxonomy, in type-order (the sort order for reason sets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReasonKind {
    /// Resolved input content changed.
    InputChanged,
    /// One or more declared env values changed.
    EnvChanged,
    /// The run command changed.
    CommandChanged,
    /// The declared output set changed.
    OutputChanged,
    /// The task is new, its declared inputs changed, or its upstream set
    /// changed.
    GraphStructureChanged,
    /// An upstream root cause invalidated this task.
    DependencyInvalidated,
}

impl ReasonKind {
    /// Stable textual name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InputChanged => "InputChanged",
            Self::EnvChanged => "EnvChanged",
            Self::CommandChanged => "CommandChanged",
            Self::OutputChanged => "OutputChanged",
            Self::GraphStructureChanged => "GraphStructureChanged",
            Self::DependencyInvalidated => "DependencyInvalidated",
        }
    }

    fn tag(self) -> u32 {
        match self {
            Self::InputChanged => 0,
            Self::EnvChanged => 1,
            Self::CommandChanged => 2,
            Self::OutputChanged => 3,
            Self::GraphStructureChanged => 4,
            Self::DependencyInvalidated => 5,
        }
    }
}

/// One canonical invalidation reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationReason {
    /// What kind of change.
    pub kind: ReasonKind,
    /// Root-cause task, required for `DependencyInvalidated`.
    pub source_task_id: Option<String>,
    /// Sorted, deduplicated `(key, value)` detail pairs.
    pub details: Vec<(String, String)>,
}

impl InvalidationReason {
    fn new(kind: ReasonKind) -> Self {
        Self {
            kind,
            source_task_id: None,
            details: Vec::new(),
        }
    }

    fn with_details(mut self, mut details: Vec<(String, String)>) -> Self {
        details.sort();
        details.dedup();
        self.details = details;
        self
    }

    fn dependency(source: impl Into<String>) -> Self {
        Self {
            kind: ReasonKind::DependencyInvalidated,
            source_task_id: Some(source.into()),
            details: Vec::new(),
        }
    }

    fn sort_key(&self) -> (u32, &str, &[(String, String)]) {
        (
            self.kind.tag(),
            self.source_task_id.as_deref().unwrap_or(""),
            &self.details,
        )
    }

    /// Binary encoding: explicit field order, length-prefixed strings,
    /// big-endian fixed-width integers. Never iterates hash-map order.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        fn put_str(out: &mut Vec<u8>, value: &str) {
            out.extend_from_slice(&(value.len() as u64).to_be_bytes());
            out.extend_from_slice(value.as_bytes());
        }

        let mut out = Vec::new();
        out.extend_from_slice(&self.kind.tag().to_be_bytes());
        match &self.source_task_id {
            Some(source) => {
                out.push(1);
                put_str(&mut out, source);
            }
            None => out.push(0),
        }
        out.extend_from_slice(&(self.details.len() as u64).to_be_bytes());
        for (key, value) in &self.details {
            put_str(&mut out, key);
            put_str(&mut out, value);
        }
        out
    }

    /// Stable textual form used in trace events:
    /// `Kind`, `Kind[k=v,k=v]`, or `Kind(source=id)[k=v]`.
    #[must_use]
    pub fn canonical_string(&self) -> String {
        let mut out = String::from(self.kind.as_str());
        if let Some(source) = &self.source_task_id {
            out.push_str("(source=");
            out.push_str(source);
            out.push(')');
        }
        if !self.details.is_empty() {
            out.push('[');
            for (index, (key, value)) in self.details.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push('=');
                out.push_str(value);
            }
            out.push(']');
        }
        out
    }
}

/// Pre-run snapshot of one task's comparable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSnapshot {
    /// Declared input patterns, as a set.
    pub declared_inputs: BTreeSet<String>,
    /// Content hash summary over the resolved inputs.
    pub input_hash: String,
    /// Declared environment.
    pub env: BTreeMap<String, String>,
    /// The run command.
    pub run: String,
    /// Declared outputs, as a set.
    pub outputs: BTreeSet<String>,
    /// Direct upstream dependency names.
    pub upstream: BTreeSet<String>,
}

/// Pre-run snapshot of a whole graph against a workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphSnapshot {
    /// Task name to its snapshot.
    pub tasks: BTreeMap<String, TaskSnapshot>,
}

impl GraphSnapshot {
    /// Snapshot `graph` against `workdir`: resolve every task's inputs and
    /// summarize their content.
    pub fn capture(graph: &TaskGraph, workdir: &Path) -> Result<Self> {
        let mut tasks = BTreeMap::new();
        for index in 0..graph.len() {
            let task = graph.node(index);
            let resolved = inputs::resolve(&task.inputs, workdir)?;
            let mut hasher = Sha256::new();
            hasher.update((resolved.len() as u64).to_be_bytes());
            for input in &resolved {
                hasher.update((input.path.len() as u64).to_be_bytes());
                hasher.update(input.path.as_bytes());
                hasher.update((input.content.len() as u64).to_be_bytes());
                hasher.update(&input.content);
            }
            tasks.insert(
                task.name.clone(),
                TaskSnapshot {
                    declared_inputs: task.inputs.iter().cloned().collect(),
                    input_hash: hex::encode(hasher.finalize()),
                    env: task.env.clone(),
                    run: task.run.clone(),
                    outputs: task.outputs.iter().cloned().collect(),
                    upstream: graph
                        .parents(index)
                        .iter()
                        .map(|&parent| graph.node(parent).name.clone())
                        .collect(),
                },
            );
        }
        Ok(Self { tasks })
    }
}

/// Verdict for one task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationEntry {
    /// Whether the task must execute.
    pub invalidated: bool,
    /// Canonically sorted, deduplicated reasons.
    pub reasons: Vec<InvalidationReason>,
}

/// Task name to verdict, covering every task in the new graph.
pub type InvalidationMap = BTreeMap<String, InvalidationEntry>;

fn direct_reasons(
    name: &str,
    old: &GraphSnapshot,
    new_all: &GraphSnapshot,
    new: &TaskSnapshot,
) -> Vec<InvalidationReason> {
    let Some(previous) = old.tasks.get(name) else {
        return vec![InvalidationReason::new(ReasonKind::GraphStructureChanged)];
    };

    let mut reasons = Vec::new();

    if previous.input_hash != new.input_hash {
        reasons.push(InvalidationReason::new(ReasonKind::InputChanged));
    }

    let changed_env: Vec<(String, String)> = previous
        .env
        .keys()
        .chain(new.env.keys())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|key| previous.env.get(*key) != new.env.get(*key))
        .map(|key| ("EnvName".to_string(), key.clone()))
        .collect();
    if !changed_env.is_empty() {
        reasons.push(InvalidationReason::new(ReasonKind::EnvChanged).with_details(changed_env));
    }

    if previous.run != new.run {
        reasons.push(InvalidationReason::new(ReasonKind::CommandChanged));
    }

    let changed_outputs: Vec<(String, String)> = previous
        .outputs
        .symmetric_difference(&new.outputs)
        .map(|path| ("OutputName".to_string(), path.clone()))
        .collect();
    if !changed_outputs.is_empty() {
        reasons
            .push(InvalidationReason::new(ReasonKind::OutputChanged).with_details(changed_outputs));
    }

    if previous.declared_inputs != new.declared_inputs {
        reasons.push(
            InvalidationReason::new(ReasonKind::GraphStructureChanged)
                .with_details(vec![("DeclaredInputs".into(), "changed".into())]),
        );
    }
    if previous.upstream != new.upstream {
        reasons.push(InvalidationReason::new(ReasonKind::GraphStructureChanged));
    }
    let missing_upstream: Vec<(String, String)> = previous
        .upstream
        .iter()
        .filter(|upstream| !new_all.tasks.contains_key(*upstream))
        .map(|upstream| ("UpstreamTaskID".to_string(), upstream.clone()))
        .collect();
    if !missing_upstream.is_empty() {
        reasons.push(
            InvalidationReason::new(ReasonKind::GraphStructureChanged)
                .with_details(missing_upstream),
        );
    }

    reasons
}

/// Compute the invalidation map for `new_graph` given its snapshot and the
/// previous run's snapshot.
///
/// Tasks are evaluated in deterministic topological order with lexical
/// tie-breaks; each directly invalidated task is a root cause of itself,
/// and downstream tasks inherit root causes, not intermediate hops.
#[must_use]
pub fn compute(
    old: &GraphSnapshot,
    new_graph: &TaskGraph,
    new: &GraphSnapshot,
) -> InvalidationMap {
    let mut map = InvalidationMap::new();
    let mut root_causes: HashMap<String, BTreeSet<String>> = HashMap::new();

    for index in new_graph.topological_order() {
        let name = &new_graph.node(index).name;
        let Some(snapshot) = new.tasks.get(name) else {
            continue;
        };

        let mut reasons = direct_reasons(name, old, new, snapshot);
        let directly_invalidated = !reasons.is_empty();

        let mut roots: BTreeSet<String> = BTreeSet::new();
        if directly_invalidated {
            roots.insert(name.clone());
        }

        let mut inherited: BTreeSet<String> = BTreeSet::new();
        for &parent in new_graph.parents(index) {
            let parent_name = &new_graph.node(parent).name;
            if map
                .get(parent_name)
                .is_some_and(|entry: &InvalidationEntry| entry.invalidated)
            {
                if let Some(parent_roots) = root_causes.get(parent_name) {
                    inherited.extend(parent_roots.iter().cloned());
                }
            }
        }
        for root in &inherited {
            reasons.push(InvalidationReason::dependency(root.clone()));
        }
        roots.extend(inherited);

        reasons.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        reasons.dedup();

        let invalidated = !roots.is_empty();
        root_causes.insert(name.clone(), roots);
        map.insert(
            name.clone(),
            InvalidationEntry {
                invalidated,
                reasons,
            },
        );
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::Task;

    fn task(name: &str, run: &str) -> Task {
        Task {
            name: name.into(),
            inputs: vec![],
            run: run.into(),
            env: BTreeMap::new(),
            outputs: vec![],
        }
    }

    fn snapshot_of(graph: &TaskGraph, dir: &Path) -> GraphSnapshot {
        GraphSnapshot::capture(graph, dir).unwrap()
    }

    fn chain(run_a: &str) -> TaskGraph {
        TaskGraph::build(
            vec![task("a", run_a), task("b", "mid"), task("c", "leaf")],
            &[("a".into(), "b".into()), ("b".into(), "c".into())],
        )
        .unwrap()
    }

    #[test]
    fn unchanged_graph_invalidates_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let graph = chain("root");
        let old = snapshot_of(&graph, tmp.path());
        let new = old.clone();
        let map = compute(&old, &graph, &new);
        assert!(map.values().all(|entry| !entry.invalidated));
        assert!(map.values().all(|entry| entry.reasons.is_empty()));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn command_change_propagates_root_cause_not_hop() {
        let tmp = tempfile::TempDir::new().unwrap();
        let old_graph = chain("root-v1");
        let old = snapshot_of(&old_graph, tmp.path());
        let new_graph = chain("root-v2");
        let new = snapshot_of(&new_graph, tmp.path());

        let map = compute(&old, &new_graph, &new);

        let a = &map["a"];
        assert!(a.invalidated);
        assert_eq!(a.reasons[0].kind, ReasonKind::CommandChanged);

        let c = &map["c"];
        assert!(c.invalidated);
        assert_eq!(c.reasons.len(), 1);
        assert_eq!(c.reasons[0].kind, ReasonKind::DependencyInvalidated);
        assert_eq!(c.reasons[0].source_task_id.as_deref(), Some("a"));
    }

    #[test]
    fn env_changes_carry_sorted_details() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut old_task = task("a", "run");
        old_task.env.insert("ZED".into(), "1".into());
        old_task.env.insert("ALPHA".into(), "1".into());
        let old_graph = TaskGraph::build(vec![old_task], &[]).unwrap();
        let old = snapshot_of(&old_graph, tmp.path());

        let mut new_task = task("a", "run");
        new_task.env.insert("ZED".into(), "2".into());
        new_task.env.insert("BETA".into(), "1".into());
        let new_graph = TaskGraph::build(vec![new_task], &[]).unwrap();
        let new = snapshot_of(&new_graph, tmp.path());

        let map = compute(&old, &new_graph, &new);
        let entry = &map["a"];
        assert!(entry.invalidated);
        assert_eq!(entry.reasons.len(), 1);
        assert_eq!(entry.reasons[0].kind, ReasonKind::EnvChanged);
        // ALPHA removed, BETA added, ZED changed; sorted by key name.
        assert_eq!(
            entry.reasons[0].details,
            vec![
                ("EnvName".to_string(), "ALPHA".to_string()),
                ("EnvName".to_string(), "BETA".to_string()),
                ("EnvName".to_string(), "ZED".to_string()),
            ]
        );
    }

    #[test]
    fn new_task_is_structure_changed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let graph = chain("root");
        let new = snapshot_of(&graph, tmp.path());
        let map = compute(&GraphSnapshot::default(), &graph, &new);
        assert!(map.values().all(|entry| entry.invalidated));
        assert_eq!(map["a"].reasons[0].kind, ReasonKind::GraphStructureChanged);
    }

    #[test]
    fn input_content_change_is_input_changed() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("in.txt"), "v1").unwrap();
        let mut root = task("a", "run");
        root.inputs.push("in.txt".into());
        let graph = TaskGraph::build(vec![root], &[]).unwrap();
        let old = snapshot_of(&graph, tmp.path());

        std::fs::write(tmp.path().join("in.txt"), "v2").unwrap();
        let new = snapshot_of(&graph, tmp.path());

        let map = compute(&old, &graph, &new);
        assert_eq!(map["a"].reasons[0].kind, ReasonKind::InputChanged);
    }

    #[test]
    fn output_symmetric_difference_is_detailed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut old_task = task("a", "run");
        old_task.outputs = vec!["kept".into(), "dropped".into()];
        let old_graph = TaskGraph::build(vec![old_task], &[]).unwrap();
        let old = snapshot_of(&old_graph, tmp.path());

        let mut new_task = task("a", "run");
        new_task.outputs = vec!["kept".into(), "added".into()];
        let new_graph = TaskGraph::build(vec![new_task], &[]).unwrap();
        let new = snapshot_of(&new_graph, tmp.path());

        let map = compute(&old, &new_graph, &new);
        let entry = &map["a"];
        assert_eq!(entry.reasons[0].kind, ReasonKind::OutputChanged);
        assert_eq!(
            entry.reasons[0].details,
            vec![
                ("OutputName".to_string(), "added".to_string()),
                ("OutputName".to_string(), "dropped".to_string()),
            ]
        );
    }

    #[test]
    fn binary_encoding_is_stable_and_order_free() {
        let reason = InvalidationReason::new(ReasonKind::EnvChanged).with_details(vec![
            ("EnvName".into(), "B".into()),
            ("EnvName".into(), "A".into()),
        ]);
        let other = InvalidationReason::new(ReasonKind::EnvChanged).with_details(vec![
            ("EnvName".into(), "A".into()),
            ("EnvName".into(), "B".into()),
        ]);
        assert_eq!(reason.encode(), other.encode());

        let dep = InvalidationReason::dependency("a");
        assert_ne!(reason.encode(), dep.encode());
        assert_eq!(dep.canonical_string(), "DependencyInvalidated(source=a)");
        assert_eq!(
            reason.canonical_string(),
            "EnvChanged[EnvName=A,EnvName=B]"
        );
    }

    #[test]
    fn map_is_pure_function_of_snapshots() {
        let tmp = tempfile::TempDir::new().unwrap();
        let old_graph = chain("root-v1");
        let old = snapshot_of(&old_graph, tmp.path());
        let new_graph = chain("root-v2");
        let new = snapshot_of(&new_graph, tmp.path());

        let m1 = compute(&old, &new_graph, &new);
        let m2 = compute(&old, &new_graph, &new);
        assert_eq!(m1, m2);
    }
}
