//! Immutable validated task graph with canonical identity.

use gantry_core::{Error, Result, Task};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use sha2::{Digest, Sha256};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

fn update_framed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Per-task definition digest over sorted `inputs`, sorted `env`, and
/// `run`. The task `name` is deliberately excluded so renaming a task does
/// not change graph identity; `name` only tie-breaks duplicate definitions
/// in the canonical order.
#[must_use]
pub fn task_def_hash(task: &Task) -> String {
    let mut hasher = Sha256::new();

    let mut inputs: Vec<&str> = task.inputs.iter().map(String::as_str).collect();
    inputs.sort_unstable();
    hasher.update((inputs.len() as u64).to_be_bytes());
    for input in inputs {
        update_framed(&mut hasher, input.as_bytes());
    }

    hasher.update((task.env.len() as u64).to_be_bytes());
    for (key, value) in &task.env {
        update_framed(&mut hasher, key.as_bytes());
        update_framed(&mut hasher, value.as_bytes());
    }

    update_framed(&mut hasher, task.run.as_bytes());
    hex::encode(hasher.finalize())
}

/// Immutable, validated task DAG.
///
/// Node indices are canonical: nodes are sorted by `(task_def_hash, name)`
/// at construction, edges are remapped to canonical indices and sorted, so
/// two graphs with the same task definitions and dependency structure are
/// identical regardless of insertion order.
#[derive(Debug)]
pub struct TaskGraph {
    nodes: Vec<Task>,
    def_hashes: Vec<String>,
    name_to_index: HashMap<String, usize>,
    edges: Vec<(usize, usize)>,
    children: Vec<Vec<usize>>,
    parents: Vec<Vec<usize>>,
    indegree: Vec<usize>,
    depth: Vec<usize>,
    graph_hash: String,
    /// petgraph mirror of the structure (node i == canonical index i),
    /// used for traversal queries.
    mirror: DiGraph<(), ()>,
}

impl TaskGraph {
    /// Build and validate a graph from tasks and `(from, to)` edges, where
    /// `to` depends on `from`.
    ///
    /// # Errors
    ///
    /// Rejects empty or duplicate names, edges referring to unknown nodes,
    /// self-loops, duplicate edges, and cycles (with a cycle witness in
    /// the message).
    pub fn build(tasks: Vec<Task>, edges: &[(String, String)]) -> Result<Self> {
        if tasks.is_empty() {
            return Err(Error::graph("graph contains no tasks"));
        }
        for task in &tasks {
            task.validate()?;
        }

        let mut seen_names: HashSet<&str> = HashSet::new();
        for task in &tasks {
            if !seen_names.insert(&task.name) {
                return Err(Error::graph(format!("duplicate task name '{}'", task.name)));
            }
        }

        // Canonical order sorts by (definition hash, name); name is the
        // tie-breaker for duplicate definitions.
        let mut order: Vec<(String, usize)> = tasks
            .iter()
            .enumerate()
            .map(|(i, task)| (task_def_hash(task), i))
            .collect();
        order.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| tasks[a.1].name.cmp(&tasks[b.1].name))
        });

        let def_hashes: Vec<String> = order.iter().map(|(hash, _)| hash.clone()).collect();
        let nodes: Vec<Task> = order.iter().map(|(_, i)| tasks[*i].clone()).collect();
        let name_to_index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, task)| (task.name.clone(), i))
            .collect();

        let mut canonical_edges: BTreeSet<(usize, usize)> = BTreeSet::new();
        for (from, to) in edges {
            let from_idx = *name_to_index
                .get(from)
                .ok_or_else(|| Error::graph(format!("edge references unknown task '{from}'")))?;
            let to_idx = *name_to_index
                .get(to)
                .ok_or_else(|| Error::graph(format!("edge references unknown task '{to}'")))?;
            if from_idx == to_idx {
                return Err(Error::graph(format!("self-loop on task '{from}'")));
            }
            if !canonical_edges.insert((from_idx, to_idx)) {
                return Err(Error::graph(format!("duplicate edge '{from}' -> '{to}'")));
            }
        }
        let edges: Vec<(usize, usize)> = canonical_edges.into_iter().collect();

        let mut children = vec![Vec::new(); nodes.len()];
        let mut parents = vec![Vec::new(); nodes.len()];
        let mut indegree = vec![0usize; nodes.len()];
        for &(from, to) in &edges {
            children[from].push(to);
            parents[to].push(from);
            indegree[to] += 1;
        }
        // Adjacency is sorted by canonical index.
        for list in children.iter_mut().chain(parents.iter_mut()) {
            list.sort_unstable();
        }

        let depth = kahn_depths(&nodes, &children, &indegree)
            .ok_or_else(|| Error::graph(cycle_witness(&nodes, &children)))?;

        let graph_hash = compute_graph_hash(&def_hashes, &edges);

        // petgraph mirrors the structure for traversal queries; the
        // canonical arrays above are the source of truth for identity.
        let mut mirror: DiGraph<(), ()> = DiGraph::new();
        for _ in 0..nodes.len() {
            mirror.add_node(());
        }
        for &(from, to) in &edges {
            mirror.add_edge(NodeIndex::new(from), NodeIndex::new(to), ());
        }
        debug_assert!(!petgraph::algo::is_cyclic_directed(&mirror));

        tracing::debug!(
            tasks = nodes.len(),
            edges = edges.len(),
            hash = %graph_hash,
            "task graph validated"
        );

        Ok(Self {
            nodes,
            def_hashes,
            name_to_index,
            edges,
            children,
            parents,
            indegree,
            depth,
            graph_hash,
            mirror,
        })
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph holds no tasks. Construction rejects this, so
    /// only a default-free accessor for completeness.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Tasks in canonical order.
    #[must_use]
    pub fn nodes(&self) -> &[Task] {
        &self.nodes
    }

    /// The task at canonical index `index`.
    #[must_use]
    pub fn node(&self, index: usize) -> &Task {
        &self.nodes[index]
    }

    /// Per-node definition hashes in canonical order.
    #[must_use]
    pub fn def_hashes(&self) -> &[String] {
        &self.def_hashes
    }

    /// Canonical index for a task name.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// Canonical `(from, to)` edge list.
    #[must_use]
    pub fn edges(&self) -> &[(usize, usize)] {
        &self.edges
    }

    /// Direct downstream dependents of `index`, sorted by canonical index.
    #[must_use]
    pub fn children(&self, index: usize) -> &[usize] {
        &self.children[index]
    }

    /// Direct upstream dependencies of `index`, sorted by canonical index.
    #[must_use]
    pub fn parents(&self, index: usize) -> &[usize] {
        &self.parents[index]
    }

    /// Number of incoming edges for `index`.
    #[must_use]
    pub fn indegree(&self, index: usize) -> usize {
        self.indegree[index]
    }

    /// Longest-path-from-root depth of `index`; roots are depth 0.
    #[must_use]
    pub fn depth(&self, index: usize) -> usize {
        self.depth[index]
    }

    /// The largest depth in the graph.
    #[must_use]
    pub fn max_depth(&self) -> usize {
        self.depth.iter().copied().max().unwrap_or(0)
    }

    /// Canonical insertion-order-invariant graph identity.
    #[must_use]
    pub fn graph_hash(&self) -> &str {
        &self.graph_hash
    }

    /// Topological order with lexical (task name) tie-breaks.
    #[must_use]
    pub fn topological_order(&self) -> Vec<usize> {
        let mut indegree = self.indegree.clone();
        let mut ready: BinaryHeap<Reverse<(&str, usize)>> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| indegree[*i] == 0)
            .map(|(i, task)| Reverse((task.name.as_str(), i)))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse((_, index))) = ready.pop() {
            order.push(index);
            for &child in &self.children[index] {
                indegree[child] -= 1;
                if indegree[child] == 0 {
                    ready.push(Reverse((self.nodes[child].name.as_str(), child)));
                }
            }
        }
        debug_assert_eq!(order.len(), self.nodes.len());
        order
    }

    /// Transitive upstream closure of `index` (excluding `index` itself).
    #[must_use]
    pub fn ancestors(&self, index: usize) -> BTreeSet<usize> {
        let reversed = Reversed(&self.mirror);
        let mut dfs = Dfs::new(reversed, NodeIndex::new(index));
        let mut closure = BTreeSet::new();
        while let Some(node) = dfs.next(reversed) {
            if node.index() != index {
                closure.insert(node.index());
            }
        }
        closure
    }
}

/// Kahn's algorithm: returns per-node longest-path depths, or `None` when
/// the graph is cyclic.
fn kahn_depths(
    nodes: &[Task],
    children: &[Vec<usize>],
    indegree: &[usize],
) -> Option<Vec<usize>> {
    let mut indegree = indegree.to_vec();
    let mut depth = vec![0usize; nodes.len()];
    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut processed = 0usize;
    while let Some(Reverse(index)) = ready.pop() {
        processed += 1;
        for &child in &children[index] {
            depth[child] = depth[child].max(depth[index] + 1);
            indegree[child] -= 1;
            if indegree[child] == 0 {
                ready.push(Reverse(child));
            }
        }
    }

    (processed == nodes.len()).then_some(depth)
}

/// Deterministic DFS from the smallest canonical index that extracts a
/// cycle witness for the error message.
fn cycle_witness(nodes: &[Task], children: &[Vec<usize>]) -> String {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Grey,
        Black,
    }

    let mut color = vec![Color::White; nodes.len()];
    let mut stack: Vec<usize> = Vec::new();

    fn visit(
        node: usize,
        children: &[Vec<usize>],
        color: &mut [Color],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        color[node] = Color::Grey;
        stack.push(node);
        for &child in &children[node] {
            match color[child] {
                Color::Grey => {
                    let start = stack.iter().position(|&n| n == child).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(child);
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = visit(child, children, color, stack) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }
        stack.pop();
        color[node] = Color::Black;
        None
    }

    for start in 0..nodes.len() {
        if color[start] == Color::White {
            if let Some(cycle) = visit(start, children, &mut color, &mut stack) {
                let names: Vec<&str> = cycle.iter().map(|&i| nodes[i].name.as_str()).collect();
                return format!("dependency cycle: {}", names.join(" -> "));
            }
        }
    }
    "dependency cycle detected".to_string()
}

fn compute_graph_hash(def_hashes: &[String], edges: &[(usize, usize)]) -> String {
    let mut hasher = Sha256::new();
    hasher.update((def_hashes.len() as u64).to_be_bytes());
    for hash in def_hashes {
        update_framed(&mut hasher, hash.as_bytes());
    }
    hasher.update((edges.len() as u64).to_be_bytes());
    for &(from, to) in edges {
        hasher.update((from as u64).to_be_bytes());
        hasher.update((to as u64).to_be_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn task(name: &str, run: &str) -> Task {
        Task {
            name: name.into(),
            inputs: vec![],
            run: run.into(),
            env: BTreeMap::new(),
            outputs: vec![],
        }
    }

    fn edge(from: &str, to: &str) -> (String, String) {
        (from.into(), to.into())
    }

    #[test]
    fn builds_diamond_with_depths() {
        let graph = TaskGraph::build(
            vec![task("a", "1"), task("b", "2"), task("c", "3"), task("d", "4")],
            &[edge("a", "b"), edge("a", "c"), edge("b", "d"), edge("c", "d")],
        )
        .unwrap();
        let a = graph.index_of("a").unwrap();
        let b = graph.index_of("b").unwrap();
        let d = graph.index_of("d").unwrap();
        assert_eq!(graph.depth(a), 0);
        assert_eq!(graph.depth(b), 1);
        assert_eq!(graph.depth(d), 2);
        assert_eq!(graph.max_depth(), 2);
        assert_eq!(graph.indegree(d), 2);
        assert_eq!(graph.ancestors(d).len(), 3);
    }

    #[test]
    fn graph_hash_is_insertion_order_invariant() {
        let g1 = TaskGraph::build(
            vec![task("a", "1"), task("b", "2"), task("c", "3")],
            &[edge("a", "b"), edge("b", "c")],
        )
        .unwrap();
        let g2 = TaskGraph::build(
            vec![task("c", "3"), task("a", "1"), task("b", "2")],
            &[edge("b", "c"), edge("a", "b")],
        )
        .unwrap();
        assert_eq!(g1.graph_hash(), g2.graph_hash());
    }

    #[test]
    fn graph_hash_ignores_names_but_not_structure() {
        let g1 = TaskGraph::build(
            vec![task("a", "1"), task("b", "2")],
            &[edge("a", "b")],
        )
        .unwrap();
        // Renamed tasks, same definitions and structure.
        let g2 = TaskGraph::build(
            vec![task("x", "1"), task("y", "2")],
            &[edge("x", "y")],
        )
        .unwrap();
        assert_eq!(g1.graph_hash(), g2.graph_hash());

        // Reversed edge changes structure.
        let g3 = TaskGraph::build(
            vec![task("a", "1"), task("b", "2")],
            &[edge("b", "a")],
        )
        .unwrap();
        assert_ne!(g1.graph_hash(), g3.graph_hash());
    }

    #[test]
    fn cycles_are_rejected_with_witness() {
        let err = TaskGraph::build(
            vec![task("a", "1"), task("b", "2"), task("c", "3")],
            &[edge("a", "b"), edge("b", "c"), edge("c", "a")],
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("cycle"));
        assert!(message.contains("->"));
    }

    #[test]
    fn self_loops_and_duplicates_are_rejected() {
        let err = TaskGraph::build(vec![task("a", "1")], &[edge("a", "a")]).unwrap_err();
        assert!(err.to_string().contains("self-loop"));

        let err = TaskGraph::build(
            vec![task("a", "1"), task("b", "2")],
            &[edge("a", "b"), edge("a", "b")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate edge"));
    }

    #[test]
    fn unknown_edge_endpoint_is_rejected() {
        let err = TaskGraph::build(vec![task("a", "1")], &[edge("a", "ghost")]).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err =
            TaskGraph::build(vec![task("a", "1"), task("a", "2")], &[]).unwrap_err();
        assert!(err.to_string().contains("duplicate task name"));
    }

    #[test]
    fn topological_order_breaks_ties_lexically() {
        let graph = TaskGraph::build(
            vec![task("zeta", "1"), task("alpha", "2"), task("mid", "3")],
            &[edge("alpha", "mid"), edge("zeta", "mid")],
        )
        .unwrap();
        let names: Vec<&str> = graph
            .topological_order()
            .into_iter()
            .map(|i| graph.node(i).name.as_str())
            .collect();
        assert_eq!(names, vec!["alpha", "zeta", "mid"]);
    }

    #[test]
    fn def_hash_excludes_name_and_outputs() {
        let t1 = task("a", "make");
        let mut t2 = task("b", "make");
        t2.outputs.push("out.bin".into());
        assert_eq!(task_def_hash(&t1), task_def_hash(&t2));

        let t3 = task("a", "make -j");
        assert_ne!(task_def_hash(&t1), task_def_hash(&t3));
    }
}
