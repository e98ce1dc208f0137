//! DAG executor behaviour: failure propagation, parallel determinism, and
//! plan-driven reuse.

use gantry_core::cache::{Cache, MemoryCache};
use gantry_core::exec::ExecutionContext;
use gantry_core::normalize::Normalizer;
use gantry_core::runner::TaskRunner;
use gantry_core::{Error, Task};
use gantry_engine::executor::DagExecutor;
use gantry_engine::trace::{EventKind, TraceRecorder};
use gantry_engine::{GraphResult, Trace};
use gantry_task_graph::{TaskGraph, TaskState};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn task(name: &str, run: &str) -> Task {
    Task {
        name: name.into(),
        inputs: vec![],
        run: run.into(),
        env: BTreeMap::new(),
        outputs: vec![],
    }
}

fn edges(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(from, to)| ((*from).to_string(), (*to).to_string()))
        .collect()
}

async fn run_graph(
    graph: Arc<TaskGraph>,
    workdir: &TempDir,
    concurrency: usize,
) -> (GraphResult, Trace) {
    let recorder = TraceRecorder::new(graph.graph_hash());
    let runner = TaskRunner::detached(Cache::Memory(MemoryCache::new()), Normalizer::Raw);
    let executor = DagExecutor::new(
        Arc::clone(&graph),
        runner,
        None,
        recorder.clone(),
        None,
        concurrency,
    );
    let ctx = ExecutionContext {
        workdir: workdir.path().to_path_buf(),
        cancel: CancellationToken::new(),
    };
    let result = executor.execute(&ctx).await.unwrap();
    (result, recorder.snapshot())
}

#[tokio::test]
async fn all_nodes_reach_terminal_states() {
    let tmp = TempDir::new().unwrap();
    let graph = Arc::new(
        TaskGraph::build(
            vec![task("a", "true"), task("b", "true"), task("c", "true")],
            &edges(&[("a", "b"), ("b", "c")]),
        )
        .unwrap(),
    );
    let (result, _) = run_graph(graph, &tmp, 1).await;
    assert!(result
        .final_states
        .values()
        .all(|state| *state == TaskState::Completed));
    assert!(!result.any_failed());
}

#[tokio::test]
async fn failure_propagates_and_unrelated_work_continues() {
    // S2: a -> b -> c plus independent d; a exits 7.
    let tmp = TempDir::new().unwrap();
    let graph = Arc::new(
        TaskGraph::build(
            vec![
                task("a", "exit 7"),
                task("b", "true"),
                task("c", "true"),
                task("d", "echo d"),
            ],
            &edges(&[("a", "b"), ("b", "c")]),
        )
        .unwrap(),
    );
    let (result, trace) = run_graph(graph, &tmp, 1).await;

    assert_eq!(result.final_states["a"], TaskState::Failed);
    assert_eq!(result.final_states["b"], TaskState::Skipped);
    assert_eq!(result.final_states["c"], TaskState::Skipped);
    assert_eq!(result.final_states["d"], TaskState::Completed);
    assert!(result.any_failed());
    assert_eq!(result.results["a"].exit_code, 7);

    // The failed node gets TaskFailed only; skips carry the cause.
    let a_events: Vec<EventKind> = trace
        .events
        .iter()
        .filter(|e| e.task_id == "a")
        .map(|e| e.kind)
        .collect();
    assert_eq!(a_events, vec![EventKind::TaskFailed]);

    let skip_events: Vec<(&str, &str)> = trace
        .events
        .iter()
        .filter(|e| e.kind == EventKind::TaskSkipped)
        .map(|e| (e.task_id.as_str(), e.cause_task_id.as_deref().unwrap()))
        .collect();
    assert_eq!(skip_events, vec![("b", "a"), ("c", "a")]);
}

#[tokio::test]
async fn trace_order_is_depth_staged_lexical_for_all_concurrency() {
    // S3: a, b at depth 0; c depends on a; d depends on b; e independent.
    let build = || {
        Arc::new(
            TaskGraph::build(
                vec![
                    task("a", "echo a"),
                    task("b", "echo b"),
                    task("c", "echo c"),
                    task("d", "echo d"),
                    task("e", "echo e"),
                ],
                &edges(&[("a", "c"), ("b", "d")]),
            )
            .unwrap(),
        )
    };

    let mut hashes = Vec::new();
    let mut canonical = Vec::new();
    for concurrency in [1usize, 3, 8] {
        let tmp = TempDir::new().unwrap();
        let (result, trace) = run_graph(build(), &tmp, concurrency).await;
        assert!(result
            .final_states
            .values()
            .all(|state| *state == TaskState::Completed));

        let executed: Vec<&str> = trace
            .events
            .iter()
            .filter(|e| e.kind == EventKind::TaskExecuted)
            .map(|e| e.task_id.as_str())
            .collect();
        assert_eq!(executed, vec!["a", "b", "e", "c", "d"]);

        hashes.push(trace.trace_hash());
        canonical.push(trace.canonical_bytes());
    }
    assert_eq!(hashes[0], hashes[1]);
    assert_eq!(hashes[1], hashes[2]);
    assert_eq!(canonical[0], canonical[1]);
    assert_eq!(canonical[1], canonical[2]);
}

#[tokio::test]
async fn final_states_identical_across_concurrency_with_failures() {
    let build = || {
        Arc::new(
            TaskGraph::build(
                vec![
                    task("fail1", "exit 1"),
                    task("ok1", "sleep 0.05; echo ok"),
                    task("child1", "true"),
                    task("child2", "true"),
                    task("grand", "true"),
                ],
                &edges(&[
                    ("fail1", "child1"),
                    ("ok1", "child2"),
                    ("child1", "grand"),
                    ("child2", "grand"),
                ]),
            )
            .unwrap(),
        )
    };

    let mut outcomes = Vec::new();
    for concurrency in [1usize, 4] {
        let tmp = TempDir::new().unwrap();
        let (result, trace) = run_graph(build(), &tmp, concurrency).await;
        outcomes.push((result.final_states, trace.trace_hash()));
    }
    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[0].0["fail1"], TaskState::Failed);
    assert_eq!(outcomes[0].0["child1"], TaskState::Skipped);
    assert_eq!(outcomes[0].0["ok1"], TaskState::Completed);
    assert_eq!(outcomes[0].0["child2"], TaskState::Completed);
    assert_eq!(outcomes[0].0["grand"], TaskState::Skipped);
}

#[tokio::test]
async fn skip_cause_is_lexically_smallest_failed_ancestor() {
    // Both "apple" and "zebra" fail into the same sink.
    let tmp = TempDir::new().unwrap();
    let graph = Arc::new(
        TaskGraph::build(
            vec![task("zebra", "exit 1"), task("apple", "exit 1"), task("sink", "true")],
            &edges(&[("zebra", "sink"), ("apple", "sink")]),
        )
        .unwrap(),
    );
    let (result, trace) = run_graph(graph, &tmp, 2).await;
    assert_eq!(result.final_states["sink"], TaskState::Skipped);

    let skip = trace
        .events
        .iter()
        .find(|e| e.kind == EventKind::TaskSkipped)
        .unwrap();
    assert_eq!(skip.cause_task_id.as_deref(), Some("apple"));
}

#[tokio::test]
async fn cache_hit_replays_instead_of_executing() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("in.txt"), "hello").unwrap();
    let graph = Arc::new(
        TaskGraph::build(
            vec![Task {
                name: "copy".into(),
                inputs: vec!["in.txt".into()],
                run: "cat in.txt > copied.txt".into(),
                env: BTreeMap::new(),
                outputs: vec!["copied.txt".into()],
            }],
            &[],
        )
        .unwrap(),
    );

    let cache = Cache::Memory(MemoryCache::new());
    let runner = TaskRunner::new(cache, Normalizer::Raw);
    let ctx = ExecutionContext {
        workdir: tmp.path().to_path_buf(),
        cancel: CancellationToken::new(),
    };

    let first = DagExecutor::new(
        Arc::clone(&graph),
        runner.clone(),
        None,
        TraceRecorder::new(graph.graph_hash()),
        None,
        1,
    );
    let result = first.execute(&ctx).await.unwrap();
    assert_eq!(result.final_states["copy"], TaskState::Completed);

    std::fs::remove_file(tmp.path().join("copied.txt")).unwrap();

    let recorder = TraceRecorder::new(graph.graph_hash());
    let second = DagExecutor::new(
        Arc::clone(&graph),
        runner,
        None,
        recorder.clone(),
        None,
        1,
    );
    let result = second.execute(&ctx).await.unwrap();
    assert_eq!(result.final_states["copy"], TaskState::Cached);
    assert_eq!(
        std::fs::read(tmp.path().join("copied.txt")).unwrap(),
        b"hello"
    );

    let kinds: Vec<EventKind> = recorder.snapshot().events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![EventKind::TaskCached, EventKind::TaskArtifactsRestored]
    );
}

#[tokio::test]
async fn cached_failure_replays_as_failure() {
    let tmp = TempDir::new().unwrap();
    let graph = Arc::new(
        TaskGraph::build(
            vec![task("boom", "echo bad >&2; exit 3"), task("after", "true")],
            &edges(&[("boom", "after")]),
        )
        .unwrap(),
    );
    let cache = Cache::Memory(MemoryCache::new());
    let runner = TaskRunner::new(cache, Normalizer::Raw);
    let ctx = ExecutionContext {
        workdir: tmp.path().to_path_buf(),
        cancel: CancellationToken::new(),
    };

    for _ in 0..2 {
        let executor = DagExecutor::new(
            Arc::clone(&graph),
            runner.clone(),
            None,
            TraceRecorder::new(graph.graph_hash()),
            None,
            1,
        );
        let result = executor.execute(&ctx).await.unwrap();
        assert_eq!(result.final_states["boom"], TaskState::Failed);
        assert_eq!(result.final_states["after"], TaskState::Skipped);
        assert_eq!(result.results["boom"].exit_code, 3);
        assert_eq!(result.results["boom"].stderr, b"bad\n");
    }
}

#[tokio::test]
async fn cancellation_kills_in_flight_work() {
    let tmp = TempDir::new().unwrap();
    let graph = Arc::new(
        TaskGraph::build(vec![task("slow", "sleep 30")], &[])
            .unwrap(),
    );
    let runner = TaskRunner::detached(Cache::Memory(MemoryCache::new()), Normalizer::Raw);
    let cancel = CancellationToken::new();
    let ctx = ExecutionContext {
        workdir: tmp.path().to_path_buf(),
        cancel: cancel.clone(),
    };
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let executor = DagExecutor::new(
        Arc::clone(&graph),
        runner,
        None,
        TraceRecorder::new(graph.graph_hash()),
        None,
        1,
    );
    let started = std::time::Instant::now();
    let err = executor.execute(&ctx).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
}
