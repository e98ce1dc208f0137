//! The observational trace: an inert, canonical, hashable record of every
//! observable decision in a run.
//!
//! Events carry no timestamps, pointer addresses, or runtime-dependent
//! values. The canonical byte form sorts events and omits empty optional
//! fields, so logically equal traces are byte-identical and the
//! `TraceHash` is stable across concurrency levels and hosts.

use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};

/// Event kinds in fixed kind-order (the sort order for canonical bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventKind {
    /// The invalidation engine marked the task stale.
    TaskInvalidated,
    /// Artifacts were restored into the workspace.
    TaskArtifactsRestored,
    /// The task was satisfied from the cache.
    TaskCached,
    /// The task's command executed.
    TaskExecuted,
    /// The task's command exited non-zero (or restoration failed).
    TaskFailed,
    /// The task was skipped because an ancestor failed.
    TaskSkipped,
}

impl EventKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::TaskInvalidated => "TaskInvalidated",
            Self::TaskArtifactsRestored => "TaskArtifactsRestored",
            Self::TaskCached => "TaskCached",
            Self::TaskExecuted => "TaskExecuted",
            Self::TaskFailed => "TaskFailed",
            Self::TaskSkipped => "TaskSkipped",
        }
    }
}

/// Fixed reason vocabulary for execution events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReason {
    /// Unplanned cache probe hit.
    CacheHit,
    /// Artifact restoration following an unplanned cache hit.
    CacheReplay,
    /// The incremental plan decided `ReuseCache`.
    PlannedReuseCache,
    /// Artifact restoration for a planned `ReuseCache` node.
    CacheRestore,
    /// Execution with no plan forcing it.
    FreshWork,
    /// Execution forced by the incremental plan.
    PlannedExecute,
    /// Skip caused by a failed ancestor.
    UpstreamFailed,
}

impl EventReason {
    /// Stable textual form used in the canonical encoding.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CacheHit => "CacheHit",
            Self::CacheReplay => "CacheReplay",
            Self::PlannedReuseCache => "PlannedReuseCache",
            Self::CacheRestore => "CacheRestore",
            Self::FreshWork => "FreshWork",
            Self::PlannedExecute => "PlannedExecute",
            Self::UpstreamFailed => "UpstreamFailed",
        }
    }
}

/// One observable transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    /// What happened.
    pub kind: EventKind,
    /// The task it happened to.
    pub task_id: String,
    /// Why, when the kind carries a reason.
    pub reason: Option<String>,
    /// The root-cause task for skips and dependency invalidations.
    pub cause_task_id: Option<String>,
    /// Sorted artifact paths, when the event restored artifacts.
    pub artifacts: Vec<String>,
}

impl TraceEvent {
    /// Event with just a kind and task.
    #[must_use]
    pub fn new(kind: EventKind, task_id: impl Into<String>) -> Self {
        Self {
            kind,
            task_id: task_id.into(),
            reason: None,
            cause_task_id: None,
            artifacts: Vec::new(),
        }
    }

    /// Attach a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: EventReason) -> Self {
        self.reason = Some(reason.as_str().to_string());
        self
    }

    /// Attach a free-form reason (invalidation reasons carry details).
    #[must_use]
    pub fn with_reason_text(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach the causing task.
    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause_task_id = Some(cause.into());
        self
    }

    /// Attach restored artifact paths (sorted here, defensively).
    #[must_use]
    pub fn with_artifacts(mut self, mut artifacts: Vec<String>) -> Self {
        artifacts.sort_unstable();
        artifacts.dedup();
        self.artifacts = artifacts;
        self
    }

    fn sort_key(&self) -> (&str, EventKind, &str, &str, &[String]) {
        (
            &self.task_id,
            self.kind,
            self.reason.as_deref().unwrap_or(""),
            self.cause_task_id.as_deref().unwrap_or(""),
            &self.artifacts,
        )
    }
}

/// A complete execution record for one graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    /// Identity of the graph this trace describes.
    pub graph_hash: String,
    /// Events in decision order.
    pub events: Vec<TraceEvent>,
}

fn push_json_string(out: &mut Vec<u8>, value: &str) {
    out.push(b'"');
    for ch in value.chars() {
        match ch {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
            c if (c as u32) < 0x20 => {
                out.extend_from_slice(format!("\\u{:04x}", c as u32).as_bytes());
            }
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
}

impl Trace {
    /// Empty trace for a graph. Written up-front so a crashed run still
    /// leaves a well-formed artifact.
    #[must_use]
    pub fn empty(graph_hash: impl Into<String>) -> Self {
        Self {
            graph_hash: graph_hash.into(),
            events: Vec::new(),
        }
    }

    /// The canonical byte form: events sorted by `(task-id, kind-order,
    /// reason, cause-task-id, artifacts)`, fixed field order, sorted keys,
    /// no whitespace, empty optional fields omitted.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut sorted: Vec<&TraceEvent> = self.events.iter().collect();
        sorted.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let mut out = Vec::new();
        out.extend_from_slice(b"{\"events\":[");
        for (index, event) in sorted.iter().enumerate() {
            if index > 0 {
                out.push(b',');
            }
            out.push(b'{');
            let mut first = true;
            let field = |out: &mut Vec<u8>, first: &mut bool, key: &str| {
                if !*first {
                    out.push(b',');
                }
                *first = false;
                push_json_string(out, key);
                out.push(b':');
            };
            if !event.artifacts.is_empty() {
                field(&mut out, &mut first, "artifacts");
                out.push(b'[');
                for (i, artifact) in event.artifacts.iter().enumerate() {
                    if i > 0 {
                        out.push(b',');
                    }
                    push_json_string(&mut out, artifact);
                }
                out.push(b']');
            }
            if let Some(cause) = &event.cause_task_id {
                field(&mut out, &mut first, "cause");
                push_json_string(&mut out, cause);
            }
            field(&mut out, &mut first, "kind");
            push_json_string(&mut out, event.kind.as_str());
            if let Some(reason) = &event.reason {
                field(&mut out, &mut first, "reason");
                push_json_string(&mut out, reason);
            }
            field(&mut out, &mut first, "task");
            push_json_string(&mut out, &event.task_id);
            out.push(b'}');
        }
        out.extend_from_slice(b"],\"graph_hash\":");
        push_json_string(&mut out, &self.graph_hash);
        out.push(b'}');
        out
    }

    /// `SHA-256` of the canonical bytes, hex encoded.
    #[must_use]
    pub fn trace_hash(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_bytes()))
    }
}

/// Inert event sink.
///
/// `record` never fails and never affects execution behaviour; a poisoned
/// inner lock degrades to dropping events rather than propagating a panic
/// into the engine.
#[derive(Debug, Clone)]
pub struct TraceRecorder {
    graph_hash: String,
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl TraceRecorder {
    /// Recorder for one run of the graph identified by `graph_hash`.
    #[must_use]
    pub fn new(graph_hash: impl Into<String>) -> Self {
        Self {
            graph_hash: graph_hash.into(),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Append an event. Infallible by contract.
    pub fn record(&self, event: TraceEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    /// Current trace snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Trace {
        let events = self
            .events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default();
        Trace {
            graph_hash: self.graph_hash.clone(),
            events,
        }
    }
}
