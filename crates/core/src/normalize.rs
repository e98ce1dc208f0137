//! Output normalization: stripping nondeterministic substrings.
//!
//! Harvested artifact bytes and captured streams can embed values that
//! differ between otherwise identical executions (timestamps, pids, heap
//! addresses). The default normalizer replaces them with stable
//! placeholders so cached artifacts compare bit-for-bit.

use regex::bytes::Regex;
use std::sync::LazyLock;

// Substitutions are applied in this exact order. Timestamps go first so the
// duration rule cannot eat the seconds field of a timestamp.
static ISO_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2})?").unwrap()
});
static DATETIME: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\d{4}[-/]\d{2}[-/]\d{2} \d{2}:\d{2}:\d{2}(?:\.\d+)?").unwrap()
});
static UNIX_EPOCH: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\b1\d{9,12}\b").unwrap()
});
static DURATION: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\b\d+(?:ms|s|seconds?|minutes?|hours?)\b").unwrap()
});
static PID: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)\bpid \d+").unwrap()
});
static HEX_ADDR: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\b0x[0-9a-fA-F]{8,16}\b").unwrap()
});

/// A byte-to-byte transform applied to harvested content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Normalizer {
    /// Pass bytes through untouched.
    Raw,
    /// Replace nondeterministic substrings with stable placeholders.
    #[default]
    Placeholders,
    /// Placeholder substitution plus CRLF -> LF folding for stream output.
    Stream,
}

fn substitute(bytes: &[u8]) -> Vec<u8> {
    let bytes = ISO_TIMESTAMP.replace_all(bytes, &b"<TIMESTAMP>"[..]);
    let bytes = DATETIME.replace_all(&bytes, &b"<TIMESTAMP>"[..]);
    let bytes = UNIX_EPOCH.replace_all(&bytes, &b"<UNIX_TS>"[..]);
    let bytes = DURATION.replace_all(&bytes, &b"<DURATION>"[..]);
    let bytes = PID.replace_all(&bytes, &b"pid <PID>"[..]);
    HEX_ADDR.replace_all(&bytes, &b"<ADDR>"[..]).into_owned()
}

fn fold_crlf(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\r' && bytes.get(i + 1) == Some(&b'\n') {
            i += 1;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

impl Normalizer {
    /// Apply the transform.
    #[must_use]
    pub fn apply(&self, bytes: &[u8]) -> Vec<u8> {
        match self {
            Self::Raw => bytes.to_vec(),
            Self::Placeholders => substitute(bytes),
            Self::Stream => substitute(&fold_crlf(bytes)),
        }
    }
}
