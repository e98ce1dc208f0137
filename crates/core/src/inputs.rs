//! Input resolution: expanding declared patterns into content.
//!
//! Identity is content, not metadata: the resolver reads file bytes and
//! never consults mtime, permissions, or ownership. The resolved list is
//! explicitly sorted; filesystem enumeration order is never relied upon.

use crate::{Error, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// A resolved `{path, content}` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInput {
    /// Forward-slash-normalized path, relative to the base directory when
    /// the pattern was relative, absolute otherwise.
    pub path: String,
    /// The file's content bytes.
    pub content: Vec<u8>,
}

/// Render a path with forward slashes, folding `.` and `..` components.
pub(crate) fn slashify(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut rooted = false;
    for comp in path.components() {
        match comp {
            Component::RootDir => rooted = true,
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(s) => parts.push(s.to_string_lossy().into_owned()),
            Component::Prefix(p) => parts.push(p.as_os_str().to_string_lossy().into_owned()),
        }
    }
    let joined = parts.join("/");
    if rooted { format!("/{joined}") } else { joined }
}

fn looks_like_glob(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?') || pattern.contains('[') || pattern.contains('{')
}

/// Extract the literal directory prefix of a glob pattern.
///
/// `src/**/*.rs` -> `src`, `**/*.rs` -> `` (the base dir itself).
fn glob_base(pattern: &str) -> String {
    let mut base_parts = Vec::new();
    for part in pattern.split('/') {
        if looks_like_glob(part) {
            break;
        }
        if !part.is_empty() {
            base_parts.push(part);
        }
    }
    base_parts.join("/")
}

fn build_glob_set(pattern: &str) -> Result<GlobSet> {
    let glob = Glob::new(pattern)
        .map_err(|e| Error::graph(format!("Invalid input pattern '{pattern}': {e}")))?;
    GlobSetBuilder::new()
        .add(glob)
        .build()
        .map_err(|e| Error::graph(format!("Failed to build glob set for '{pattern}': {e}")))
}

/// Expand `patterns` against `base_dir` into a sorted, deduplicated list of
/// `{path, content}` pairs.
///
/// Absolute patterns are used as-is; relative patterns are joined with
/// `base_dir`. Directories are skipped; only regular files contribute.
/// Patterns with no matches yield an empty expansion.
///
/// # Errors
///
/// Returns a graph-class error for an invalid pattern and an I/O error for
/// an unreadable matched file.
pub fn resolve(patterns: &[String], base_dir: &Path) -> Result<Vec<ResolvedInput>> {
    let span = tracing::debug_span!(
        "inputs.resolve",
        base = %base_dir.display(),
        pattern_count = patterns.len()
    );
    let _guard = span.enter();

    // Normalized path key -> filesystem path to read. BTreeMap gives the
    // sorted unique order and one read per unique path.
    let mut matched: BTreeMap<String, PathBuf> = BTreeMap::new();

    for pattern in patterns {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            continue;
        }

        if looks_like_glob(pattern) {
            let set = build_glob_set(pattern)?;
            let absolute = Path::new(pattern).is_absolute();
            let walk_root = if absolute {
                // glob_base keeps components only; restore the root.
                PathBuf::from(format!("/{}", glob_base(pattern)))
            } else {
                base_dir.join(glob_base(pattern))
            };
            if !walk_root.exists() {
                tracing::debug!(pattern, "glob base does not exist, empty expansion");
                continue;
            }
            for entry in WalkDir::new(&walk_root).into_iter().filter_map(|e| e.ok()) {
                let path = entry.path();
                if !entry.file_type().is_file() {
                    continue;
                }
                let candidate = if absolute {
                    slashify(path)
                } else {
                    match path.strip_prefix(base_dir) {
                        Ok(rel) => slashify(rel),
                        Err(_) => continue,
                    }
                };
                if set.is_match(Path::new(&candidate)) {
                    matched.entry(candidate).or_insert_with(|| path.to_path_buf());
                }
            }
        } else {
            let abs = if Path::new(pattern).is_absolute() {
                PathBuf::from(pattern)
            } else {
                base_dir.join(pattern)
            };
            if abs.is_file() {
                let key = if Path::new(pattern).is_absolute() {
                    slashify(&abs)
                } else {
                    slashify(Path::new(pattern))
                };
                matched.entry(key).or_insert(abs);
            }
            // Missing or directory literals contribute nothing.
        }
    }

    let mut resolved = Vec::with_capacity(matched.len());
    for (path, source) in matched {
        let content = fs::read(&source).map_err(|e| Error::io(e, &source, "read"))?;
        resolved.push(ResolvedInput { path, content });
    }

    tracing::debug!(total_files = resolved.len(), "input resolution complete");
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn resolves_literals_and_globs_sorted() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("src/sub")).unwrap();
        std::fs::write(root.join("src/a.rs"), "A").unwrap();
        std::fs::write(root.join("src/sub/b.rs"), "B").unwrap();
        std::fs::write(root.join("README.md"), "readme").unwrap();

        let resolved = resolve(
            &["README.md".into(), "src/**/*.rs".into()],
            root,
        )
        .unwrap();
        let paths: Vec<&str> = resolved.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "src/a.rs", "src/sub/b.rs"]);
        assert_eq!(resolved[0].content, b"readme");
    }

    #[test]
    fn directories_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("dir")).unwrap();
        std::fs::write(root.join("dir/x.txt"), "x").unwrap();

        // A literal directory path contributes nothing; only a glob reaches
        // the files beneath it.
        let resolved = resolve(&["dir".into()], root).unwrap();
        assert!(resolved.is_empty());

        let resolved = resolve(&["dir/*".into()], root).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].path, "dir/x.txt");
    }

    #[test]
    fn overlapping_patterns_deduplicate() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "content").unwrap();
        let resolved = resolve(&["a.txt".into(), "*.txt".into()], tmp.path()).unwrap();
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn missing_patterns_yield_empty_expansion() {
        let tmp = TempDir::new().unwrap();
        let resolved = resolve(
            &["nope.txt".into(), "gone/**/*.rs".into()],
            tmp.path(),
        )
        .unwrap();
        assert!(resolved.is_empty());
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let err = resolve(&["src/[".into()], tmp.path()).unwrap_err();
        assert!(err.to_string().contains("Invalid input pattern"));
    }

    #[test]
    fn question_mark_and_class_globs() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::write(root.join("a1.txt"), "a1").unwrap();
        std::fs::write(root.join("a2.txt"), "a2").unwrap();
        std::fs::write(root.join("b1.txt"), "b1").unwrap();

        let resolved = resolve(&["a[12].txt".into()], root).unwrap();
        assert_eq!(resolved.len(), 2);

        let resolved = resolve(&["?1.txt".into()], root).unwrap();
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn absolute_literal_kept_absolute() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("abs.txt");
        std::fs::write(&file, "abs").unwrap();
        let resolved = resolve(
            &[file.to_string_lossy().into_owned()],
            Path::new("/nonexistent-base"),
        )
        .unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].path.starts_with('/'));
    }

    #[test]
    fn slashify_folds_dot_components() {
        assert_eq!(slashify(Path::new("./a/b")), "a/b");
        assert_eq!(slashify(Path::new("a/../b")), "b");
        assert_eq!(slashify(Path::new("/x/y")), "/x/y");
    }
}
