//! Output harvesting: collecting declared artifacts after execution.

use crate::inputs::slashify;
use crate::normalize::Normalizer;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A harvested `{path, normalized-content}` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Forward-slash-normalized path, relative to the workspace when the
    /// declaration was relative, absolute otherwise.
    pub path: String,
    /// Artifact content after normalization.
    pub content: Vec<u8>,
}

/// Collect every declared output into a sorted, deduplicated artifact list.
///
/// A declared path that resolves to a regular file contributes that file; a
/// directory contributes every regular file beneath it; a missing path is a
/// hard failure (the task did not produce its declared output). Content is
/// read verbatim and passed through `normalizer`.
pub fn harvest(
    declared_outputs: &[String],
    base_dir: &Path,
    normalizer: Normalizer,
) -> Result<Vec<Artifact>> {
    let span = tracing::debug_span!(
        "harvest.collect",
        base = %base_dir.display(),
        declared = declared_outputs.len()
    );
    let _guard = span.enter();

    let mut collected: BTreeMap<String, PathBuf> = BTreeMap::new();

    for declared in declared_outputs {
        let absolute = Path::new(declared).is_absolute();
        let target = if absolute {
            PathBuf::from(declared)
        } else {
            base_dir.join(declared)
        };

        if target.is_file() {
            let key = if absolute {
                slashify(&target)
            } else {
                slashify(Path::new(declared))
            };
            collected.entry(key).or_insert(target);
        } else if target.is_dir() {
            for entry in WalkDir::new(&target).into_iter() {
                let entry =
                    entry.map_err(|e| Error::execution(format!("walking output '{declared}': {e}")))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                let key = if absolute {
                    slashify(path)
                } else {
                    match path.strip_prefix(base_dir) {
                        Ok(rel) => slashify(rel),
                        Err(_) => slashify(path),
                    }
                };
                collected.entry(key).or_insert_with(|| path.to_path_buf());
            }
        } else {
            return Err(Error::execution(format!(
                "declared output '{declared}' was not produced"
            )));
        }
    }

    let mut artifacts = Vec::with_capacity(collected.len());
    for (path, source) in collected {
        let raw = fs::read(&source).map_err(|e| Error::io(e, &source, "read"))?;
        artifacts.push(Artifact {
            path,
            content: normalizer.apply(&raw),
        });
    }

    tracing::debug!(artifacts = artifacts.len(), "harvest complete");
    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn collects_files_and_directories_sorted() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("out/nested")).unwrap();
        std::fs::write(root.join("out/b.txt"), "b").unwrap();
        std::fs::write(root.join("out/nested/a.txt"), "a").unwrap();
        std::fs::write(root.join("top.txt"), "top").unwrap();

        let artifacts = harvest(
            &["top.txt".into(), "out".into()],
            root,
            Normalizer::Raw,
        )
        .unwrap();
        let paths: Vec<&str> = artifacts.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(paths, vec!["out/b.txt", "out/nested/a.txt", "top.txt"]);
    }

    #[test]
    fn missing_output_fails_hard() {
        let tmp = TempDir::new().unwrap();
        let err = harvest(&["gone.txt".into()], tmp.path(), Normalizer::Raw).unwrap_err();
        assert!(err.to_string().contains("was not produced"));
    }

    #[test]
    fn overlapping_declarations_deduplicate() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("out")).unwrap();
        std::fs::write(root.join("out/x.txt"), "x").unwrap();

        let artifacts = harvest(
            &["out".into(), "out/x.txt".into()],
            root,
            Normalizer::Raw,
        )
        .unwrap();
        assert_eq!(artifacts.len(), 1);
    }

    #[test]
    fn content_is_normalized() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("log.txt"), "done at 2024-01-02T03:04:05Z").unwrap();
        let artifacts = harvest(
            &["log.txt".into()],
            tmp.path(),
            Normalizer::Placeholders,
        )
        .unwrap();
        assert_eq!(artifacts[0].content, b"done at <TIMESTAMP>".to_vec());
    }
}
