//! Content-addressed task identity.
//!
//! The task hash is a SHA-256 digest over length-prefixed fields in a fixed
//! order. Length-prefixing prevents concatenation ambiguity; env pairs and
//! declared outputs are sorted before hashing so insertion order never
//! matters. Inputs arrive pre-sorted from the resolver and are hashed in
//! the order given, never re-ordered here.

use crate::ResolvedInput;
use crate::Task;
use crate::inputs::slashify;
use sha2::{Digest, Sha256};
use std::path::Path;

fn update_framed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn update_count(hasher: &mut Sha256, count: usize) {
    hasher.update((count as u64).to_be_bytes());
}

/// Compute the content-addressed identity of a task execution.
///
/// The preimage, each field length-prefixed with a big-endian `u64`:
/// working-directory identity, command string, sorted env pairs (count
/// prefix), sorted declared outputs (count prefix), input count, then each
/// input's `(path, content)`.
#[must_use]
pub fn task_hash(workdir: &Path, task: &Task, inputs: &[ResolvedInput]) -> String {
    let mut hasher = Sha256::new();

    update_framed(&mut hasher, slashify(workdir).as_bytes());
    update_framed(&mut hasher, task.run.as_bytes());

    // BTreeMap iteration is already key-sorted; keys are case-sensitive.
    update_count(&mut hasher, task.env.len());
    for (key, value) in &task.env {
        update_framed(&mut hasher, key.as_bytes());
        update_framed(&mut hasher, value.as_bytes());
    }

    let mut outputs: Vec<&str> = task.outputs.iter().map(String::as_str).collect();
    outputs.sort_unstable();
    update_count(&mut hasher, outputs.len());
    for output in outputs {
        update_framed(&mut hasher, output.as_bytes());
    }

    update_count(&mut hasher, inputs.len());
    for input in inputs {
        update_framed(&mut hasher, input.path.as_bytes());
        update_framed(&mut hasher, &input.content);
    }

    hex::encode(hasher.finalize())
}

/// SHA-256 of a byte slice, lowercase hex.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn task(run: &str) -> Task {
        Task {
            name: "t".into(),
            inputs: vec![],
            run: run.into(),
            env: BTreeMap::new(),
            outputs: vec![],
        }
    }

    fn input(path: &str, content: &[u8]) -> ResolvedInput {
        ResolvedInput {
            path: path.into(),
            content: content.to_vec(),
        }
    }

    #[test]
    fn hash_is_64_lowercase_hex() {
        let h = task_hash(Path::new("/w"), &task("make"), &[]);
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn identical_components_identical_hash() {
        let t = task("make all");
        let ins = [input("a.txt", b"a"), input("b.txt", b"b")];
        let h1 = task_hash(Path::new("/w"), &t, &ins);
        let h2 = task_hash(Path::new("/w"), &t, &ins);
        assert_eq!(h1, h2);
    }

    #[test]
    fn every_component_is_significant() {
        let base = task("make");
        let ins = [input("a.txt", b"a")];
        let h = task_hash(Path::new("/w"), &base, &ins);

        assert_ne!(h, task_hash(Path::new("/other"), &base, &ins));
        assert_ne!(h, task_hash(Path::new("/w"), &task("make -j4"), &ins));

        let mut with_env = base.clone();
        with_env.env.insert("CC".into(), "gcc".into());
        assert_ne!(h, task_hash(Path::new("/w"), &with_env, &ins));

        let mut with_out = base.clone();
        with_out.outputs.push("out.bin".into());
        assert_ne!(h, task_hash(Path::new("/w"), &with_out, &ins));

        assert_ne!(h, task_hash(Path::new("/w"), &base, &[input("a.txt", b"changed")]));
        assert_ne!(h, task_hash(Path::new("/w"), &base, &[input("b.txt", b"a")]));
    }

    #[test]
    fn env_insertion_order_is_irrelevant() {
        let mut t1 = task("make");
        t1.env.insert("A".into(), "1".into());
        t1.env.insert("B".into(), "2".into());
        let mut t2 = task("make");
        t2.env.insert("B".into(), "2".into());
        t2.env.insert("A".into(), "1".into());
        assert_eq!(
            task_hash(Path::new("/w"), &t1, &[]),
            task_hash(Path::new("/w"), &t2, &[])
        );
    }

    #[test]
    fn output_insertion_order_is_irrelevant() {
        let mut t1 = task("make");
        t1.outputs = vec!["b.bin".into(), "a.bin".into()];
        let mut t2 = task("make");
        t2.outputs = vec!["a.bin".into(), "b.bin".into()];
        assert_eq!(
            task_hash(Path::new("/w"), &t1, &[]),
            task_hash(Path::new("/w"), &t2, &[])
        );
    }

    #[test]
    fn env_keys_are_case_sensitive() {
        let mut t1 = task("make");
        t1.env.insert("path".into(), "x".into());
        let mut t2 = task("make");
        t2.env.insert("PATH".into(), "x".into());
        assert_ne!(
            task_hash(Path::new("/w"), &t1, &[]),
            task_hash(Path::new("/w"), &t2, &[])
        );
    }

    #[test]
    fn framing_prevents_concatenation_ambiguity() {
        // ("ab", "c") vs ("a", "bc") must differ even though the
        // concatenated bytes are identical.
        let h1 = task_hash(Path::new("/w"), &task("make"), &[input("ab", b"c")]);
        let h2 = task_hash(Path::new("/w"), &task("make"), &[input("a", b"bc")]);
        assert_ne!(h1, h2);
    }
}
