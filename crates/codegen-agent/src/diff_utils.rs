//! Diff statistics (§4.J), ported line-for-line from
//! `agent/diff/diff_utils.py`'s `compute_diff_stat`; plus a file-map unified
//! diff builder for the SSE layer's client-snapshot-as-base case, where
//! there's no shared container to run `diff` against directly.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffStatEntry {
    pub file: String,
    pub insertions: usize,
    pub deletions: usize,
}

/// Walk a unified diff, tallying `+`/`-` lines per file. A new `diff --git
/// a/... b/...` header starts a fresh entry (keyed by the `b/` path with
/// its prefix stripped); `+++`/`---` header lines are not counted.
pub fn compute_diff_stat(diff: &str) -> Vec<DiffStatEntry> {
    let mut entries: Vec<DiffStatEntry> = Vec::new();
    let mut current: Option<usize> = None;

    for line in diff.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            let b_path = rest
                .split(" b/")
                .nth(1)
                .map(|s| s.to_string())
                .unwrap_or_default();
            entries.push(DiffStatEntry {
                file: b_path,
                insertions: 0,
                deletions: 0,
            });
            current = Some(entries.len() - 1);
            continue;
        }
        if line.starts_with("+++") || line.starts_with("---") {
            continue;
        }
        let Some(idx) = current else { continue };
        if let Some(stripped) = line.strip_prefix('+') {
            let _ = stripped;
            entries[idx].insertions += 1;
        } else if let Some(stripped) = line.strip_prefix('-') {
            let _ = stripped;
            entries[idx].deletions += 1;
        }
    }

    entries
}

/// Git-style unified diff between two full file-content maps — used when
/// the diff base is a client-supplied snapshot (`allFiles`) rather than a
/// workspace's own creation-time checkpoint.
pub fn unified_diff_between(base: &HashMap<String, String>, current: &HashMap<String, String>) -> String {
    let mut paths: BTreeSet<&String> = base.keys().collect();
    paths.extend(current.keys());

    let mut out = String::new();
    for path in paths {
        let old = base.get(path).map(String::as_str).unwrap_or("");
        let new = current.get(path).map(String::as_str).unwrap_or("");
        if old == new {
            continue;
        }
        out.push_str(&format!("diff --git a/{path} b/{path}\n"));
        out.push_str(
            &similar::TextDiff::from_lines(old, new)
                .unified_diff()
                .header(&format!("a/{path}"), &format!("b/{path}"))
                .to_string(),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_insertions_and_deletions_per_file() {
        let diff = r#"diff --git a/src/main.rs b/src/main.rs
index 1111111..2222222 100644
--- a/src/main.rs
+++ b/src/main.rs
@@ -1,3 +1,3 @@
-fn old() {}
+fn new() {}
+fn extra() {}
diff --git a/src/lib.rs b/src/lib.rs
index 3333333..4444444 100644
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,1 +1,1 @@
-pub mod old;
"#;
        let stats = compute_diff_stat(diff);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].file, "src/main.rs");
        assert_eq!(stats[0].insertions, 2);
        assert_eq!(stats[0].deletions, 1);
        assert_eq!(stats[1].file, "src/lib.rs");
        assert_eq!(stats[1].insertions, 0);
        assert_eq!(stats[1].deletions, 1);
    }

    #[test]
    fn empty_diff_yields_no_entries() {
        assert!(compute_diff_stat("").is_empty());
    }

    #[test]
    fn unified_diff_between_skips_unchanged_files_and_marks_new_ones() {
        let mut base = HashMap::new();
        base.insert("src/App.tsx".to_string(), "function App() {}\n".to_string());
        base.insert("README.md".to_string(), "hello\n".to_string());

        let mut current = base.clone();
        current.insert(
            "src/App.tsx".to_string(),
            "function App() {\n  const [count] = [0];\n}\n".to_string(),
        );

        let diff = unified_diff_between(&base, &current);
        assert!(diff.contains("diff --git a/src/App.tsx b/src/App.tsx"));
        assert!(diff.contains("+  const [count] = [0];"));
        assert!(!diff.contains("README.md"));

        let stats = compute_diff_stat(&diff);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].file, "src/App.tsx");
    }

    #[test]
    fn unified_diff_between_marks_brand_new_files() {
        let base = HashMap::new();
        let mut current = HashMap::new();
        current.insert("src/App.tsx".to_string(), "function App() {}\n".to_string());

        let diff = unified_diff_between(&base, &current);
        assert!(diff.contains("+function App() {}"));
    }
}
