//! Resumable worklist: everything in the catalog that is not already in the
//! output file.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use crate::models::WorkKey;

/// The keys a run still has to process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worklist {
    /// Size of the full catalog.
    pub total: usize,
    /// Catalog keys already present in the output.
    pub completed: usize,
    /// Remaining keys in processing order.
    pub keys: Vec<WorkKey>,
}

impl Worklist {
    /// Build the worklist for a run, optionally capped at `limit` keys.
    pub fn build(
        full: &BTreeSet<WorkKey>,
        completed: &HashSet<WorkKey>,
        limit: Option<usize>,
    ) -> Self {
        let mut keys = resolve(full, completed);
        let done = full.len() - keys.len();
        if let Some(limit) = limit {
            keys.truncate(limit);
        }
        Self {
            total: full.len(),
            completed: done,
            keys,
        }
    }

    pub fn remaining(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// `full − completed`, in lexicographic order so repeated runs over an
/// unchanged catalog process keys in the same order.
pub fn resolve(full: &BTreeSet<WorkKey>, completed: &HashSet<WorkKey>) -> Vec<WorkKey> {
    full.iter()
        .filter(|key| !completed.contains(*key))
        .cloned()
        .collect()
}

/// Keys already written to the output file.
///
/// A missing or unreadable file is an empty set, which is what the very
/// first run sees. Lines that are not a JSON object with a usable `key`
/// (e.g. a line cut short by a crash) are skipped.
pub async fn load_completed(path: &Path) -> HashSet<WorkKey> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) => {
            tracing::info!(
                path = %path.display(),
                error = %e,
                "No previous output, starting from scratch"
            );
            return HashSet::new();
        }
    };

    let completed = parse_completed(&text);
    tracing::info!("Found {} already processed", completed.len());
    completed
}

fn parse_completed(text: &str) -> HashSet<WorkKey> {
    let mut skipped = 0usize;
    let completed = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let key = serde_json::from_str::<serde_json::Value>(line)
                .ok()
                .and_then(|value| value.get("key")?.as_str().and_then(WorkKey::parse));
            if key.is_none() {
                skipped += 1;
            }
            key
        })
        .collect();

    if skipped > 0 {
        tracing::warn!(skipped, "Skipped malformed lines in previous output");
    }
    completed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(raw: &[&str]) -> BTreeSet<WorkKey> {
        raw.iter().filter_map(|k| WorkKey::parse(k)).collect()
    }

    fn done(raw: &[&str]) -> HashSet<WorkKey> {
        raw.iter().filter_map(|k| WorkKey::parse(k)).collect()
    }

    fn as_strs(keys: &[WorkKey]) -> Vec<&str> {
        keys.iter().map(WorkKey::as_str).collect()
    }

    #[test]
    fn resolve_removes_completed_keys() {
        let remaining = resolve(&set(&["A", "B"]), &done(&["A"]));
        assert_eq!(as_strs(&remaining), ["B"]);
    }

    #[test]
    fn resolve_is_sorted() {
        let remaining = resolve(&set(&["C", "A", "B"]), &HashSet::new());
        assert_eq!(as_strs(&remaining), ["A", "B", "C"]);
    }

    #[test]
    fn fully_completed_catalog_is_empty() {
        let list = Worklist::build(&set(&["A", "B"]), &done(&["A", "B", "Z"]), None);
        assert!(list.is_empty());
        assert_eq!(list.total, 2);
        assert_eq!(list.completed, 2);
    }

    #[test]
    fn limit_truncates_remaining() {
        let list = Worklist::build(&set(&["A", "B", "C", "D"]), &done(&["A"]), Some(2));
        assert_eq!(as_strs(&list.keys), ["B", "C"]);
        assert_eq!(list.completed, 1);
        assert_eq!(list.remaining(), 2);
    }

    #[test]
    fn completed_lines_are_normalized_and_malformed_skipped() {
        let text = r#"{"key":"A","fetch_timestamp":"2024-01-01T00:00:00Z","payload":[]}
{"key":"b 1","fetch_timestamp":"2024-01-01T00:00:00Z","payload":[]}
{"key":"C","fetch_timest
garbage
{"payload":[]}
"#;
        let completed = parse_completed(text);
        assert_eq!(completed, done(&["A", "B1"]));
    }

    #[tokio::test]
    async fn missing_output_is_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let completed = load_completed(&dir.path().join("nothing-yet.jsonl")).await;
        assert!(completed.is_empty());
    }
}
