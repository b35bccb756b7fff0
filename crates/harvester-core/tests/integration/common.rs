use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use harvester_core::testutil::{MockSearchApi, RecordingReporter};
use harvester_core::{
    CatalogFormat, DEFAULT_KEY_FIELD, FileCatalog, HarvestConfig, HarvestPipeline, JsonlSink,
    Record, RunSummary, Worklist, load_catalog, load_completed,
};

/// A catalog file and an output file in a private temp directory.
pub struct Workspace {
    _dir: TempDir,
    pub catalog: PathBuf,
    pub output: PathBuf,
}

impl Workspace {
    pub fn with_catalog(keys: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let catalog = dir.path().join("catalog.jsonl");
        let lines: String = keys
            .iter()
            .map(|k| format!("{{\"name\": \"venue {k}\", \"postcode\": \"{k}\"}}\n"))
            .collect();
        std::fs::write(&catalog, lines).unwrap();
        let output = dir.path().join("out.jsonl");
        Self {
            _dir: dir,
            catalog,
            output,
        }
    }

    /// Resolve the worklist exactly like the binary does at startup.
    pub async fn worklist(&self) -> Worklist {
        let full = load_catalog(
            &FileCatalog::new(&self.catalog),
            CatalogFormat::JsonLines,
            DEFAULT_KEY_FIELD,
        )
        .await
        .unwrap();
        let completed = load_completed(&self.output).await;
        Worklist::build(&full, &completed, None)
    }

    /// One full run against `api`.
    pub async fn run(&self, api: MockSearchApi, config: HarvestConfig) -> RunSummary {
        let worklist = self.worklist().await;
        let sink = JsonlSink::open(&self.output).await.unwrap();
        let pipeline =
            HarvestPipeline::new(config, api, sink, Arc::new(RecordingReporter::new())).unwrap();
        pipeline
            .run(&worklist, CancellationToken::new())
            .await
            .unwrap()
    }

    pub fn records(&self) -> Vec<Record> {
        read_records(&self.output)
    }
}

pub fn read_records(path: &Path) -> Vec<Record> {
    match std::fs::read_to_string(path) {
        Ok(text) => text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect(),
        Err(_) => Vec::new(),
    }
}

pub fn sorted_keys(records: &[Record]) -> Vec<String> {
    let mut keys: Vec<String> = records.iter().map(|r| r.key.to_string()).collect();
    keys.sort();
    keys
}

pub fn fast_config() -> HarvestConfig {
    HarvestConfig::default()
        .with_cool_down(Duration::from_millis(50))
        .with_gate_ceiling(Duration::from_secs(5))
        .with_call_timeout(Duration::from_secs(5))
}
