//! Loading the full candidate catalog.
//!
//! The catalog is a sequence of structured records, one per candidate. Each
//! record exposes one string field holding the raw key. Two layouts are
//! understood:
//!
//! - JSON lines: `{"name": "...", "postcode": "EC1A 1BB"}` per line
//! - CSV with a header row naming the key column
//!
//! Entries that fail to parse, lack the field, or normalize to nothing are
//! skipped. Only failing to obtain the catalog at all is an error.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::AppError;
use crate::models::WorkKey;
use crate::traits::CatalogSource;

pub const DEFAULT_KEY_FIELD: &str = "postcode";

/// Layout of the catalog text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogFormat {
    JsonLines,
    Csv,
}

impl CatalogFormat {
    /// Guess the layout from a file name or URL path: `.csv` is CSV,
    /// anything else is JSON lines.
    pub fn infer(location: &str) -> Self {
        let path = location.split(['?', '#']).next().unwrap_or(location);
        if path.to_ascii_lowercase().ends_with(".csv") {
            CatalogFormat::Csv
        } else {
            CatalogFormat::JsonLines
        }
    }
}

impl FromStr for CatalogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "jsonl" | "json" | "ndjson" => Ok(CatalogFormat::JsonLines),
            "csv" => Ok(CatalogFormat::Csv),
            _ => Err(format!("Unknown catalog format: {s}")),
        }
    }
}

/// Extract, normalize, deduplicate and sort the keys of a catalog.
pub fn parse_catalog(text: &str, format: CatalogFormat, field: &str) -> BTreeSet<WorkKey> {
    let mut skipped = 0usize;
    let keys: BTreeSet<WorkKey> = match format {
        CatalogFormat::JsonLines => text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| {
                let key = json_line_key(line, field);
                if key.is_none() {
                    skipped += 1;
                }
                key
            })
            .collect(),
        CatalogFormat::Csv => parse_csv(text, field, &mut skipped),
    };

    if skipped > 0 {
        tracing::debug!(skipped, "Skipped malformed catalog entries");
    }
    keys
}

fn json_line_key(line: &str, field: &str) -> Option<WorkKey> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    WorkKey::parse(value.get(field)?.as_str()?)
}

fn parse_csv(text: &str, field: &str, skipped: &mut usize) -> BTreeSet<WorkKey> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let column = match reader.headers() {
        Ok(headers) => headers.iter().position(|h| h.trim() == field),
        Err(_) => None,
    };
    let Some(column) = column else {
        tracing::warn!(field, "Catalog CSV has no column with the key field");
        return BTreeSet::new();
    };

    reader
        .records()
        .filter_map(|row| {
            let key = row
                .ok()
                .and_then(|row| row.get(column).and_then(WorkKey::parse));
            if key.is_none() {
                *skipped += 1;
            }
            key
        })
        .collect()
}

/// Fetch the catalog text and turn it into the key set.
pub async fn load_catalog<S: CatalogSource>(
    source: &S,
    format: CatalogFormat,
    field: &str,
) -> Result<BTreeSet<WorkKey>, AppError> {
    let origin = source.describe();
    tracing::info!(%origin, "Loading catalog");

    let text = source.load().await.map_err(|e| match e {
        AppError::CatalogUnavailable(_) => e,
        other => AppError::CatalogUnavailable(format!("{origin}: {other}")),
    })?;

    let keys = parse_catalog(&text, format, field);
    tracing::info!("Found {} unique keys", keys.len());
    Ok(keys)
}

/// Catalog stored in a local file.
#[derive(Debug, Clone)]
pub struct FileCatalog {
    path: PathBuf,
}

impl FileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CatalogSource for FileCatalog {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn load(&self) -> Result<String, AppError> {
        tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            AppError::CatalogUnavailable(format!("{}: {e}", self.path.display()))
        })
    }
}
