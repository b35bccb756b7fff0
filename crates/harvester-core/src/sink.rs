//! Append-only JSON lines output.
//!
//! Each successful fetch becomes one self-contained line:
//!
//! ```text
//! {"key":"EC1A1BB","fetch_timestamp":"2024-05-01T10:00:00Z","payload":[...]}
//! ```
//!
//! Lines are never rewritten. A later run reads the same file back through
//! [`crate::worklist::load_completed`] to find out what is already done.
//!
//! A run killed in the middle of a line leaves a torn tail. The next record
//! must not be glued onto it, so a newline is written first whenever the
//! file does not end with one.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::AppError;
use crate::models::Record;
use crate::traits::RecordSink;

/// [`RecordSink`] writing JSON lines to a local file opened in append mode.
///
/// The file is opened once per run. Appends are serialized by a mutex and
/// each line goes out in a single write, so concurrent fetches never
/// interleave partial lines.
pub struct JsonlSink {
    path: PathBuf,
    output: Mutex<Output>,
}

struct Output {
    file: File,
    /// The last write may have stopped mid-line.
    torn: bool,
}

impl JsonlSink {
    /// Open (or create) the output file for appending.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let torn = ends_mid_line(&path).await?;
        if torn {
            tracing::warn!(
                path = %path.display(),
                "Output ends in a partial line, terminating it"
            );
        }
        tracing::debug!(path = %path.display(), "Opened output file");

        Ok(Self {
            path,
            output: Mutex::new(Output { file, torn }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Whether a non-empty file lacks a trailing newline.
async fn ends_mid_line(path: &Path) -> Result<bool, AppError> {
    let mut reader = File::open(path).await?;
    if reader.metadata().await?.len() == 0 {
        return Ok(false);
    }
    reader.seek(SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    reader.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}

impl Output {
    async fn write_line(&mut self, line: &[u8]) -> Result<(), AppError> {
        if self.torn {
            self.file.write_all(b"\n").await?;
            self.torn = false;
        }
        self.torn = true;
        self.file.write_all(line).await?;
        // tokio hands writes to a background thread; wait for this one to land.
        self.file.flush().await?;
        self.torn = false;
        Ok(())
    }
}

/// Serialize a record as one line, newline included.
pub fn encode_line(record: &Record) -> Result<Vec<u8>, AppError> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(line)
}

impl RecordSink for JsonlSink {
    async fn append(&self, record: &Record) -> Result<(), AppError> {
        let line = encode_line(record)?;
        self.output.lock().await.write_line(&line).await
    }

    async fn flush(&self) -> Result<(), AppError> {
        let mut output = self.output.lock().await;
        output.file.flush().await?;
        output.file.sync_all().await?;
        Ok(())
    }
}
