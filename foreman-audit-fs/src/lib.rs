#![deny(missing_docs)]
//! Filesystem-backed implementation of foreman's [`AuditLog`] trait.
//!
//! Two JSON-lines files under a root directory, one
//! [`SealedRecord`] per line. The directory is created lazily on the
//! first append. Appends are serialized through one lock so lines never
//! interleave.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_core::{AuditError, AuditLog, DecisionRecord, LedgerEntry, SealedRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const LEDGER_FILE: &str = "ledger.jsonl";
const DECISIONS_FILE: &str = "decisions.jsonl";

/// JSON-lines audit log.
///
/// Suitable for single-machine deployments where the ledger and the
/// decision log must survive restarts without a database.
#[derive(Debug)]
pub struct FsAuditLog {
    root: PathBuf,
    append: Mutex<()>,
}

impl FsAuditLog {
    /// A log rooted at `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            append: Mutex::new(()),
        }
    }

    /// The directory holding both files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the cost ledger file.
    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(LEDGER_FILE)
    }

    /// Path of the decision log file.
    pub fn decisions_path(&self) -> PathBuf {
        self.root.join(DECISIONS_FILE)
    }

    async fn append<T: Serialize>(&self, file: &str, record: T) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(&SealedRecord::seal(record)?)?;
        line.push(b'\n');

        let _guard = self.append.lock().await;
        tokio::fs::create_dir_all(&self.root).await?;
        let mut out = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(file))
            .await?;
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }

    async fn read_all<T>(&self, file: &str) -> Result<Vec<T>, AuditError>
    where
        T: Serialize + DeserializeOwned,
    {
        let contents = match tokio::fs::read_to_string(self.root.join(file)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        parse_lines(file, &contents)
    }
}

/// Decode and verify every line. A final line without a newline that does
/// not decode is treated as an interrupted append and skipped.
fn parse_lines<T>(log: &str, contents: &str) -> Result<Vec<T>, AuditError>
where
    T: Serialize + DeserializeOwned,
{
    let complete = contents.ends_with('\n');
    let lines: Vec<&str> = contents.lines().collect();
    let mut records = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let sealed: SealedRecord<T> = match serde_json::from_str(line) {
            Ok(sealed) => sealed,
            Err(e) if !complete && index + 1 == lines.len() => {
                tracing::warn!(log, index, error = %e, "foreman.audit.truncated_tail");
                break;
            }
            Err(e) => {
                return Err(AuditError::Serialization(format!(
                    "{log} record {index}: {e}"
                )));
            }
        };
        records.push(sealed.open(log, index)?);
    }
    Ok(records)
}

#[async_trait]
impl AuditLog for FsAuditLog {
    async fn append_ledger(&self, entry: LedgerEntry) -> Result<(), AuditError> {
        self.append(LEDGER_FILE, entry).await
    }

    async fn append_decision(&self, record: DecisionRecord) -> Result<(), AuditError> {
        self.append(DECISIONS_FILE, record).await
    }

    async fn ledger_since(&self, since: DateTime<Utc>) -> Result<Vec<LedgerEntry>, AuditError> {
        let entries: Vec<LedgerEntry> = self.read_all(LEDGER_FILE).await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.timestamp >= since)
            .collect())
    }

    async fn decisions(&self) -> Result<Vec<DecisionRecord>, AuditError> {
        self.read_all(DECISIONS_FILE).await
    }
}
