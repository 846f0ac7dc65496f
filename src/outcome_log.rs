// =============================================================================
// OUTCOME LOG & SNAPSHOT JOURNAL
// Append-only JSONL persistence. These files are the only inputs the
// learning loop reads; nothing in the live decision path depends on
// reading them back.
// =============================================================================

use crate::types::{CycleRecord, OutcomeRecord, Snapshot};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

fn append_jsonl<T: Serialize>(file: &Mutex<File>, record: &T) -> Result<()> {
    let line = serde_json::to_string(record)?;
    let mut guard = file.lock().expect("log file mutex poisoned");
    writeln!(guard, "{}", line)?;
    guard.flush()?;
    Ok(())
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))
}

/// Append-only archive of closed-trade outcomes, one JSON object per line.
pub struct OutcomeLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl OutcomeLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn append(&self, record: &OutcomeRecord) -> Result<()> {
        append_jsonl(&self.file, record)
    }

    /// Read back every parseable outcome. Corrupt lines are skipped
    /// with a warning rather than poisoning the whole history.
    pub fn read_all(&self) -> Result<Vec<OutcomeRecord>> {
        read_jsonl(&self.path)
    }
}

/// Append-only journal of raw ribbon snapshots, tagged by timeframe.
/// Lets the learning loop replay market conditions after the fact.
pub struct SnapshotJournal {
    path: PathBuf,
    file: Mutex<File>,
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct JournalEntry {
    pub timeframe: String,
    #[serde(flatten)]
    pub snapshot: Snapshot,
}

impl SnapshotJournal {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn append(&self, timeframe: &str, snapshot: &Snapshot) -> Result<()> {
        let entry = JournalEntry {
            timeframe: timeframe.to_string(),
            snapshot: snapshot.clone(),
        };
        append_jsonl(&self.file, &entry)
    }

    pub fn read_all(&self) -> Result<Vec<JournalEntry>> {
        read_jsonl(&self.path)
    }
}

/// Audit trail of every evaluated entry cycle, accepted or rejected.
/// Purely diagnostic; never read by the decision path.
pub struct CycleAudit {
    file: Mutex<File>,
}

impl CycleAudit {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn append(&self, record: &CycleRecord) -> Result<()> {
        append_jsonl(&self.file, record)
    }
}

fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => out.push(record),
            Err(e) => warn!("⚠️ skipping corrupt line {} in {}: {}", idx + 1, path.display(), e),
        }
    }
    Ok(out)
}
