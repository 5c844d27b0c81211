//! Append-only attempt telemetry (`.taskloop/logs/attempts.jsonl`).
//!
//! One JSON object per line. Records are tagged with `"kind"` so call
//! attempts and backend switches share one file in the order they happened.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{AttemptRecord, SwitchRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryRecord {
    Call(AttemptRecord),
    Switch(SwitchRecord),
}

/// Single-writer JSONL log. Lines are flushed as they are written so a
/// crashed run keeps every record up to the crash.
#[derive(Debug)]
pub struct TelemetryLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl TelemetryLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create telemetry dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open telemetry log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_call(&self, record: &AttemptRecord) -> Result<()> {
        self.append(&TelemetryRecord::Call(record.clone()))
    }

    pub fn record_switch(&self, record: &SwitchRecord) -> Result<()> {
        self.append(&TelemetryRecord::Switch(record.clone()))
    }

    fn append(&self, record: &TelemetryRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("serialize telemetry record")?;
        line.push('\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("telemetry log lock poisoned"))?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.flush())
            .with_context(|| format!("append telemetry {}", self.path.display()))?;
        debug!(path = %self.path.display(), "telemetry appended");
        Ok(())
    }
}

/// Read every record back, in file order. A missing file reads as empty.
pub fn read_records(path: &Path) -> Result<Vec<TelemetryRecord>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("open telemetry log {}", path.display()));
        }
    };
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read telemetry log {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("parse telemetry line {} in {}", idx + 1, path.display()))?;
        records.push(record);
    }
    Ok(records)
}

/// Call records only, in file order.
pub fn read_calls(path: &Path) -> Result<Vec<AttemptRecord>> {
    Ok(read_records(path)?
        .into_iter()
        .filter_map(|record| match record {
            TelemetryRecord::Call(call) => Some(call),
            TelemetryRecord::Switch(_) => None,
        })
        .collect())
}

/// Switch records only, in file order.
pub fn read_switches(path: &Path) -> Result<Vec<SwitchRecord>> {
    Ok(read_records(path)?
        .into_iter()
        .filter_map(|record| match record {
            TelemetryRecord::Switch(switch) => Some(switch),
            TelemetryRecord::Call(_) => None,
        })
        .collect())
}
