//! Persistent top-K schedule store keyed by task identity.
//!
//! Records live in a concurrent in-memory map and are persisted to a
//! log-structured append-only file: every write appends, and [TuningDatabase::load]
//! folds the log back into the map with later entries superseding earlier
//! ones on a `(task_key, trace fingerprint)` collision. [TuningDatabase::compact]
//! rewrites the folded state through a temp file and an atomic rename.

use crate::bestset::BoundedBestSet;
use crate::trace::ScheduleTrace;
use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

/// Leading byte of every log record. Unknown versions are skipped on load.
pub const DB_FORMAT_VERSION: u8 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TuningRecord {
    pub task_key: String,
    pub trace: ScheduleTrace,
    pub predicted_cost: f64,
    pub measured_cost: Option<f64>,
}

impl TuningRecord {
    pub fn new(task_key: impl Into<String>, trace: ScheduleTrace, predicted_cost: f64) -> Self {
        TuningRecord {
            task_key: task_key.into(),
            trace,
            predicted_cost,
            measured_cost: None,
        }
    }

    /// Measured cost when available, predicted otherwise.
    pub fn sort_cost(&self) -> f64 {
        self.measured_cost.unwrap_or(self.predicted_cost)
    }

    fn trace_fingerprint(&self) -> u128 {
        self.trace.byte_fingerprint()
    }
}

pub struct TuningDatabase {
    entries: DashMap<String, Vec<TuningRecord>>,
    log_path: Option<PathBuf>,
    pending: Mutex<Vec<TuningRecord>>,
    capacity_per_key: Option<usize>,
}

impl TuningDatabase {
    /// An in-memory database; pass a log path to persist across processes.
    pub fn new(log_path: Option<&Path>) -> Self {
        TuningDatabase {
            entries: DashMap::new(),
            log_path: log_path.map(Path::to_owned),
            pending: Mutex::new(Vec::new()),
            capacity_per_key: None,
        }
    }

    /// Caps the records retained per task key; the worst record is evicted
    /// on overflow.
    pub fn with_capacity(log_path: Option<&Path>, capacity_per_key: usize) -> Self {
        TuningDatabase {
            capacity_per_key: Some(capacity_per_key),
            ..TuningDatabase::new(log_path)
        }
    }

    pub fn insert(&self, record: TuningRecord) {
        self.pending.lock().unwrap().push(record.clone());
        self.absorb(record);
    }

    // Map-only insert shared by `insert` and `load`.
    fn absorb(&self, record: TuningRecord) {
        let mut entry = self.entries.entry(record.task_key.clone()).or_default();
        let fp = record.trace_fingerprint();
        if let Some(existing) = entry.iter_mut().find(|r| r.trace_fingerprint() == fp) {
            *existing = record;
            return;
        }
        entry.push(record);
        if let Some(cap) = self.capacity_per_key {
            while entry.len() > cap {
                // Evict the worst; among ties, the most recent insert.
                let mut worst = 0;
                for i in 1..entry.len() {
                    if entry[i].sort_cost().total_cmp(&entry[worst].sort_cost()).is_ge() {
                        worst = i;
                    }
                }
                entry.remove(worst);
            }
        }
    }

    /// The `k` best records for a task, ascending by measured-else-predicted
    /// cost, ties in insertion order.
    pub fn get_top_k(&self, task_key: &str, k: usize) -> Vec<TuningRecord> {
        let Some(records) = self.entries.get(task_key) else {
            return Vec::new();
        };
        let mut best = BoundedBestSet::new(k);
        for record in records.iter() {
            best.insert(record.sort_cost(), record.clone());
        }
        best.into_sorted_vec().into_iter().map(|(_, r)| r).collect()
    }

    /// Attaches a measurement to the stored record with the given trace
    /// fingerprint. The update is journaled like an insert.
    pub fn update_measured(&self, task_key: &str, trace_fingerprint: u128, measured: f64) -> bool {
        let Some(mut records) = self.entries.get_mut(task_key) else {
            return false;
        };
        let Some(record) = records
            .iter_mut()
            .find(|r| r.trace_fingerprint() == trace_fingerprint)
        else {
            return false;
        };
        record.measured_cost = Some(measured);
        let updated = record.clone();
        drop(records);
        self.pending.lock().unwrap().push(updated);
        true
    }

    pub fn record_count(&self) -> usize {
        self.entries.iter().map(|e| e.value().len()).sum()
    }

    /// Appends buffered writes to the log. On failure the buffer is kept and
    /// retried on the next flush; only this explicit call surfaces the error.
    pub fn flush(&self) -> Result<usize> {
        let mut pending = self.pending.lock().unwrap();
        if pending.is_empty() {
            return Ok(0);
        }
        let Some(path) = &self.log_path else {
            let dropped = pending.len();
            pending.clear();
            return Ok(dropped);
        };

        let mut buffer = Vec::new();
        for record in pending.iter() {
            encode_record(&mut buffer, record)?;
        }
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(&buffer));
        match result {
            Ok(()) => {
                let written = pending.len();
                pending.clear();
                Ok(written)
            }
            Err(err) => Err(err).with_context(|| format!("appending to {}", path.display())),
        }
    }

    /// Folds the log file into the in-memory map. Returns the number of
    /// records absorbed. Unknown record versions and undecodable bodies are
    /// skipped with a warning; a truncated tail stops the fold.
    pub fn load(&self) -> Result<usize> {
        let Some(path) = &self.log_path else {
            return Ok(0);
        };
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };

        let start = Instant::now();
        let mut absorbed = 0usize;
        let mut offset = 0usize;
        while offset < bytes.len() {
            if offset + 5 > bytes.len() {
                warn!("database log ends mid-record header, dropping the tail");
                break;
            }
            let version = bytes[offset];
            let len =
                u32::from_le_bytes(bytes[offset + 1..offset + 5].try_into().unwrap()) as usize;
            offset += 5;
            if offset + len > bytes.len() {
                warn!("database log ends mid-record body, dropping the tail");
                break;
            }
            let body = &bytes[offset..offset + len];
            offset += len;
            if version != DB_FORMAT_VERSION {
                warn!("skipping database record with unknown version {}", version);
                continue;
            }
            match bincode::deserialize::<TuningRecord>(body) {
                Ok(record) => {
                    self.absorb(record);
                    absorbed += 1;
                }
                Err(err) => warn!("skipping undecodable database record: {}", err),
            }
        }
        debug!(
            "loading database took {:?} ({} records)",
            start.elapsed(),
            absorbed
        );
        Ok(absorbed)
    }

    /// Rewrites the log as the folded in-memory state, dropping superseded
    /// entries, via a temp file and an atomic rename.
    pub fn compact(&self) -> Result<()> {
        let Some(path) = &self.log_path else {
            return Ok(());
        };
        let start = Instant::now();
        let dir = path
            .parent()
            .ok_or_else(|| anyhow!("log path must have a parent, but is: {:?}", path))?;
        let mut temp_file = tempfile::NamedTempFile::new_in(dir)?;
        let mut buffer = Vec::new();
        for entry in self.entries.iter() {
            for record in entry.value() {
                encode_record(&mut buffer, record)?;
            }
        }
        temp_file.write_all(&buffer)?;
        let temp_file_path = temp_file.keep()?.1;
        std::fs::rename(temp_file_path, path)?;
        self.pending.lock().unwrap().clear();
        debug!("compacting database took {:?}", start.elapsed());
        Ok(())
    }
}

fn encode_record(buffer: &mut Vec<u8>, record: &TuningRecord) -> Result<()> {
    let body = bincode::serialize(record).context("encoding database record")?;
    buffer.push(DB_FORMAT_VERSION);
    buffer.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buffer.extend_from_slice(&body);
    Ok(())
}
