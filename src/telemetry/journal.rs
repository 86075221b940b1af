//! # Delivery Journal
//!
//! Optional JSONL log of delivery outcomes, one line per attempt.
//!
//! - Files are named `deliveries-<utc timestamp>-<seq>.jsonl` and sort by age
//! - A file is closed after `max_records_per_file` records
//! - Only the newest `max_files_to_keep` files are retained

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::types::FlushTrigger;
use crate::config::JournalConfig;
use crate::error::Result;

const FILE_PREFIX: &str = "deliveries-";
const FILE_SUFFIX: &str = ".jsonl";

/// Fate of the samples in one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Delivered,
    Requeued,
    /// Final attempt at stop failed; samples were dropped with the session
    Unsent,
}

/// One journal line
#[derive(Debug, Clone, Serialize)]
pub struct JournalRecord {
    pub at: DateTime<Utc>,
    pub session_id: String,
    pub trigger: FlushTrigger,
    pub samples: usize,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "is_zero")]
    pub shed: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

/// Rotating JSONL writer
#[derive(Debug)]
pub struct DeliveryJournal {
    dir: PathBuf,
    max_records_per_file: usize,
    max_files_to_keep: usize,
    current: Option<File>,
    records_in_current: usize,
    seq: u64,
}

impl DeliveryJournal {
    /// Open a journal in `dir`, creating the directory if needed
    pub fn new<P: AsRef<Path>>(dir: P, max_records_per_file: usize, max_files_to_keep: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            max_records_per_file: max_records_per_file.max(1),
            max_files_to_keep: max_files_to_keep.max(1),
            current: None,
            records_in_current: 0,
            seq: 0,
        })
    }

    /// Build from config; `None` when the journal is disabled
    pub fn from_config(config: &JournalConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        Self::new(&config.log_dir, config.max_records_per_file, config.max_files_to_keep).map(Some)
    }

    /// Append one record, rotating first if the current file is full
    pub fn record(&mut self, record: &JournalRecord) -> Result<()> {
        if self.current.is_none() || self.records_in_current >= self.max_records_per_file {
            self.rotate()?;
        }

        if let Some(file) = self.current.as_mut() {
            let mut line = serde_json::to_vec(record)?;
            line.push(b'\n');
            file.write_all(&line)?;
            self.records_in_current += 1;
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        if let Some(mut file) = self.current.take() {
            file.flush()?;
        }

        let name = format!(
            "{}{}-{:04}{}",
            FILE_PREFIX,
            Utc::now().format("%Y%m%dT%H%M%S%.3f"),
            self.seq,
            FILE_SUFFIX
        );
        self.seq += 1;

        let path = self.dir.join(name);
        debug!("Opening delivery journal {}", path.display());
        self.current = Some(OpenOptions::new().create(true).append(true).open(&path)?);
        self.records_in_current = 0;

        self.prune()
    }

    fn prune(&self) -> Result<()> {
        let mut files = self.journal_files()?;
        if files.len() <= self.max_files_to_keep {
            return Ok(());
        }

        let excess = files.len() - self.max_files_to_keep;
        for path in files.drain(..excess) {
            debug!("Removing old delivery journal {}", path.display());
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Journal files in the directory, oldest first
    pub fn journal_files(&self) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .map(|n| n.to_string_lossy())
                    .is_some_and(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX))
            })
            .collect();
        files.sort();
        Ok(files)
    }
}
