//! Append-only output sinks.
//!
//! The JSONL sink is authoritative: its line is written and synced before the
//! human-readable block is appended, so a crash between the two leaves a
//! complete record in the JSONL file. Sinks assume a single writer; two
//! concurrent sessions pointed at the same files are not supported.

use crate::record::SessionRecord;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Errors writing the machine-readable sink. Fatal to the session.
#[derive(Debug)]
pub enum PersistError {
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::CreateDir { path, source } => {
                write!(f, "failed to create directory {}: {}", path.display(), source)
            }
            PersistError::Open { path, source } => {
                write!(f, "failed to open {}: {}", path.display(), source)
            }
            PersistError::Serialize { source } => {
                write!(f, "failed to serialize session record: {source}")
            }
            PersistError::Write { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PersistError::CreateDir { source, .. } => Some(source),
            PersistError::Open { source, .. } => Some(source),
            PersistError::Serialize { source } => Some(source),
            PersistError::Write { source, .. } => Some(source),
        }
    }
}

fn open_append(path: &Path) -> Result<File, PersistError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| PersistError::CreateDir {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| PersistError::Open {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Both sinks, opened together at persistence time and closed on drop.
pub struct Sinks {
    jsonl_path: PathBuf,
    jsonl: File,
    log_path: PathBuf,
}

impl Sinks {
    /// Open the JSONL sink. The log sink is opened lazily at append time so a
    /// broken log path never blocks the authoritative write.
    pub fn open(jsonl_path: &Path, log_path: &Path) -> Result<Sinks, PersistError> {
        let jsonl = open_append(jsonl_path)?;
        Ok(Sinks {
            jsonl_path: jsonl_path.to_path_buf(),
            jsonl,
            log_path: log_path.to_path_buf(),
        })
    }

    /// Append the record: JSONL line first (fatal on failure), then the
    /// human-readable block (logged on failure).
    pub fn append(&mut self, record: &SessionRecord, human: &str) -> Result<(), PersistError> {
        let mut line = record
            .to_json_line()
            .map_err(|e| PersistError::Serialize { source: e })?;
        line.push('\n');

        // One buffer, one write: the line lands whole or not at all.
        self.jsonl
            .write_all(line.as_bytes())
            .and_then(|_| self.jsonl.sync_data())
            .map_err(|e| PersistError::Write {
                path: self.jsonl_path.clone(),
                source: e,
            })?;
        tracing::info!(path = %self.jsonl_path.display(), bytes = line.len(), "session record appended");

        if let Err(e) = self.append_log(human) {
            tracing::warn!(error = %e, "failed to append human-readable log");
        }
        Ok(())
    }

    fn append_log(&self, human: &str) -> Result<(), PersistError> {
        let mut log = open_append(&self.log_path)?;
        let mut block = human.trim_end().to_string();
        block.push_str("\n\n");
        log.write_all(block.as_bytes())
            .map_err(|e| PersistError::Write {
                path: self.log_path.clone(),
                source: e,
            })
    }

    pub fn close(self) {
        drop(self);
    }
}

/// Open both sinks, append once, close.
pub fn persist(
    jsonl_path: &Path,
    log_path: &Path,
    record: &SessionRecord,
    human: &str,
) -> Result<(), PersistError> {
    let mut sinks = Sinks::open(jsonl_path, log_path)?;
    sinks.append(record, human)?;
    sinks.close();
    Ok(())
}
