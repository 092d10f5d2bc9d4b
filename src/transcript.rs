// Conversation transcript log
// Write-only JSONL side channel: one {role, text, timestamp} record per line

use crate::dialogue::history::Utterance;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Error types for transcript operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptError {
    /// File I/O error
    IoError(String),
    /// JSON serialization error
    JsonError(String),
}

impl std::fmt::Display for TranscriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranscriptError::IoError(msg) => write!(f, "IO Error: {}", msg),
            TranscriptError::JsonError(msg) => write!(f, "JSON Error: {}", msg),
        }
    }
}

impl std::error::Error for TranscriptError {}

/// One line of the log
#[derive(Debug, Serialize)]
struct TranscriptRecord<'a> {
    role: &'static str,
    text: &'a str,
    /// RFC 3339
    timestamp: String,
}

/// Append-only conversation log
pub struct TranscriptLog {
    file: File,
    path: PathBuf,
}

impl TranscriptLog {
    /// Create (or truncate) the log file
    ///
    /// # Arguments
    /// * `path` - Location of the JSONL file
    ///
    /// # Returns
    /// * `Ok(TranscriptLog)` if the file could be opened
    /// * `Err(TranscriptError)` if an error occurred
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, TranscriptError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| TranscriptError::IoError(format!("{}: {}", path.display(), e)))?;
        Ok(Self { file, path })
    }

    /// Append one utterance as a JSON line
    pub fn append(&mut self, utterance: &Utterance) -> Result<(), TranscriptError> {
        let record = TranscriptRecord {
            role: utterance.role.as_str(),
            text: &utterance.text,
            timestamp: utterance.timestamp.to_rfc3339(),
        };
        let mut line =
            serde_json::to_string(&record).map_err(|e| TranscriptError::JsonError(e.to_string()))?;
        line.push('\n');

        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.flush())
            .map_err(|e| TranscriptError::IoError(e.to_string()))
    }

    /// Location of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }
}
