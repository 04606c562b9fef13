//! Append-only audit trail of admission decisions.
//!
//! One line per entry: `<RFC 3339 timestamp> - <fingerprint>: <message>`.
//! Writing an entry never fails the caller; problems are logged and the
//! decision that produced the entry stands.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub const AUDIT_FILE_NAME: &str = "access.log";

pub trait AuditSink: Send + Sync {
    fn record(&self, fingerprint: &str, message: &str);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditEntry {
    pub timestamp: OffsetDateTime,
    pub fingerprint: String,
    pub message: String,
}

impl AuditEntry {
    pub fn now(fingerprint: &str, message: &str) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            fingerprint: fingerprint.to_string(),
            message: message.to_string(),
        }
    }

    pub fn to_line(&self) -> String {
        let stamp = self
            .timestamp
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.timestamp.unix_timestamp().to_string());
        format!("{stamp} - {}: {}\n", self.fingerprint, self.message)
    }
}

/// Audit log file under the configured access-log directory.
pub struct FileAuditLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileAuditLog {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("create audit dir {:?}", dir))?;
        let path = dir.join(AUDIT_FILE_NAME);
        let file = open_append(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) -> Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(open_append(&self.path)?);
        }
        let Some(file) = guard.as_mut() else {
            return Ok(());
        };
        if let Err(e) = file.write_all(line.as_bytes()) {
            // Reopen on the next entry in case the file was rotated away.
            *guard = None;
            return Err(e).with_context(|| format!("append {:?}", self.path));
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open audit log {:?}", path))
}

impl AuditSink for FileAuditLog {
    fn record(&self, fingerprint: &str, message: &str) {
        tracing::info!(target: "audit", fingerprint = %fingerprint, "{message}");
        let entry = AuditEntry::now(fingerprint, message);
        if let Err(e) = self.append(&entry.to_line()) {
            tracing::warn!(error = %format!("{e:#}"), "failed to write audit entry");
        }
    }
}

/// In-memory sink, for embedding and tests.
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn messages_for(&self, fingerprint: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.fingerprint == fingerprint)
            .map(|entry| entry.message)
            .collect()
    }
}

impl AuditSink for MemoryAuditLog {
    fn record(&self, fingerprint: &str, message: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(AuditEntry::now(fingerprint, message));
    }
}
