//! Authentication log tailer.
//!
//! Follows the sshd log and turns successful `scp` sessions into candidates.
//! A transfer line has this shape:
//!
//! ```text
//! ... Accepted publickey for <user> ... SHA256:<digest> ... scp: '<path>' ...
//! ```
//!
//! Lines that lack either the `Accepted publickey` or the `scp` marker are
//! not transfers and are ignored. Lines that carry both markers but not the
//! fingerprint or the quoted path are malformed; they are logged and skipped.
//! The quoted path must be separated from `scp:` by whitespace.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use regex::Regex;

use super::{CandidateUpload, SourceKind};
use crate::identity::IdentityRef;

const AUTH_MARKER: &str = "Accepted publickey for ";
const SCP_MARKER: &str = "scp";

/// `Accepted publickey for <user> ... SHA256:<digest> ... scp: '<path>'`
static TRANSFER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Accepted publickey for (\S+).*?SHA256:(\S+).*scp:\s+'([^']+)'")
        .expect("invalid transfer pattern")
});

static FINGERPRINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"SHA256:\S").expect("invalid fingerprint pattern"));

/// One successful secure-copy session extracted from the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferSession {
    pub user: String,
    /// Digest token as logged, without the `SHA256:` prefix.
    pub fingerprint: String,
    pub path: PathBuf,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum LogParseError {
    #[error("transfer line without {0}")]
    MissingField(&'static str),
}

/// Match one log line against the transfer grammar.
pub fn parse_transfer_line(line: &str) -> Result<Option<TransferSession>, LogParseError> {
    if !line.contains(SCP_MARKER) {
        return Ok(None);
    }
    let Some(auth_at) = line.find(AUTH_MARKER) else {
        return Ok(None);
    };

    let Some(caps) = TRANSFER.captures(line) else {
        let rest = &line[auth_at + AUTH_MARKER.len()..];
        let field = if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            "user"
        } else if !FINGERPRINT.is_match(rest) {
            "fingerprint"
        } else {
            "quoted path"
        };
        return Err(LogParseError::MissingField(field));
    };

    Ok(Some(TransferSession {
        user: caps[1].to_string(),
        fingerprint: caps[2].to_string(),
        path: PathBuf::from(&caps[3]),
    }))
}

/// Relative transfer paths are relative to the inbound directory.
pub fn resolve_transfer_path(inbound_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        inbound_dir.join(path)
    }
}

/// Incremental reader over an append-only log.
///
/// Survives truncation (the file shrinks below the read offset) and rotation
/// (the path now names a different inode); both restart from offset 0.
pub struct LogTailer {
    path: PathBuf,
    from_start: bool,
    reader: Option<BufReader<File>>,
    inode: Option<u64>,
    offset: u64,
    partial: Vec<u8>,
}

impl LogTailer {
    /// With `from_start` false the first open skips content already present.
    pub fn new(path: impl Into<PathBuf>, from_start: bool) -> Self {
        Self {
            path: path.into(),
            from_start,
            reader: None,
            inode: None,
            offset: 0,
            partial: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Complete lines appended since the previous call.
    ///
    /// A missing file yields no lines; it is picked up once it appears.
    pub fn poll_lines(&mut self) -> io::Result<Vec<String>> {
        let mut lines = Vec::new();
        if self.reader.is_none() && !self.open()? {
            return Ok(lines);
        }

        match std::fs::metadata(&self.path) {
            Ok(meta) => {
                if inode_of(&meta) != self.inode {
                    tracing::info!(path = %self.path.display(), "auth log rotated");
                    self.read_available(&mut lines)?;
                    self.reader = None;
                    self.from_start = true;
                    if !self.open()? {
                        return Ok(lines);
                    }
                } else if meta.len() < self.offset {
                    tracing::info!(path = %self.path.display(), "auth log truncated");
                    if let Some(reader) = self.reader.as_mut() {
                        reader.seek(SeekFrom::Start(0))?;
                    }
                    self.offset = 0;
                    self.partial.clear();
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Rotated away with no replacement yet; drain what is left.
                self.read_available(&mut lines)?;
                return Ok(lines);
            }
            Err(e) => return Err(e),
        }

        self.read_available(&mut lines)?;
        Ok(lines)
    }

    /// Drop the current handle so the next poll reopens the file.
    pub fn reset(&mut self) {
        self.reader = None;
        self.partial.clear();
    }

    fn open(&mut self) -> io::Result<bool> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "auth log not present yet");
                // Whatever the file holds once it appears was written after startup.
                self.from_start = true;
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let meta = file.metadata()?;
        let mut reader = BufReader::new(file);
        self.offset = if self.from_start {
            0
        } else {
            reader.seek(SeekFrom::End(0))?
        };
        self.inode = inode_of(&meta);
        self.partial.clear();
        self.reader = Some(reader);
        // Anything written after this first open is new content.
        self.from_start = true;
        Ok(true)
    }

    fn read_available(&mut self, lines: &mut Vec<String>) -> io::Result<()> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(());
        };
        loop {
            let read = reader.read_until(b'\n', &mut self.partial)?;
            if read == 0 {
                return Ok(());
            }
            self.offset += read as u64;
            if self.partial.last() != Some(&b'\n') {
                // Writer is mid-line; keep the fragment for the next poll.
                return Ok(());
            }
            let line = String::from_utf8_lossy(&self.partial);
            lines.push(line.trim_end_matches(['\r', '\n']).to_string());
            self.partial.clear();
        }
    }
}

#[cfg(unix)]
fn inode_of(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn inode_of(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}

/// Settings for [`spawn_auth_log_tailer`].
#[derive(Clone, Debug)]
pub struct AuthLogSource {
    pub path: PathBuf,
    pub from_start: bool,
    pub inbound_dir: PathBuf,
    pub poll_interval: Duration,
}

/// Tail the auth log on a background thread until the receiver goes away.
pub fn spawn_auth_log_tailer(
    source: AuthLogSource,
    tx: Sender<CandidateUpload>,
) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("auth-log-tailer".to_string())
        .spawn(move || {
            let mut tailer = LogTailer::new(&source.path, source.from_start);
            tracing::info!(path = %source.path.display(), "tailing auth log");
            loop {
                let lines = match tailer.poll_lines() {
                    Ok(lines) => lines,
                    Err(e) => {
                        tracing::warn!(path = %source.path.display(), error = %e, "auth log read failed");
                        tailer.reset();
                        Vec::new()
                    }
                };
                if lines.is_empty() {
                    std::thread::sleep(source.poll_interval);
                    continue;
                }
                for line in lines {
                    let session = match parse_transfer_line(&line) {
                        Ok(Some(session)) => session,
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::warn!(error = %e, line = %line, "skipping malformed transfer line");
                            continue;
                        }
                    };
                    tracing::debug!(
                        user = %session.user,
                        fingerprint = %session.fingerprint,
                        path = %session.path.display(),
                        "scp transfer observed"
                    );
                    let candidate = CandidateUpload {
                        identity: IdentityRef::LogFingerprint(session.fingerprint),
                        path: resolve_transfer_path(&source.inbound_dir, &session.path),
                        source: SourceKind::AuthLog,
                    };
                    if tx.send(candidate).is_err() {
                        tracing::debug!("candidate channel closed; auth log tailer exiting");
                        return;
                    }
                }
            }
        })
}
