//! Inbound drop-directory watcher.
//!
//! Layout is `<inbound>/<key-name>/<file>`: the subdirectory names the
//! contributor's key in the key directory. Files placed directly in the
//! inbound root carry no identity and are skipped.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::{RecvTimeoutError, Sender};
use notify::{RecursiveMode, Watcher};

use super::{CandidateUpload, SourceKind};
use crate::identity::IdentityRef;

/// Decides whether a file has finished being written.
///
/// Check `n` happens `delay * n` after the previous one and requires the size
/// and mtime to be unchanged since then, a non-empty file, and that it opens
/// for reading. After `attempts` failed checks the file is reported as still
/// being written and the cycle starts over. Nothing here sleeps; the watcher
/// revisits pending files on later scans.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadinessProbe {
    pub attempts: u32,
    pub delay: Duration,
}

impl ReadinessProbe {
    fn wait_before(&self, check: u32) -> Duration {
        self.delay * check.max(1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl FileStamp {
    fn of(meta: &std::fs::Metadata) -> Self {
        Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        }
    }
}

/// A file waiting for its next readiness check.
#[derive(Debug)]
struct Pending {
    stamp: FileStamp,
    checks: u32,
    due: Instant,
}

/// A file already handed to the consumer.
#[derive(Debug)]
struct Offered {
    stamp: FileStamp,
    at: Instant,
}

/// Scans the inbound tree and reports files that are ready for evaluation.
///
/// A file is handed out again when its size or mtime changes, or once
/// `retry_after` has passed since it was last handed out. The consumer
/// decides whether a repeat is worth evaluating.
pub struct InboundWatcher {
    root: PathBuf,
    readiness: ReadinessProbe,
    retry_after: Option<Duration>,
    pending: HashMap<PathBuf, Pending>,
    offered: HashMap<PathBuf, Offered>,
    strays: HashMap<PathBuf, FileStamp>,
}

impl InboundWatcher {
    /// `retry_after` of `None` never re-offers an unchanged file.
    pub fn new(
        root: impl Into<PathBuf>,
        readiness: ReadinessProbe,
        retry_after: Option<Duration>,
    ) -> Self {
        Self {
            root: root.into(),
            readiness,
            retry_after,
            pending: HashMap::new(),
            offered: HashMap::new(),
            strays: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Earliest moment a pending file is due for another check.
    pub fn next_due(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.due).min()
    }

    pub fn scan(&mut self) -> io::Result<Vec<CandidateUpload>> {
        self.scan_at(Instant::now())
    }

    /// One pass over the tree as of `now`.
    pub fn scan_at(&mut self, now: Instant) -> io::Result<Vec<CandidateUpload>> {
        let mut present = HashSet::new();
        let mut candidates = Vec::new();

        for entry in sorted_entries(&self.root)? {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if is_hidden(&path) {
                continue;
            }
            if file_type.is_file() {
                present.insert(path.clone());
                if let Ok(meta) = entry.metadata() {
                    let stamp = FileStamp::of(&meta);
                    if self.strays.insert(path.clone(), stamp) != Some(stamp) {
                        tracing::warn!(
                            path = %path.display(),
                            "file outside a contributor directory; skipping"
                        );
                    }
                }
                continue;
            }
            if !file_type.is_dir() {
                continue;
            }
            let Some(key_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                tracing::warn!(path = %path.display(), "non-UTF-8 contributor directory");
                continue;
            };
            let files = match sorted_entries(&path) {
                Ok(files) => files,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to read contributor directory");
                    continue;
                }
            };
            for file in files {
                let file_path = file.path();
                if is_hidden(&file_path) || !file.file_type().is_ok_and(|t| t.is_file()) {
                    continue;
                }
                present.insert(file_path.clone());
                if let Some(candidate) = self.observe(&file_path, &key_name, now) {
                    candidates.push(candidate);
                }
            }
        }

        self.pending.retain(|path, _| present.contains(path));
        self.offered.retain(|path, _| present.contains(path));
        self.strays.retain(|path, _| present.contains(path));
        Ok(candidates)
    }

    fn observe(&mut self, path: &Path, key_name: &str, now: Instant) -> Option<CandidateUpload> {
        let stamp = FileStamp::of(&std::fs::metadata(path).ok()?);

        if let Some(offered) = self.offered.get(path) {
            if offered.stamp == stamp {
                let retry_due = self
                    .retry_after
                    .is_some_and(|after| now.saturating_duration_since(offered.at) >= after);
                if !retry_due {
                    return None;
                }
                tracing::debug!(path = %path.display(), "re-offering unchanged file");
                return Some(self.offer(path, key_name, stamp, now));
            }
        }

        let Some(pending) = self.pending.get_mut(path) else {
            self.pending.insert(
                path.to_path_buf(),
                Pending {
                    stamp,
                    checks: 0,
                    due: now + self.readiness.wait_before(1),
                },
            );
            return None;
        };
        if now < pending.due {
            return None;
        }
        if pending.stamp == stamp && stamp.len > 0 && File::open(path).is_ok() {
            self.pending.remove(path);
            return Some(self.offer(path, key_name, stamp, now));
        }

        pending.checks += 1;
        pending.stamp = stamp;
        if pending.checks >= self.readiness.attempts.max(1) {
            tracing::info!(path = %path.display(), size = stamp.len, "file still being written; retrying later");
            pending.checks = 0;
        } else {
            tracing::debug!(path = %path.display(), check = pending.checks, size = stamp.len, "file not ready yet");
        }
        pending.due = now + self.readiness.wait_before(pending.checks + 1);
        None
    }

    fn offer(&mut self, path: &Path, key_name: &str, stamp: FileStamp, now: Instant) -> CandidateUpload {
        self.offered
            .insert(path.to_path_buf(), Offered { stamp, at: now });
        CandidateUpload {
            identity: IdentityRef::KeyName(key_name.to_string()),
            path: path.to_path_buf(),
            source: SourceKind::Inbound,
        }
    }
}

fn sorted_entries(dir: &Path) -> io::Result<Vec<std::fs::DirEntry>> {
    let mut entries = std::fs::read_dir(dir)?.flatten().collect::<Vec<_>>();
    entries.sort_by_key(|entry| entry.file_name());
    Ok(entries)
}

/// Dotfiles are transfer temporaries (`scp`, our own `.partial` copies).
fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

/// Settings for [`spawn_inbound_watcher`].
#[derive(Clone, Debug)]
pub struct InboundSource {
    pub root: PathBuf,
    pub readiness: ReadinessProbe,
    pub poll_interval: Duration,
    /// How long an unchanged file waits before it is offered again.
    pub retry_after: Option<Duration>,
}

/// Watch the inbound tree on a background thread until the receiver goes away.
///
/// Filesystem notifications trigger an early rescan; the poll interval is the
/// upper bound between scans, shortened when a pending file is due sooner.
pub fn spawn_inbound_watcher(
    source: InboundSource,
    tx: Sender<CandidateUpload>,
) -> io::Result<JoinHandle<()>> {
    std::fs::create_dir_all(&source.root)?;
    std::thread::Builder::new()
        .name("inbound-watcher".to_string())
        .spawn(move || {
            let (wake_tx, wake_rx) = crossbeam_channel::unbounded::<()>();
            // Held so `recv_timeout` keeps timing out when notifications are unavailable.
            let _wake_keepalive = wake_tx.clone();
            let _fs_watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                if res.is_ok() {
                    let _ = wake_tx.send(());
                }
            }) {
                Ok(mut watcher) => match watcher.watch(&source.root, RecursiveMode::Recursive) {
                    Ok(()) => Some(watcher),
                    Err(e) => {
                        tracing::warn!(path = %source.root.display(), error = %e, "inbound notifications unavailable; polling only");
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "inbound notifications unavailable; polling only");
                    None
                }
            };

            let mut watcher =
                InboundWatcher::new(&source.root, source.readiness, source.retry_after);
            tracing::info!(path = %source.root.display(), "watching inbound directory");
            loop {
                match watcher.scan() {
                    Ok(candidates) => {
                        for candidate in candidates {
                            if tx.send(candidate).is_err() {
                                tracing::debug!("candidate channel closed; inbound watcher exiting");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(path = %source.root.display(), error = %e, "inbound scan failed");
                    }
                }
                let wait = watcher
                    .next_due()
                    .map(|due| due.saturating_duration_since(Instant::now()))
                    .map_or(source.poll_interval, |until| until.min(source.poll_interval));
                match wake_rx.recv_timeout(wait) {
                    // Coalesce a burst of events into one rescan.
                    Ok(()) => while wake_rx.try_recv().is_ok() {},
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        })
}
