//! Daemon wiring.
//!
//! Starts the event sources on their own threads and feeds every candidate
//! through a single admission consumer.

use std::collections::HashMap;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use time::OffsetDateTime;

use crate::audit::FileAuditLog;
use crate::config::IntakeSettings;
use crate::engine::{AdmissionEngine, EvaluationOutcome};
use crate::error::IntakeError;
use crate::identity::KeyResolver;
use crate::ledger::IdentityLedger;
use crate::policy::AdmissionDecision;
use crate::probe::LocalInspector;
use crate::sources::auth_log::{AuthLogSource, spawn_auth_log_tailer};
use crate::sources::control::spawn_control_reader;
use crate::sources::inbound::{InboundSource, spawn_inbound_watcher};
use crate::sources::CandidateUpload;
use crate::storage::StorageDir;

/// Build the engine from resolved settings.
pub fn build_engine(settings: &IntakeSettings) -> Result<AdmissionEngine> {
    std::fs::create_dir_all(&settings.storage_dir)
        .with_context(|| format!("create storage dir {:?}", settings.storage_dir))?;
    let ledger = IdentityLedger::open(&settings.ledger_db_path)
        .with_context(|| format!("open ledger {:?}", settings.ledger_db_path))?;
    let audit = Arc::new(FileAuditLog::open(&settings.access_log_dir)?);
    tracing::info!(
        ledger = %settings.ledger_db_path.display(),
        audit = %audit.path().display(),
        storage = %settings.storage_dir.display(),
        "admission engine ready"
    );
    Ok(AdmissionEngine::new(
        ledger,
        KeyResolver::new(&settings.ssh_key_dir),
        Box::new(LocalInspector::new(settings.duration_backend.clone())),
        audit,
        StorageDir::new(&settings.storage_dir),
        settings.engine_settings(),
    ))
}

/// Run the intake daemon until every source has stopped.
pub fn run(settings: IntakeSettings, install_ctrlc: bool) -> Result<()> {
    let engine = build_engine(&settings)?;

    if install_ctrlc {
        let _ = ctrlc::set_handler(move || {
            tracing::info!("interrupted; shutting down");
            std::process::exit(130);
        });
    }

    let (tx, rx) = crossbeam_channel::unbounded();
    if let Some(path) = settings.auth_log.clone() {
        spawn_auth_log_tailer(
            AuthLogSource {
                path,
                from_start: settings.tail_from_start,
                inbound_dir: settings.inbound_dir.clone(),
                poll_interval: settings.poll_interval,
            },
            tx.clone(),
        )
        .context("spawn auth log tailer")?;
    } else {
        tracing::info!("auth log tailing disabled");
    }
    spawn_inbound_watcher(
        InboundSource {
            root: settings.inbound_dir.clone(),
            readiness: settings.readiness,
            poll_interval: settings.poll_interval,
            retry_after: settings.inbound_retry,
        },
        tx.clone(),
    )
    .with_context(|| format!("watch inbound dir {:?}", settings.inbound_dir))?;
    if settings.read_control_stdin {
        spawn_control_reader(BufReader::new(std::io::stdin()), tx.clone())
            .context("spawn control reader")?;
    }
    drop(tx);

    let handled = drain(&engine, &rx);
    tracing::info!(handled, "all intake sources stopped");
    Ok(())
}

const SETTLED_PRUNE_AT: usize = 1024;

/// Quota-rejected files left in place, keyed by path.
///
/// Both the auth log and the inbound watcher report the same upload, and the
/// watcher re-offers files it has already handed out. An entry suppresses
/// repeats while the file keeps its size and mtime and the identity's quota
/// period has not ended.
#[derive(Debug, Default)]
pub struct SettledUploads {
    entries: HashMap<PathBuf, Settled>,
}

#[derive(Debug)]
struct Settled {
    len: u64,
    modified: Option<SystemTime>,
    until: Option<i64>,
}

impl SettledUploads {
    /// True while `path` is unchanged since it was settled and `now` is
    /// before the recorded deadline. Stale entries are dropped.
    pub fn is_settled(&mut self, path: &Path, now: i64) -> bool {
        let Some(settled) = self.entries.get(path) else {
            return false;
        };
        let unchanged = std::fs::metadata(path).is_ok_and(|meta| {
            meta.len() == settled.len && meta.modified().ok() == settled.modified
        });
        if unchanged && settled.until.is_none_or(|until| now < until) {
            return true;
        }
        self.entries.remove(path);
        false
    }

    /// Remember `path` as it is now; `until` of `None` never expires.
    pub fn settle(&mut self, path: &Path, until: Option<i64>) {
        let Ok(meta) = std::fs::metadata(path) else {
            return;
        };
        if self.entries.len() >= SETTLED_PRUNE_AT {
            self.entries.retain(|path, _| path.exists());
        }
        self.entries.insert(
            path.to_path_buf(),
            Settled {
                len: meta.len(),
                modified: meta.modified().ok(),
                until,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Evaluate candidates in arrival order until the channel closes.
///
/// Per-candidate failures are logged and never end the loop. A file rejected
/// for quota stays where it is and is skipped until it changes or its
/// identity's quota period ends; failed evaluations are retried whenever the
/// file is offered again.
pub fn drain(engine: &AdmissionEngine, rx: &Receiver<CandidateUpload>) -> usize {
    let mut handled = 0;
    let mut settled = SettledUploads::default();
    for candidate in rx.iter() {
        handled += 1;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        if settled.is_settled(&candidate.path, now) {
            tracing::debug!(
                path = %candidate.path.display(),
                source = %candidate.source,
                "quota-rejected file unchanged; skipping"
            );
            continue;
        }
        match engine.evaluate_at(&candidate, now) {
            Ok(EvaluationOutcome::Missing) => {
                tracing::debug!(path = %candidate.path.display(), source = %candidate.source, "candidate already gone");
            }
            Ok(EvaluationOutcome::Rejected {
                fingerprint,
                decision:
                    AdmissionDecision::RejectedSizeQuota { .. }
                    | AdmissionDecision::RejectedAirtimeQuota { .. },
                ..
            }) => {
                settled.settle(&candidate.path, engine.quota_period_end(&fingerprint, now));
            }
            Ok(_) => {}
            Err(e @ IntakeError::CredentialUnreadable { .. }) => {
                tracing::warn!(
                    path = %candidate.path.display(),
                    source = %candidate.source,
                    error = %e,
                    "dropping candidate without identity"
                );
            }
            Err(e) => {
                tracing::warn!(
                    path = %candidate.path.display(),
                    source = %candidate.source,
                    identity = %candidate.identity,
                    error = %e,
                    "candidate evaluation failed"
                );
            }
        }
    }
    handled
}
