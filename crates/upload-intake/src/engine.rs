//! Admission engine.
//!
//! Owns the identity ledger and turns each candidate upload into a decision:
//! resolve the identity, load its row, run the checks, then either charge the
//! quota and hand the file to storage, or record a strike and escalate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;

use crate::audit::AuditSink;
use crate::error::IntakeError;
use crate::escalation::{BanMode, Escalation, EscalationController, EscalationPolicy};
use crate::identity::{Fingerprint, KeyResolver};
use crate::ledger::{CommitError, IdentityLedger, IdentityRecord};
use crate::policy::{AdmissionDecision, MediaInspector, QuotaPolicy, check_candidate};
use crate::sources::CandidateUpload;
use crate::storage::StorageDir;

/// Policy knobs for an [`AdmissionEngine`].
#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub quota: QuotaPolicy,
    pub escalation: EscalationPolicy,
    pub ban_mode: BanMode,
    /// Quota period length in seconds; zero disables period resets.
    pub quota_period_secs: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EvaluationOutcome {
    Admitted {
        fingerprint: Fingerprint,
        stored_at: PathBuf,
        size_mb: u64,
        airtime_secs: u64,
    },
    Rejected {
        fingerprint: Fingerprint,
        decision: AdmissionDecision,
        escalation: Escalation,
    },
    /// The fingerprint is on the permanent ban list.
    RefusedBanned { fingerprint: Fingerprint },
    /// The candidate file is gone, usually because it was already handled.
    Missing,
}

pub struct AdmissionEngine {
    ledger: IdentityLedger,
    resolver: KeyResolver,
    inspector: Box<dyn MediaInspector>,
    audit: Arc<dyn AuditSink>,
    storage: StorageDir,
    quota: QuotaPolicy,
    escalation: EscalationController,
    quota_period_secs: i64,
    locks: IdentityLocks,
}

impl AdmissionEngine {
    pub fn new(
        ledger: IdentityLedger,
        resolver: KeyResolver,
        inspector: Box<dyn MediaInspector>,
        audit: Arc<dyn AuditSink>,
        storage: StorageDir,
        settings: EngineSettings,
    ) -> Self {
        Self {
            ledger,
            resolver,
            inspector,
            audit,
            storage,
            quota: settings.quota,
            escalation: EscalationController::new(settings.escalation, settings.ban_mode),
            quota_period_secs: settings.quota_period_secs,
            locks: IdentityLocks::default(),
        }
    }

    pub fn ledger(&self) -> &IdentityLedger {
        &self.ledger
    }

    /// Unix time at which `fingerprint`'s current quota period ends.
    ///
    /// `None` when periods never reset. An identity without a row would start
    /// a fresh period at `now`.
    pub fn quota_period_end(&self, fingerprint: &Fingerprint, now: i64) -> Option<i64> {
        if self.quota_period_secs <= 0 {
            return None;
        }
        let start = match self.ledger.get(fingerprint.as_str()) {
            Ok(Some(record)) => record.period_start,
            Ok(None) => now,
            Err(e) => {
                tracing::debug!(fingerprint = %fingerprint, error = %e, "period lookup failed");
                now
            }
        };
        Some(start.saturating_add(self.quota_period_secs))
    }

    pub fn evaluate(&self, candidate: &CandidateUpload) -> Result<EvaluationOutcome, IntakeError> {
        self.evaluate_at(candidate, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Evaluate `candidate` as of unix time `now`.
    ///
    /// Evaluations for the same identity are serialized; different
    /// identities proceed in parallel.
    pub fn evaluate_at(
        &self,
        candidate: &CandidateUpload,
        now: i64,
    ) -> Result<EvaluationOutcome, IntakeError> {
        let fingerprint = self.resolver.resolve(&candidate.identity)?;
        let lock = self.locks.handle(fingerprint.as_str());
        let result = {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            self.evaluate_locked(candidate, fingerprint.clone(), now)
        };
        drop(lock);
        self.locks.prune(fingerprint.as_str());
        result
    }

    fn evaluate_locked(
        &self,
        candidate: &CandidateUpload,
        fingerprint: Fingerprint,
        now: i64,
    ) -> Result<EvaluationOutcome, IntakeError> {
        let path = &candidate.path;
        if !path.is_file() {
            tracing::debug!(path = %path.display(), "candidate no longer present");
            return Ok(EvaluationOutcome::Missing);
        }
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        if self.escalation.ban_mode() == BanMode::Permanent
            && self
                .ledger
                .is_banned(fingerprint.as_str())
                .map_err(IntakeError::Store)?
        {
            self.audit.record(
                fingerprint.as_str(),
                &format!("rejected upload from banned identity ({file_name})"),
            );
            if let Err(e) = self.storage.discard(path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to delete upload from banned identity");
            }
            return Ok(EvaluationOutcome::RefusedBanned { fingerprint });
        }

        let mut record = self
            .ledger
            .load_or_create(fingerprint.as_str(), now)
            .map_err(IntakeError::Store)?;
        if record.roll_period(now, self.quota_period_secs) {
            tracing::debug!(fingerprint = %fingerprint, period_start = record.period_start, "quota period reset");
        }

        let decision = check_candidate(&self.quota, &record, path, self.inspector.as_ref())?;
        match decision {
            AdmissionDecision::Admitted {
                size_mb,
                airtime_secs,
            } => self.admit(record, candidate, fingerprint, size_mb, airtime_secs, now),
            rejected => self.reject(record, candidate, fingerprint, rejected, &file_name, now),
        }
    }

    fn admit(
        &self,
        mut record: IdentityRecord,
        candidate: &CandidateUpload,
        fingerprint: Fingerprint,
        size_mb: u64,
        airtime_secs: u64,
        now: i64,
    ) -> Result<EvaluationOutcome, IntakeError> {
        let path = &candidate.path;
        record.charge(size_mb, airtime_secs, now);
        let stored_at = match self
            .ledger
            .commit_admission(&record, || self.storage.promote(path))
        {
            Ok(dest) => dest,
            Err(CommitError::Store(error)) => return Err(IntakeError::Store(error)),
            Err(CommitError::Promote(source)) => {
                return Err(IntakeError::Storage {
                    path: path.clone(),
                    source,
                });
            }
            Err(CommitError::Ledger { dest, error }) => {
                if let Err(e) = self.storage.restore(&dest, path) {
                    tracing::error!(
                        fingerprint = %fingerprint,
                        stored_at = %dest.display(),
                        error = %e,
                        "file reached storage but the ledger was not charged"
                    );
                }
                return Err(IntakeError::Store(error));
            }
        };

        let message = AdmissionDecision::Admitted {
            size_mb,
            airtime_secs,
        }
        .audit_message("");
        self.audit.record(fingerprint.as_str(), &message);
        tracing::info!(
            fingerprint = %fingerprint,
            source = %candidate.source,
            stored_at = %stored_at.display(),
            size_mb,
            airtime_secs,
            daily_upload_mb = record.daily_upload_mb,
            daily_airtime_secs = record.daily_airtime_secs,
            "upload admitted"
        );
        Ok(EvaluationOutcome::Admitted {
            fingerprint,
            stored_at,
            size_mb,
            airtime_secs,
        })
    }

    fn reject(
        &self,
        mut record: IdentityRecord,
        candidate: &CandidateUpload,
        fingerprint: Fingerprint,
        decision: AdmissionDecision,
        file_name: &str,
        now: i64,
    ) -> Result<EvaluationOutcome, IntakeError> {
        self.audit
            .record(fingerprint.as_str(), &decision.audit_message(file_name));
        let escalation =
            self.escalation
                .strike(&mut record, &self.ledger, self.audit.as_ref(), now);

        // Unsupported files are dropped; quota rejections stay for a later retry.
        if decision == AdmissionDecision::RejectedUnsupportedType {
            if let Err(e) = self.storage.discard(&candidate.path) {
                tracing::warn!(path = %candidate.path.display(), error = %e, "failed to delete unsupported upload");
            }
        }
        let escalation = escalation.map_err(IntakeError::Store)?;

        tracing::info!(
            fingerprint = %fingerprint,
            source = %candidate.source,
            path = %candidate.path.display(),
            decision = %decision,
            escalation = ?escalation,
            "upload rejected"
        );
        Ok(EvaluationOutcome::Rejected {
            fingerprint,
            decision,
            escalation,
        })
    }
}

/// One mutex per fingerprint with an evaluation in flight.
#[derive(Default)]
struct IdentityLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IdentityLocks {
    fn handle(&self, fingerprint: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(fingerprint.to_string()).or_default().clone()
    }

    /// Drop the entry once no evaluation holds it.
    fn prune(&self, fingerprint: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if map
            .get(fingerprint)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(fingerprint);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::identity::IdentityRef;
    use crate::sources::SourceKind;
    use std::path::Path;

    const ALICE_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAABAgMEBQYHCAkKCwwNDg8QERITFBUWFxgZGhscHR4f alice@studio";
    const ALICE_FP: &str = "SHA256:ZkAslGjFiUHdGf/WUL8rQvkib4PTvQatUV0OUQSncCA";

    /// Reports the size and duration encoded in the file's contents as `size:secs`.
    struct ContentInspector;

    impl MediaInspector for ContentInspector {
        fn size_mb(&self, path: &Path) -> anyhow::Result<u64> {
            Ok(read_pair(path)?.0)
        }
        fn duration_secs(&self, path: &Path) -> anyhow::Result<u64> {
            Ok(read_pair(path)?.1)
        }
    }

    fn read_pair(path: &Path) -> anyhow::Result<(u64, u64)> {
        let text = std::fs::read_to_string(path)?;
        let (size, secs) = text
            .trim()
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("bad fixture"))?;
        Ok((size.parse()?, secs.parse()?))
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        keys: PathBuf,
        inbound: PathBuf,
        storage: PathBuf,
        audit: Arc<MemoryAuditLog>,
        engine: AdmissionEngine,
    }

    fn fixture(period: i64) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = dir.path().join("keys");
        let inbound = dir.path().join("inbound");
        let storage = dir.path().join("storage");
        for path in [&keys, &inbound, &storage] {
            std::fs::create_dir_all(path).expect("mkdir");
        }
        std::fs::write(keys.join("alice.pub"), ALICE_KEY).expect("key");
        let audit = Arc::new(MemoryAuditLog::default());
        let engine = AdmissionEngine::new(
            IdentityLedger::open_in_memory().expect("ledger"),
            KeyResolver::new(&keys),
            Box::new(ContentInspector),
            audit.clone(),
            StorageDir::new(&storage),
            EngineSettings {
                quota: QuotaPolicy::new(["mp3", "flac"], 100, 1000),
                escalation: EscalationPolicy {
                    strike_threshold: 3,
                    timeout_threshold: 3,
                },
                ban_mode: BanMode::Soft,
                quota_period_secs: period,
            },
        );
        Fixture {
            _dir: dir,
            keys,
            inbound,
            storage,
            audit,
            engine,
        }
    }

    fn candidate(fx: &Fixture, name: &str, contents: &str) -> CandidateUpload {
        let path = fx.inbound.join(name);
        std::fs::write(&path, contents).expect("write candidate");
        CandidateUpload {
            identity: IdentityRef::KeyPath(fx.keys.join("alice.pub")),
            path,
            source: SourceKind::Control,
        }
    }

    #[test]
    fn unknown_credential_charges_nobody() {
        let fx = fixture(0);
        let mut upload = candidate(&fx, "a.mp3", "1:1");
        upload.identity = IdentityRef::KeyPath(fx.keys.join("mallory.pub"));
        let result = fx.engine.evaluate_at(&upload, 0);
        assert!(matches!(result, Err(IntakeError::CredentialUnreadable { .. })));
        assert!(upload.path.exists());
        assert!(fx.audit.entries().is_empty());
    }

    #[test]
    fn missing_candidate_is_skipped() {
        let fx = fixture(0);
        let upload = candidate(&fx, "a.mp3", "1:1");
        std::fs::remove_file(&upload.path).expect("remove");
        assert_eq!(
            fx.engine.evaluate_at(&upload, 0).expect("evaluate"),
            EvaluationOutcome::Missing
        );
        assert!(fx.engine.ledger().get(ALICE_FP).expect("get").is_none());
    }

    #[test]
    fn probe_failure_does_not_strike() {
        let fx = fixture(0);
        let upload = candidate(&fx, "a.mp3", "garbage");
        let result = fx.engine.evaluate_at(&upload, 0);
        assert!(matches!(result, Err(IntakeError::Probe { .. })));
        let record = fx.engine.ledger().get(ALICE_FP).expect("get").expect("row");
        assert_eq!(record.strikes, 0);
        assert!(upload.path.exists());
    }

    #[test]
    fn storage_collision_leaves_ledger_uncharged() {
        let fx = fixture(0);
        std::fs::write(fx.storage.join("a.mp3"), "taken").expect("occupy");
        let upload = candidate(&fx, "a.mp3", "10:60");
        let result = fx.engine.evaluate_at(&upload, 0);
        assert!(matches!(result, Err(IntakeError::Storage { .. })));
        let record = fx.engine.ledger().get(ALICE_FP).expect("get").expect("row");
        assert_eq!(record.daily_upload_mb, 0);
        assert_eq!(record.daily_airtime_secs, 0);
        assert!(upload.path.exists());
        assert!(fx.audit.messages_for(ALICE_FP).is_empty());
    }

    #[test]
    fn quota_resets_after_period() {
        let fx = fixture(86_400);
        let first = candidate(&fx, "a.mp3", "90:100");
        assert!(matches!(
            fx.engine.evaluate_at(&first, 1_000).expect("first"),
            EvaluationOutcome::Admitted { .. }
        ));

        let second = candidate(&fx, "b.mp3", "20:100");
        assert!(matches!(
            fx.engine.evaluate_at(&second, 2_000).expect("second"),
            EvaluationOutcome::Rejected {
                decision: AdmissionDecision::RejectedSizeQuota { size_mb: 20 },
                ..
            }
        ));

        let next_day = fx.engine.evaluate_at(&second, 1_000 + 86_400).expect("next day");
        assert!(matches!(next_day, EvaluationOutcome::Admitted { .. }));
        let record = fx.engine.ledger().get(ALICE_FP).expect("get").expect("row");
        assert_eq!(record.daily_upload_mb, 20);
        assert_eq!(record.strikes, 1);
        assert_eq!(record.period_start, 1_000 + 86_400);
    }

    #[test]
    fn concurrent_same_identity_uploads_do_not_lose_updates() {
        let fx = fixture(0);
        let uploads = (0..8)
            .map(|i| candidate(&fx, &format!("show-{i}.mp3"), "5:10"))
            .collect::<Vec<_>>();
        std::thread::scope(|scope| {
            for upload in &uploads {
                let engine = &fx.engine;
                scope.spawn(move || engine.evaluate_at(upload, 0).expect("evaluate"));
            }
        });
        let record = fx.engine.ledger().get(ALICE_FP).expect("get").expect("row");
        assert_eq!(record.daily_upload_mb, 40);
        assert_eq!(record.daily_airtime_secs, 80);
        assert_eq!(fx.engine.locks.len(), 0);
    }
}
