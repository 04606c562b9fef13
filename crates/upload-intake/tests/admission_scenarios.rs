use std::path::{Path, PathBuf};
use std::sync::Arc;

use upload_intake::audit::MemoryAuditLog;
use upload_intake::engine::{AdmissionEngine, EngineSettings, EvaluationOutcome};
use upload_intake::error::IntakeError;
use upload_intake::escalation::{BanMode, Escalation, EscalationPolicy};
use upload_intake::identity::{IdentityRef, KeyResolver};
use upload_intake::ledger::{IdentityLedger, IdentityRecord};
use upload_intake::policy::{AdmissionDecision, MediaInspector, QuotaPolicy};
use upload_intake::sources::{CandidateUpload, SourceKind};
use upload_intake::storage::StorageDir;

const ALICE_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAABAgMEBQYHCAkKCwwNDg8QERITFBUWFxgZGhscHR4f alice@studio";
const ALICE_FP: &str = "SHA256:ZkAslGjFiUHdGf/WUL8rQvkib4PTvQatUV0OUQSncCA";
const STRIKES: u32 = 3;
const TIMEOUTS: u32 = 2;
const NOW: i64 = 1_709_294_400;

/// Test media: the file body is `<size_mb>:<duration_secs>`.
struct FixtureInspector;

impl MediaInspector for FixtureInspector {
    fn size_mb(&self, path: &Path) -> anyhow::Result<u64> {
        Ok(read_fixture(path)?.0)
    }

    fn duration_secs(&self, path: &Path) -> anyhow::Result<u64> {
        Ok(read_fixture(path)?.1)
    }
}

fn read_fixture(path: &Path) -> anyhow::Result<(u64, u64)> {
    let body = std::fs::read_to_string(path)?;
    let (size, secs) = body
        .trim()
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("not a fixture: {body:?}"))?;
    Ok((size.parse()?, secs.parse()?))
}

struct Harness {
    _dir: tempfile::TempDir,
    keys: PathBuf,
    inbound: PathBuf,
    storage: PathBuf,
    audit: Arc<MemoryAuditLog>,
    engine: AdmissionEngine,
}

impl Harness {
    fn new(ban_mode: BanMode) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = dir.path().join("storage");
        std::fs::create_dir_all(&storage).expect("storage");
        Self::with_storage(dir, storage, ban_mode)
    }

    fn with_storage(dir: tempfile::TempDir, storage: PathBuf, ban_mode: BanMode) -> Self {
        let keys = dir.path().join("keys");
        let inbound = dir.path().join("inbound");
        std::fs::create_dir_all(&keys).expect("keys");
        std::fs::create_dir_all(inbound.join("alice")).expect("inbound");
        std::fs::write(keys.join("alice.pub"), ALICE_KEY).expect("key");

        let audit = Arc::new(MemoryAuditLog::default());
        let engine = AdmissionEngine::new(
            IdentityLedger::open(&dir.path().join("userstats.db")).expect("ledger"),
            KeyResolver::new(&keys),
            Box::new(FixtureInspector),
            audit.clone(),
            StorageDir::new(&storage),
            EngineSettings {
                quota: QuotaPolicy::new(["mp3", "flac", "ogg"], 100, 1000),
                escalation: EscalationPolicy {
                    strike_threshold: STRIKES,
                    timeout_threshold: TIMEOUTS,
                },
                ban_mode,
                quota_period_secs: 86_400,
            },
        );
        Self {
            _dir: dir,
            keys,
            inbound,
            storage,
            audit,
            engine,
        }
    }

    fn upload(&self, name: &str, body: &str) -> CandidateUpload {
        let path = self.inbound.join("alice").join(name);
        std::fs::write(&path, body).expect("write upload");
        CandidateUpload {
            identity: IdentityRef::KeyName("alice".to_string()),
            path,
            source: SourceKind::Inbound,
        }
    }

    fn seed(&self, strikes: u32, timeouts: u32) {
        let mut record = IdentityRecord::new(ALICE_FP, NOW);
        record.strikes = strikes;
        record.timeouts = timeouts;
        self.engine.ledger().save(&record).expect("seed");
    }

    fn record(&self) -> Option<IdentityRecord> {
        self.engine.ledger().get(ALICE_FP).expect("ledger read")
    }
}

#[test]
fn scenario_a_admits_within_quota() {
    let h = Harness::new(BanMode::Soft);
    let upload = h.upload("morning.mp3", "40:120");

    let outcome = h.engine.evaluate_at(&upload, NOW).expect("evaluate");
    let stored_at = h.storage.join("morning.mp3");
    assert_eq!(
        outcome,
        EvaluationOutcome::Admitted {
            fingerprint: upload_intake::identity::Fingerprint::from_log_token(ALICE_FP),
            stored_at: stored_at.clone(),
            size_mb: 40,
            airtime_secs: 120,
        }
    );

    let record = h.record().expect("row");
    assert_eq!(record.daily_upload_mb, 40);
    assert_eq!(record.daily_airtime_secs, 120);
    assert_eq!(record.strikes, 0);
    assert_eq!(record.last_upload_at, Some(NOW));
    assert!(!upload.path.exists());
    assert_eq!(std::fs::read_to_string(&stored_at).expect("stored"), "40:120");
    assert_eq!(h.audit.messages_for(ALICE_FP), vec!["uploaded successfully"]);
}

#[test]
fn re_evaluating_an_admitted_path_changes_nothing() {
    let h = Harness::new(BanMode::Soft);
    let upload = h.upload("morning.mp3", "40:120");
    h.engine.evaluate_at(&upload, NOW).expect("first");
    let before = h.record();

    let again = h.engine.evaluate_at(&upload, NOW + 5).expect("second");
    assert_eq!(again, EvaluationOutcome::Missing);
    assert_eq!(h.record(), before);
    assert_eq!(h.audit.entries().len(), 1);
}

#[test]
fn scenario_b_strike_threshold_times_out() {
    let h = Harness::new(BanMode::Soft);
    h.seed(STRIKES - 1, 0);
    let upload = h.upload("setup.exe", "1:1");

    let outcome = h.engine.evaluate_at(&upload, NOW).expect("evaluate");
    assert!(matches!(
        outcome,
        EvaluationOutcome::Rejected {
            decision: AdmissionDecision::RejectedUnsupportedType,
            escalation: Escalation::TimedOut { timeouts: 1 },
            ..
        }
    ));
    let record = h.record().expect("row");
    assert_eq!((record.strikes, record.timeouts), (0, 1));
    assert_eq!(
        h.audit.messages_for(ALICE_FP),
        vec!["unsupported file type (setup.exe)", "user timed out"]
    );
    assert!(!upload.path.exists(), "unsupported uploads are deleted");
}

#[test]
fn scenario_c_soft_ban_deletes_row_and_forgets() {
    let h = Harness::new(BanMode::Soft);
    h.seed(STRIKES - 1, TIMEOUTS - 1);
    let bad = h.upload("virus.exe", "1:1");

    let outcome = h.engine.evaluate_at(&bad, NOW).expect("evaluate");
    assert!(matches!(
        outcome,
        EvaluationOutcome::Rejected {
            escalation: Escalation::Banned,
            ..
        }
    ));
    assert!(h.record().is_none());
    assert_eq!(
        h.audit.messages_for(ALICE_FP),
        vec!["unsupported file type (virus.exe)", "user timed out", "user banned"]
    );

    let next = h.upload("apology.ogg", "1:30");
    let outcome = h.engine.evaluate_at(&next, NOW + 60).expect("evaluate");
    assert!(matches!(outcome, EvaluationOutcome::Admitted { .. }));
    let record = h.record().expect("fresh row");
    assert_eq!((record.strikes, record.timeouts), (0, 0));
    assert_eq!(record.daily_upload_mb, 1);
}

#[test]
fn permanent_ban_refuses_the_fingerprint() {
    let h = Harness::new(BanMode::Permanent);
    h.seed(STRIKES - 1, TIMEOUTS - 1);
    h.engine
        .evaluate_at(&h.upload("virus.exe", "1:1"), NOW)
        .expect("ban");
    assert!(h.engine.ledger().is_banned(ALICE_FP).expect("ban list"));

    let next = h.upload("apology.ogg", "1:30");
    let outcome = h.engine.evaluate_at(&next, NOW + 60).expect("evaluate");
    assert!(matches!(outcome, EvaluationOutcome::RefusedBanned { .. }));
    assert!(h.record().is_none(), "no row is recreated");
    assert!(!next.path.exists());
    assert!(!h.storage.join("apology.ogg").exists());
    assert_eq!(
        h.audit.messages_for(ALICE_FP).last().map(String::as_str),
        Some("rejected upload from banned identity (apology.ogg)")
    );
}

#[test]
fn scenario_d_size_quota_leaves_file_in_place() {
    let h = Harness::new(BanMode::Soft);
    let upload = h.upload("marathon.flac", "101:60");

    let outcome = h.engine.evaluate_at(&upload, NOW).expect("evaluate");
    assert!(matches!(
        outcome,
        EvaluationOutcome::Rejected {
            decision: AdmissionDecision::RejectedSizeQuota { size_mb: 101 },
            escalation: Escalation::Active,
            ..
        }
    ));
    assert!(upload.path.exists());
    assert!(!h.storage.join("marathon.flac").exists());
    let record = h.record().expect("row");
    assert_eq!(record.strikes, 1);
    assert_eq!(record.daily_upload_mb, 0);
    assert_eq!(
        h.audit.messages_for(ALICE_FP),
        vec!["exceeded upload size quota (marathon.flac, 101 MB)"]
    );
}

#[test]
fn airtime_quota_counts_prior_admissions() {
    let h = Harness::new(BanMode::Soft);
    h.engine
        .evaluate_at(&h.upload("one.mp3", "10:900"), NOW)
        .expect("first");
    let second = h.upload("two.mp3", "10:101");
    let outcome = h.engine.evaluate_at(&second, NOW + 1).expect("second");
    assert!(matches!(
        outcome,
        EvaluationOutcome::Rejected {
            decision: AdmissionDecision::RejectedAirtimeQuota { airtime_secs: 101 },
            ..
        }
    ));
    assert!(second.path.exists());
    let record = h.record().expect("row");
    assert_eq!((record.daily_upload_mb, record.daily_airtime_secs), (10, 900));
}

#[test]
fn failed_move_does_not_charge_the_identity() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing_storage = dir.path().join("not-created");
    let h = Harness::with_storage(dir, missing_storage, BanMode::Soft);
    let upload = h.upload("show.mp3", "5:60");

    let result = h.engine.evaluate_at(&upload, NOW);
    assert!(matches!(result, Err(IntakeError::Storage { .. })));
    let record = h.record().expect("row created on first sight");
    assert_eq!((record.daily_upload_mb, record.daily_airtime_secs), (0, 0));
    assert_eq!(record.last_upload_at, None);
    assert!(upload.path.exists());
    assert!(h.audit.messages_for(ALICE_FP).is_empty());
}

#[test]
fn counters_stay_below_thresholds_across_many_violations() {
    let h = Harness::new(BanMode::Soft);
    for round in 0..(STRIKES * TIMEOUTS * 2) {
        let upload = h.upload(&format!("junk-{round}.exe"), "1:1");
        h.engine
            .evaluate_at(&upload, NOW + round as i64)
            .expect("evaluate");
        if let Some(record) = h.record() {
            assert!(record.strikes < STRIKES, "round {round}: {record:?}");
            assert!(record.timeouts < TIMEOUTS, "round {round}: {record:?}");
        }
    }
    let bans = h
        .audit
        .messages_for(ALICE_FP)
        .into_iter()
        .filter(|message| message == "user banned")
        .count();
    assert_eq!(bans, 2);
}

#[test]
fn unknown_key_name_is_not_charged() {
    let h = Harness::new(BanMode::Soft);
    let mut upload = h.upload("show.mp3", "1:1");
    upload.identity = IdentityRef::KeyName("mallory".to_string());
    let result = h.engine.evaluate_at(&upload, NOW);
    assert!(matches!(result, Err(IntakeError::CredentialUnreadable { .. })));
    assert!(upload.path.exists());
    assert!(h.audit.entries().is_empty());
    assert!(h.keys.join("alice.pub").exists());
}
