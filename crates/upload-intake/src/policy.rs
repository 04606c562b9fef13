//! Admission checks.
//!
//! A candidate is checked for file type, then upload volume, then airtime.
//! The first failing check decides; later checks are not run, so a file with
//! the wrong type is never sized or probed.

use std::ffi::OsStr;
use std::fmt;
use std::path::Path;

use crate::error::IntakeError;
use crate::ledger::IdentityRecord;

/// Measures a candidate file. Implementations may shell out or decode, so
/// callers only ask for what the current check needs.
pub trait MediaInspector: Send + Sync {
    /// File size in whole megabytes (rounded down).
    fn size_mb(&self, path: &Path) -> anyhow::Result<u64>;
    /// Media duration in whole seconds (rounded down).
    fn duration_secs(&self, path: &Path) -> anyhow::Result<u64>;
}

/// Per-identity ceilings and the accepted file types.
#[derive(Clone, Debug)]
pub struct QuotaPolicy {
    accepted_types: Vec<String>,
    pub max_upload_mb: u64,
    pub max_airtime_secs: u64,
}

impl QuotaPolicy {
    /// `accepted_types` may be given with or without a leading dot, in any case.
    pub fn new<I, S>(accepted_types: I, max_upload_mb: u64, max_airtime_secs: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let accepted_types = accepted_types
            .into_iter()
            .map(|ext| normalize_extension(ext.as_ref()))
            .filter(|ext| !ext.is_empty())
            .collect();
        Self {
            accepted_types,
            max_upload_mb,
            max_airtime_secs,
        }
    }

    pub fn accepted_types(&self) -> &[String] {
        &self.accepted_types
    }

    pub fn accepts_type(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(OsStr::to_str) else {
            return false;
        };
        let ext = ext.to_ascii_lowercase();
        self.accepted_types.iter().any(|accepted| *accepted == ext)
    }
}

fn normalize_extension(raw: &str) -> String {
    raw.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Outcome of evaluating one candidate against one identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admitted { size_mb: u64, airtime_secs: u64 },
    RejectedUnsupportedType,
    RejectedSizeQuota { size_mb: u64 },
    RejectedAirtimeQuota { airtime_secs: u64 },
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted { .. })
    }

    /// Audit line describing the decision.
    pub fn audit_message(&self, file_name: &str) -> String {
        match self {
            AdmissionDecision::Admitted { .. } => "uploaded successfully".to_string(),
            AdmissionDecision::RejectedUnsupportedType => {
                format!("unsupported file type ({file_name})")
            }
            AdmissionDecision::RejectedSizeQuota { size_mb } => {
                format!("exceeded upload size quota ({file_name}, {size_mb} MB)")
            }
            AdmissionDecision::RejectedAirtimeQuota { airtime_secs } => {
                format!("exceeded airtime quota ({file_name}, {airtime_secs} s)")
            }
        }
    }
}

impl fmt::Display for AdmissionDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AdmissionDecision::Admitted { .. } => "admitted",
            AdmissionDecision::RejectedUnsupportedType => "rejected_unsupported_type",
            AdmissionDecision::RejectedSizeQuota { .. } => "rejected_size_quota",
            AdmissionDecision::RejectedAirtimeQuota { .. } => "rejected_airtime_quota",
        };
        f.write_str(label)
    }
}

/// Run the checks in order against the identity's current consumption.
pub fn check_candidate(
    policy: &QuotaPolicy,
    record: &IdentityRecord,
    path: &Path,
    inspector: &dyn MediaInspector,
) -> Result<AdmissionDecision, IntakeError> {
    if !policy.accepts_type(path) {
        return Ok(AdmissionDecision::RejectedUnsupportedType);
    }

    let size_mb = inspector
        .size_mb(path)
        .map_err(|e| IntakeError::probe(path, e))?;
    if record.daily_upload_mb.saturating_add(size_mb) > policy.max_upload_mb {
        return Ok(AdmissionDecision::RejectedSizeQuota { size_mb });
    }

    let airtime_secs = inspector
        .duration_secs(path)
        .map_err(|e| IntakeError::probe(path, e))?;
    if record.daily_airtime_secs.saturating_add(airtime_secs) > policy.max_airtime_secs {
        return Ok(AdmissionDecision::RejectedAirtimeQuota { airtime_secs });
    }

    Ok(AdmissionDecision::Admitted {
        size_mb,
        airtime_secs,
    })
}
