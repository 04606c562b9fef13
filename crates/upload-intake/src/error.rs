//! Error taxonomy for the admission path.
//!
//! Startup and configuration code uses `anyhow` directly; everything a single
//! candidate upload can run into is one of these variants, none of which stop
//! the intake loop.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    /// The key material behind an identity reference could not be read or parsed.
    /// No identity is charged.
    #[error("credential unreadable ({reference}): {reason}")]
    CredentialUnreadable { reference: String, reason: String },

    /// Size or duration of the candidate could not be determined.
    #[error("probe {}: {reason}", path.display())]
    Probe { path: PathBuf, reason: String },

    /// The identity ledger rejected a read or write.
    #[error("ledger: {0:#}")]
    Store(anyhow::Error),

    /// Moving or deleting a candidate file failed.
    #[error("storage {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl IntakeError {
    pub(crate) fn credential(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CredentialUnreadable {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn probe(path: &std::path::Path, err: anyhow::Error) -> Self {
        Self::Probe {
            path: path.to_path_buf(),
            reason: format!("{err:#}"),
        }
    }
}
