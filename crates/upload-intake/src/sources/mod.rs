//! Producers of candidate uploads.
//!
//! Each source runs on its own thread and sends [`CandidateUpload`]s into one
//! channel; the runtime drains that channel into the admission engine.

use std::fmt;
use std::path::PathBuf;

use crate::identity::IdentityRef;

pub mod auth_log;
pub mod control;
pub mod inbound;

/// Which producer observed a candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    AuthLog,
    Inbound,
    Control,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::AuthLog => "auth_log",
            SourceKind::Inbound => "inbound",
            SourceKind::Control => "control",
        })
    }
}

/// An unvalidated (identity, file) pair awaiting a decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidateUpload {
    pub identity: IdentityRef,
    pub path: PathBuf,
    pub source: SourceKind,
}
