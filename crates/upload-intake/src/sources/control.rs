//! Direct candidate input.
//!
//! The ssh session handler can pipe `<key-path> <file-path>` lines to the
//! daemon when the auth log does not carry enough detail. The first space
//! separates the two fields, so the file path may itself contain spaces.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;

use super::{CandidateUpload, SourceKind};
use crate::identity::IdentityRef;

/// Parse one control line; blank or single-field lines yield `None`.
pub fn parse_control_line(line: &str) -> Option<CandidateUpload> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (key_path, file_path) = line.split_once(' ')?;
    if key_path.is_empty() || file_path.trim().is_empty() {
        return None;
    }
    Some(CandidateUpload {
        identity: IdentityRef::KeyPath(PathBuf::from(key_path)),
        path: PathBuf::from(file_path),
        source: SourceKind::Control,
    })
}

/// Read control lines on a background thread until EOF or the receiver goes away.
pub fn spawn_control_reader<R>(input: R, tx: Sender<CandidateUpload>) -> io::Result<JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    std::thread::Builder::new()
        .name("control-reader".to_string())
        .spawn(move || {
            for line in input.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(error = %e, "control input read failed");
                        break;
                    }
                };
                let Some(candidate) = parse_control_line(&line) else {
                    if !line.trim().is_empty() {
                        tracing::warn!(line = %line, "ignoring malformed control line");
                    }
                    continue;
                };
                if tx.send(candidate).is_err() {
                    return;
                }
            }
            tracing::info!("control input closed");
        })
}
