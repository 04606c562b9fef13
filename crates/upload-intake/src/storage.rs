//! Handoff of admitted files to the converter's storage directory.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct StorageDir {
    root: PathBuf,
}

impl StorageDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Move `src` into storage under its original file name.
    ///
    /// An existing file of the same name is never replaced.
    pub fn promote(&self, src: &Path) -> io::Result<PathBuf> {
        let name = src.file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "candidate has no file name")
        })?;
        let dest = self.root.join(name);
        if dest.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already in storage", dest.display()),
            ));
        }
        move_file(src, &dest)?;
        Ok(dest)
    }

    /// Undo a [`promote`](Self::promote) whose ledger commit failed.
    pub fn restore(&self, dest: &Path, original: &Path) -> io::Result<()> {
        move_file(dest, original)
    }

    /// Delete a rejected candidate.
    pub fn discard(&self, path: &Path) -> io::Result<()> {
        match std::fs::remove_file(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Rename, falling back to copy + remove when crossing filesystems.
fn move_file(src: &Path, dest: &Path) -> io::Result<()> {
    match std::fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            let name = dest.file_name().unwrap_or_default().to_string_lossy();
            let partial = dest.with_file_name(format!(".{name}.partial"));
            std::fs::copy(src, &partial)?;
            if let Err(e) = std::fs::rename(&partial, dest) {
                let _ = std::fs::remove_file(&partial);
                return Err(e);
            }
            std::fs::remove_file(src)
        }
        Err(e) => Err(e),
    }
}
