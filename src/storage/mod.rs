//! Certificate store bootstrap
//!
//! The proxy engine reads and writes its CA material under a single
//! directory. This module makes sure that directory exists, and is writable,
//! before any endpoint is constructed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

const WRITE_PROBE: &str = ".tapline-write-probe";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{} exists and is not a directory", path.display())]
    NotADirectory { path: PathBuf },
    #[error("{} is not writable: {source}", path.display())]
    Unwritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Create `path` and any missing parents, then verify it accepts new files.
pub fn ensure_dir(path: &Path) -> Result<(), StorageError> {
    if let Some(blocker) = first_non_directory(path) {
        return Err(StorageError::NotADirectory { path: blocker });
    }

    fs::create_dir_all(path).map_err(|source| StorageError::Unwritable {
        path: path.to_path_buf(),
        source,
    })?;

    let probe = path.join(WRITE_PROBE);
    fs::write(&probe, b"").map_err(|source| StorageError::Unwritable {
        path: path.to_path_buf(),
        source,
    })?;
    if let Err(err) = fs::remove_file(&probe) {
        tracing::debug!("Failed to remove write probe {}: {}", probe.display(), err);
    }

    tracing::debug!("Certificate store ready at {}", path.display());
    Ok(())
}

/// The path itself or the closest existing ancestor that is not a directory.
fn first_non_directory(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|candidate| candidate.exists())
        .filter(|existing| !existing.is_dir())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_missing_parents() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b").join("certs");

        ensure_dir(&nested).expect("directory created");
        assert!(nested.is_dir());
        assert!(!nested.join(WRITE_PROBE).exists());
    }

    #[test]
    fn existing_directory_is_accepted() {
        let dir = tempdir().unwrap();
        ensure_dir(dir.path()).expect("existing dir ok");
        ensure_dir(dir.path()).expect("idempotent");
    }

    #[test]
    fn regular_file_is_rejected() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("certs");
        fs::write(&file, b"not a dir").unwrap();

        match ensure_dir(&file) {
            Err(StorageError::NotADirectory { path }) => assert_eq!(path, file),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn file_in_the_middle_of_the_path_is_rejected() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("blocker");
        fs::write(&file, b"").unwrap();

        let err = ensure_dir(&file.join("certs")).unwrap_err();
        assert!(matches!(err, StorageError::NotADirectory { path } if path == file));
    }
}
