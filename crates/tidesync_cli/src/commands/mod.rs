//! CLI command implementations.

pub mod identity;
pub mod inspect;
pub mod keys;

use std::path::{Path, PathBuf};
use thiserror::Error;
use tidesync_storage::{OpenOptions, SqliteBackend, StorageError};

/// Errors shared by the store commands.
#[derive(Debug, Error)]
pub enum CommandError {
    /// No database file for the setup.
    #[error("no database found at {}", .0.display())]
    NotFound(PathBuf),

    /// The database could not be read.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A stored value has an unexpected shape.
    #[error("invalid store contents: {0}")]
    Invalid(String),
}

/// Opens an existing setup database without creating one.
pub fn open_existing(dir: &Path, setup: &str) -> Result<SqliteBackend, CommandError> {
    let path = tidesync_core::database_path(dir, setup);
    if !path.exists() {
        return Err(CommandError::NotFound(path));
    }
    tracing::debug!(path = %path.display(), "opening database");
    Ok(SqliteBackend::open(&path, OpenOptions::default())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_database_is_reported() {
        let dir = tempdir().unwrap();
        let err = open_existing(dir.path(), "default").unwrap_err();
        assert!(matches!(err, CommandError::NotFound(_)));
        assert!(!dir.path().join("default.db").exists());
    }
}
