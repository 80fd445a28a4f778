//! Typed error kinds for the copy worker's phases.
//!
//! Analysis and execution errors are caught per-inode by the worker loop: the
//! claim is released (or, for execution errors, deliberately left set so the
//! batch timeout drives a retry) and a typed string is appended to
//! `inode.errors`.

use thiserror::Error;

/// Coarse classification used by the diagnostics module and recorded as the
/// prefix of entries appended to `inode.errors`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    PathError,
    IoError,
    PermissionError,
    HashError,
    MountError,
    DbError,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::PathError => "path_error",
            ErrorClass::IoError => "io_error",
            ErrorClass::PermissionError => "permission_error",
            ErrorClass::HashError => "hash_error",
            ErrorClass::MountError => "mount_error",
            ErrorClass::DbError => "db_error",
            ErrorClass::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("path error: {0}")]
    Path(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("hash error: {0}")]
    Hash(String),
}

impl AnalysisError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            AnalysisError::Path(_) => ErrorClass::PathError,
            AnalysisError::Io(e) => classify_io_error(e),
            AnalysisError::Hash(_) => ErrorClass::HashError,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] postgres::Error),
}

impl ExecutionError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            ExecutionError::Filesystem(e) => classify_io_error(e),
            ExecutionError::Database(_) => ErrorClass::DbError,
        }
    }
}

#[derive(Debug, Error)]
pub enum MountError {
    #[error("medium {0} not found in medium table")]
    UnknownMedium(String),
    #[error("image path for medium {0} does not exist: {1}")]
    MissingImage(String, String),
    #[error("mount helper failed for medium {0}: {1}")]
    HelperFailed(String, String),
    #[error("io error probing mount state: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error while resolving medium: {0}")]
    Db(#[from] postgres::Error),
}

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("database error during claim: {0}")]
    Db(#[from] postgres::Error),
}

/// Map a raw `io::Error` to the coarse error classes used across the worker:
/// `ENOENT`-shaped errors are `path_error`, permission failures are
/// `permission_error`, and everything else bottoms out at `io_error`
/// (beyond-end-of-device / media errors / generic `EIO`).
pub fn classify_io_error(e: &std::io::Error) -> ErrorClass {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::NotFound => ErrorClass::PathError,
        ErrorKind::PermissionDenied => ErrorClass::PermissionError,
        _ => ErrorClass::IoError,
    }
}
