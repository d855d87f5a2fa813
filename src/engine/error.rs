//! Updater Error Types

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Malformed or truncated update stream
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Invalid header magic: {found:02x?}")]
    BadMagic { found: Vec<u8> },

    #[error("Update file truncated while reading {field}")]
    Truncated { field: &'static str },

    #[error("Record path is {len} bytes (limit {limit})")]
    PathTooLong { len: usize, limit: usize },

    #[error("Record path is empty")]
    EmptyPath,

    #[error("Record path escapes the partition root: {path}")]
    UnsafePath { path: String },

    #[error("IO error while reading update file: {0}")]
    Io(#[from] io::Error),
}

impl FormatError {
    /// The truncated-input subtype of format errors
    pub fn is_truncated(&self) -> bool {
        matches!(self, Self::Truncated { .. })
    }
}

/// A mount or unmount syscall failed
#[derive(Error, Debug)]
#[error("{op} failed for {}: {source}", target.display())]
pub struct MountError {
    pub op: &'static str,
    pub target: PathBuf,
    #[source]
    pub source: io::Error,
}

impl MountError {
    pub fn new(op: &'static str, target: impl Into<PathBuf>, source: io::Error) -> Self {
        Self {
            op,
            target: target.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("Digest mismatch for {what}: expected {expected}, got {actual}")]
    DigestMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    #[error("Insufficient storage: need {required} bytes, {available} available")]
    InsufficientStorage { required: u64, available: u64 },

    #[error("Mount error: {0}")]
    Mount(#[from] MountError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Lock error: {0}")]
    Lock(#[from] crate::engine::locks::LockError),

    #[error("Journal error: {0}")]
    Journal(#[from] crate::engine::updater::state::StateError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl UpdateError {
    /// Stable short name of the error kind, for reports
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Format(e) if e.is_truncated() => "truncated_input",
            Self::Format(_) => "format",
            Self::DigestMismatch { .. } => "digest_mismatch",
            Self::InsufficientStorage { .. } => "insufficient_storage",
            Self::Mount(_) => "mount",
            Self::Io(_) => "io",
            Self::Lock(_) => "lock",
            Self::Journal(_) => "journal",
            Self::Config(_) => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;

/// A failed run, carrying the phase it failed in
#[derive(Error, Debug)]
#[error("Update failed during {phase}: {source}")]
pub struct DriverError {
    pub phase: crate::engine::updater::state::Phase,
    #[source]
    pub source: UpdateError,
}

impl DriverError {
    pub fn kind(&self) -> &'static str {
        self.source.kind()
    }
}
