//! Error types for snapshot, merge and rotation operations
//!
//! Every variant names the domain, disk device or path it concerns so a
//! failure can be reported without extra context from the caller.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackupError>;

/// One failed disk of a multi-disk operation.
#[derive(Debug, Clone)]
pub struct DiskFailure {
    pub device: String,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Domain '{domain}' not found")]
    DomainNotFound { domain: String },

    #[error("Domain '{domain}' unavailable: {reason}")]
    DomainUnavailable { domain: String, reason: String },

    #[error("Backing chain of {device} is inconsistent at '{}': {reason}", .path.display())]
    ChainInconsistent {
        device: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Consistency violation on {domain}/{device}: {reason}")]
    ConsistencyViolation {
        domain: String,
        device: String,
        reason: String,
    },

    #[error("Snapshot of '{domain}' failed: {reason}")]
    SnapshotFailed { domain: String, reason: String },

    #[error("Copy of '{}' to '{}' incomplete: {reason}", .source_path.display(), .dest_path.display())]
    CopyIncomplete {
        source_path: PathBuf,
        dest_path: PathBuf,
        reason: String,
    },

    #[error(
        "Insufficient space in '{}': {required} bytes required, {available} available",
        .dest_dir.display()
    )]
    InsufficientSpace {
        dest_dir: PathBuf,
        required: u64,
        available: u64,
    },

    #[error("Block job on {domain}/{device} failed: {reason}")]
    BlockJobFailed {
        domain: String,
        device: String,
        reason: String,
    },

    #[error("Block job on {domain}/{device} did not finish within {waited_secs}s")]
    BlockJobTimedOut {
        domain: String,
        device: String,
        waited_secs: u64,
    },

    #[error("Pivot on {domain}/{device} failed: {reason}")]
    PivotFailed {
        domain: String,
        device: String,
        reason: String,
    },

    #[error("Backup set '{}' has no manifest", .set_dir.display())]
    ManifestMissing { set_dir: PathBuf },

    #[error("Manifest '{}' is invalid: {reason}", .path.display())]
    InvalidManifest { path: PathBuf, reason: String },

    #[error("Retention count must be at least 1 (got {retention})")]
    InvalidRetention { retention: usize },

    #[error("Domain '{domain}' is locked by another run ('{}')", .lock_path.display())]
    Locked { domain: String, lock_path: PathBuf },

    #[error("Configuration error: {reason}")]
    Config { reason: String },

    #[error("Command '{program}' failed: {reason}")]
    Command { program: String, reason: String },

    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} disk(s) of '{domain}' failed: {}", .failures.len(), summarize(.failures))]
    DiskFailures {
        domain: String,
        failures: Vec<DiskFailure>,
    },
}

impl BackupError {
    /// Stable name of the error kind, printed on the error stream by the CLI.
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::DomainNotFound { .. } => "DomainNotFound",
            BackupError::DomainUnavailable { .. } => "DomainUnavailable",
            BackupError::ChainInconsistent { .. } => "ChainInconsistent",
            BackupError::ConsistencyViolation { .. } => "ConsistencyViolation",
            BackupError::SnapshotFailed { .. } => "SnapshotFailed",
            BackupError::CopyIncomplete { .. } => "CopyIncomplete",
            BackupError::InsufficientSpace { .. } => "InsufficientSpace",
            BackupError::BlockJobFailed { .. } => "BlockJobFailed",
            BackupError::BlockJobTimedOut { .. } => "BlockJobTimedOut",
            BackupError::PivotFailed { .. } => "PivotFailed",
            BackupError::ManifestMissing { .. } => "ManifestMissing",
            BackupError::InvalidManifest { .. } => "InvalidManifest",
            BackupError::InvalidRetention { .. } => "InvalidRetention",
            BackupError::Locked { .. } => "Locked",
            BackupError::Config { .. } => "Config",
            BackupError::Command { .. } => "Command",
            BackupError::Io { .. } => "Io",
            BackupError::DiskFailures { .. } => "DiskFailures",
        }
    }

    /// True for failures of the block job itself, timeouts included.
    pub fn is_block_job_failure(&self) -> bool {
        matches!(
            self,
            BackupError::BlockJobFailed { .. } | BackupError::BlockJobTimedOut { .. }
        )
    }

    /// Disk device the error concerns, when there is one.
    pub fn device(&self) -> Option<&str> {
        match self {
            BackupError::ChainInconsistent { device, .. }
            | BackupError::ConsistencyViolation { device, .. }
            | BackupError::BlockJobFailed { device, .. }
            | BackupError::BlockJobTimedOut { device, .. }
            | BackupError::PivotFailed { device, .. } => Some(device),
            _ => None,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> BackupError {
        let path = path.into();
        move |source| BackupError::Io { path, source }
    }
}

fn summarize(failures: &[DiskFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({}: {})", f.device, f.kind, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}
