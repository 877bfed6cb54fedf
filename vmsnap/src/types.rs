use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// === HYPERVISOR-REPORTED STATE ===

/// One file-backed disk of a domain as the hypervisor reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInfo {
    pub device: String,
    pub path: PathBuf,
    pub format: String,
}

/// Pointer from an image to the image it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackingRef {
    pub path: PathBuf,
    pub format: String,
}

/// One node of a backing chain. Plain value, no links to other nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLink {
    pub path: PathBuf,
    pub format: String,
    pub backing: Option<BackingRef>,
}

/// A disk and its backing chain ordered top -> base.
#[derive(Debug, Clone)]
pub struct DiskChain {
    pub disk: DiskInfo,
    pub links: Vec<ChainLink>,
}

impl DiskChain {
    pub fn device(&self) -> &str {
        &self.disk.device
    }

    pub fn depth(&self) -> usize {
        self.links.len()
    }

    pub fn is_flat(&self) -> bool {
        self.links.len() <= 1
    }

    pub fn top(&self) -> Option<&ChainLink> {
        self.links.first()
    }

    pub fn base(&self) -> Option<&ChainLink> {
        self.links.last()
    }

    /// The link right behind the top, i.e. the file frozen by the last snapshot.
    pub fn frozen(&self) -> Option<&ChainLink> {
        self.links.get(1)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.links.iter().any(|link| link.path == path)
    }
}

/// Fresh view of every disk chain of a domain.
#[derive(Debug, Clone)]
pub struct DomainChains {
    pub domain: String,
    pub disks: Vec<DiskChain>,
}

impl DomainChains {
    pub fn get(&self, device: &str) -> Option<&DiskChain> {
        self.disks.iter().find(|chain| chain.device() == device)
    }
}

// === SNAPSHOTS AND BLOCK JOBS ===

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDiskSpec {
    pub device: String,
    pub path: PathBuf,
}

/// External, disk-only snapshot covering every listed disk atomically.
#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub name: String,
    pub disks: Vec<SnapshotDiskSpec>,
    pub quiesce: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockJobHandle {
    pub domain: String,
    pub device: String,
    pub top_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockJobState {
    Running,
    ReadyForPivot,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockJobInfo {
    pub state: BlockJobState,
    pub percent_complete: u8,
    pub message: Option<String>,
}

impl BlockJobInfo {
    pub fn running(percent_complete: u8) -> Self {
        Self {
            state: BlockJobState::Running,
            percent_complete,
            message: None,
        }
    }

    pub fn ready() -> Self {
        Self {
            state: BlockJobState::ReadyForPivot,
            percent_complete: 100,
            message: None,
        }
    }

    pub fn completed() -> Self {
        Self {
            state: BlockJobState::Completed,
            percent_complete: 100,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: BlockJobState::Failed,
            percent_complete: 0,
            message: Some(message.into()),
        }
    }
}

// === REQUEST STRUCTURES ===

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub domain: String,
    pub backup_dir: PathBuf,
    pub verify_checksum: bool,
    pub quiesce: bool,
    pub save_domain_definition: bool,
}

#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub domain: String,
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

#[derive(Debug, Clone)]
pub struct RotateRequest {
    pub domain: String,
    pub backup_dir: PathBuf,
    pub retention: usize,
}

#[derive(Debug, Clone)]
pub struct ListRequest {
    pub domain: String,
    pub backup_dir: PathBuf,
}

// === OPERATION STATE ===

/// Linear progress of a backup run; `Failed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPhase {
    Idle,
    SnapshotRequested,
    SnapshotCreated,
    FilesCopied,
    Validated,
    Done,
    Failed,
}

/// Per-disk progress of a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePhase {
    ChainIdentified,
    PullRequested,
    Pulling,
    Pivoted,
    ChainFilesRemoved,
}
