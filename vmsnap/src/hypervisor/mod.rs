//! Capability interface to the hypervisor
//!
//! The snapshot and block-job machinery belongs to the hypervisor. The
//! operations only ever reach it through this trait, which keeps them
//! testable against an in-memory implementation.

pub mod virsh;

use async_trait::async_trait;
use std::path::Path;

use crate::errors::Result;
use crate::types::{BackingRef, BlockJobHandle, BlockJobInfo, DiskInfo, SnapshotRequest};

pub use virsh::VirshHypervisor;

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// File-backed disks of the domain; fails with `DomainNotFound`.
    async fn list_disks(&self, domain: &str) -> Result<Vec<DiskInfo>>;

    /// Backing pointer embedded in the image at `path`, `None` for a base image.
    async fn get_backing_file(&self, path: &Path) -> Result<Option<BackingRef>>;

    /// Creates an external disk-only snapshot without persisted metadata.
    ///
    /// Must be atomic across every disk in `request`; any failure is reported
    /// as `SnapshotFailed` and leaves no disk switched to a new top file.
    async fn create_external_snapshot(&self, domain: &str, request: &SnapshotRequest)
        -> Result<String>;

    /// Starts a live pull of the full backing chain into the disk's top file.
    async fn start_block_pull(&self, domain: &str, device: &str) -> Result<BlockJobHandle>;

    async fn poll_block_job(&self, job: &BlockJobHandle) -> Result<BlockJobInfo>;

    /// Finalizes a job that reported `ReadyForPivot`; fails with `PivotFailed`.
    async fn pivot_block_job(&self, job: &BlockJobHandle) -> Result<()>;

    /// Domain definition document, saved alongside each backup set.
    async fn domain_definition(&self, domain: &str) -> Result<String>;
}
