use std::collections::HashSet;
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::errors::{BackupError, DiskFailure, Result};
use crate::hypervisor::Hypervisor;
use crate::services::inspector::ChainInspector;
use crate::services::store::validate_domain_name;
use crate::types::{BlockJobHandle, BlockJobState, MergePhase, MergeRequest};

#[derive(Debug)]
pub enum DiskMergeOutcome {
    /// Chain already had a single file; nothing was done.
    AlreadyFlat,
    Merged {
        removed: Vec<PathBuf>,
        /// Old chain files left in place because they could not be proven
        /// unreferenced or could not be deleted
        kept: Vec<PathBuf>,
    },
    Failed(BackupError),
}

impl fmt::Display for DiskMergeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskMergeOutcome::AlreadyFlat => write!(f, "already flat"),
            DiskMergeOutcome::Merged { removed, kept } if kept.is_empty() => {
                write!(f, "merged, removed {} old file(s)", removed.len())
            }
            DiskMergeOutcome::Merged { removed, kept } => write!(
                f,
                "merged, removed {} old file(s), kept {}: {}",
                removed.len(),
                kept.len(),
                kept.iter()
                    .map(|path| path.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            DiskMergeOutcome::Failed(e) => write!(f, "failed ({})", e.kind()),
        }
    }
}

#[derive(Debug)]
pub struct DiskMergeResult {
    pub device: String,
    /// Last phase the disk reached
    pub phase: MergePhase,
    pub outcome: DiskMergeOutcome,
}

#[derive(Debug)]
pub struct MergeReport {
    pub domain: String,
    pub disks: Vec<DiskMergeResult>,
}

impl MergeReport {
    pub fn merged_count(&self) -> usize {
        self.disks
            .iter()
            .filter(|disk| matches!(disk.outcome, DiskMergeOutcome::Merged { .. }))
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &BackupError)> {
        self.disks.iter().filter_map(|disk| match &disk.outcome {
            DiskMergeOutcome::Failed(e) => Some((disk.device.as_str(), e)),
            _ => None,
        })
    }

    /// Turns per-disk failures into a single `DiskFailures` error.
    pub fn into_result(self) -> Result<Self> {
        let failures: Vec<DiskFailure> = self
            .failures()
            .map(|(device, e)| DiskFailure {
                device: device.to_string(),
                kind: e.kind(),
                message: e.to_string(),
            })
            .collect();

        if failures.is_empty() {
            Ok(self)
        } else {
            Err(BackupError::DiskFailures {
                domain: self.domain,
                failures,
            })
        }
    }
}

/// Flattens the backing chain of every disk of a domain into its top file.
///
/// Disks are handled one after another but independently: a failed or
/// timed out block job is recorded for its disk and the next disk proceeds.
/// Chain files of a disk are deleted only after its pivot is verified.
pub async fn execute_merge(hypervisor: &dyn Hypervisor, request: &MergeRequest) -> Result<MergeReport> {
    validate_domain_name(&request.domain)?;
    let domain = request.domain.as_str();
    info!("Starting merge of all disk chains of domain {}", domain);

    let inspector = ChainInspector::new(hypervisor);
    let devices: Vec<String> = hypervisor
        .list_disks(domain)
        .await?
        .into_iter()
        .map(|disk| disk.device)
        .collect();

    let mut disks = Vec::with_capacity(devices.len());
    for device in devices {
        let mut phase = MergePhase::ChainIdentified;
        let outcome = match merge_disk(hypervisor, &inspector, request, &device, &mut phase).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Merge of {}/{} failed in {:?}: {}", domain, device, phase, e);
                DiskMergeOutcome::Failed(e)
            }
        };
        disks.push(DiskMergeResult {
            device,
            phase,
            outcome,
        });
    }

    let report = MergeReport {
        domain: domain.to_string(),
        disks,
    };
    info!(
        "Merge of {} finished: {} merged, {} failed, {} disk(s) total",
        domain,
        report.merged_count(),
        report.failures().count(),
        report.disks.len()
    );
    Ok(report)
}

async fn merge_disk(
    hypervisor: &dyn Hypervisor,
    inspector: &ChainInspector<'_>,
    request: &MergeRequest,
    device: &str,
    phase: &mut MergePhase,
) -> Result<DiskMergeOutcome> {
    let domain = request.domain.as_str();
    let chain = inspector.inspect_disk(domain, device).await?;

    if chain.is_flat() {
        info!("Disk {} is already flat, nothing to merge", device);
        return Ok(DiskMergeOutcome::AlreadyFlat);
    }

    let old_files: Vec<PathBuf> = chain.links[1..].iter().map(|link| link.path.clone()).collect();

    // Step 1: pull the whole chain into the top file
    info!(
        "Step 1: Pulling {} backing file(s) of {} into {}",
        old_files.len(),
        device,
        chain.disk.path.display()
    );
    let job = hypervisor.start_block_pull(domain, device).await?;
    *phase = MergePhase::PullRequested;

    // Step 2: wait for the hypervisor to finish
    *phase = MergePhase::Pulling;
    let state = wait_for_block_job(hypervisor, &job, request.poll_interval, request.max_wait).await?;

    // Step 3: pivot and verify against a fresh chain
    if state == BlockJobState::ReadyForPivot {
        info!("Step 3: Pivoting {} to its flattened top file", device);
        hypervisor.pivot_block_job(&job).await?;
    }
    let merged = inspector.inspect_disk(domain, device).await?;
    if merged.depth() != 1 {
        return Err(BackupError::PivotFailed {
            domain: domain.to_string(),
            device: device.to_string(),
            reason: format!("chain still has {} link(s) after merge", merged.depth()),
        });
    }
    *phase = MergePhase::Pivoted;
    info!("✓ Disk {} now runs on a single file", device);

    // Step 4: remove files no chain of the domain references anymore.
    // The disk itself is merged at this point; nothing below fails it.
    let referenced = referenced_files(hypervisor, inspector, domain).await;
    let mut removed = Vec::new();
    let mut kept = Vec::new();
    for path in old_files {
        match &referenced {
            Some(referenced) if !referenced.contains(&path) => {}
            Some(_) => {
                warn!("Keeping {} since a disk chain still references it", path.display());
                kept.push(path);
                continue;
            }
            None => {
                warn!("Keeping {} since not every disk chain could be read", path.display());
                kept.push(path);
                continue;
            }
        }
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed merged chain file {}", path.display());
                removed.push(path);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Chain file {} already gone", path.display());
            }
            Err(e) => {
                warn!("Could not remove chain file {}: {}", path.display(), e);
                kept.push(path);
            }
        }
    }
    *phase = MergePhase::ChainFilesRemoved;
    info!(
        "Step 4: ✓ Removed {} old chain file(s) of {}, kept {}",
        removed.len(),
        device,
        kept.len()
    );

    Ok(DiskMergeOutcome::Merged { removed, kept })
}

/// Every file in any disk chain of the domain, or `None` when some chain
/// cannot be read and so nothing can be proven unreferenced.
async fn referenced_files(
    hypervisor: &dyn Hypervisor,
    inspector: &ChainInspector<'_>,
    domain: &str,
) -> Option<HashSet<PathBuf>> {
    let disks = match hypervisor.list_disks(domain).await {
        Ok(disks) => disks,
        Err(e) => {
            warn!("Could not list disks of {}: {}", domain, e);
            return None;
        }
    };

    let mut referenced = HashSet::new();
    for disk in disks {
        match inspector.inspect_disk(domain, &disk.device).await {
            Ok(chain) => referenced.extend(chain.links.into_iter().map(|link| link.path)),
            Err(e) => {
                warn!("Could not read chain of {}/{}: {}", domain, disk.device, e);
                return None;
            }
        }
    }
    Some(referenced)
}

/// Polls a block job until it is ready to pivot or has completed on its own.
///
/// The whole wait is bounded by `max_wait`; running out of time yields
/// `BlockJobTimedOut` and leaves the job to the hypervisor.
pub async fn wait_for_block_job(
    hypervisor: &dyn Hypervisor,
    job: &BlockJobHandle,
    poll_interval: Duration,
    max_wait: Duration,
) -> Result<BlockJobState> {
    match timeout(max_wait, poll_until_settled(hypervisor, job, poll_interval)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                "Block job on {}/{} still running after {}s, leaving it to the hypervisor",
                job.domain,
                job.device,
                max_wait.as_secs()
            );
            Err(BackupError::BlockJobTimedOut {
                domain: job.domain.clone(),
                device: job.device.clone(),
                waited_secs: max_wait.as_secs(),
            })
        }
    }
}

async fn poll_until_settled(
    hypervisor: &dyn Hypervisor,
    job: &BlockJobHandle,
    poll_interval: Duration,
) -> Result<BlockJobState> {
    loop {
        let info = hypervisor.poll_block_job(job).await?;
        match info.state {
            BlockJobState::Running => {
                debug!("Block job on {}: {}% done", job.device, info.percent_complete);
                sleep(poll_interval).await;
            }
            BlockJobState::ReadyForPivot | BlockJobState::Completed => {
                info!("Step 2: ✓ Block job on {} reached {:?}", job.device, info.state);
                return Ok(info.state);
            }
            BlockJobState::Failed => {
                return Err(BackupError::BlockJobFailed {
                    domain: job.domain.clone(),
                    device: job.device.clone(),
                    reason: info
                        .message
                        .unwrap_or_else(|| "hypervisor reported the job as failed".to_string()),
                });
            }
        }
    }
}
