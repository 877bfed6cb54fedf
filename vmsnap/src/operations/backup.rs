use chrono::Local;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::constants::limits::MAX_NAME_SUFFIX;
use crate::constants::naming::{DOMAIN_DEFINITION_FILE, SNAPSHOT_NAME_FORMAT};
use crate::errors::{BackupError, Result};
use crate::hypervisor::Hypervisor;
use crate::services::copier::BackupCopier;
use crate::services::inspector::ChainInspector;
use crate::services::store::{validate_domain_name, BackupStore, Manifest, ManifestDisk};
use crate::types::{
    BackupPhase, BackupRequest, DiskInfo, DomainChains, SnapshotDiskSpec, SnapshotRequest,
};

/// Outcome of a successful backup run.
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub domain: String,
    pub set_name: String,
    pub set_dir: PathBuf,
    pub snapshot_id: String,
    pub disks: Vec<ManifestDisk>,
    pub phase: BackupPhase,
}

struct PhaseTracker<'a> {
    domain: &'a str,
    phase: BackupPhase,
}

impl<'a> PhaseTracker<'a> {
    fn new(domain: &'a str) -> Self {
        Self {
            domain,
            phase: BackupPhase::Idle,
        }
    }

    fn advance(&mut self, next: BackupPhase) {
        if self.phase == BackupPhase::Failed {
            return;
        }
        debug!("Backup of {}: {:?} -> {:?}", self.domain, self.phase, next);
        self.phase = next;
    }
}

/// Snapshots every disk of the domain, copies the frozen backing files into a
/// new backup set, re-validates the chains and seals the set with a manifest.
pub async fn execute_backup(
    hypervisor: &dyn Hypervisor,
    request: &BackupRequest,
) -> Result<BackupReport> {
    validate_domain_name(&request.domain)?;
    info!(
        "Starting incremental backup of domain {} into {}",
        request.domain,
        request.backup_dir.display()
    );

    let mut tracker = PhaseTracker::new(&request.domain);
    let result = run_backup(hypervisor, request, &mut tracker).await;

    match &result {
        Ok(report) => info!(
            "Backup of {} completed: set {} with {} disk file(s)",
            request.domain,
            report.set_name,
            report.disks.len()
        ),
        Err(e) => {
            let failed_in = tracker.phase;
            tracker.advance(BackupPhase::Failed);
            error!(
                "Backup of {} failed after {:?}: {}",
                request.domain, failed_in, e
            );
        }
    }

    result
}

async fn run_backup(
    hypervisor: &dyn Hypervisor,
    request: &BackupRequest,
    tracker: &mut PhaseTracker<'_>,
) -> Result<BackupReport> {
    let domain = request.domain.as_str();
    let inspector = ChainInspector::new(hypervisor);
    let store = BackupStore::new(&request.backup_dir);

    let before = inspector.inspect(domain).await?;
    if before.disks.is_empty() {
        return Err(BackupError::DomainUnavailable {
            domain: domain.to_string(),
            reason: "domain has no file-backed disks".to_string(),
        });
    }
    check_copy_names(domain, &before)?;

    // Step 1: atomic external snapshot of all disks
    let snapshot = plan_snapshot(domain, &before, &store, request.quiesce).await?;
    tracker.advance(BackupPhase::SnapshotRequested);
    info!(
        "Step 1: Requesting external snapshot {} for {} disk(s)",
        snapshot.name,
        snapshot.disks.len()
    );
    let snapshot_id = hypervisor
        .create_external_snapshot(domain, &snapshot)
        .await?;
    tracker.advance(BackupPhase::SnapshotCreated);
    info!("✓ Snapshot {} created", snapshot_id);

    // From here on the snapshot stays; only the backup set is ours to undo.
    let set_dir = store.create_set_dir(domain, &snapshot.name).await?;

    match seal_backup_set(
        hypervisor,
        &inspector,
        &store,
        request,
        &before,
        &snapshot,
        &snapshot_id,
        &set_dir,
        tracker,
    )
    .await
    {
        Ok(disks) => Ok(BackupReport {
            domain: domain.to_string(),
            set_name: snapshot.name.clone(),
            set_dir,
            snapshot_id,
            disks,
            phase: tracker.phase,
        }),
        Err(e) => {
            warn!("Discarding incomplete backup set {}", set_dir.display());
            if let Err(cleanup) = store.discard_set(&set_dir).await {
                error!(
                    "Could not remove incomplete backup set {}: {}",
                    set_dir.display(),
                    cleanup
                );
            }
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn seal_backup_set(
    hypervisor: &dyn Hypervisor,
    inspector: &ChainInspector<'_>,
    store: &BackupStore,
    request: &BackupRequest,
    before: &DomainChains,
    snapshot: &SnapshotRequest,
    snapshot_id: &str,
    set_dir: &Path,
    tracker: &mut PhaseTracker<'_>,
) -> Result<Vec<ManifestDisk>> {
    let domain = request.domain.as_str();
    let copier = BackupCopier::new(request.verify_checksum);

    // Step 2: copy the file each disk was writing to before the snapshot
    let after = inspector.inspect(domain).await?;
    check_same_disks(domain, before, &after)?;

    let mut copied = Vec::with_capacity(snapshot.disks.len());
    for spec in &snapshot.disks {
        let previous = lookup(domain, before, &spec.device)?;
        let chain = lookup(domain, &after, &spec.device)?;

        let top = chain.top().map(|link| link.path.as_path());
        if top != Some(spec.path.as_path()) {
            return Err(violation(
                domain,
                &spec.device,
                format!(
                    "top file is {:?}, expected '{}' after snapshot",
                    top,
                    spec.path.display()
                ),
            ));
        }

        let frozen = chain.frozen().ok_or_else(|| {
            violation(domain, &spec.device, "new top file has no backing file".to_string())
        })?;
        if frozen.path != previous.disk.path {
            return Err(violation(
                domain,
                &spec.device,
                format!(
                    "backing file is '{}', expected previous top '{}'",
                    frozen.path.display(),
                    previous.disk.path.display()
                ),
            ));
        }

        info!(
            "Step 2: Copying frozen file of {} ({})",
            spec.device,
            frozen.path.display()
        );
        let file = copier.copy(&frozen.path, set_dir).await?;
        copied.push(ManifestDisk {
            device: spec.device.clone(),
            format: frozen.format.clone(),
            source_path: frozen.path.clone(),
            file: file_name(&file.path),
            size_bytes: file.size_bytes,
            sha256: file.sha256,
            backing: frozen.backing.clone(),
        });
    }
    tracker.advance(BackupPhase::FilesCopied);
    info!("✓ {} frozen file(s) copied", copied.len());

    if request.save_domain_definition {
        let definition = hypervisor.domain_definition(domain).await?;
        let path = set_dir.join(DOMAIN_DEFINITION_FILE);
        fs::write(&path, definition)
            .await
            .map_err(BackupError::io(&path))?;
        debug!("Saved domain definition to {}", path.display());
    }

    // Step 3: re-read the chains and make sure nothing moved underneath us
    let validated = inspector.inspect(domain).await?;
    check_same_disks(domain, before, &validated)?;
    validate_copies(domain, before, &validated, &copied, set_dir).await?;
    tracker.advance(BackupPhase::Validated);
    info!("Step 3: ✓ Chains re-validated against copied files");

    // Step 4: the manifest marks the set complete
    let manifest = Manifest::new(domain, snapshot_id, copied);
    store.write_manifest(set_dir, &manifest).await?;
    tracker.advance(BackupPhase::Done);
    info!("Step 4: ✓ Manifest written to {}", set_dir.display());

    Ok(manifest.disks)
}

async fn validate_copies(
    domain: &str,
    before: &DomainChains,
    validated: &DomainChains,
    copied: &[ManifestDisk],
    set_dir: &Path,
) -> Result<()> {
    for disk in copied {
        let previous = lookup(domain, before, &disk.device)?;
        let chain = lookup(domain, validated, &disk.device)?;

        if chain.depth() != previous.depth() + 1 {
            return Err(violation(
                domain,
                &disk.device,
                format!(
                    "chain depth is {}, expected {}",
                    chain.depth(),
                    previous.depth() + 1
                ),
            ));
        }

        match chain.frozen() {
            Some(link) if link.path == disk.source_path => {}
            other => {
                return Err(violation(
                    domain,
                    &disk.device,
                    format!(
                        "chain no longer references '{}' behind its top (found {:?})",
                        disk.source_path.display(),
                        other.map(|link| &link.path)
                    ),
                ));
            }
        }

        let copy_path = set_dir.join(&disk.file);
        let copy_size = file_size(&copy_path).await;
        let source_size = file_size(&disk.source_path).await;
        if copy_size != Some(disk.size_bytes) || source_size != Some(disk.size_bytes) {
            return Err(violation(
                domain,
                &disk.device,
                format!(
                    "size drift: copied {} bytes, copy now {:?}, source now {:?}",
                    disk.size_bytes, copy_size, source_size
                ),
            ));
        }
    }
    Ok(())
}

/// Picks a snapshot name whose new top files and set directory are all free.
async fn plan_snapshot(
    domain: &str,
    chains: &DomainChains,
    store: &BackupStore,
    quiesce: bool,
) -> Result<SnapshotRequest> {
    let base = Local::now().format(SNAPSHOT_NAME_FORMAT).to_string();

    for attempt in 0..MAX_NAME_SUFFIX {
        let name = if attempt == 0 {
            base.clone()
        } else {
            format!("{}-{}", base, attempt)
        };

        let disks: Vec<SnapshotDiskSpec> = chains
            .disks
            .iter()
            .map(|chain| SnapshotDiskSpec {
                device: chain.disk.device.clone(),
                path: new_top_path(domain, &chain.disk, &name),
            })
            .collect();

        let mut taken = path_exists(&store.set_dir(domain, &name)).await;
        for spec in &disks {
            taken = taken || path_exists(&spec.path).await;
        }

        if !taken {
            return Ok(SnapshotRequest {
                name,
                disks,
                quiesce,
            });
        }
        debug!("Snapshot name {} already in use", name);
    }

    Err(BackupError::SnapshotFailed {
        domain: domain.to_string(),
        reason: format!("no free snapshot name derived from {}", base),
    })
}

/// New top file beside the current one: `<domain>_<device>-<snapshot>.<format>`.
pub fn new_top_path(domain: &str, disk: &DiskInfo, snapshot_name: &str) -> PathBuf {
    let dir = disk.path.parent().unwrap_or_else(|| Path::new("/"));
    dir.join(format!(
        "{}_{}-{}.{}",
        domain, disk.device, snapshot_name, disk.format
    ))
}

/// Copies land in one directory under their own names, so two disks whose
/// current files share a name cannot be backed up together.
fn check_copy_names(domain: &str, chains: &DomainChains) -> Result<()> {
    let mut seen = HashSet::new();
    for chain in &chains.disks {
        let name = file_name(&chain.disk.path);
        if !seen.insert(name.clone()) {
            return Err(violation(
                domain,
                chain.device(),
                format!("another disk already uses file name '{}'", name),
            ));
        }
    }
    Ok(())
}

fn check_same_disks(domain: &str, before: &DomainChains, now: &DomainChains) -> Result<()> {
    for chain in &before.disks {
        if now.get(chain.device()).is_none() {
            return Err(violation(
                domain,
                chain.device(),
                "disk disappeared during backup".to_string(),
            ));
        }
    }
    for chain in &now.disks {
        if before.get(chain.device()).is_none() {
            return Err(violation(
                domain,
                chain.device(),
                "disk attached during backup".to_string(),
            ));
        }
    }
    Ok(())
}

fn lookup<'c>(
    domain: &str,
    chains: &'c DomainChains,
    device: &str,
) -> Result<&'c crate::types::DiskChain> {
    chains.get(device).ok_or_else(|| {
        violation(domain, device, "disk disappeared during backup".to_string())
    })
}

fn violation(domain: &str, device: &str, reason: String) -> BackupError {
    BackupError::ConsistencyViolation {
        domain: domain.to_string(),
        device: device.to_string(),
        reason,
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

async fn path_exists(path: &Path) -> bool {
    fs::metadata(path).await.is_ok()
}

async fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).await.ok().map(|meta| meta.len())
}
