use std::path::PathBuf;
use tracing::{info, warn};

use crate::errors::{BackupError, Result};
use crate::hypervisor::Hypervisor;
use crate::services::store::{validate_domain_name, BackupStore};
use crate::types::RotateRequest;

#[derive(Debug, Clone, Default)]
pub struct RotateReport {
    /// Complete sets that were kept, newest first
    pub kept: Vec<String>,
    pub removed: Vec<String>,
    /// Sets without a complete manifest; never counted, never deleted
    pub skipped: Vec<String>,
}

/// Keeps the `retention` newest complete backup sets of a domain and deletes
/// every older complete set.
pub async fn execute_rotation(hypervisor: &dyn Hypervisor, request: &RotateRequest) -> Result<RotateReport> {
    if request.retention == 0 {
        return Err(BackupError::InvalidRetention {
            retention: request.retention,
        });
    }
    validate_domain_name(&request.domain)?;

    // Fails with DomainNotFound for names the hypervisor does not know.
    hypervisor.list_disks(&request.domain).await?;

    let store = BackupStore::new(&request.backup_dir);
    let sets = store.list_sets(&request.domain).await?;

    let mut report = RotateReport::default();
    let mut doomed: Vec<(String, PathBuf)> = Vec::new();
    for set in sets {
        if !set.is_complete() {
            info!("Skipping incomplete backup set {}", set.name);
            report.skipped.push(set.name);
        } else if report.kept.len() < request.retention {
            report.kept.push(set.name);
        } else {
            doomed.push((set.name, set.dir));
        }
    }

    if doomed.is_empty() {
        info!(
            "No old backup sets to rotate for {} (have {}, keeping {})",
            request.domain,
            report.kept.len(),
            request.retention
        );
        return Ok(report);
    }

    info!(
        "Rotating {} old backup set(s) of {} (keeping {} most recent)",
        doomed.len(),
        request.domain,
        request.retention
    );

    let mut first_error = None;
    for (name, dir) in doomed {
        match store.discard_set(&dir).await {
            Ok(()) => {
                info!("Deleted backup set {}", dir.display());
                report.removed.push(name);
            }
            Err(e) => {
                warn!("Failed to delete backup set {}: {}", dir.display(), e);
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(report),
    }
}
