use chrono::{DateTime, Utc};
use std::path::PathBuf;

use crate::errors::Result;
use crate::services::store::{validate_domain_name, BackupStore};
use crate::types::ListRequest;

/// One backup set as shown by `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSetSummary {
    pub name: String,
    pub dir: PathBuf,
    pub complete: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub disks: Vec<String>,
    pub total_bytes: u64,
}

impl BackupSetSummary {
    pub fn describe(&self) -> String {
        let created = self
            .created_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{:<24} {:<10} {:<23} {:>8.1} MB  {}",
            self.name,
            if self.complete { "complete" } else { "incomplete" },
            created,
            self.total_bytes as f64 / 1024.0 / 1024.0,
            self.disks.join(",")
        )
    }
}

/// Backup sets of a domain, newest first. Does not touch the hypervisor.
pub async fn execute_list(request: &ListRequest) -> Result<Vec<BackupSetSummary>> {
    validate_domain_name(&request.domain)?;
    let store = BackupStore::new(&request.backup_dir);

    let sets = store.list_sets(&request.domain).await?;
    Ok(sets
        .into_iter()
        .map(|set| {
            let complete = set.is_complete();
            let created_at = set.created_at();
            let (disks, total_bytes) = set
                .manifest
                .map(|manifest| {
                    let total = manifest.disks.iter().map(|disk| disk.size_bytes).sum::<u64>();
                    let devices = manifest.disks.into_iter().map(|disk| disk.device).collect::<Vec<_>>();
                    (devices, total)
                })
                .unwrap_or_default();
            BackupSetSummary {
                name: set.name,
                dir: set.dir,
                complete,
                created_at,
                disks,
                total_bytes,
            }
        })
        .collect())
}
