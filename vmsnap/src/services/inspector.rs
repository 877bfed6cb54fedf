//! Backing chain inspection
//!
//! Walks each disk's chain from the top file down to its base using the
//! hypervisor's image introspection. Nothing is cached: every call re-reads
//! the chain, since the hypervisor may switch top files between calls.

use std::collections::HashSet;
use tokio::fs;
use tracing::debug;

use crate::constants::limits::MAX_CHAIN_DEPTH;
use crate::errors::{BackupError, Result};
use crate::hypervisor::Hypervisor;
use crate::types::{BackingRef, ChainLink, DiskChain, DiskInfo, DomainChains};

pub struct ChainInspector<'a> {
    hypervisor: &'a dyn Hypervisor,
}

impl<'a> ChainInspector<'a> {
    pub fn new(hypervisor: &'a dyn Hypervisor) -> Self {
        Self { hypervisor }
    }

    /// Chains of every disk of `domain`, in the order the hypervisor lists them.
    pub async fn inspect(&self, domain: &str) -> Result<DomainChains> {
        let disks = self.hypervisor.list_disks(domain).await?;

        let mut chains = Vec::with_capacity(disks.len());
        for disk in disks {
            chains.push(self.walk(disk).await?);
        }

        Ok(DomainChains {
            domain: domain.to_string(),
            disks: chains,
        })
    }

    /// Chain of a single disk; a detached disk is `DomainUnavailable`.
    pub async fn inspect_disk(&self, domain: &str, device: &str) -> Result<DiskChain> {
        let disk = self
            .hypervisor
            .list_disks(domain)
            .await?
            .into_iter()
            .find(|disk| disk.device == device)
            .ok_or_else(|| BackupError::DomainUnavailable {
                domain: domain.to_string(),
                reason: format!("disk {} is no longer attached", device),
            })?;

        self.walk(disk).await
    }

    async fn walk(&self, disk: DiskInfo) -> Result<DiskChain> {
        let mut links = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(BackingRef {
            path: disk.path.clone(),
            format: disk.format.clone(),
        });

        while let Some(current) = next {
            if !visited.insert(current.path.clone()) {
                return Err(BackupError::ChainInconsistent {
                    device: disk.device.clone(),
                    path: current.path,
                    reason: "backing chain loops back on itself".to_string(),
                });
            }

            if links.len() >= MAX_CHAIN_DEPTH {
                return Err(BackupError::ChainInconsistent {
                    device: disk.device.clone(),
                    path: current.path,
                    reason: format!("chain is deeper than {} links", MAX_CHAIN_DEPTH),
                });
            }

            match fs::metadata(&current.path).await {
                Ok(meta) if meta.is_file() => {}
                Ok(_) => {
                    return Err(BackupError::ChainInconsistent {
                        device: disk.device.clone(),
                        path: current.path,
                        reason: "chain entry is not a regular file".to_string(),
                    });
                }
                Err(e) => {
                    return Err(BackupError::ChainInconsistent {
                        device: disk.device.clone(),
                        path: current.path,
                        reason: format!("file does not resolve: {}", e),
                    });
                }
            }

            let backing = self.hypervisor.get_backing_file(&current.path).await?;
            next = backing.clone();
            links.push(ChainLink {
                path: current.path,
                format: current.format,
                backing,
            });
        }

        debug!(
            "Disk {} chain has {} link(s): {}",
            disk.device,
            links.len(),
            links
                .iter()
                .map(|link| link.path.display().to_string())
                .collect::<Vec<_>>()
                .join(" -> ")
        );

        Ok(DiskChain { disk, links })
    }
}
