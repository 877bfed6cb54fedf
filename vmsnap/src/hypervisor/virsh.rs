//! Hypervisor binding that drives libvirt through `virsh` and inspects
//! images with `qemu-img`.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::Hypervisor;
use crate::config::HypervisorConfig;
use crate::errors::{BackupError, Result};
use crate::services::commands::{execute_checked, execute_command};
use crate::types::{BackingRef, BlockJobHandle, BlockJobInfo, DiskInfo, SnapshotRequest};

pub struct VirshHypervisor {
    uri: String,
    virsh: String,
    qemu_img: String,
}

/// Format and backing pointer of one image, as `qemu-img info` reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: String,
    pub backing_path: Option<PathBuf>,
    pub backing_format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawImageInfo {
    format: String,
    #[serde(rename = "backing-filename")]
    backing_filename: Option<String>,
    #[serde(rename = "full-backing-filename")]
    full_backing_filename: Option<String>,
    #[serde(rename = "backing-filename-format")]
    backing_filename_format: Option<String>,
}

impl VirshHypervisor {
    pub fn new(config: &HypervisorConfig) -> Self {
        Self {
            uri: config.uri.clone(),
            virsh: config.virsh_binary.clone(),
            qemu_img: config.qemu_img_binary.clone(),
        }
    }

    fn virsh_args(&self, args: &[&str]) -> Vec<String> {
        let mut full = vec!["-c".to_string(), self.uri.clone()];
        full.extend(args.iter().map(|arg| arg.to_string()));
        full
    }

    async fn image_info(&self, path: &Path) -> Result<ImageInfo> {
        let args = vec![
            "info".to_string(),
            "--output=json".to_string(),
            "-U".to_string(),
            path.to_string_lossy().to_string(),
        ];
        let json = execute_checked(&self.qemu_img, &args).await?;
        parse_image_info(&json, path)
    }

    async fn find_disk(&self, domain: &str, device: &str) -> Result<DiskInfo> {
        self.list_disks(domain)
            .await?
            .into_iter()
            .find(|disk| disk.device == device)
            .ok_or_else(|| BackupError::DomainUnavailable {
                domain: domain.to_string(),
                reason: format!("disk {} is not attached", device),
            })
    }

    /// Progress of the job currently running on `device`, `None` when there is none.
    async fn block_job_progress(&self, job: &BlockJobHandle) -> Result<Option<u8>> {
        let output = execute_command(
            &self.virsh,
            &self.virsh_args(&["blockjob", job.domain.as_str(), job.device.as_str(), "--info"]),
        )
        .await?;

        if !output.success {
            return Err(BackupError::BlockJobFailed {
                domain: job.domain.clone(),
                device: job.device.clone(),
                reason: output.error_text(),
            });
        }

        Ok(parse_block_job_progress(&output.stdout))
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn list_disks(&self, domain: &str) -> Result<Vec<DiskInfo>> {
        let output = execute_command(
            &self.virsh,
            &self.virsh_args(&["domblklist", domain, "--details"]),
        )
        .await?;

        if !output.success {
            return Err(classify_domain_error(domain, &output.error_text()));
        }

        let mut disks = Vec::new();
        for (device, path) in parse_domblklist(&output.stdout) {
            let info = self.image_info(&path).await?;
            disks.push(DiskInfo {
                device,
                path,
                format: info.format,
            });
        }

        debug!("Domain {} has {} file-backed disks", domain, disks.len());
        Ok(disks)
    }

    async fn get_backing_file(&self, path: &Path) -> Result<Option<BackingRef>> {
        let info = self.image_info(path).await?;
        let Some(backing_path) = info.backing_path else {
            return Ok(None);
        };

        let format = match info.backing_format {
            Some(format) => format,
            None => self.image_info(&backing_path).await?.format,
        };

        Ok(Some(BackingRef {
            path: backing_path,
            format,
        }))
    }

    async fn create_external_snapshot(
        &self,
        domain: &str,
        request: &SnapshotRequest,
    ) -> Result<String> {
        let mut args = self.virsh_args(&[
            "snapshot-create-as",
            "--domain",
            domain,
            "--name",
            request.name.as_str(),
        ]);
        for spec in &request.disks {
            args.push("--diskspec".to_string());
            args.push(format!(
                "{},snapshot=external,file={}",
                spec.device,
                escape_diskspec_value(&spec.path.to_string_lossy())
            ));
        }
        args.extend(
            ["--disk-only", "--atomic", "--no-metadata"]
                .iter()
                .map(|arg| arg.to_string()),
        );
        if request.quiesce {
            args.push("--quiesce".to_string());
        }

        info!(
            "Creating external snapshot {} of {} ({} disks)",
            request.name,
            domain,
            request.disks.len()
        );

        let output = execute_command(&self.virsh, &args).await?;
        if !output.success {
            return Err(BackupError::SnapshotFailed {
                domain: domain.to_string(),
                reason: output.error_text(),
            });
        }

        Ok(request.name.clone())
    }

    async fn start_block_pull(&self, domain: &str, device: &str) -> Result<BlockJobHandle> {
        let disk = self.find_disk(domain, device).await?;

        let output = execute_command(&self.virsh, &self.virsh_args(&["blockpull", domain, device]))
            .await?;
        if !output.success {
            return Err(BackupError::BlockJobFailed {
                domain: domain.to_string(),
                device: device.to_string(),
                reason: output.error_text(),
            });
        }

        Ok(BlockJobHandle {
            domain: domain.to_string(),
            device: device.to_string(),
            top_path: disk.path,
        })
    }

    async fn poll_block_job(&self, job: &BlockJobHandle) -> Result<BlockJobInfo> {
        match self.block_job_progress(job).await? {
            // libvirt finalizes a pull by itself; 100 % only means it is about to.
            Some(percent) => Ok(BlockJobInfo::running(percent)),
            // A pull job disappears once it has finished; whether it succeeded
            // shows in the top file's backing pointer.
            None => match self.get_backing_file(&job.top_path).await? {
                None => Ok(BlockJobInfo::completed()),
                Some(backing) => Ok(BlockJobInfo::failed(format!(
                    "job ended but '{}' still has backing file '{}'",
                    job.top_path.display(),
                    backing.path.display()
                ))),
            },
        }
    }

    async fn pivot_block_job(&self, job: &BlockJobHandle) -> Result<()> {
        if self.block_job_progress(job).await?.is_none() {
            debug!("No job left on {}/{}, nothing to pivot", job.domain, job.device);
            return Ok(());
        }

        let output = execute_command(
            &self.virsh,
            &self.virsh_args(&["blockjob", job.domain.as_str(), job.device.as_str(), "--pivot"]),
        )
        .await?;
        if !output.success {
            return Err(BackupError::PivotFailed {
                domain: job.domain.clone(),
                device: job.device.clone(),
                reason: output.error_text(),
            });
        }
        Ok(())
    }

    async fn domain_definition(&self, domain: &str) -> Result<String> {
        let output = execute_command(&self.virsh, &self.virsh_args(&["dumpxml", domain])).await?;
        if !output.success {
            return Err(classify_domain_error(domain, &output.error_text()));
        }
        Ok(output.stdout)
    }
}

fn classify_domain_error(domain: &str, message: &str) -> BackupError {
    let lower = message.to_lowercase();
    if lower.contains("failed to get domain")
        || lower.contains("domain not found")
        || lower.contains("no domain with matching name")
    {
        BackupError::DomainNotFound {
            domain: domain.to_string(),
        }
    } else {
        BackupError::DomainUnavailable {
            domain: domain.to_string(),
            reason: message.to_string(),
        }
    }
}

/// Commas separate diskspec fields; virsh expects literal ones doubled.
fn escape_diskspec_value(value: &str) -> String {
    value.replace(',', ",,")
}

/// Extracts `(target, source)` for file-backed disks from `domblklist --details`.
pub fn parse_domblklist(output: &str) -> Vec<(String, PathBuf)> {
    output
        .lines()
        .filter_map(|line| {
            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns.len() < 4 {
                return None;
            }
            let (kind, device, target) = (columns[0], columns[1], columns[2]);
            let source = columns[3..].join(" ");
            if kind != "file" || device != "disk" || source == "-" {
                return None;
            }
            Some((target.to_string(), PathBuf::from(source)))
        })
        .collect()
}

/// Parses `qemu-img info --output=json`, resolving relative backing names
/// against the image's own directory.
pub fn parse_image_info(json: &str, image: &Path) -> Result<ImageInfo> {
    let raw: RawImageInfo = serde_json::from_str(json).map_err(|e| BackupError::Command {
        program: "qemu-img".to_string(),
        reason: format!("unexpected info output for '{}': {}", image.display(), e),
    })?;

    let backing_path = raw
        .full_backing_filename
        .or(raw.backing_filename)
        .filter(|name| !name.is_empty())
        .map(|name| {
            let path = PathBuf::from(&name);
            if path.is_relative() {
                image.parent().unwrap_or_else(|| Path::new("/")).join(path)
            } else {
                path
            }
        });

    Ok(ImageInfo {
        format: raw.format,
        backing_path,
        backing_format: raw.backing_filename_format,
    })
}

/// Percentage from `blockjob --info` output such as `Block Pull: [ 45 %]`.
pub fn parse_block_job_progress(output: &str) -> Option<u8> {
    output.lines().find_map(|line| {
        let start = line.find('[')?;
        let end = line[start..].find('%')? + start;
        let value: f64 = line[start + 1..end].trim().parse().ok()?;
        Some(value.clamp(0.0, 100.0) as u8)
    })
}
