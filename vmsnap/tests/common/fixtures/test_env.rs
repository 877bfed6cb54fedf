//! Temporary domain environments
//!
//! Each environment owns a temp directory with an `images/` directory for
//! the disk chains and a `backups/` directory used as the backup store root.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

use vmsnap::types::{BackupRequest, DiskInfo, ListRequest, MergeRequest, RotateRequest};

use super::FakeHypervisor;

pub const DOMAIN: &str = "web";

pub struct TestEnv {
    pub dir: TempDir,
    pub images: PathBuf,
    pub backups: PathBuf,
    pub hypervisor: FakeHypervisor,
}

impl TestEnv {
    /// Domain `DOMAIN` with one flat qcow2 base image per device.
    pub fn with_disks(devices: &[&str]) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let images = dir.path().join("images");
        let backups = dir.path().join("backups");
        fs::create_dir_all(&images).expect("Failed to create images dir");
        fs::create_dir_all(&backups).expect("Failed to create backups dir");

        let hypervisor = FakeHypervisor::new();
        let disks = devices
            .iter()
            .map(|device| {
                let path = images.join(format!("{}-{}.qcow2", DOMAIN, device));
                fs::write(&path, format!("base image of {}", device).repeat(64)).unwrap();
                DiskInfo {
                    device: device.to_string(),
                    path,
                    format: "qcow2".to_string(),
                }
            })
            .collect();
        hypervisor.add_domain(DOMAIN, disks);

        Self {
            dir,
            images,
            backups,
            hypervisor,
        }
    }

    pub fn backup_request(&self) -> BackupRequest {
        BackupRequest {
            domain: DOMAIN.to_string(),
            backup_dir: self.backups.clone(),
            verify_checksum: true,
            quiesce: false,
            save_domain_definition: true,
        }
    }

    pub fn merge_request(&self) -> MergeRequest {
        MergeRequest {
            domain: DOMAIN.to_string(),
            poll_interval: Duration::from_millis(5),
            max_wait: Duration::from_secs(5),
        }
    }

    pub fn rotate_request(&self, retention: usize) -> RotateRequest {
        RotateRequest {
            domain: DOMAIN.to_string(),
            backup_dir: self.backups.clone(),
            retention,
        }
    }

    pub fn list_request(&self) -> ListRequest {
        ListRequest {
            domain: DOMAIN.to_string(),
            backup_dir: self.backups.clone(),
        }
    }

    pub fn base_image(&self, device: &str) -> PathBuf {
        self.images.join(format!("{}-{}.qcow2", DOMAIN, device))
    }

    pub fn domain_backup_dir(&self) -> PathBuf {
        self.backups.join(DOMAIN)
    }

    /// Set directories currently present for `DOMAIN`, sorted by name.
    pub fn set_dirs(&self) -> Vec<PathBuf> {
        subdirs(&self.domain_backup_dir())
    }
}

pub fn subdirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    dirs
}

/// Regular files directly inside `dir`, by file name.
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.is_file())
        .map(|path| path.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}
