pub mod manager;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::defaults;
use crate::errors::{BackupError, Result};

pub use manager::ConfigManager;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub hypervisor: HypervisorConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub rotate: RotateConfig,
    /// Directory holding the per-domain lock files
    pub lock_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HypervisorConfig {
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default = "default_virsh_binary")]
    pub virsh_binary: String,
    #[serde(default = "default_qemu_img_binary")]
    pub qemu_img_binary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupConfig {
    #[serde(default = "default_true")]
    pub verify_checksum: bool,
    #[serde(default)]
    pub quiesce: bool,
    #[serde(default = "default_true")]
    pub save_domain_definition: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_max_wait")]
    pub max_wait_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RotateConfig {
    #[serde(default = "default_retention")]
    pub retention: usize,
}

fn default_uri() -> String {
    defaults::HYPERVISOR_URI.to_string()
}

fn default_virsh_binary() -> String {
    defaults::VIRSH_BINARY.to_string()
}

fn default_qemu_img_binary() -> String {
    defaults::QEMU_IMG_BINARY.to_string()
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    defaults::POLL_INTERVAL_SECONDS
}

fn default_max_wait() -> u64 {
    defaults::MAX_WAIT_SECONDS
}

fn default_retention() -> usize {
    defaults::RETENTION
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            virsh_binary: default_virsh_binary(),
            qemu_img_binary: default_qemu_img_binary(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            verify_checksum: true,
            quiesce: false,
            save_domain_definition: true,
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            max_wait_seconds: default_max_wait(),
        }
    }
}

impl Default for RotateConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
        }
    }
}

impl MergeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_seconds)
    }
}

impl Config {
    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rotate.retention < 1 {
            return Err(BackupError::InvalidRetention {
                retention: self.rotate.retention,
            });
        }
        if self.merge.poll_interval_seconds == 0 {
            return Err(BackupError::Config {
                reason: "merge.poll_interval_seconds must be greater than 0".to_string(),
            });
        }
        if self.merge.max_wait_seconds < self.merge.poll_interval_seconds {
            return Err(BackupError::Config {
                reason: format!(
                    "merge.max_wait_seconds ({}) is shorter than merge.poll_interval_seconds ({})",
                    self.merge.max_wait_seconds, self.merge.poll_interval_seconds
                ),
            });
        }
        for (field, value) in [
            ("hypervisor.uri", &self.hypervisor.uri),
            ("hypervisor.virsh_binary", &self.hypervisor.virsh_binary),
            ("hypervisor.qemu_img_binary", &self.hypervisor.qemu_img_binary),
        ] {
            if value.trim().is_empty() {
                return Err(BackupError::Config {
                    reason: format!("{} must not be empty", field),
                });
            }
        }
        Ok(())
    }
}
