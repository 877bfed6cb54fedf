//! Backup store layout
//!
//! `<root>/<domain>/<set>/` holds one copied file per disk, the domain
//! definition and `manifest.json`. A set is complete only once its manifest
//! exists and says so; the manifest is always the last file written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::constants::naming::{MANIFEST_FILE, MANIFEST_FORMAT_VERSION, MANIFEST_TMP_FILE};
use crate::errors::{BackupError, Result};
use crate::types::BackingRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetStatus {
    Complete,
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDisk {
    pub device: String,
    pub format: String,
    /// Live chain file the copy was taken from
    pub source_path: PathBuf,
    /// File name of the copy inside the set directory
    pub file: String,
    pub size_bytes: u64,
    pub sha256: Option<String>,
    /// Backing pointer of the copied file at copy time
    pub backing: Option<BackingRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub domain: String,
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub status: SetStatus,
    pub disks: Vec<ManifestDisk>,
}

impl Manifest {
    pub fn new(domain: &str, snapshot_id: &str, disks: Vec<ManifestDisk>) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            domain: domain.to_string(),
            snapshot_id: snapshot_id.to_string(),
            created_at: Utc::now(),
            status: SetStatus::Complete,
            disks,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == SetStatus::Complete
    }
}

/// One set directory found in the store.
#[derive(Debug, Clone)]
pub struct BackupSetEntry {
    pub name: String,
    pub dir: PathBuf,
    /// `None` when the manifest is missing or unreadable
    pub manifest: Option<Manifest>,
}

impl BackupSetEntry {
    pub fn is_complete(&self) -> bool {
        self.manifest.as_ref().is_some_and(Manifest::is_complete)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.manifest.as_ref().map(|manifest| manifest.created_at)
    }
}

/// Newest first: by manifest creation time, then by name. Sets without a
/// manifest sort after every set that has one.
pub fn newest_first(a: &BackupSetEntry, b: &BackupSetEntry) -> Ordering {
    match (a.created_at(), b.created_at()) {
        (Some(x), Some(y)) => y.cmp(&x).then_with(|| b.name.cmp(&a.name)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.name.cmp(&a.name),
    }
}

/// Domain names become directory names; reject anything that would escape
/// the store root.
pub fn validate_domain_name(domain: &str) -> Result<()> {
    if domain.is_empty() || domain == "." || domain == ".." || domain.contains(['/', '\\', '\0']) {
        return Err(BackupError::Config {
            reason: format!("'{}' is not a usable domain name", domain),
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn domain_dir(&self, domain: &str) -> PathBuf {
        self.root.join(domain)
    }

    pub fn set_dir(&self, domain: &str, name: &str) -> PathBuf {
        self.domain_dir(domain).join(name)
    }

    /// Creates a new, empty set directory; fails if it already exists.
    pub async fn create_set_dir(&self, domain: &str, name: &str) -> Result<PathBuf> {
        let domain_dir = self.domain_dir(domain);
        fs::create_dir_all(&domain_dir)
            .await
            .map_err(BackupError::io(&domain_dir))?;

        let dir = domain_dir.join(name);
        fs::create_dir(&dir).await.map_err(BackupError::io(&dir))?;
        debug!("Created backup set directory {}", dir.display());
        Ok(dir)
    }

    /// Writes the manifest through a temporary file and a rename, so a
    /// reader sees either no manifest or a whole one.
    pub async fn write_manifest(&self, set_dir: &Path, manifest: &Manifest) -> Result<()> {
        let tmp = set_dir.join(MANIFEST_TMP_FILE);
        let path = set_dir.join(MANIFEST_FILE);

        let body = serde_json::to_vec_pretty(manifest).map_err(|e| BackupError::InvalidManifest {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        fs::write(&tmp, body).await.map_err(BackupError::io(&tmp))?;
        fs::rename(&tmp, &path).await.map_err(BackupError::io(&path))?;
        Ok(())
    }

    pub async fn load_manifest(&self, set_dir: &Path) -> Result<Manifest> {
        let path = set_dir.join(MANIFEST_FILE);
        let body = match fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BackupError::ManifestMissing {
                    set_dir: set_dir.to_path_buf(),
                });
            }
            Err(e) => return Err(BackupError::Io { path, source: e }),
        };

        serde_json::from_slice(&body).map_err(|e| BackupError::InvalidManifest {
            path,
            reason: e.to_string(),
        })
    }

    /// Every set directory of `domain`, newest first. A domain without a
    /// directory has no sets.
    pub async fn list_sets(&self, domain: &str) -> Result<Vec<BackupSetEntry>> {
        let domain_dir = self.domain_dir(domain);
        if fs::metadata(&domain_dir).await.is_err() {
            return Ok(Vec::new());
        }

        let pattern = format!(
            "{}/*",
            glob::Pattern::escape(&domain_dir.to_string_lossy())
        );
        let paths = glob::glob(&pattern).map_err(|e| BackupError::Config {
            reason: format!("invalid backup directory pattern {}: {}", pattern, e),
        })?;

        let mut sets = Vec::new();
        for entry in paths {
            let dir = entry.map_err(|e| BackupError::Io {
                path: e.path().to_path_buf(),
                source: std::io::Error::from(e),
            })?;
            if !dir.is_dir() {
                continue;
            }
            let Some(name) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                warn!("Skipping backup set with non UTF-8 name: {}", dir.display());
                continue;
            };

            let manifest = match self.load_manifest(&dir).await {
                Ok(manifest) => Some(manifest),
                Err(BackupError::ManifestMissing { .. }) => None,
                Err(e) => {
                    warn!("Ignoring unreadable manifest in {}: {}", dir.display(), e);
                    None
                }
            };

            sets.push(BackupSetEntry {
                name,
                dir,
                manifest,
            });
        }

        sets.sort_by(newest_first);
        Ok(sets)
    }

    /// Removes a set directory and everything in it.
    pub async fn discard_set(&self, set_dir: &Path) -> Result<()> {
        match fs::remove_dir_all(set_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackupError::Io {
                path: set_dir.to_path_buf(),
                source: e,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn manifest_at(domain: &str, ts: i64) -> Manifest {
        let mut manifest = Manifest::new(domain, "snap", Vec::new());
        manifest.created_at = Utc.timestamp_opt(ts, 0).unwrap();
        manifest
    }

    #[tokio::test]
    async fn test_manifest_roundtrip_and_status() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path());
        let set = store.create_set_dir("web", "20250101_000000").await.unwrap();

        let manifest = Manifest::new(
            "web",
            "20250101_000000",
            vec![ManifestDisk {
                device: "vda".to_string(),
                format: "qcow2".to_string(),
                source_path: PathBuf::from("/images/web.qcow2"),
                file: "web.qcow2".to_string(),
                size_bytes: 42,
                sha256: None,
                backing: None,
            }],
        );
        store.write_manifest(&set, &manifest).await.unwrap();

        assert!(!set.join(MANIFEST_TMP_FILE).exists());
        let loaded = store.load_manifest(&set).await.unwrap();
        assert_eq!(loaded, manifest);
        assert!(loaded.is_complete());

        let raw = std::fs::read_to_string(set.join(MANIFEST_FILE)).unwrap();
        assert!(raw.contains("\"status\": \"complete\""));
    }

    #[tokio::test]
    async fn test_missing_manifest() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path());
        let set = store.create_set_dir("web", "a").await.unwrap();

        let err = store.load_manifest(&set).await.unwrap_err();
        assert_eq!(err.kind(), "ManifestMissing");
    }

    #[tokio::test]
    async fn test_corrupt_manifest_is_invalid() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path());
        let set = store.create_set_dir("web", "a").await.unwrap();
        std::fs::write(set.join(MANIFEST_FILE), b"{ not json").unwrap();

        let err = store.load_manifest(&set).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidManifest");
    }

    #[tokio::test]
    async fn test_create_set_dir_refuses_existing() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path());
        store.create_set_dir("web", "a").await.unwrap();
        assert!(store.create_set_dir("web", "a").await.is_err());
    }

    #[tokio::test]
    async fn test_list_sets_orders_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path());

        for (name, ts) in [("b", 200), ("a", 300), ("c", 100)] {
            let set = store.create_set_dir("web", name).await.unwrap();
            store
                .write_manifest(&set, &manifest_at("web", ts))
                .await
                .unwrap();
        }
        store.create_set_dir("web", "z-partial").await.unwrap();
        std::fs::write(store.domain_dir("web").join("stray.txt"), b"x").unwrap();

        let sets = store.list_sets("web").await.unwrap();
        let names: Vec<&str> = sets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "z-partial"]);
        assert!(!sets[3].is_complete());
    }

    #[tokio::test]
    async fn test_list_sets_of_unknown_domain_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path());
        assert!(store.list_sets("nobody").await.unwrap().is_empty());
    }

    #[test]
    fn test_validate_domain_name() {
        assert!(validate_domain_name("web-01").is_ok());
        assert!(validate_domain_name("").is_err());
        assert!(validate_domain_name("..").is_err());
        assert!(validate_domain_name("a/b").is_err());
    }

    #[tokio::test]
    async fn test_discard_set_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path());
        let set = store.create_set_dir("web", "a").await.unwrap();
        std::fs::write(set.join("disk.qcow2"), b"data").unwrap();

        store.discard_set(&set).await.unwrap();
        assert!(!set.exists());
        store.discard_set(&set).await.unwrap();
    }
}
