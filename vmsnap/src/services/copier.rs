use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::constants::limits::COPY_BUFFER_SIZE;
use crate::errors::{BackupError, Result};

/// A verified copy inside a backup set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopiedFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: Option<String>,
}

/// Byte-for-byte copier for frozen backing files.
///
/// Never leaves a partial destination behind: every failure path removes the
/// destination file before the error is returned.
#[derive(Debug, Clone)]
pub struct BackupCopier {
    verify_checksum: bool,
}

impl BackupCopier {
    pub fn new(verify_checksum: bool) -> Self {
        Self { verify_checksum }
    }

    /// Copies `source` into `dest_dir` under its own file name.
    pub async fn copy(&self, source: &Path, dest_dir: &Path) -> Result<CopiedFile> {
        let file_name = source
            .file_name()
            .ok_or_else(|| BackupError::CopyIncomplete {
                source_path: source.to_path_buf(),
                dest_path: dest_dir.to_path_buf(),
                reason: "source has no file name".to_string(),
            })?;
        let dest = dest_dir.join(file_name);

        let source_size = fs::metadata(source)
            .await
            .map_err(BackupError::io(source))?
            .len();
        ensure_space(dest_dir, source_size)?;

        info!(
            "Copying '{}' to '{}' ({:.1} MB)",
            source.display(),
            dest.display(),
            source_size as f64 / 1024.0 / 1024.0
        );

        // Opened before the copy starts so an existing file is never removed.
        let writer = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&dest)
            .await
            .map_err(|e| write_error(&dest, source_size, e))?;

        let digest = match self.transfer(source, writer, &dest, source_size).await {
            Ok(digest) => digest,
            Err(e) => {
                remove_partial(&dest).await;
                return Err(e);
            }
        };

        self.verify(source, &dest, source_size, digest.as_deref()).await
    }

    /// Checks a finished copy against the source's size and digest.
    ///
    /// On mismatch the destination is removed and `CopyIncomplete` returned.
    pub async fn verify(
        &self,
        source: &Path,
        dest: &Path,
        expected_size: u64,
        expected_sha256: Option<&str>,
    ) -> Result<CopiedFile> {
        let actual_size = match fs::metadata(dest).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                return Err(BackupError::CopyIncomplete {
                    source_path: source.to_path_buf(),
                    dest_path: dest.to_path_buf(),
                    reason: format!("destination unreadable: {}", e),
                });
            }
        };

        if actual_size != expected_size {
            remove_partial(dest).await;
            return Err(BackupError::CopyIncomplete {
                source_path: source.to_path_buf(),
                dest_path: dest.to_path_buf(),
                reason: format!(
                    "size mismatch: expected {} bytes, found {}",
                    expected_size, actual_size
                ),
            });
        }

        let sha256 = match (self.verify_checksum, expected_sha256) {
            (true, Some(expected)) => {
                let actual = sha256_file(dest).await?;
                if actual != expected {
                    remove_partial(dest).await;
                    return Err(BackupError::CopyIncomplete {
                        source_path: source.to_path_buf(),
                        dest_path: dest.to_path_buf(),
                        reason: format!("checksum mismatch: expected {}, found {}", expected, actual),
                    });
                }
                Some(actual)
            }
            _ => None,
        };

        debug!("Verified copy {} ({} bytes)", dest.display(), actual_size);

        Ok(CopiedFile {
            path: dest.to_path_buf(),
            size_bytes: actual_size,
            sha256,
        })
    }

    /// Streams `source` into `writer`, hashing the bytes read when checksum
    /// verification is enabled.
    async fn transfer(
        &self,
        source: &Path,
        mut writer: File,
        dest: &Path,
        required: u64,
    ) -> Result<Option<String>> {
        let mut reader = File::open(source).await.map_err(BackupError::io(source))?;

        let mut hasher = self.verify_checksum.then(Sha256::new);
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];

        loop {
            let read = reader
                .read(&mut buffer)
                .await
                .map_err(BackupError::io(source))?;
            if read == 0 {
                break;
            }
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&buffer[..read]);
            }
            writer
                .write_all(&buffer[..read])
                .await
                .map_err(|e| write_error(dest, required, e))?;
        }

        writer.flush().await.map_err(|e| write_error(dest, required, e))?;
        writer.sync_all().await.map_err(|e| write_error(dest, required, e))?;

        Ok(hasher.map(|hasher| format!("{:x}", hasher.finalize())))
    }
}

/// Hex SHA-256 of a file's contents.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).await.map_err(BackupError::io(path))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer).await.map_err(BackupError::io(path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn ensure_space(dest_dir: &Path, required: u64) -> Result<()> {
    let available = fs2::available_space(dest_dir).map_err(BackupError::io(dest_dir))?;
    if available < required {
        return Err(BackupError::InsufficientSpace {
            dest_dir: dest_dir.to_path_buf(),
            required,
            available,
        });
    }
    Ok(())
}

/// Maps a write failure; a full device reports the file size it needed and
/// what is left now.
fn write_error(dest: &Path, required: u64, e: std::io::Error) -> BackupError {
    if e.kind() == ErrorKind::StorageFull {
        let dest_dir = dest.parent().unwrap_or(dest);
        BackupError::InsufficientSpace {
            dest_dir: dest_dir.to_path_buf(),
            required,
            available: fs2::available_space(dest_dir).unwrap_or(0),
        }
    } else {
        BackupError::Io {
            path: dest.to_path_buf(),
            source: e,
        }
    }
}

async fn remove_partial(dest: &Path) {
    match fs::remove_file(dest).await {
        Ok(()) => warn!("Removed partial copy {}", dest.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove partial copy {}: {}", dest.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_copy_is_byte_identical() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let source = src_dir.path().join("disk.qcow2");
        let data: Vec<u8> = (0..(COPY_BUFFER_SIZE + 123)).map(|i| (i % 251) as u8).collect();
        std::fs::write(&source, &data).unwrap();

        let copied = BackupCopier::new(true)
            .copy(&source, dst_dir.path())
            .await
            .unwrap();

        assert_eq!(copied.path, dst_dir.path().join("disk.qcow2"));
        assert_eq!(copied.size_bytes, data.len() as u64);
        assert_eq!(std::fs::read(&copied.path).unwrap(), data);
        assert_eq!(copied.sha256, Some(sha256_file(&source).await.unwrap()));
    }

    #[tokio::test]
    async fn test_copy_without_checksum() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let source = src_dir.path().join("disk.raw");
        std::fs::write(&source, b"raw image").unwrap();

        let copied = BackupCopier::new(false)
            .copy(&source, dst_dir.path())
            .await
            .unwrap();
        assert_eq!(copied.sha256, None);
        assert_eq!(copied.size_bytes, 9);
    }

    #[tokio::test]
    async fn test_truncated_destination_is_removed() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let source = src_dir.path().join("disk.qcow2");
        std::fs::write(&source, vec![7u8; 4096]).unwrap();

        let dest = dst_dir.path().join("disk.qcow2");
        std::fs::write(&dest, vec![7u8; 1000]).unwrap();

        let err = BackupCopier::new(true)
            .verify(&source, &dest, 4096, None)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "CopyIncomplete");
        assert!(err.to_string().contains("size mismatch"));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_removed() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let source = src_dir.path().join("disk.qcow2");
        std::fs::write(&source, b"abcd").unwrap();
        let dest = dst_dir.path().join("disk.qcow2");
        std::fs::write(&dest, b"abce").unwrap();

        let expected = sha256_file(&source).await.unwrap();
        let err = BackupCopier::new(true)
            .verify(&source, &dest, 4, Some(&expected))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("checksum mismatch"));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_existing_destination_is_not_overwritten() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let source = src_dir.path().join("disk.qcow2");
        std::fs::write(&source, b"new").unwrap();
        let dest = dst_dir.path().join("disk.qcow2");
        std::fs::write(&dest, b"old data").unwrap();

        let err = BackupCopier::new(true)
            .copy(&source, dst_dir.path())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Io");
        assert_eq!(std::fs::read(&dest).unwrap(), b"old data");
    }

    #[test]
    fn test_ensure_space_rejects_oversized_file() {
        let dir = TempDir::new().unwrap();
        assert!(ensure_space(dir.path(), 1).is_ok());

        let err = ensure_space(dir.path(), u64::MAX).unwrap_err();
        assert_eq!(err.kind(), "InsufficientSpace");
        assert!(err.to_string().contains(&u64::MAX.to_string()));
    }

    #[tokio::test]
    async fn test_copy_without_room_leaves_no_destination() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let source = src_dir.path().join("huge.raw");

        // Sparse: larger than the destination can hold, without using the space
        let available = fs2::available_space(dst_dir.path()).unwrap();
        std::fs::File::create(&source)
            .unwrap()
            .set_len(available + (1 << 30))
            .unwrap();

        let err = BackupCopier::new(true)
            .copy(&source, dst_dir.path())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "InsufficientSpace");
        assert!(!dst_dir.path().join("huge.raw").exists());
    }

    #[test]
    fn test_full_device_reports_required_size() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("disk.qcow2");

        let err = write_error(&dest, 4096, std::io::Error::from(ErrorKind::StorageFull));
        match err {
            BackupError::InsufficientSpace {
                dest_dir, required, ..
            } => {
                assert_eq!(dest_dir, dir.path());
                assert_eq!(required, 4096);
            }
            other => panic!("unexpected error {:?}", other),
        }

        let err = write_error(&dest, 4096, std::io::Error::from(ErrorKind::PermissionDenied));
        assert_eq!(err.kind(), "Io");
    }

    #[tokio::test]
    async fn test_missing_source_is_io_error() {
        let dst_dir = TempDir::new().unwrap();
        let err = BackupCopier::new(true)
            .copy(Path::new("/nonexistent/vmsnap/disk.qcow2"), dst_dir.path())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Io");
    }
}
