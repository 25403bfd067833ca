//! Relational store bindings, document archive and retry pacing for medsync.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::debug;

pub mod memory;
pub mod postgres;
pub mod repository;

pub use memory::MemoryRepository;
pub use postgres::PgRepository;
pub use repository::{Repository, StorageError, StorageResult};

pub const CRATE_NAME: &str = "medsync-storage";

#[derive(Debug, Clone)]
pub struct ArchivedDocument {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub already_archived: bool,
}

/// Write-once archive of exported portal documents, addressed by content hash so a
/// re-imported export is recognised instead of stored twice.
#[derive(Debug, Clone)]
pub struct DocumentArchive {
    root: PathBuf,
}

impl DocumentArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn content_hash(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn relative_path_for(
        &self,
        received_at: DateTime<Utc>,
        origin: &str,
        content_hash: &str,
        file_name: &str,
    ) -> PathBuf {
        let day = received_at.format("%Y%m%d").to_string();
        let ext = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| "bin".to_string());
        PathBuf::from(day)
            .join(origin)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Archive an export under its content-hash path. Bytes land in a temp file first and
    /// are renamed into place, so a crash never leaves a truncated export behind.
    pub async fn archive(
        &self,
        received_at: DateTime<Utc>,
        origin: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedDocument> {
        let content_hash = Self::content_hash(bytes);
        let relative_path = self.relative_path_for(received_at, origin, &content_hash, file_name);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        let already_archived = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if already_archived {
            debug!(path = %absolute_path.display(), "document already archived");
        } else {
            fs::create_dir_all(&parent)
                .await
                .with_context(|| format!("creating archive directory {}", parent.display()))?;
            let temp_path = absolute_path.with_extension("partial");
            fs::write(&temp_path, bytes)
                .await
                .with_context(|| format!("writing {}", temp_path.display()))?;
            if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err).with_context(|| format!("moving {}", absolute_path.display()));
            }
        }

        Ok(ArchivedDocument {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            already_archived,
        })
    }
}

/// Pause before reconnecting after a failed traversal attempt: `base_delay * attempt`,
/// capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// `attempt` is 1-based: the first retry waits one base delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.max(1))
            .min(self.max_delay)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hash_is_stable() {
        let hash = DocumentArchive::content_hash(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn relative_path_keeps_export_extension() {
        let archive = DocumentArchive::new("/tmp/archive");
        let received_at = DateTime::parse_from_rfc3339("2026-03-01T08:30:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let path = archive.relative_path_for(received_at, "patient-export", "abc", "Export.TXT");
        assert_eq!(path, PathBuf::from("20260301/patient-export/abc.txt"));
        let path = archive.relative_path_for(received_at, "patient-export", "abc", "noext");
        assert_eq!(path, PathBuf::from("20260301/patient-export/abc.bin"));
    }

    #[tokio::test]
    async fn reimported_export_is_recognised() {
        let dir = tempdir().expect("tempdir");
        let archive = DocumentArchive::new(dir.path());
        let received_at = DateTime::parse_from_rfc3339("2026-03-01T08:30:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .archive(received_at, "patient-export", "export.txt", b"Rue Haute 1")
            .await
            .expect("first archive");
        let second = archive
            .archive(received_at, "patient-export", "export.txt", b"Rue Haute 1")
            .await
            .expect("second archive");

        assert!(!first.already_archived);
        assert!(second.already_archived);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn archive_leaves_only_the_final_file() {
        let dir = tempdir().expect("tempdir");
        let archive = DocumentArchive::new(dir.path());
        let received_at = DateTime::parse_from_rfc3339("2026-03-01T08:30:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let doc = archive
            .archive(received_at, "patient-export", "export.txt", b"Rue Basse 4")
            .await
            .expect("archive");

        let parent = doc.absolute_path.parent().expect("parent");
        let names: Vec<String> = std::fs::read_dir(parent)
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("{}.txt", doc.content_hash)]);
        assert_eq!(std::fs::read(&doc.absolute_path).expect("read"), b"Rue Basse 4");
        assert_eq!(doc.byte_size, 11);
    }

    #[test]
    fn backoff_grows_with_attempt_and_is_capped() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(250));
        assert!(!policy.exhausted(3));
        assert!(policy.exhausted(4));
    }
}
