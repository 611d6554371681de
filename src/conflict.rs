//! Conflict resolution
//!
//! Policy: local data is never destroyed. When both replicas changed, the
//! local file is renamed to a deterministic conflict-backup name beside the
//! original and the remote copy takes the original path. When the remote
//! side vanished instead of changed (bidirectional mode), the local edit
//! wins and is re-uploaded by the reconciler.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::info;

use crate::errors::{Result, SyncError};

/// Produces conflict-backup names and performs the rename-aside.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    /// Identity embedded in backup names, usually the local username.
    owner: String,
}

impl ConflictResolver {
    pub fn new(owner: impl Into<String>) -> Self {
        Self { owner: owner.into() }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Backup name for `original`: `<stem>_<owner>-conflict-<date><ext>`,
    /// with a ` (n)` counter when that name is already taken.
    pub fn conflict_path(&self, original: &Path) -> Result<PathBuf> {
        let parent = original
            .parent()
            .ok_or_else(|| SyncError::InvalidPath(original.display().to_string()))?;
        let stem = original
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| SyncError::InvalidPath(original.display().to_string()))?;
        let ext = original
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let date = Utc::now().format("%Y-%m-%d");

        let base = format!("{stem}_{}-conflict-{date}", self.owner);
        let mut candidate = parent.join(format!("{base}{ext}"));
        let mut counter = 1u32;
        while candidate.exists() {
            candidate = parent.join(format!("{base} ({counter}){ext}"));
            counter += 1;
        }
        Ok(candidate)
    }

    /// Move `original` aside to its conflict-backup name and return the
    /// backup path.
    pub async fn backup_aside(&self, original: &Path) -> Result<PathBuf> {
        let backup = self.conflict_path(original)?;
        tokio::fs::rename(original, &backup).await?;
        info!(
            "Preserved local version of {} as {}",
            original.display(),
            backup.display()
        );
        Ok(backup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn backup_name_carries_owner_and_extension() {
        let resolver = ConflictResolver::new("alice");
        let path = resolver.conflict_path(Path::new("/tmp/report.pdf")).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("report_alice-conflict-"));
        assert!(name.ends_with(".pdf"));
    }

    #[test]
    fn backup_name_without_extension() {
        let resolver = ConflictResolver::new("alice");
        let path = resolver.conflict_path(Path::new("/tmp/Makefile")).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("Makefile_alice-conflict-"));
        assert!(!name.contains('.'));
    }

    #[tokio::test]
    async fn backup_aside_moves_the_file_and_counts_collisions() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("report.pdf");
        let resolver = ConflictResolver::new("alice");

        std::fs::write(&original, b"first").unwrap();
        let first = resolver.backup_aside(&original).await.unwrap();
        assert!(!original.exists());
        assert_eq!(std::fs::read(&first).unwrap(), b"first");

        std::fs::write(&original, b"second").unwrap();
        let second = resolver.backup_aside(&original).await.unwrap();
        assert_ne!(first, second);
        assert!(second.to_string_lossy().contains("(1)"));
        assert_eq!(std::fs::read(&second).unwrap(), b"second");
    }
}
