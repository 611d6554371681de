//! Local↔remote path derivation for objects not yet in the metadata store

use std::path::{Path, PathBuf};

use crate::errors::{Result, SyncError};
use crate::item::SyncItem;

/// Remote path separator. Remote paths are rooted at the configured remote
/// folder and join segments with this, independent of the local platform.
pub const REMOTE_SEPARATOR: char = '/';

/// Derives the canonical correspondence between a local path and a remote
/// path for an object absent from the metadata store.
#[derive(Debug, Clone)]
pub struct PathMapper {
    local_root: PathBuf,
    remote_root: String,
}

impl PathMapper {
    pub fn new(local_root: impl Into<PathBuf>, remote_root: impl Into<String>) -> Self {
        let mut remote_root = remote_root.into();
        while remote_root.len() > 1 && remote_root.ends_with(REMOTE_SEPARATOR) {
            remote_root.pop();
        }
        Self {
            local_root: local_root.into(),
            remote_root,
        }
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    pub fn remote_root(&self) -> &str {
        &self.remote_root
    }

    /// Remote path corresponding to a local path under the sync root.
    pub fn local_to_remote(&self, local: &Path) -> Result<String> {
        let rel = local
            .strip_prefix(&self.local_root)
            .map_err(|_| SyncError::OutsideRoot {
                path: local.to_path_buf(),
                root: self.local_root.clone(),
            })?;

        let mut remote = self.remote_root.clone();
        for component in rel.components() {
            let segment = component.as_os_str().to_str().ok_or_else(|| {
                SyncError::InvalidPath(local.display().to_string())
            })?;
            if !remote.ends_with(REMOTE_SEPARATOR) {
                remote.push(REMOTE_SEPARATOR);
            }
            remote.push_str(segment);
        }
        Ok(remote)
    }

    /// Local path corresponding to a remote path under the remote root.
    pub fn remote_to_local(&self, remote: &str) -> Result<PathBuf> {
        // The prefix must end at a segment boundary, or a sibling whose name
        // merely starts with the root (`/docsother`) would slip through.
        let rel = remote
            .strip_prefix(&self.remote_root)
            .filter(|rest| {
                rest.is_empty()
                    || rest.starts_with(REMOTE_SEPARATOR)
                    || self.remote_root.ends_with(REMOTE_SEPARATOR)
            })
            .ok_or_else(|| SyncError::InvalidPath(remote.to_string()))?;

        let mut local = self.local_root.clone();
        for segment in rel.split(REMOTE_SEPARATOR).filter(|s| !s.is_empty()) {
            if segment == ".." || segment == "." {
                return Err(SyncError::InvalidPath(remote.to_string()));
            }
            local.push(segment);
        }
        Ok(local)
    }

    /// Item for a remote folder discovered during a crawl.
    pub fn folder_item(&self, remote_path: &str) -> Result<SyncItem> {
        let local = self.remote_to_local(remote_path)?;
        Ok(SyncItem::folder(local, remote_path))
    }

    /// Item for a remote document discovered during a crawl. The local file
    /// takes the content-stream filename, which may differ from the remote
    /// display name carried in `remote_path`.
    pub fn document_item(
        &self,
        parent_remote: &str,
        remote_leafname: &str,
        content_filename: &str,
    ) -> Result<SyncItem> {
        let remote_path = join_remote(parent_remote, remote_leafname);
        let parent_local = self.remote_to_local(parent_remote)?;
        let local_path = parent_local.join(content_filename);
        Ok(SyncItem::document(local_path, remote_path, remote_leafname))
    }

    /// Item for a local file or directory about to be uploaded.
    pub fn local_item(&self, local: &Path, is_folder: bool) -> Result<SyncItem> {
        let remote_path = self.local_to_remote(local)?;
        if is_folder {
            Ok(SyncItem::folder(local, remote_path))
        } else {
            let name = local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| SyncError::InvalidPath(local.display().to_string()))?;
            Ok(SyncItem::document(local, remote_path, name))
        }
    }
}

/// Join a remote parent path and a leafname.
pub fn join_remote(parent: &str, name: &str) -> String {
    if parent.ends_with(REMOTE_SEPARATOR) {
        format!("{parent}{name}")
    } else {
        format!("{parent}{REMOTE_SEPARATOR}{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> PathMapper {
        PathMapper::new("/data/sync", "/docs")
    }

    #[test]
    fn maps_local_to_remote() {
        let remote = mapper()
            .local_to_remote(Path::new("/data/sync/reports/q1.pdf"))
            .unwrap();
        assert_eq!(remote, "/docs/reports/q1.pdf");
    }

    #[test]
    fn maps_remote_to_local() {
        let local = mapper().remote_to_local("/docs/reports/q1.pdf").unwrap();
        assert_eq!(local, PathBuf::from("/data/sync/reports/q1.pdf"));
    }

    #[test]
    fn round_trips_the_root_itself() {
        let m = mapper();
        assert_eq!(m.local_to_remote(Path::new("/data/sync")).unwrap(), "/docs");
        assert_eq!(m.remote_to_local("/docs").unwrap(), PathBuf::from("/data/sync"));
    }

    #[test]
    fn rejects_paths_outside_the_root() {
        let err = mapper()
            .local_to_remote(Path::new("/etc/passwd"))
            .unwrap_err();
        assert!(matches!(err, SyncError::OutsideRoot { .. }));
    }

    #[test]
    fn rejects_siblings_sharing_a_textual_prefix() {
        let err = mapper().remote_to_local("/docsother/x").unwrap_err();
        assert!(matches!(err, SyncError::InvalidPath(_)));

        // A "/" root still accepts everything under it.
        let m = PathMapper::new("/data/sync", "/");
        assert_eq!(m.remote_to_local("/a.txt").unwrap(), PathBuf::from("/data/sync/a.txt"));
    }

    #[test]
    fn rejects_traversal_segments() {
        let err = mapper().remote_to_local("/docs/../etc").unwrap_err();
        assert!(matches!(err, SyncError::InvalidPath(_)));
    }

    #[test]
    fn document_item_uses_content_filename_locally() {
        let item = mapper()
            .document_item("/docs/reports", "Quarterly Report", "q1.pdf")
            .unwrap();
        assert_eq!(item.local_path, PathBuf::from("/data/sync/reports/q1.pdf"));
        assert_eq!(item.remote_path, "/docs/reports/Quarterly Report");
        assert_eq!(item.remote_leafname, "Quarterly Report");
        assert_eq!(item.local_leafname, "q1.pdf");
    }

    #[test]
    fn trims_trailing_separator_from_remote_root() {
        let m = PathMapper::new("/data/sync", "/docs/");
        assert_eq!(m.remote_root(), "/docs");
        assert_eq!(
            m.local_to_remote(Path::new("/data/sync/a.txt")).unwrap(),
            "/docs/a.txt"
        );
    }
}
