//! Canonical identity of one synchronized object

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One synchronized filesystem/repository object.
///
/// Exactly one `SyncItem` exists per synchronized object; the local↔remote
/// mapping is bijective within a sync root. The remote display name and the
/// local content filename may differ, so both leafnames are carried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncItem {
    /// Absolute local path.
    pub local_path: PathBuf,
    /// Remote path, segments joined by `/`.
    pub remote_path: String,
    /// Display name of the remote object.
    pub remote_leafname: String,
    /// Filename of the local replica (the remote content-stream filename).
    pub local_leafname: String,
    pub is_folder: bool,
}

impl SyncItem {
    /// Build an item for a folder known on both sides.
    pub fn folder(local_path: impl Into<PathBuf>, remote_path: impl Into<String>) -> Self {
        let local_path = local_path.into();
        let remote_path = remote_path.into();
        let name = leafname(&local_path, &remote_path);
        Self {
            local_path,
            remote_path,
            remote_leafname: name.clone(),
            local_leafname: name,
            is_folder: true,
        }
    }

    /// Build an item for a document whose remote display name and local
    /// content filename may differ.
    pub fn document(
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
        remote_leafname: impl Into<String>,
    ) -> Self {
        let local_path = local_path.into();
        let remote_path = remote_path.into();
        let local_leafname = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            local_path,
            remote_path,
            remote_leafname: remote_leafname.into(),
            local_leafname,
            is_folder: false,
        }
    }
}

fn leafname(local_path: &Path, remote_path: &str) -> String {
    local_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| {
            remote_path
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_item_shares_leafname() {
        let item = SyncItem::folder("/data/docs/reports", "/docs/reports");
        assert!(item.is_folder);
        assert_eq!(item.remote_leafname, "reports");
        assert_eq!(item.local_leafname, "reports");
    }

    #[test]
    fn document_item_keeps_both_leafnames() {
        let item = SyncItem::document("/data/docs/report.pdf", "/docs/Quarterly Report", "Quarterly Report");
        assert!(!item.is_folder);
        assert_eq!(item.local_leafname, "report.pdf");
        assert_eq!(item.remote_leafname, "Quarterly Report");
    }
}
