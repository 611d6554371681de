//! In-memory repository backend
//!
//! A complete `RemoteRepositoryClient` over process memory. The test suite
//! drives the reconciler against it; the operation log and failure-injection
//! hooks exist for exactly that purpose.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::{Result, SyncError};
use crate::mapper::join_remote;
use crate::remote::{
    ChangeLogToken, RemoteDocument, RemoteEntry, RemoteFolder, RemoteRepositoryClient,
};

#[derive(Debug, Clone)]
struct FileNode {
    id: String,
    content: Vec<u8>,
    content_filename: Option<String>,
    modified: DateTime<Utc>,
    checked_out_by: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    folders: HashMap<String, DateTime<Utc>>,
    files: HashMap<String, FileNode>,
    links: Vec<(String, String)>,
    fail_paths: HashSet<String>,
    deny_delete: HashSet<String>,
    next_id: u64,
    change_seq: u64,
    op_log: Vec<String>,
}

impl Inner {
    fn next_id(&mut self) -> String {
        self.next_id += 1;
        format!("obj-{}", self.next_id)
    }

    fn bump(&mut self) {
        self.change_seq += 1;
    }

    fn check_reachable(&self, path: &str) -> Result<()> {
        if self.fail_paths.contains(path) {
            return Err(SyncError::Remote(format!("injected failure for {path}")));
        }
        Ok(())
    }
}

/// In-memory remote repository rooted at a fixed path.
#[derive(Clone)]
pub struct InMemoryRemote {
    root: String,
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryRemote {
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        let mut inner = Inner::default();
        inner.folders.insert(root.clone(), Utc::now());
        Self {
            root,
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Create a folder (and not its parents; tests build trees explicitly).
    pub async fn add_folder(&self, path: &str) {
        let mut inner = self.inner.write().await;
        inner.folders.insert(path.to_string(), Utc::now());
        inner.bump();
    }

    /// Create a document whose content filename is its leafname.
    pub async fn add_file(&self, path: &str, content: &[u8]) -> String {
        let name = leaf(path).to_string();
        self.add_file_with_content_name(path, Some(name), content).await
    }

    /// Create a document with an explicit (or missing) content filename.
    pub async fn add_file_with_content_name(
        &self,
        path: &str,
        content_filename: Option<String>,
        content: &[u8],
    ) -> String {
        let mut inner = self.inner.write().await;
        let id = inner.next_id();
        inner.files.insert(
            path.to_string(),
            FileNode {
                id: id.clone(),
                content: content.to_vec(),
                content_filename,
                modified: Utc::now(),
                checked_out_by: None,
            },
        );
        inner.bump();
        id
    }

    /// Replace a document's content, advancing its modification time.
    pub async fn touch(&self, path: &str, content: &[u8]) {
        let mut inner = self.inner.write().await;
        if let Some(node) = inner.files.get_mut(path) {
            node.content = content.to_vec();
            node.modified = Utc::now();
        }
        inner.bump();
    }

    pub async fn add_link(&self, parent: &str, name: &str) {
        let mut inner = self.inner.write().await;
        inner.links.push((parent.to_string(), name.to_string()));
        inner.bump();
    }

    pub async fn set_checked_out(&self, path: &str, user: &str) {
        let mut inner = self.inner.write().await;
        if let Some(node) = inner.files.get_mut(path) {
            node.checked_out_by = Some(user.to_string());
        }
    }

    /// Make every operation touching `path` fail.
    pub async fn fail_on(&self, path: &str) {
        self.inner.write().await.fail_paths.insert(path.to_string());
    }

    /// Make `delete_tree` on this folder report its objects as undeletable.
    pub async fn deny_delete(&self, path: &str) {
        self.inner.write().await.deny_delete.insert(path.to_string());
    }

    pub async fn operations(&self) -> Vec<String> {
        self.inner.read().await.op_log.clone()
    }

    pub async fn contains_folder(&self, path: &str) -> bool {
        self.inner.read().await.folders.contains_key(path)
    }

    pub async fn contains_file(&self, path: &str) -> bool {
        self.inner.read().await.files.contains_key(path)
    }

    pub async fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.read().await.files.get(path).map(|n| n.content.clone())
    }

    fn folder_of(path: &str, modified: DateTime<Utc>) -> RemoteFolder {
        RemoteFolder {
            id: format!("folder:{path}"),
            path: path.to_string(),
            name: leaf(path).to_string(),
            modified,
        }
    }

    fn document_of(path: &str, node: &FileNode) -> RemoteDocument {
        RemoteDocument {
            id: node.id.clone(),
            path: path.to_string(),
            name: leaf(path).to_string(),
            content_filename: node.content_filename.clone(),
            modified: node.modified,
            checked_out_by: node.checked_out_by.clone(),
        }
    }
}

fn leaf(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "",
    }
}

#[async_trait]
impl RemoteRepositoryClient for InMemoryRemote {
    async fn get_folder(&self, path: &str) -> Result<RemoteFolder> {
        let inner = self.inner.read().await;
        inner.check_reachable(path)?;
        match inner.folders.get(path) {
            Some(modified) => Ok(Self::folder_of(path, *modified)),
            None => Err(SyncError::RemoteNotFound(path.to_string())),
        }
    }

    async fn list_children(&self, folder: &RemoteFolder) -> Result<Vec<RemoteEntry>> {
        let inner = self.inner.read().await;
        inner.check_reachable(&folder.path)?;

        let mut entries = Vec::new();
        for (path, modified) in &inner.folders {
            if parent_of(path) == folder.path {
                entries.push(RemoteEntry::Folder(Self::folder_of(path, *modified)));
            }
        }
        for (path, node) in &inner.files {
            if parent_of(path) == folder.path {
                entries.push(RemoteEntry::Document(Self::document_of(path, node)));
            }
        }
        for (parent, name) in &inner.links {
            if parent == &folder.path {
                entries.push(RemoteEntry::Link { name: name.clone() });
            }
        }
        entries.sort_by_key(|e| match e {
            RemoteEntry::Folder(f) => f.name.clone(),
            RemoteEntry::Document(d) => d.name.clone(),
            RemoteEntry::Link { name } | RemoteEntry::Other { name, .. } => name.clone(),
        });
        Ok(entries)
    }

    async fn download(&self, doc: &RemoteDocument) -> Result<Vec<u8>> {
        let mut inner = self.inner.write().await;
        inner.check_reachable(&doc.path)?;
        let content = inner
            .files
            .get(&doc.path)
            .map(|n| n.content.clone())
            .ok_or_else(|| SyncError::RemoteNotFound(doc.path.clone()))?;
        inner.op_log.push(format!("download {}", doc.path));
        Ok(content)
    }

    async fn upload(&self, parent: &RemoteFolder, local_file: &Path) -> Result<RemoteDocument> {
        let name = local_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SyncError::InvalidPath(local_file.display().to_string()))?;
        let content = tokio::fs::read(local_file).await?;
        let path = join_remote(&parent.path, &name);

        let mut inner = self.inner.write().await;
        inner.check_reachable(&path)?;
        let id = inner.next_id();
        let node = FileNode {
            id,
            content,
            content_filename: Some(name),
            modified: Utc::now(),
            checked_out_by: None,
        };
        let doc = Self::document_of(&path, &node);
        inner.files.insert(path.clone(), node);
        inner.bump();
        inner.op_log.push(format!("upload {path}"));
        debug!("Uploaded {}", path);
        Ok(doc)
    }

    async fn update_content(
        &self,
        doc: &RemoteDocument,
        local_file: &Path,
    ) -> Result<RemoteDocument> {
        let content = tokio::fs::read(local_file).await?;
        let mut inner = self.inner.write().await;
        inner.check_reachable(&doc.path)?;
        let node = inner
            .files
            .get_mut(&doc.path)
            .ok_or_else(|| SyncError::RemoteNotFound(doc.path.clone()))?;
        node.content = content;
        node.modified = Utc::now();
        let updated = Self::document_of(&doc.path, node);
        inner.bump();
        inner.op_log.push(format!("update {}", doc.path));
        Ok(updated)
    }

    async fn create_folder(&self, parent: &RemoteFolder, name: &str) -> Result<RemoteFolder> {
        let path = join_remote(&parent.path, name);
        let mut inner = self.inner.write().await;
        inner.check_reachable(&path)?;
        let now = Utc::now();
        inner.folders.insert(path.clone(), now);
        inner.bump();
        inner.op_log.push(format!("create_folder {path}"));
        Ok(Self::folder_of(&path, now))
    }

    async fn delete_tree(&self, folder: &RemoteFolder) -> Result<Vec<String>> {
        let mut inner = self.inner.write().await;
        inner.check_reachable(&folder.path)?;
        inner.op_log.push(format!("delete_tree {}", folder.path));

        if inner.deny_delete.contains(&folder.path) {
            return Ok(vec![folder.id.clone()]);
        }

        let prefix = format!("{}/", folder.path);
        inner
            .folders
            .retain(|p, _| p != &folder.path && !p.starts_with(&prefix));
        inner.files.retain(|p, _| !p.starts_with(&prefix));
        inner.links.retain(|(parent, _)| parent != &folder.path && !parent.starts_with(&prefix));
        inner.bump();
        Ok(Vec::new())
    }

    async fn delete_all_versions(&self, doc: &RemoteDocument) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.check_reachable(&doc.path)?;
        inner
            .files
            .remove(&doc.path)
            .ok_or_else(|| SyncError::RemoteNotFound(doc.path.clone()))?;
        inner.bump();
        inner.op_log.push(format!("delete_versions {}", doc.path));
        Ok(())
    }

    async fn change_log_token(&self) -> Result<Option<ChangeLogToken>> {
        let inner = self.inner.read().await;
        Ok(Some(ChangeLogToken(inner.change_seq.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_children_by_parent() {
        let remote = InMemoryRemote::new("/docs");
        remote.add_folder("/docs/reports").await;
        remote.add_file("/docs/readme.txt", b"hello").await;
        remote.add_file("/docs/reports/q1.pdf", b"pdf").await;

        let root = remote.get_folder("/docs").await.unwrap();
        let children = remote.list_children(&root).await.unwrap();
        assert_eq!(children.len(), 2);
        assert!(matches!(&children[0], RemoteEntry::Document(d) if d.name == "readme.txt"));
        assert!(matches!(&children[1], RemoteEntry::Folder(f) if f.name == "reports"));
    }

    #[tokio::test]
    async fn delete_tree_removes_descendants() {
        let remote = InMemoryRemote::new("/docs");
        remote.add_folder("/docs/reports").await;
        remote.add_file("/docs/reports/q1.pdf", b"pdf").await;

        let folder = remote.get_folder("/docs/reports").await.unwrap();
        let failed = remote.delete_tree(&folder).await.unwrap();
        assert!(failed.is_empty());
        assert!(!remote.contains_folder("/docs/reports").await);
        assert!(!remote.contains_file("/docs/reports/q1.pdf").await);
    }

    #[tokio::test]
    async fn denied_delete_reports_failed_ids_and_keeps_tree() {
        let remote = InMemoryRemote::new("/docs");
        remote.add_folder("/docs/locked").await;
        remote.add_file("/docs/locked/keep.txt", b"keep").await;
        remote.deny_delete("/docs/locked").await;

        let folder = remote.get_folder("/docs/locked").await.unwrap();
        let failed = remote.delete_tree(&folder).await.unwrap();
        assert!(!failed.is_empty());
        assert!(remote.contains_file("/docs/locked/keep.txt").await);
    }

    #[tokio::test]
    async fn change_log_token_advances_on_mutation() {
        let remote = InMemoryRemote::new("/docs");
        let before = remote.change_log_token().await.unwrap().unwrap();
        remote.add_file("/docs/a.txt", b"a").await;
        let after = remote.change_log_token().await.unwrap().unwrap();
        assert_ne!(before, after);
    }
}
