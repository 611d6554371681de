//! Remote repository value types and the client trait the engine consumes

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// A folder in the remote repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFolder {
    pub id: String,
    /// Full remote path, segments joined by `/`.
    pub path: String,
    /// Display name (last path segment).
    pub name: String,
    pub modified: DateTime<Utc>,
}

/// A document in the remote repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub id: String,
    /// Full remote path of the document object.
    pub path: String,
    /// Display name of the object.
    pub name: String,
    /// Filename of the content stream. Servers can return no stream at all
    /// for malformed objects, so this is optional.
    pub content_filename: Option<String>,
    pub modified: DateTime<Utc>,
    /// User holding a checkout on this document, if any.
    pub checked_out_by: Option<String>,
}

impl RemoteDocument {
    /// Effective filename of the local replica.
    pub fn effective_filename(&self) -> Option<&str> {
        self.content_filename.as_deref()
    }
}

/// One child of a remote folder, as returned by `list_children`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteEntry {
    Folder(RemoteFolder),
    Document(RemoteDocument),
    /// Link/alias objects are never synchronized.
    Link { name: String },
    /// Any other repository type (policies, relationships, ...).
    Other { name: String, type_id: String },
}

/// Opaque cursor into the repository's change history. Persisted only after
/// a fully successful full pass so a failed pass re-crawls the same window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogToken(pub String);

/// Protocol access to the remote repository.
///
/// Every operation maps to one round trip; the reconciler catches per-object
/// failures at the call site, so implementations should return errors rather
/// than retry internally.
#[async_trait]
pub trait RemoteRepositoryClient: Send + Sync {
    /// Resolve a folder by its remote path.
    async fn get_folder(&self, path: &str) -> Result<RemoteFolder>;

    /// Enumerate the direct children of a folder.
    async fn list_children(&self, folder: &RemoteFolder) -> Result<Vec<RemoteEntry>>;

    /// Fetch the content of a document.
    async fn download(&self, doc: &RemoteDocument) -> Result<Vec<u8>>;

    /// Create a new document under `parent` from a local file.
    async fn upload(&self, parent: &RemoteFolder, local_file: &Path) -> Result<RemoteDocument>;

    /// Replace the content of an existing document from a local file.
    async fn update_content(&self, doc: &RemoteDocument, local_file: &Path)
        -> Result<RemoteDocument>;

    /// Create a subfolder.
    async fn create_folder(&self, parent: &RemoteFolder, name: &str) -> Result<RemoteFolder>;

    /// Recursively delete a folder, continuing past individual failures.
    /// Returns the ids of objects that could not be deleted; a non-empty
    /// list means the subtree still exists (at least partially) on the
    /// server.
    async fn delete_tree(&self, folder: &RemoteFolder) -> Result<Vec<String>>;

    /// Delete a document and all of its versions.
    async fn delete_all_versions(&self, doc: &RemoteDocument) -> Result<()>;

    /// Current change-log cursor, if the repository supports one.
    async fn change_log_token(&self) -> Result<Option<ChangeLogToken>>;
}
