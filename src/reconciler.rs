//! Tree reconciliation: the three-pass crawl
//!
//! One reconciliation pass walks the remote tree and the local tree
//! depth-first, one directory at a time. Per directory:
//!
//! 1. crawl remote children — recurse into folders, download/delete/restore
//!    documents, and collect the directory's [`RemoteListing`];
//! 2. crawl local files against that listing — upload, delete, or back up;
//! 3. crawl local directories against it — recursive local delete or
//!    recursive upload.
//!
//! Per-object failures are caught at the object boundary, logged, and folded
//! into the pass's boolean success result; siblings keep processing. The one
//! exception is a missing sync root, which aborts the whole pass: an
//! unmounted volume must never read as "the user deleted everything".

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::activity::ActivitySink;
use crate::config::SyncDirection;
use crate::conflict::ConflictResolver;
use crate::errors::{Result, SyncError};
use crate::ignore::IgnorePolicy;
use crate::item::SyncItem;
use crate::mapper::PathMapper;
use crate::remote::{RemoteDocument, RemoteEntry, RemoteFolder, RemoteRepositoryClient};
use crate::scheduler::SuspendGate;
use crate::store::MetadataStore;

/// Counts of the operations a pass performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub downloads: u32,
    pub uploads: u32,
    pub local_deletes: u32,
    pub remote_deletes: u32,
    pub conflicts: u32,
    pub errors: u32,
}

impl PassStats {
    /// True when the pass moved no data and deleted nothing.
    pub fn is_noop(&self) -> bool {
        *self == PassStats::default()
    }
}

/// Atomic counters threaded through the recursion.
#[derive(Debug, Default)]
struct PassCounters {
    downloads: AtomicU32,
    uploads: AtomicU32,
    local_deletes: AtomicU32,
    remote_deletes: AtomicU32,
    conflicts: AtomicU32,
    errors: AtomicU32,
}

impl PassCounters {
    fn snapshot(&self) -> PassStats {
        PassStats {
            downloads: self.downloads.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            local_deletes: self.local_deletes.load(Ordering::Relaxed),
            remote_deletes: self.remote_deletes.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

fn tick(counter: &AtomicU32) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Result of one reconciliation pass. `success` is true only if every
/// per-object operation across all three passes of the whole subtree
/// succeeded; the scheduler uses it to gate change-log cursor persistence.
#[derive(Debug, Clone, Copy)]
pub struct PassOutcome {
    pub success: bool,
    pub stats: PassStats,
}

/// Per-directory accumulator produced by pass 1 and consumed by passes 2
/// and 3. Scoped to one directory level and discarded afterwards.
#[derive(Debug, Default)]
struct RemoteListing {
    /// Documents present remotely, keyed by their local content filename.
    files: HashMap<String, RemoteDocument>,
    /// Names of subfolders present remotely.
    folders: HashSet<String>,
}

impl RemoteListing {
    /// Membership check for a local filename, honoring the server-side
    /// `name` → `name.zip` filename-mangling workaround.
    fn document(&self, name: &str) -> Option<&RemoteDocument> {
        self.files
            .get(name)
            .or_else(|| self.files.get(&format!("{name}.zip")))
    }
}

/// The core recursive reconciliation engine.
pub struct TreeReconciler {
    remote: Arc<dyn RemoteRepositoryClient>,
    store: Arc<dyn MetadataStore>,
    activity: Arc<dyn ActivitySink>,
    resolver: ConflictResolver,
    ignore: IgnorePolicy,
    mapper: PathMapper,
    direction: SyncDirection,
    gate: SuspendGate,
}

impl TreeReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote: Arc<dyn RemoteRepositoryClient>,
        store: Arc<dyn MetadataStore>,
        activity: Arc<dyn ActivitySink>,
        resolver: ConflictResolver,
        ignore: IgnorePolicy,
        mapper: PathMapper,
        direction: SyncDirection,
        gate: SuspendGate,
    ) -> Self {
        Self {
            remote,
            store,
            activity,
            resolver,
            ignore,
            mapper,
            direction,
            gate,
        }
    }

    pub fn local_root(&self) -> &Path {
        self.mapper.local_root()
    }

    fn bidirectional(&self) -> bool {
        self.direction == SyncDirection::Bidirectional
    }

    /// Run one full reconciliation of the configured roots.
    ///
    /// Returns `Err` only for the fatal root-missing condition; every other
    /// failure is absorbed into the outcome's `success` flag.
    pub async fn reconcile(&self) -> Result<PassOutcome> {
        self.gate.checkpoint().await;
        self.ensure_root_present()?;

        let counters = PassCounters::default();
        let root = match self.remote.get_folder(self.mapper.remote_root()).await {
            Ok(folder) => folder,
            Err(e) => {
                warn!("Could not resolve remote root {}: {}", self.mapper.remote_root(), e);
                tick(&counters.errors);
                return Ok(PassOutcome {
                    success: false,
                    stats: counters.snapshot(),
                });
            }
        };

        let success = self
            .reconcile_dir(&root, self.mapper.local_root().to_path_buf(), &counters)
            .await?;

        let stats = counters.snapshot();
        info!(
            "Reconciliation finished (success={}): {} down, {} up, {} local deletes, {} remote deletes, {} conflicts, {} errors",
            success,
            stats.downloads,
            stats.uploads,
            stats.local_deletes,
            stats.remote_deletes,
            stats.conflicts,
            stats.errors
        );
        Ok(PassOutcome { success, stats })
    }

    fn ensure_root_present(&self) -> Result<()> {
        let root = self.mapper.local_root();
        if root.is_dir() {
            Ok(())
        } else {
            Err(SyncError::RootMissing(root.to_path_buf()))
        }
    }

    /// Run the three passes for one directory level, recursing depth-first.
    fn reconcile_dir<'a>(
        &'a self,
        folder: &'a RemoteFolder,
        local_dir: PathBuf,
        counters: &'a PassCounters,
    ) -> BoxFuture<'a, Result<bool>> {
        async move {
            self.gate.checkpoint().await;
            debug!("Reconciling {} <-> {}", folder.path, local_dir.display());

            let (listing, mut success) = match self.crawl_remote(folder, &local_dir, counters).await? {
                Some(result) => result,
                // A failed listing must not present as an empty one: skip
                // the local passes for this directory entirely.
                None => return Ok(false),
            };

            match self
                .crawl_local_files(&local_dir, folder, &listing, counters)
                .await
            {
                Ok(ok) => success &= ok,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Local file pass failed in {}: {}", local_dir.display(), e);
                    tick(&counters.errors);
                    success = false;
                }
            }
            match self
                .crawl_local_folders(&local_dir, folder, &listing, counters)
                .await
            {
                Ok(ok) => success &= ok,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Local folder pass failed in {}: {}", local_dir.display(), e);
                    tick(&counters.errors);
                    success = false;
                }
            }

            match self.sweep_stale_records(&local_dir, &listing).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Record sweep failed in {}: {}", local_dir.display(), e);
                    tick(&counters.errors);
                    success = false;
                }
            }

            Ok(success)
        }
        .boxed()
    }

    /// Drop records for objects in this directory that exist on neither
    /// side. The passes above never visit them (pass 1 sees only remote
    /// children, passes 2 and 3 only local entries), and a record left
    /// behind would misread a future same-named local object as "synced
    /// before, gone remotely" and delete it.
    async fn sweep_stale_records(&self, local_dir: &Path, listing: &RemoteListing) -> Result<()> {
        for item in self.store.children_of(local_dir).await? {
            let present_locally = if item.is_folder {
                item.local_path.is_dir()
            } else {
                item.local_path.is_file()
            };
            if present_locally {
                continue;
            }
            let present_remotely = if item.is_folder {
                listing.folders.contains(&item.local_leafname)
            } else {
                listing.document(&item.local_leafname).is_some()
            };
            if present_remotely {
                continue;
            }
            debug!(
                "Dropping stale record for {} (absent on both sides)",
                item.local_path.display()
            );
            self.store.remove(&item).await?;
        }
        Ok(())
    }

    /// Pass 1: crawl remote children. Returns the directory listing and the
    /// pass's success flag, or `None` when the enumeration itself failed.
    async fn crawl_remote(
        &self,
        folder: &RemoteFolder,
        local_dir: &Path,
        counters: &PassCounters,
    ) -> Result<Option<(RemoteListing, bool)>> {
        let children = match self.remote.list_children(folder).await {
            Ok(children) => children,
            Err(e) => {
                warn!("Could not list remote folder {}: {}", folder.path, e);
                tick(&counters.errors);
                return Ok(None);
            }
        };

        let mut listing = RemoteListing::default();
        let mut success = true;

        for entry in children {
            self.gate.checkpoint().await;
            match entry {
                RemoteEntry::Folder(child) => {
                    if !self.ignore.worth_syncing(local_dir, &child.name) {
                        continue;
                    }
                    listing.folders.insert(child.name.clone());
                    match self.crawl_remote_folder(&child, local_dir, counters).await {
                        Ok(ok) => success &= ok,
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            warn!("Failed to process remote folder {}: {}", child.path, e);
                            tick(&counters.errors);
                            success = false;
                        }
                    }
                }
                RemoteEntry::Document(doc) => {
                    match self
                        .crawl_remote_document(folder, &doc, local_dir, &mut listing, counters)
                        .await
                    {
                        Ok(ok) => success &= ok,
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            warn!("Failed to process remote document {}: {}", doc.path, e);
                            tick(&counters.errors);
                            success = false;
                        }
                    }
                }
                RemoteEntry::Link { name } => {
                    debug!("Ignoring link object {} in {}", name, folder.path);
                }
                RemoteEntry::Other { name, type_id } => {
                    debug!("Ignoring object {} of type {} in {}", name, type_id, folder.path);
                }
            }
        }

        Ok(Some((listing, success)))
    }

    /// One remote subfolder from pass 1.
    async fn crawl_remote_folder(
        &self,
        folder: &RemoteFolder,
        parent_local: &Path,
        counters: &PassCounters,
    ) -> Result<bool> {
        let local_path = parent_local.join(&folder.name);
        if local_path.is_dir() {
            return self
                .reconcile_dir(folder, local_path, counters)
                .await;
        }

        // The whole mount point disappearing must abort, not cascade into
        // deletes.
        self.ensure_root_present()?;

        if local_path.is_file() {
            debug!(
                "Removing stray local file {} shadowing a remote folder",
                local_path.display()
            );
            tokio::fs::remove_file(&local_path).await?;
        }

        let item = self.mapper.folder_item(&folder.path)?;
        if self.store.contains_folder(&item).await? {
            if !self.bidirectional() {
                // Download-only mode never mutates remote state; the local
                // deletion is undone instead.
                info!(
                    "Restoring {} locally (download-only mode ignores local deletes)",
                    folder.path
                );
                return self.download_folder_tree(folder, local_path, counters).await;
            }
            // Present in the store but gone locally: the user deleted it.
            let failed = self.remote.delete_tree(folder).await?;
            if failed.is_empty() {
                info!("Deleted remote folder {} (removed locally)", folder.path);
                tick(&counters.remote_deletes);
                self.store.remove(&item).await?;
                Ok(true)
            } else {
                // Deletion denied: restore the subtree locally instead of
                // losing remote data.
                self.activity.alert(&format!(
                    "Could not delete remote folder {} ({} objects denied); restoring it locally",
                    folder.path,
                    failed.len()
                ));
                self.download_folder_tree(folder, local_path, counters).await
            }
        } else {
            // Never synced before: a new remote folder.
            self.download_folder_tree(folder, local_path, counters).await
        }
    }

    /// One remote document from pass 1.
    async fn crawl_remote_document(
        &self,
        parent: &RemoteFolder,
        doc: &RemoteDocument,
        local_dir: &Path,
        listing: &mut RemoteListing,
        counters: &PassCounters,
    ) -> Result<bool> {
        let Some(filename) = doc.effective_filename() else {
            warn!("Remote document {} has no content filename; skipping", doc.path);
            return Ok(true);
        };
        let filename = filename.to_string();
        if !self.ignore.worth_syncing(local_dir, &filename) {
            return Ok(true);
        }
        listing.files.insert(filename.clone(), doc.clone());

        let local_path = local_dir.join(&filename);
        let item = match self.store.get_by_local_path(&local_path).await? {
            Some(item) => item,
            None => self
                .mapper
                .document_item(&parent.path, &doc.name, &filename)?,
        };

        if local_path.is_file() {
            if !self.store.contains_local_file(&local_path).await? {
                // First-time sync of a pre-existing remote file.
                self.download_document(doc, &local_path, &item, counters).await?;
            } else if let Some(recorded) = self.store.server_modification_date(&item).await? {
                if doc.modified > recorded {
                    // Remote changed; download_document preserves any
                    // concurrent local edit under a conflict name first.
                    self.download_document(doc, &local_path, &item, counters).await?;
                }
            }
            return Ok(true);
        }

        self.ensure_root_present()?;

        if self.store.contains_local_file(&local_path).await? {
            // Synced before, now gone locally: the user deleted it.
            match doc.checked_out_by.as_deref() {
                Some(user) if user != self.resolver_owner() => {
                    self.activity.alert(&format!(
                        "{} is checked out by {}; restoring it instead of deleting",
                        doc.path, user
                    ));
                    self.download_document(doc, &local_path, &item, counters).await?;
                }
                _ if !self.bidirectional() => {
                    // Download-only mode never mutates remote state; the
                    // local deletion is undone instead.
                    info!(
                        "Restoring {} locally (download-only mode ignores local deletes)",
                        doc.path
                    );
                    self.download_document(doc, &local_path, &item, counters).await?;
                }
                _ => {
                    self.remote.delete_all_versions(doc).await?;
                    self.store.remove(&item).await?;
                    info!("Deleted remote document {} (removed locally)", doc.path);
                    tick(&counters.remote_deletes);
                }
            }
        } else {
            // Brand-new remote file.
            self.download_document(doc, &local_path, &item, counters).await?;
        }
        Ok(true)
    }

    fn resolver_owner(&self) -> &str {
        self.resolver.owner()
    }

    /// Download one document to its local path and record it. An existing
    /// local file with unsynced edits is renamed aside first, never
    /// overwritten.
    async fn download_document(
        &self,
        doc: &RemoteDocument,
        local_path: &Path,
        item: &SyncItem,
        counters: &PassCounters,
    ) -> Result<()> {
        if local_path.is_file() && self.store.local_file_has_changed(local_path).await? {
            let backup = self.resolver.backup_aside(local_path).await?;
            tick(&counters.conflicts);
            self.activity.alert(&format!(
                "Conflict on {}: your version was kept as {}, the server version replaced the original",
                local_path.display(),
                backup.display()
            ));
        }

        self.activity.started();
        let result = async {
            let bytes = self.remote.download(doc).await?;
            tokio::fs::write(local_path, &bytes).await?;
            self.store.add(item, &doc.id, doc.modified).await
        }
        .await;
        self.activity.stopped();
        result?;

        tick(&counters.downloads);
        debug!("Downloaded {} -> {}", doc.path, local_path.display());
        Ok(())
    }

    /// Recursively materialize a remote folder subtree locally, recording
    /// every object as it lands.
    fn download_folder_tree<'a>(
        &'a self,
        folder: &'a RemoteFolder,
        local_dir: PathBuf,
        counters: &'a PassCounters,
    ) -> BoxFuture<'a, Result<bool>> {
        async move {
            self.gate.checkpoint().await;
            tokio::fs::create_dir_all(&local_dir).await?;
            let item = self.mapper.folder_item(&folder.path)?;
            self.store.add(&item, &folder.id, folder.modified).await?;
            debug!("Created local folder {}", local_dir.display());

            let children = match self.remote.list_children(folder).await {
                Ok(children) => children,
                Err(e) => {
                    warn!("Could not list remote folder {}: {}", folder.path, e);
                    tick(&counters.errors);
                    return Ok(false);
                }
            };

            let mut success = true;
            for entry in children {
                self.gate.checkpoint().await;
                match entry {
                    RemoteEntry::Folder(child) => {
                        if !self.ignore.worth_syncing(&local_dir, &child.name) {
                            continue;
                        }
                        let child_local = local_dir.join(&child.name);
                        match self.download_folder_tree(&child, child_local, counters).await {
                            Ok(ok) => success &= ok,
                            Err(e) if e.is_fatal() => return Err(e),
                            Err(e) => {
                                warn!("Failed to download folder {}: {}", child.path, e);
                                tick(&counters.errors);
                                success = false;
                            }
                        }
                    }
                    RemoteEntry::Document(doc) => {
                        let Some(filename) = doc.effective_filename() else {
                            warn!(
                                "Remote document {} has no content filename; skipping",
                                doc.path
                            );
                            continue;
                        };
                        let filename = filename.to_string();
                        if !self.ignore.worth_syncing(&local_dir, &filename) {
                            continue;
                        }
                        let local_path = local_dir.join(&filename);
                        let result = async {
                            let item =
                                self.mapper.document_item(&folder.path, &doc.name, &filename)?;
                            self.download_document(&doc, &local_path, &item, counters).await
                        }
                        .await;
                        match result {
                            Ok(()) => {}
                            Err(e) if e.is_fatal() => return Err(e),
                            Err(e) => {
                                warn!("Failed to download document {}: {}", doc.path, e);
                                tick(&counters.errors);
                                success = false;
                            }
                        }
                    }
                    RemoteEntry::Link { name } => {
                        debug!("Ignoring link object {} in {}", name, folder.path);
                    }
                    RemoteEntry::Other { name, type_id } => {
                        debug!(
                            "Ignoring object {} of type {} in {}",
                            name, type_id, folder.path
                        );
                    }
                }
            }
            Ok(success)
        }
        .boxed()
    }

    /// Pass 2: diff local files against the remote listing.
    async fn crawl_local_files(
        &self,
        local_dir: &Path,
        folder: &RemoteFolder,
        listing: &RemoteListing,
        counters: &PassCounters,
    ) -> Result<bool> {
        let mut entries = match tokio::fs::read_dir(local_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Could not read local directory {}: {}", local_dir.display(), e);
                tick(&counters.errors);
                return Ok(false);
            }
        };

        let mut success = true;
        while let Some(entry) = entries.next_entry().await? {
            self.gate.checkpoint().await;

            let file_type = match entry.file_type().await {
                Ok(ft) => ft,
                Err(e) => {
                    warn!("Could not stat {}: {}", entry.path().display(), e);
                    tick(&counters.errors);
                    success = false;
                    continue;
                }
            };
            if file_type.is_symlink() {
                debug!("Skipping symlink {}", entry.path().display());
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if !self.ignore.worth_syncing(local_dir, &name) {
                continue;
            }

            let path = entry.path();
            match self.sync_local_file(&path, &name, folder, listing, counters).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Failed to sync local file {}: {}", path.display(), e);
                    tick(&counters.errors);
                    success = false;
                }
            }
        }
        Ok(success)
    }

    /// One local file from pass 2.
    async fn sync_local_file(
        &self,
        path: &Path,
        name: &str,
        folder: &RemoteFolder,
        listing: &RemoteListing,
        counters: &PassCounters,
    ) -> Result<()> {
        if let Some(doc) = listing.document(name) {
            // Present on both sides: push a content update if the local
            // replica changed since the last agreed state.
            if self.bidirectional()
                && self.store.contains_local_file(path).await?
                && self.store.local_file_has_changed(path).await?
            {
                self.activity.started();
                let result = async {
                    let updated = self.remote.update_content(doc, path).await?;
                    let item = match self.store.get_by_local_path(path).await? {
                        Some(item) => item,
                        None => self.mapper.local_item(path, false)?,
                    };
                    self.store.add(&item, &updated.id, updated.modified).await
                }
                .await;
                self.activity.stopped();
                result?;
                tick(&counters.uploads);
                debug!("Updated remote content of {}", path.display());
            }
            return Ok(());
        }

        // Absent remotely.
        match self.store.get_by_local_path(path).await? {
            Some(item) => {
                if self.store.local_file_has_changed(path).await? {
                    if self.bidirectional() {
                        // The local edit wins over the remote deletion.
                        self.upload_document(folder, path, counters).await?;
                    } else {
                        // Download-only mode never recreates remote state;
                        // preserve the edit under a conflict name.
                        let backup = self.resolver.backup_aside(path).await?;
                        self.store.remove(&item).await?;
                        tick(&counters.conflicts);
                        self.activity.alert(&format!(
                            "{} disappeared from the server; your edits were kept as {}",
                            path.display(),
                            backup.display()
                        ));
                    }
                } else {
                    // Unchanged locally: the remote deletion wins.
                    tokio::fs::remove_file(path).await?;
                    self.store.remove(&item).await?;
                    info!("Removed local file {} (deleted remotely)", path.display());
                    tick(&counters.local_deletes);
                }
            }
            None => {
                if self.bidirectional() {
                    // Brand-new local file.
                    self.upload_document(folder, path, counters).await?;
                }
            }
        }
        Ok(())
    }

    /// Upload one local file as a new remote document and record it.
    async fn upload_document(
        &self,
        folder: &RemoteFolder,
        path: &Path,
        counters: &PassCounters,
    ) -> Result<()> {
        self.activity.started();
        let result = async {
            let doc = self.remote.upload(folder, path).await?;
            let item = self.mapper.local_item(path, false)?;
            self.store.add(&item, &doc.id, doc.modified).await
        }
        .await;
        self.activity.stopped();
        result?;
        tick(&counters.uploads);
        debug!("Uploaded {} into {}", path.display(), folder.path);
        Ok(())
    }

    /// Pass 3: diff local subdirectories against the remote listing.
    /// Directories present on both sides were already recursed in pass 1.
    async fn crawl_local_folders(
        &self,
        local_dir: &Path,
        folder: &RemoteFolder,
        listing: &RemoteListing,
        counters: &PassCounters,
    ) -> Result<bool> {
        let mut entries = match tokio::fs::read_dir(local_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Could not read local directory {}: {}", local_dir.display(), e);
                tick(&counters.errors);
                return Ok(false);
            }
        };

        let mut success = true;
        while let Some(entry) = entries.next_entry().await? {
            self.gate.checkpoint().await;

            let file_type = match entry.file_type().await {
                Ok(ft) => ft,
                Err(e) => {
                    warn!("Could not stat {}: {}", entry.path().display(), e);
                    tick(&counters.errors);
                    success = false;
                    continue;
                }
            };
            if file_type.is_symlink() || !file_type.is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if !self.ignore.worth_syncing(local_dir, &name) {
                continue;
            }
            if listing.folders.contains(&name) {
                continue;
            }

            let path = entry.path();
            let result = self
                .sync_local_folder(&path, folder, counters)
                .await;
            match result {
                Ok(ok) => success &= ok,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Failed to sync local folder {}: {}", path.display(), e);
                    tick(&counters.errors);
                    success = false;
                }
            }
        }
        Ok(success)
    }

    /// One local directory from pass 3 that did not appear remotely.
    async fn sync_local_folder(
        &self,
        path: &Path,
        folder: &RemoteFolder,
        counters: &PassCounters,
    ) -> Result<bool> {
        let item = match self.store.get_by_local_path(path).await? {
            Some(item) => item,
            None => self.mapper.local_item(path, true)?,
        };

        if self.store.contains_folder(&item).await? {
            // Synced before and gone remotely: the remote deletion wins.
            // No remote call is made; the folder is already absent there.
            tokio::fs::remove_dir_all(path).await?;
            self.store.remove(&item).await?;
            info!("Removed local folder {} (deleted remotely)", path.display());
            tick(&counters.local_deletes);
            Ok(true)
        } else if self.bidirectional() {
            // Brand-new local subtree.
            self.upload_folder_tree(path.to_path_buf(), folder, counters).await
        } else {
            Ok(true)
        }
    }

    /// Recursively create a remote folder subtree from a local one,
    /// recording every object as it lands.
    fn upload_folder_tree<'a>(
        &'a self,
        local_dir: PathBuf,
        remote_parent: &'a RemoteFolder,
        counters: &'a PassCounters,
    ) -> BoxFuture<'a, Result<bool>> {
        async move {
            self.gate.checkpoint().await;
            let name = local_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| SyncError::InvalidPath(local_dir.display().to_string()))?;

            let created = self.remote.create_folder(remote_parent, &name).await?;
            let item = self.mapper.local_item(&local_dir, true)?;
            self.store.add(&item, &created.id, created.modified).await?;
            tick(&counters.uploads);
            debug!("Created remote folder {}", created.path);

            let mut entries = tokio::fs::read_dir(&local_dir).await?;
            let mut success = true;
            while let Some(entry) = entries.next_entry().await? {
                self.gate.checkpoint().await;

                let file_type = match entry.file_type().await {
                    Ok(ft) => ft,
                    Err(e) => {
                        warn!("Could not stat {}: {}", entry.path().display(), e);
                        tick(&counters.errors);
                        success = false;
                        continue;
                    }
                };
                if file_type.is_symlink() {
                    debug!("Skipping symlink {}", entry.path().display());
                    continue;
                }

                let child_name = entry.file_name().to_string_lossy().into_owned();
                if !self.ignore.worth_syncing(&local_dir, &child_name) {
                    continue;
                }

                let child = entry.path();
                let result = if file_type.is_dir() {
                    self.upload_folder_tree(child.clone(), &created, counters).await
                } else {
                    self.upload_document(&created, &child, counters).await.map(|()| true)
                };
                match result {
                    Ok(ok) => success &= ok,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!("Failed to upload {}: {}", child.display(), e);
                        tick(&counters.errors);
                        success = false;
                    }
                }
            }
            Ok(success)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn doc(path: &str, filename: &str) -> RemoteDocument {
        RemoteDocument {
            id: format!("id:{path}"),
            path: path.to_string(),
            name: filename.to_string(),
            content_filename: Some(filename.to_string()),
            modified: Utc::now(),
            checked_out_by: None,
        }
    }

    #[test]
    fn listing_lookup_falls_back_to_zip_suffix() {
        let mut listing = RemoteListing::default();
        listing
            .files
            .insert("report.zip".to_string(), doc("/docs/report", "report.zip"));

        assert!(listing.document("report.zip").is_some());
        assert!(listing.document("report").is_some());
        assert!(listing.document("other").is_none());
    }

    #[test]
    fn counters_snapshot_into_stats() {
        let counters = PassCounters::default();
        tick(&counters.downloads);
        tick(&counters.downloads);
        tick(&counters.conflicts);

        let stats = counters.snapshot();
        assert_eq!(stats.downloads, 2);
        assert_eq!(stats.conflicts, 1);
        assert!(!stats.is_noop());
        assert!(PassStats::default().is_noop());
    }
}
