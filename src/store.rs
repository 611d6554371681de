//! Persisted metadata store: the identity/state oracle of the engine
//!
//! A record exists for an object iff the engine has, at some point, made the
//! local and remote sides agree on it. Absence means "never synced"; presence
//! plus a checksum mismatch means "locally edited since last sync".

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::Result;
use crate::item::SyncItem;
use crate::remote::ChangeLogToken;

/// Blake3 hex digest of a file's content.
pub fn file_checksum(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// The store interface the reconciler and scheduler consume.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_by_local_path(&self, path: &Path) -> Result<Option<SyncItem>>;

    async fn get_by_remote_path(&self, path: &str) -> Result<Option<SyncItem>>;

    /// Persist a record once the object exists on both sides. For documents
    /// the checksum of the local replica is recorded as the last-synced
    /// content digest.
    async fn add(&self, item: &SyncItem, remote_id: &str, modified: DateTime<Utc>) -> Result<()>;

    /// Drop a record; for folders, drops the whole subtree's records.
    async fn remove(&self, item: &SyncItem) -> Result<()>;

    /// All records whose local path sits directly inside `dir`.
    async fn children_of(&self, dir: &Path) -> Result<Vec<SyncItem>>;

    async fn contains_local_file(&self, path: &Path) -> Result<bool>;

    async fn contains_folder(&self, item: &SyncItem) -> Result<bool>;

    /// Whether the local file's content differs from the recorded digest.
    /// An unrecorded file counts as changed.
    async fn local_file_has_changed(&self, path: &Path) -> Result<bool>;

    async fn server_modification_date(&self, item: &SyncItem) -> Result<Option<DateTime<Utc>>>;

    async fn checksum(&self, path: &Path) -> Result<Option<String>>;

    async fn change_log_token(&self) -> Result<Option<ChangeLogToken>>;

    async fn set_change_log_token(&self, token: &ChangeLogToken) -> Result<()>;

    async fn last_full_sync(&self) -> Result<Option<DateTime<Utc>>>;

    async fn set_last_full_sync(&self, when: DateTime<Utc>) -> Result<()>;

    async fn last_partial_sync(&self) -> Result<Option<DateTime<Utc>>>;

    async fn set_last_partial_sync(&self, when: DateTime<Utc>) -> Result<()>;
}

/// Blocking SQLite core. `rusqlite::Connection` is `Send` but not `Sync`,
/// so all access goes through the Mutex in `SqliteMetadataStore`.
struct MetadataDb {
    conn: Connection,
}

/// Escape `%`, `_`, and the escape character itself for a SQL LIKE pattern
/// using `ESCAPE '\'`.
fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

impl MetadataDb {
    fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_items (
                local_path TEXT PRIMARY KEY,
                remote_path TEXT NOT NULL UNIQUE,
                remote_leafname TEXT NOT NULL,
                local_leafname TEXT NOT NULL,
                is_folder INTEGER NOT NULL,
                remote_object_id TEXT NOT NULL,
                server_modified TEXT NOT NULL,
                checksum TEXT,
                updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS engine_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sync_items_remote ON sync_items(remote_path);
            "#,
        )?;

        info!("Metadata store initialized");
        Ok(())
    }

    fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncItem> {
        Ok(SyncItem {
            local_path: PathBuf::from(row.get::<_, String>(0)?),
            remote_path: row.get(1)?,
            remote_leafname: row.get(2)?,
            local_leafname: row.get(3)?,
            is_folder: row.get(4)?,
        })
    }

    fn get_by_local_path(&self, path: &Path) -> Result<Option<SyncItem>> {
        let item = self
            .conn
            .query_row(
                r#"
                SELECT local_path, remote_path, remote_leafname, local_leafname, is_folder
                FROM sync_items WHERE local_path = ?1
                "#,
                params![path.to_string_lossy()],
                Self::row_to_item,
            )
            .optional()?;
        Ok(item)
    }

    fn get_by_remote_path(&self, path: &str) -> Result<Option<SyncItem>> {
        let item = self
            .conn
            .query_row(
                r#"
                SELECT local_path, remote_path, remote_leafname, local_leafname, is_folder
                FROM sync_items WHERE remote_path = ?1
                "#,
                params![path],
                Self::row_to_item,
            )
            .optional()?;
        Ok(item)
    }

    fn add(&mut self, item: &SyncItem, remote_id: &str, modified: DateTime<Utc>) -> Result<()> {
        let checksum = if item.is_folder {
            None
        } else {
            Some(file_checksum(&item.local_path)?)
        };

        self.conn.execute(
            r#"
            INSERT INTO sync_items
                (local_path, remote_path, remote_leafname, local_leafname,
                 is_folder, remote_object_id, server_modified, checksum, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, CURRENT_TIMESTAMP)
            ON CONFLICT(local_path) DO UPDATE SET
                remote_path = excluded.remote_path,
                remote_leafname = excluded.remote_leafname,
                local_leafname = excluded.local_leafname,
                is_folder = excluded.is_folder,
                remote_object_id = excluded.remote_object_id,
                server_modified = excluded.server_modified,
                checksum = excluded.checksum,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![
                item.local_path.to_string_lossy(),
                item.remote_path,
                item.remote_leafname,
                item.local_leafname,
                item.is_folder,
                remote_id,
                modified.to_rfc3339(),
                checksum,
            ],
        )?;

        debug!("Recorded {}", item.local_path.display());
        Ok(())
    }

    fn remove(&mut self, item: &SyncItem) -> Result<()> {
        let local = item.local_path.to_string_lossy().into_owned();
        if item.is_folder {
            let prefix = format!(
                "{}%",
                escape_like(&format!("{local}{}", std::path::MAIN_SEPARATOR))
            );
            self.conn.execute(
                r#"DELETE FROM sync_items WHERE local_path = ?1 OR local_path LIKE ?2 ESCAPE '\'"#,
                params![local, prefix],
            )?;
        } else {
            self.conn
                .execute("DELETE FROM sync_items WHERE local_path = ?1", params![local])?;
        }
        debug!("Dropped record for {}", item.local_path.display());
        Ok(())
    }

    fn children_of(&self, dir: &Path) -> Result<Vec<SyncItem>> {
        let prefix = format!(
            "{}%",
            escape_like(&format!(
                "{}{}",
                dir.to_string_lossy(),
                std::path::MAIN_SEPARATOR
            ))
        );
        let mut stmt = self.conn.prepare(
            r#"
            SELECT local_path, remote_path, remote_leafname, local_leafname, is_folder
            FROM sync_items WHERE local_path LIKE ?1 ESCAPE '\'
            "#,
        )?;
        let rows = stmt.query_map(params![prefix], Self::row_to_item)?;
        let mut items = Vec::new();
        for row in rows {
            let item = row?;
            if item.local_path.parent() == Some(dir) {
                items.push(item);
            }
        }
        Ok(items)
    }

    fn contains_local_file(&self, path: &Path) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_items WHERE local_path = ?1 AND is_folder = 0",
            params![path.to_string_lossy()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn contains_folder(&self, item: &SyncItem) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_items WHERE local_path = ?1 AND is_folder = 1",
            params![item.local_path.to_string_lossy()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn checksum(&self, path: &Path) -> Result<Option<String>> {
        let checksum = self
            .conn
            .query_row(
                "SELECT checksum FROM sync_items WHERE local_path = ?1",
                params![path.to_string_lossy()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(checksum.flatten())
    }

    fn local_file_has_changed(&self, path: &Path) -> Result<bool> {
        match self.checksum(path)? {
            Some(recorded) => Ok(file_checksum(path)? != recorded),
            None => Ok(true),
        }
    }

    fn server_modification_date(&self, item: &SyncItem) -> Result<Option<DateTime<Utc>>> {
        let stored = self
            .conn
            .query_row(
                "SELECT server_modified FROM sync_items WHERE local_path = ?1",
                params![item.local_path.to_string_lossy()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(stored.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }))
    }

    fn get_state(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM engine_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_state(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO engine_state (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
            params![key, value],
        )?;
        Ok(())
    }
}

const STATE_CHANGE_LOG_TOKEN: &str = "change_log_token";
const STATE_LAST_FULL_SYNC: &str = "last_full_sync";
const STATE_LAST_PARTIAL_SYNC: &str = "last_partial_sync";

/// Async-safe SQLite-backed metadata store.
#[derive(Clone)]
pub struct SqliteMetadataStore {
    inner: Arc<Mutex<MetadataDb>>,
}

impl SqliteMetadataStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = MetadataDb::open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(db)),
        })
    }

    /// In-memory store, used by the test suite.
    pub async fn open_in_memory() -> Result<Self> {
        let db = MetadataDb::open_in_memory()?;
        Ok(Self {
            inner: Arc::new(Mutex::new(db)),
        })
    }

    async fn get_time(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let db = self.inner.lock().await;
        Ok(db.get_state(key)?.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }))
    }

    async fn set_time(&self, key: &str, when: DateTime<Utc>) -> Result<()> {
        let mut db = self.inner.lock().await;
        db.set_state(key, &when.to_rfc3339())
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn get_by_local_path(&self, path: &Path) -> Result<Option<SyncItem>> {
        self.inner.lock().await.get_by_local_path(path)
    }

    async fn get_by_remote_path(&self, path: &str) -> Result<Option<SyncItem>> {
        self.inner.lock().await.get_by_remote_path(path)
    }

    async fn add(&self, item: &SyncItem, remote_id: &str, modified: DateTime<Utc>) -> Result<()> {
        self.inner.lock().await.add(item, remote_id, modified)
    }

    async fn remove(&self, item: &SyncItem) -> Result<()> {
        self.inner.lock().await.remove(item)
    }

    async fn children_of(&self, dir: &Path) -> Result<Vec<SyncItem>> {
        self.inner.lock().await.children_of(dir)
    }

    async fn contains_local_file(&self, path: &Path) -> Result<bool> {
        self.inner.lock().await.contains_local_file(path)
    }

    async fn contains_folder(&self, item: &SyncItem) -> Result<bool> {
        self.inner.lock().await.contains_folder(item)
    }

    async fn local_file_has_changed(&self, path: &Path) -> Result<bool> {
        self.inner.lock().await.local_file_has_changed(path)
    }

    async fn server_modification_date(&self, item: &SyncItem) -> Result<Option<DateTime<Utc>>> {
        self.inner.lock().await.server_modification_date(item)
    }

    async fn checksum(&self, path: &Path) -> Result<Option<String>> {
        self.inner.lock().await.checksum(path)
    }

    async fn change_log_token(&self) -> Result<Option<ChangeLogToken>> {
        let db = self.inner.lock().await;
        Ok(db.get_state(STATE_CHANGE_LOG_TOKEN)?.map(ChangeLogToken))
    }

    async fn set_change_log_token(&self, token: &ChangeLogToken) -> Result<()> {
        let mut db = self.inner.lock().await;
        db.set_state(STATE_CHANGE_LOG_TOKEN, &token.0)
    }

    async fn last_full_sync(&self) -> Result<Option<DateTime<Utc>>> {
        self.get_time(STATE_LAST_FULL_SYNC).await
    }

    async fn set_last_full_sync(&self, when: DateTime<Utc>) -> Result<()> {
        self.set_time(STATE_LAST_FULL_SYNC, when).await
    }

    async fn last_partial_sync(&self) -> Result<Option<DateTime<Utc>>> {
        self.get_time(STATE_LAST_PARTIAL_SYNC).await
    }

    async fn set_last_partial_sync(&self, when: DateTime<Utc>) -> Result<()> {
        self.set_time(STATE_LAST_PARTIAL_SYNC, when).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store_with_file(content: &[u8]) -> (SqliteMetadataStore, TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.pdf");
        std::fs::write(&path, content).unwrap();
        let store = SqliteMetadataStore::open_in_memory().await.unwrap();
        (store, dir, path)
    }

    #[tokio::test]
    async fn add_and_lookup_both_directions() {
        let (store, _dir, path) = store_with_file(b"content").await;
        let item = SyncItem::document(&path, "/docs/report.pdf", "report.pdf");
        store.add(&item, "obj-1", Utc::now()).await.unwrap();

        assert!(store.contains_local_file(&path).await.unwrap());
        let by_remote = store.get_by_remote_path("/docs/report.pdf").await.unwrap().unwrap();
        assert_eq!(by_remote.local_path, path);
        let by_local = store.get_by_local_path(&path).await.unwrap().unwrap();
        assert_eq!(by_local.remote_path, "/docs/report.pdf");
    }

    #[tokio::test]
    async fn change_detection_uses_recorded_checksum() {
        let (store, _dir, path) = store_with_file(b"v1").await;
        let item = SyncItem::document(&path, "/docs/report.pdf", "report.pdf");
        store.add(&item, "obj-1", Utc::now()).await.unwrap();

        assert!(!store.local_file_has_changed(&path).await.unwrap());
        std::fs::write(&path, b"v2").unwrap();
        assert!(store.local_file_has_changed(&path).await.unwrap());
    }

    #[tokio::test]
    async fn unrecorded_file_counts_as_changed() {
        let (store, _dir, path) = store_with_file(b"v1").await;
        assert!(store.local_file_has_changed(&path).await.unwrap());
    }

    #[tokio::test]
    async fn removing_a_folder_drops_the_subtree() {
        let dir = TempDir::new().unwrap();
        let store = SqliteMetadataStore::open_in_memory().await.unwrap();

        let folder = SyncItem::folder(dir.path().join("reports"), "/docs/reports");
        store.add(&folder, "f-1", Utc::now()).await.unwrap();

        let inner = dir.path().join("reports").join("q1.pdf");
        std::fs::create_dir_all(dir.path().join("reports")).unwrap();
        std::fs::write(&inner, b"pdf").unwrap();
        let doc = SyncItem::document(&inner, "/docs/reports/q1.pdf", "q1.pdf");
        store.add(&doc, "d-1", Utc::now()).await.unwrap();

        store.remove(&folder).await.unwrap();
        assert!(!store.contains_folder(&folder).await.unwrap());
        assert!(!store.contains_local_file(&inner).await.unwrap());
    }

    #[tokio::test]
    async fn removing_a_folder_leaves_like_named_siblings_alone() {
        let dir = TempDir::new().unwrap();
        let store = SqliteMetadataStore::open_in_memory().await.unwrap();

        let doomed = SyncItem::folder(dir.path().join("a_b"), "/docs/a_b");
        store.add(&doomed, "f-1", Utc::now()).await.unwrap();

        // `_` would match any character if the LIKE pattern were unescaped.
        let sibling = SyncItem::folder(dir.path().join("axb"), "/docs/axb");
        store.add(&sibling, "f-2", Utc::now()).await.unwrap();
        std::fs::create_dir_all(dir.path().join("axb")).unwrap();
        let inner = dir.path().join("axb").join("keep.txt");
        std::fs::write(&inner, b"keep").unwrap();
        let doc = SyncItem::document(&inner, "/docs/axb/keep.txt", "keep.txt");
        store.add(&doc, "d-1", Utc::now()).await.unwrap();

        store.remove(&doomed).await.unwrap();
        assert!(!store.contains_folder(&doomed).await.unwrap());
        assert!(store.contains_folder(&sibling).await.unwrap());
        assert!(store.contains_local_file(&inner).await.unwrap());
    }

    #[tokio::test]
    async fn children_of_lists_direct_children_only() {
        let dir = TempDir::new().unwrap();
        let store = SqliteMetadataStore::open_in_memory().await.unwrap();

        let reports = dir.path().join("reports");
        std::fs::create_dir_all(reports.join("archive")).unwrap();

        let folder = SyncItem::folder(&reports, "/docs/reports");
        store.add(&folder, "f-1", Utc::now()).await.unwrap();
        let sub = SyncItem::folder(reports.join("archive"), "/docs/reports/archive");
        store.add(&sub, "f-2", Utc::now()).await.unwrap();

        let direct = reports.join("q1.pdf");
        std::fs::write(&direct, b"pdf").unwrap();
        let doc = SyncItem::document(&direct, "/docs/reports/q1.pdf", "q1.pdf");
        store.add(&doc, "d-1", Utc::now()).await.unwrap();

        let deep = reports.join("archive").join("q0.pdf");
        std::fs::write(&deep, b"pdf").unwrap();
        let deep_doc = SyncItem::document(&deep, "/docs/reports/archive/q0.pdf", "q0.pdf");
        store.add(&deep_doc, "d-2", Utc::now()).await.unwrap();

        let mut names: Vec<_> = store
            .children_of(&reports)
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.local_leafname)
            .collect();
        names.sort();
        assert_eq!(names, vec!["archive".to_string(), "q1.pdf".to_string()]);
    }

    #[tokio::test]
    async fn store_is_safe_to_share_across_tasks() {
        let dir = TempDir::new().unwrap();
        let store = SqliteMetadataStore::open_in_memory().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let path = dir.path().join(format!("doc-{i}.txt"));
            std::fs::write(&path, format!("body {i}")).unwrap();
            handles.push(tokio::spawn(async move {
                let remote = format!("/docs/doc-{i}.txt");
                let leaf = format!("doc-{i}.txt");
                let item = SyncItem::document(&path, &remote, &leaf);
                store.add(&item, &format!("obj-{i}"), Utc::now()).await.unwrap();
                assert!(store.contains_local_file(&path).await.unwrap());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn persists_change_log_token_and_timestamps() {
        let store = SqliteMetadataStore::open_in_memory().await.unwrap();
        assert!(store.change_log_token().await.unwrap().is_none());

        store
            .set_change_log_token(&ChangeLogToken("42".to_string()))
            .await
            .unwrap();
        assert_eq!(
            store.change_log_token().await.unwrap().unwrap().0,
            "42"
        );

        let now = Utc::now();
        store.set_last_full_sync(now).await.unwrap();
        let stored = store.last_full_sync().await.unwrap().unwrap();
        assert_eq!(stored.timestamp(), now.timestamp());
        assert!(store.last_partial_sync().await.unwrap().is_none());
    }
}
