//! Filesystem change notifications
//!
//! Watches the local sync root recursively and delivers change events in
//! small batches. The scheduler pauses delivery around reconciliation passes
//! so the engine never reacts to its own writes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, info, warn};

use crate::errors::Result;
use crate::ignore::IgnorePolicy;

const BATCH_TIMEOUT: Duration = Duration::from_millis(100);

/// One local filesystem change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
}

/// Recursive directory watcher with junk filtering and batch delivery.
pub struct FileWatcher {
    root: PathBuf,
    ignore: IgnorePolicy,
    paused: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    watcher: Option<RecommendedWatcher>,
}

impl FileWatcher {
    pub fn new(root: PathBuf, ignore: IgnorePolicy) -> Self {
        Self {
            root,
            ignore,
            paused: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            watcher: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shared flag that silences event delivery while set. Events arriving
    /// while paused are discarded, not queued.
    pub fn pause_flag(&self) -> Arc<AtomicBool> {
        self.paused.clone()
    }

    /// Start watching; `callback` receives each debounce batch.
    pub fn start<F>(&mut self, callback: F) -> Result<()>
    where
        F: Fn(Vec<FileEvent>) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if let Err(e) = tx.send(event) {
                        error!("Failed to forward filesystem event: {}", e);
                    }
                }
                Err(e) => error!("Filesystem watcher error: {}", e),
            }
        })?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        self.watcher = Some(watcher);
        self.running.store(true, Ordering::SeqCst);
        info!("Watching {}", self.root.display());

        let running = self.running.clone();
        let paused = self.paused.clone();
        let ignore = self.ignore.clone();
        let root = self.root.clone();

        tokio::task::spawn_blocking(move || {
            let mut pending: Vec<FileEvent> = Vec::new();
            loop {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                match rx.recv_timeout(BATCH_TIMEOUT) {
                    Ok(event) => {
                        if paused.load(Ordering::SeqCst) {
                            continue;
                        }
                        pending.extend(convert_event(event, &ignore));
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if !pending.is_empty() {
                            if paused.load(Ordering::SeqCst) {
                                pending.clear();
                                continue;
                            }
                            let batch = std::mem::take(&mut pending);
                            debug!("Delivering {} filesystem events", batch.len());
                            callback(batch);
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        warn!("Filesystem watcher channel closed");
                        break;
                    }
                }
            }
            info!("Stopped watching {}", root.display());
        });

        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.watcher = None;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Map one raw notify event to zero or more engine events, dropping junk
/// filenames and event kinds the engine does not react to.
fn convert_event(event: Event, ignore: &IgnorePolicy) -> Vec<FileEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => FileEventKind::Created,
        EventKind::Modify(_) => FileEventKind::Modified,
        EventKind::Remove(_) => FileEventKind::Deleted,
        _ => return Vec::new(),
    };

    event
        .paths
        .into_iter()
        .filter(|path| {
            match (path.parent(), path.file_name().and_then(|n| n.to_str())) {
                (Some(parent), Some(name)) => ignore.worth_syncing(parent, name),
                _ => false,
            }
        })
        .map(|path| FileEvent { path, kind })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::time::sleep;

    #[tokio::test]
    async fn delivers_create_events_and_skips_junk() {
        let dir = TempDir::new().unwrap();
        let mut watcher = FileWatcher::new(dir.path().to_path_buf(), IgnorePolicy::default());

        let seen: Arc<Mutex<Vec<FileEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        watcher
            .start(move |events| sink.lock().unwrap().extend(events))
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        std::fs::write(dir.path().join("doc.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"junk").unwrap();
        sleep(Duration::from_millis(300)).await;

        let events = seen.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| e.path.ends_with("doc.txt") && e.kind == FileEventKind::Created));
        assert!(!events.iter().any(|e| e.path.ends_with(".hidden")));
    }

    #[tokio::test]
    async fn paused_watcher_discards_events() {
        let dir = TempDir::new().unwrap();
        let mut watcher = FileWatcher::new(dir.path().to_path_buf(), IgnorePolicy::default());
        let pause = watcher.pause_flag();

        let seen: Arc<Mutex<Vec<FileEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        watcher
            .start(move |events| sink.lock().unwrap().extend(events))
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        pause.store(true, Ordering::SeqCst);
        std::fs::write(dir.path().join("quiet.txt"), b"hello").unwrap();
        sleep(Duration::from_millis(300)).await;
        assert!(seen.lock().unwrap().is_empty());

        pause.store(false, Ordering::SeqCst);
        std::fs::write(dir.path().join("loud.txt"), b"hello").unwrap();
        sleep(Duration::from_millis(300)).await;
        assert!(seen
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.path.ends_with("loud.txt")));
    }
}
