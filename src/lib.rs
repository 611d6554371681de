//! Two-way synchronization between a local directory tree and a remote
//! document repository.
//!
//! The engine keeps the two trees convergent:
//! - Depth-first three-pass reconciliation of remote and local state
//! - A persisted metadata store recording the last agreed state per object
//! - Conflict handling that never destroys local data
//! - A scheduler driving full passes on a timer and debounced partial
//!   passes from filesystem events
//!
//! Remote access, metadata persistence, and user-facing notifications sit
//! behind traits ([`RemoteRepositoryClient`], [`MetadataStore`],
//! [`ActivitySink`]) so protocol bindings and frontends stay out of the
//! engine.

pub mod activity;
pub mod config;
pub mod conflict;
pub mod errors;
pub mod ignore;
pub mod item;
pub mod mapper;
pub mod memory;
pub mod reconciler;
pub mod remote;
pub mod scheduler;
pub mod store;
pub mod watcher;

pub use activity::{ActivitySink, LogActivitySink, NullActivitySink};
pub use config::{SyncConfig, SyncDirection};
pub use conflict::ConflictResolver;
pub use errors::{Result, SyncError};
pub use ignore::IgnorePolicy;
pub use item::SyncItem;
pub use mapper::PathMapper;
pub use memory::InMemoryRemote;
pub use reconciler::{PassOutcome, PassStats, TreeReconciler};
pub use remote::{
    ChangeLogToken, RemoteDocument, RemoteEntry, RemoteFolder, RemoteRepositoryClient,
};
pub use scheduler::{
    EngineState, EngineStatus, SchedulerHandle, SuspendGate, SyncScheduler,
};
pub use store::{file_checksum, MetadataStore, SqliteMetadataStore};
pub use watcher::{FileEvent, FileEventKind, FileWatcher};
