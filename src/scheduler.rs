//! Pass scheduling
//!
//! A single worker task owns the reconciler and runs at most one pass at a
//! time. Full passes fire on a poll-interval timer that restarts only after
//! the pass completes, so slow passes never overlap. Filesystem event
//! batches arm a debounced partial-pass timer; each new batch pushes the
//! deadline out again, so a partial pass runs only once the tree has been
//! quiet for the debounce window.
//!
//! Around every pass the worker silences the filesystem watcher and drains
//! any event batches already queued, so the engine never schedules work in
//! response to its own writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::activity::ActivitySink;
use crate::errors::{Result, SyncError};
use crate::reconciler::{PassStats, TreeReconciler};
use crate::remote::RemoteRepositoryClient;
use crate::store::MetadataStore;
use crate::watcher::FileEvent;

/// Cooperative suspension flag shared between the scheduler and the
/// reconciler. The reconciler polls [`SuspendGate::checkpoint`] between
/// directories and children, so suspension takes effect at the next object
/// boundary rather than mid-transfer.
#[derive(Debug, Clone)]
pub struct SuspendGate {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for SuspendGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SuspendGate {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn suspend(&self) {
        let _ = self.tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(false);
    }

    pub fn is_suspended(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait here while suspended; returns immediately otherwise.
    pub async fn checkpoint(&self) {
        let mut rx = self.rx.clone();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Syncing,
    Suspended,
}

/// Point-in-time snapshot of the engine, queryable without blocking on the
/// worker.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub state: EngineState,
    pub last_full_sync: Option<DateTime<Utc>>,
    pub last_partial_sync: Option<DateTime<Utc>>,
    /// Stats of the most recent pass, full or partial.
    pub last_stats: Option<PassStats>,
    /// Whether the most recent pass completed without per-object failures.
    pub last_success: Option<bool>,
}

impl EngineStatus {
    fn initial() -> Self {
        Self {
            state: EngineState::Idle,
            last_full_sync: None,
            last_partial_sync: None,
            last_stats: None,
            last_success: None,
        }
    }
}

enum EngineMessage {
    SyncNow,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassKind {
    Full,
    Partial,
}

/// Drives reconciliation passes from timers, filesystem events, and manual
/// triggers. Consumed by [`SyncScheduler::start`].
pub struct SyncScheduler {
    reconciler: Arc<TreeReconciler>,
    store: Arc<dyn MetadataStore>,
    remote: Arc<dyn RemoteRepositoryClient>,
    activity: Arc<dyn ActivitySink>,
    gate: SuspendGate,
    /// Shared with the filesystem watcher; set while a pass runs.
    notifications_paused: Arc<AtomicBool>,
    poll_interval: Duration,
    debounce: Duration,
}

impl SyncScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reconciler: Arc<TreeReconciler>,
        store: Arc<dyn MetadataStore>,
        remote: Arc<dyn RemoteRepositoryClient>,
        activity: Arc<dyn ActivitySink>,
        gate: SuspendGate,
        notifications_paused: Arc<AtomicBool>,
        poll_interval: Duration,
        debounce: Duration,
    ) -> Self {
        Self {
            reconciler,
            store,
            remote,
            activity,
            gate,
            notifications_paused,
            poll_interval,
            debounce,
        }
    }

    /// Spawn the worker task. The first full pass runs immediately.
    pub fn start(self) -> SchedulerHandle {
        let (control_tx, control_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(EngineStatus::initial());
        let gate = self.gate.clone();

        let task = tokio::spawn(self.run(control_rx, events_rx, status_tx));

        SchedulerHandle {
            control: control_tx,
            events: events_tx,
            status: status_rx,
            gate,
            task,
        }
    }

    async fn run(
        self,
        mut control: mpsc::Receiver<EngineMessage>,
        mut events: mpsc::UnboundedReceiver<Vec<FileEvent>>,
        status_tx: watch::Sender<EngineStatus>,
    ) {
        let mut status = EngineStatus::initial();
        match self.store.last_full_sync().await {
            Ok(ts) => status.last_full_sync = ts,
            Err(e) => warn!("Could not read last full sync timestamp: {}", e),
        }
        match self.store.last_partial_sync().await {
            Ok(ts) => status.last_partial_sync = ts,
            Err(e) => warn!("Could not read last partial sync timestamp: {}", e),
        }
        let _ = status_tx.send(status.clone());

        let mut full_deadline = Instant::now();
        let mut partial_deadline: Option<Instant> = None;

        loop {
            let partial_wait = async move {
                match partial_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                msg = control.recv() => match msg {
                    Some(EngineMessage::SyncNow) => {
                        self.execute_pass(PassKind::Full, &mut events, &mut status, &status_tx).await;
                        full_deadline = Instant::now() + self.poll_interval;
                        partial_deadline = None;
                    }
                    Some(EngineMessage::Shutdown) | None => break,
                },
                batch = events.recv() => match batch {
                    Some(batch) if !batch.is_empty() => {
                        debug!("{} filesystem events; partial pass in {:?}", batch.len(), self.debounce);
                        partial_deadline = Some(Instant::now() + self.debounce);
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = partial_wait => {
                    self.execute_pass(PassKind::Partial, &mut events, &mut status, &status_tx).await;
                    partial_deadline = None;
                }
                _ = tokio::time::sleep_until(full_deadline) => {
                    self.execute_pass(PassKind::Full, &mut events, &mut status, &status_tx).await;
                    full_deadline = Instant::now() + self.poll_interval;
                    partial_deadline = None;
                }
            }
        }
        info!("Scheduler worker stopped");
    }

    async fn execute_pass(
        &self,
        kind: PassKind,
        events: &mut mpsc::UnboundedReceiver<Vec<FileEvent>>,
        status: &mut EngineStatus,
        status_tx: &watch::Sender<EngineStatus>,
    ) {
        status.state = EngineState::Syncing;
        let _ = status_tx.send(status.clone());
        self.notifications_paused.store(true, Ordering::SeqCst);

        // Sample the cursor before crawling; anything that changes during
        // the pass stays ahead of it and is picked up next time.
        let token = if kind == PassKind::Full {
            match self.remote.change_log_token().await {
                Ok(token) => token,
                Err(e) => {
                    warn!("Could not read change-log token: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let (success, stats) = match self.reconciler.reconcile().await {
            Ok(outcome) => (outcome.success, Some(outcome.stats)),
            Err(e) => {
                error!("Reconciliation aborted: {}", e);
                if let SyncError::RootMissing(root) = &e {
                    self.activity.alert(&format!(
                        "Sync root {} is missing; leaving both sides untouched",
                        root.display()
                    ));
                }
                (false, None)
            }
        };

        if success {
            let now = Utc::now();
            match kind {
                PassKind::Full => {
                    if let Some(token) = token {
                        if let Err(e) = self.store.set_change_log_token(&token).await {
                            warn!("Could not persist change-log token: {}", e);
                        }
                    }
                    if let Err(e) = self.store.set_last_full_sync(now).await {
                        warn!("Could not persist last full sync timestamp: {}", e);
                    }
                    status.last_full_sync = Some(now);
                }
                PassKind::Partial => {
                    if let Err(e) = self.store.set_last_partial_sync(now).await {
                        warn!("Could not persist last partial sync timestamp: {}", e);
                    }
                    status.last_partial_sync = Some(now);
                }
            }
        }

        // Discard events the pass itself generated before listening again.
        while events.try_recv().is_ok() {}
        self.notifications_paused.store(false, Ordering::SeqCst);

        status.state = if self.gate.is_suspended() {
            EngineState::Suspended
        } else {
            EngineState::Idle
        };
        status.last_stats = stats;
        status.last_success = Some(success);
        let _ = status_tx.send(status.clone());
    }
}

/// Control surface over a running scheduler.
pub struct SchedulerHandle {
    control: mpsc::Sender<EngineMessage>,
    events: mpsc::UnboundedSender<Vec<FileEvent>>,
    status: watch::Receiver<EngineStatus>,
    gate: SuspendGate,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Trigger a full pass as soon as the worker is free.
    pub async fn sync_now(&self) -> Result<()> {
        self.control
            .send(EngineMessage::SyncNow)
            .await
            .map_err(|_| SyncError::SchedulerStopped)
    }

    /// Sender to wire into the filesystem watcher's batch callback.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<Vec<FileEvent>> {
        self.events.clone()
    }

    pub fn suspend(&self) {
        self.gate.suspend();
    }

    pub fn resume(&self) {
        self.gate.resume();
    }

    /// Latest status snapshot; never blocks on the worker.
    pub fn status(&self) -> EngineStatus {
        let mut status = self.status.borrow().clone();
        if status.state == EngineState::Idle && self.gate.is_suspended() {
            status.state = EngineState::Suspended;
        }
        status
    }

    /// Stop the worker and wait for it to finish any in-flight pass.
    pub async fn shutdown(self) -> Result<()> {
        // The worker may already be gone; joining is what matters.
        let _ = self.control.send(EngineMessage::Shutdown).await;
        self.gate.resume();
        self.task
            .await
            .map_err(|_| SyncError::SchedulerStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn gate_checkpoint_waits_for_resume() {
        let gate = SuspendGate::new();
        gate.suspend();
        assert!(gate.is_suspended());

        let waiter = gate.clone();
        let blocked = tokio::spawn(async move { waiter.checkpoint().await });
        sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        gate.resume();
        timeout(Duration::from_secs(1), blocked)
            .await
            .expect("checkpoint should unblock on resume")
            .unwrap();
    }

    #[tokio::test]
    async fn gate_checkpoint_passes_when_not_suspended() {
        let gate = SuspendGate::new();
        timeout(Duration::from_millis(100), gate.checkpoint())
            .await
            .expect("checkpoint should not block");
    }
}
