//! Fire-and-forget progress and notification sink

use tracing::{debug, warn};

/// Observational side channel around the engine's visible I/O.
///
/// `started`/`stopped` bracket any operation a front end might want to
/// animate; `alert` carries user-visible notification text (conflict
/// backups, permission problems). Implementations must not block and must
/// not fail.
pub trait ActivitySink: Send + Sync {
    fn started(&self);
    fn stopped(&self);
    fn alert(&self, message: &str);
}

/// Sink that discards everything.
#[derive(Debug, Default)]
pub struct NullActivitySink;

impl ActivitySink for NullActivitySink {
    fn started(&self) {}
    fn stopped(&self) {}
    fn alert(&self, _message: &str) {}
}

/// Sink that forwards to the tracing subscriber.
#[derive(Debug, Default)]
pub struct LogActivitySink;

impl ActivitySink for LogActivitySink {
    fn started(&self) {
        debug!("Sync activity started");
    }

    fn stopped(&self) {
        debug!("Sync activity stopped");
    }

    fn alert(&self, message: &str) {
        warn!("{}", message);
    }
}
