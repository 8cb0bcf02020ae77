//! Event delivery into a realm watcher
//!
//! A [`DeliveryGate`] sits between the directory watch and the realm's event
//! loop. While delivery is paused, offered events are buffered and then
//! re-raised when the last [`PausedDelivery`] guard goes away, so a reload
//! delays other events instead of losing them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Kind of filesystem change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileEventKind {
    Created,
    Modified,
    Removed,
}

impl FileEventKind {
    /// Fold a later event on the same path into this one
    pub fn merge(self, next: FileEventKind) -> FileEventKind {
        match (self, next) {
            (_, FileEventKind::Removed) => FileEventKind::Removed,
            (FileEventKind::Created, _) | (_, FileEventKind::Created) => FileEventKind::Created,
            _ => FileEventKind::Modified,
        }
    }
}

/// A change to a module file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub file_name: String,
    pub path: PathBuf,
}

impl FileEvent {
    pub fn new(kind: FileEventKind, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            kind,
            file_name,
            path,
        }
    }

    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self::new(FileEventKind::Created, path)
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self::new(FileEventKind::Modified, path)
    }

    pub fn removed(path: impl Into<PathBuf>) -> Self {
        Self::new(FileEventKind::Removed, path)
    }
}

/// Push `event` into `queue`, merging with a queued event for the same path
fn coalesce_into(queue: &mut Vec<FileEvent>, event: FileEvent) {
    match queue.iter_mut().find(|queued| queued.path == event.path) {
        Some(queued) => queued.kind = queued.kind.merge(event.kind),
        None => queue.push(event),
    }
}

#[derive(Default)]
struct GateState {
    paused: usize,
    deferred: Vec<FileEvent>,
}

/// The per-watcher "delivery paused" switch
pub struct DeliveryGate {
    state: Mutex<GateState>,
    tx: mpsc::UnboundedSender<FileEvent>,
}

impl DeliveryGate {
    /// Create a gate and the receiving end of its event channel
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<FileEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Self {
            state: Mutex::new(GateState::default()),
            tx,
        });
        (gate, rx)
    }

    /// Offer an event for delivery.
    ///
    /// Returns false once the receiving side is gone.
    pub fn offer(&self, event: FileEvent) -> bool {
        let mut state = self.state.lock();
        if state.paused > 0 {
            debug!("Delivery paused, deferring {:?}", event);
            coalesce_into(&mut state.deferred, event);
            return true;
        }
        self.tx.send(event).is_ok()
    }

    /// Pause delivery until the returned guard is dropped.
    ///
    /// Guards nest; delivery resumes when the last one is released.
    pub fn pause(&self) -> PausedDelivery<'_> {
        self.state.lock().paused += 1;
        PausedDelivery { gate: self }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().paused == 0
    }

    /// Number of events waiting for delivery to resume
    pub fn deferred_len(&self) -> usize {
        self.state.lock().deferred.len()
    }

    fn resume(&self) {
        let mut state = self.state.lock();
        state.paused = state.paused.saturating_sub(1);
        if state.paused > 0 {
            return;
        }

        let deferred = std::mem::take(&mut state.deferred);
        if !deferred.is_empty() {
            debug!("Delivery resumed, re-raising {} deferred event(s)", deferred.len());
        }
        for event in deferred {
            if self.tx.send(event).is_err() {
                break;
            }
        }
    }
}

/// Scoped pause of a [`DeliveryGate`]; resumes delivery on drop
#[must_use = "delivery resumes as soon as the guard is dropped"]
pub struct PausedDelivery<'a> {
    gate: &'a DeliveryGate,
}

impl Drop for PausedDelivery<'_> {
    fn drop(&mut self) {
        self.gate.resume();
    }
}

/// Trailing-edge coalescing of event bursts.
///
/// An event is released once no further event for its path arrived during
/// the quiet period.
pub struct EventCoalescer {
    quiet: Duration,
    pending: Vec<(FileEvent, Instant)>,
}

impl EventCoalescer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending: Vec::new(),
        }
    }

    /// True when events should bypass coalescing entirely
    pub fn is_immediate(&self) -> bool {
        self.quiet.is_zero()
    }

    pub fn push(&mut self, event: FileEvent, now: Instant) {
        let deadline = now + self.quiet;
        match self.pending.iter_mut().find(|(queued, _)| queued.path == event.path) {
            Some((queued, due)) => {
                queued.kind = queued.kind.merge(event.kind);
                *due = deadline;
            }
            None => self.pending.push((event, deadline)),
        }
    }

    /// Remove and return every event whose quiet period has elapsed, in arrival order
    pub fn drain_ready(&mut self, now: Instant) -> Vec<FileEvent> {
        let mut ready = Vec::new();
        self.pending.retain(|(event, due)| {
            if *due <= now {
                ready.push(event.clone());
                false
            } else {
                true
            }
        });
        ready
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|(_, due)| *due).min()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_pending(&self, path: &Path) -> bool {
        self.pending.iter().any(|(event, _)| event.path == path)
    }
}
