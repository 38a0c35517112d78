//! Event bus - pub/sub for loop lifecycle events
//!
//! Built on a tokio broadcast channel: lossy, no replay, fire-and-forget.
//! Dropping a receiver unsubscribes it. Per-loop emission goes through an
//! [`EventEmitter`] handle so components never hold the bus itself.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::{IterationOutcome, SyncPhase};

use super::types::{LoopEvent, LoopEventKind};

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Central event bus
pub struct EventBus {
    tx: broadcast::Sender<LoopEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Emit an event to all subscribers. No subscribers is fine; slow
    /// subscribers drop the oldest events.
    pub fn emit(&self, event: LoopEvent) {
        debug!(event_type = event.event_type(), loop_id = %event.loop_id, "EventBus::emit");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.tx.subscribe()
    }

    /// Create an emitter bound to a loop
    pub fn emitter_for(&self, loop_id: impl Into<String>) -> EventEmitter {
        EventEmitter {
            tx: self.tx.clone(),
            loop_id: loop_id.into(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Create an event bus wrapped in an Arc for shared ownership
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}

/// Handle for components to emit events for one loop
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<LoopEvent>,
    loop_id: String,
}

impl EventEmitter {
    pub fn loop_id(&self) -> &str {
        &self.loop_id
    }

    pub fn emit(&self, kind: LoopEventKind) {
        let event = LoopEvent::new(self.loop_id.clone(), kind);
        debug!(event_type = event.event_type(), "EventEmitter::emit");
        let _ = self.tx.send(event);
    }

    // === Convenience methods ===

    pub fn created(&self) {
        self.emit(LoopEventKind::Created);
    }

    pub fn started(&self) {
        self.emit(LoopEventKind::Started);
    }

    pub fn iteration_start(&self, iteration: u32) {
        self.emit(LoopEventKind::IterationStart { iteration });
    }

    pub fn iteration_end(&self, iteration: u32, outcome: IterationOutcome) {
        self.emit(LoopEventKind::IterationEnd { iteration, outcome });
    }

    pub fn completed(&self, iterations: u32) {
        self.emit(LoopEventKind::Completed { iterations });
    }

    pub fn stopped(&self) {
        self.emit(LoopEventKind::Stopped);
    }

    pub fn failed(&self, message: &str) {
        self.emit(LoopEventKind::Failed {
            message: message.to_string(),
        });
    }

    pub fn deleted(&self) {
        self.emit(LoopEventKind::Deleted);
    }

    pub fn accepted(&self) {
        self.emit(LoopEventKind::Accepted);
    }

    pub fn discarded(&self) {
        self.emit(LoopEventKind::Discarded);
    }

    pub fn pushed(&self, remote_branch: &str) {
        self.emit(LoopEventKind::Pushed {
            remote_branch: remote_branch.to_string(),
        });
    }

    pub fn error(&self, message: &str) {
        self.emit(LoopEventKind::Error {
            message: message.to_string(),
        });
    }

    pub fn log(&self, message: &str) {
        self.emit(LoopEventKind::Log {
            message: message.to_string(),
        });
    }

    pub fn plan_ready(&self) {
        self.emit(LoopEventKind::PlanReady);
    }

    pub fn plan_feedback(&self, round: u32) {
        self.emit(LoopEventKind::PlanFeedback { round });
    }

    pub fn plan_accepted(&self) {
        self.emit(LoopEventKind::PlanAccepted);
    }

    pub fn plan_discarded(&self) {
        self.emit(LoopEventKind::PlanDiscarded);
    }

    pub fn sync_started(&self) {
        self.emit(LoopEventKind::SyncStarted);
    }

    pub fn sync_clean(&self, already_up_to_date: bool) {
        self.emit(LoopEventKind::SyncClean { already_up_to_date });
    }

    pub fn sync_conflicts(&self, phase: SyncPhase, files: Vec<String>) {
        self.emit(LoopEventKind::SyncConflicts { phase, files });
    }

    pub fn git_commit(&self, hash: &str, iteration: u32) {
        self.emit(LoopEventKind::GitCommit {
            hash: hash.to_string(),
            iteration,
        });
    }
}
