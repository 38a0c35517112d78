//! Event vocabulary for loop lifecycle streaming
//!
//! Every event carries the owning loop's ID and a wall-clock timestamp.
//! Consumers (route layer, loggers, tests) subscribe on the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{IterationOutcome, SyncPhase};

/// A timestamped loop event
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoopEvent {
    pub loop_id: String,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: LoopEventKind,
}

impl LoopEvent {
    pub fn new(loop_id: impl Into<String>, kind: LoopEventKind) -> Self {
        Self {
            loop_id: loop_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Dotted event name, e.g. `loop.iteration.end`
    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }
}

/// The event payloads
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEventKind {
    // === Loop lifecycle ===
    Created,
    Started,
    IterationStart {
        iteration: u32,
    },
    IterationEnd {
        iteration: u32,
        outcome: IterationOutcome,
    },
    Completed {
        iterations: u32,
    },
    Stopped,
    Failed {
        message: String,
    },
    Deleted,
    Accepted,
    Discarded,
    Pushed {
        remote_branch: String,
    },
    Error {
        message: String,
    },
    Log {
        message: String,
    },

    // === Planning ===
    PlanReady,
    PlanFeedback {
        round: u32,
    },
    PlanAccepted,
    PlanDiscarded,

    // === Base-branch sync ===
    SyncStarted,
    SyncClean {
        already_up_to_date: bool,
    },
    SyncConflicts {
        phase: SyncPhase,
        files: Vec<String>,
    },

    // === Git ===
    GitCommit {
        hash: String,
        iteration: u32,
    },
}

impl LoopEventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Created => "loop.created",
            Self::Started => "loop.started",
            Self::IterationStart { .. } => "loop.iteration.start",
            Self::IterationEnd { .. } => "loop.iteration.end",
            Self::Completed { .. } => "loop.completed",
            Self::Stopped => "loop.stopped",
            Self::Failed { .. } => "loop.failed",
            Self::Deleted => "loop.deleted",
            Self::Accepted => "loop.accepted",
            Self::Discarded => "loop.discarded",
            Self::Pushed { .. } => "loop.pushed",
            Self::Error { .. } => "loop.error",
            Self::Log { .. } => "loop.log",
            Self::PlanReady => "loop.plan.ready",
            Self::PlanFeedback { .. } => "loop.plan.feedback",
            Self::PlanAccepted => "loop.plan.accepted",
            Self::PlanDiscarded => "loop.plan.discarded",
            Self::SyncStarted => "loop.sync.started",
            Self::SyncClean { .. } => "loop.sync.clean",
            Self::SyncConflicts { .. } => "loop.sync.conflicts",
            Self::GitCommit { .. } => "loop.git.commit",
        }
    }
}
