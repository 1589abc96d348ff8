//! Engine audit trail
//!
//! Append-only log of everything the engine does to the roster:
//! submissions, state transitions, output staging, retries, blocked
//! dependencies and cycle boundaries.
//! - Event: envelope with id + timestamp + kind
//! - EventLog: thread-safe, append-only log

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::execution::{JobState, Termination};
use crate::types::{JobId, ResourceName};

/// Single event in the engine activity log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence ID (for ordering)
    pub id: u64,
    /// Time since engine start (ms)
    pub timestamp_ms: u64,
    /// Event type and data
    pub kind: EventKind,
}

/// All possible event types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // ═══════════════════════════════════════════
    // CYCLE LEVEL
    // ═══════════════════════════════════════════
    CycleStarted {
        roster_len: usize,
    },
    CycleCompleted {
        processed: usize,
        suppressed_errors: usize,
    },

    // ═══════════════════════════════════════════
    // JOB LEVEL
    // ═══════════════════════════════════════════
    JobSubmitted {
        job_id: JobId,
        resource: ResourceName,
        remote_id: String,
    },
    SubmissionFailed {
        job_id: JobId,
        error: String,
    },
    StateChanged {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },
    JobTerminated {
        job_id: JobId,
        termination: Termination,
    },
    OutputStaged {
        job_id: JobId,
    },
    OutputCollected {
        job_id: JobId,
    },
    CancelRequested {
        job_id: JobId,
    },
    RetryScheduled {
        job_id: JobId,
        attempt: u32,
    },
    DependencyBlocked {
        job_id: JobId,
        failed_predecessor: JobId,
    },
}

impl EventKind {
    /// Extract job_id if the event is job-related
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Self::JobSubmitted { job_id, .. }
            | Self::SubmissionFailed { job_id, .. }
            | Self::StateChanged { job_id, .. }
            | Self::JobTerminated { job_id, .. }
            | Self::OutputStaged { job_id }
            | Self::OutputCollected { job_id }
            | Self::CancelRequested { job_id }
            | Self::RetryScheduled { job_id, .. }
            | Self::DependencyBlocked { job_id, .. } => Some(job_id),
            Self::CycleStarted { .. } | Self::CycleCompleted { .. } => None,
        }
    }

    /// Check if this is a cycle-boundary event
    pub fn is_cycle_event(&self) -> bool {
        matches!(
            self,
            Self::CycleStarted { .. } | Self::CycleCompleted { .. }
        )
    }
}

/// Thread-safe, append-only event log
#[derive(Clone)]
pub struct EventLog {
    events: Arc<RwLock<Vec<Event>>>,
    start_time: Instant,
    next_id: Arc<AtomicU64>,
}

impl EventLog {
    /// Create a new event log (call at engine construction)
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            start_time: Instant::now(),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event (thread-safe, returns event ID)
    pub fn emit(&self, kind: EventKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            id,
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            kind,
        };

        self.events.write().push(event);
        id
    }

    /// Get all events (cloned)
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Filter events by job ID
    pub fn filter_job(&self, job_id: &JobId) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.job_id() == Some(job_id))
            .collect()
    }

    /// Filter cycle-boundary events only
    pub fn cycle_events(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.is_cycle_event())
            .collect()
    }

    /// Serialize to JSON for persistence/debugging
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.events()).unwrap_or(Value::Null)
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").field("len", &self.len()).finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
