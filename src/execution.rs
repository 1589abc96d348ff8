//! Job lifecycle state machine
//!
//! Every unit of remote computation carries an [`Execution`] record: the
//! current lifecycle state, the backend reference assigned at submission,
//! timestamps, and the final [`Termination`].
//!
//! The state diagram (the only legal edges):
//!
//! ```text
//! NEW ──────────► SUBMITTED ──► RUNNING ──► TERMINATING ──► TERMINATED
//!  │                │  ▲          │              ▲              ▲
//!  │                ▼  │          ▼              │              │
//!  │              STOPPED ────────┴──────────────┴──────────────┤
//!  └── (submission failed / canceled) ──────────────────────────┘
//! ```
//!
//! TERMINATED is absorbing; the sole backward move is the explicit retry
//! intent ([`Execution::reset`]), which returns a fresh NEW record.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::types::ResourceName;

/// Seconds since the Unix epoch, saturating on clock skew.
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ============================================================================
// STATES
// ============================================================================

/// Lifecycle state of a job or collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Created locally, not yet handed to any backend
    New,
    /// Accepted by a backend, queued remotely
    Submitted,
    /// Executing remotely
    Running,
    /// Held/suspended by the remote system; never leaves on its own
    Stopped,
    /// Finished remotely, output staging in progress
    Terminating,
    /// Final state; absorbing except for the explicit retry intent
    Terminated,
}

impl JobState {
    /// All states, in lifecycle order (used for stats tables)
    pub const ALL: [JobState; 6] = [
        JobState::New,
        JobState::Submitted,
        JobState::Running,
        JobState::Stopped,
        JobState::Terminating,
        JobState::Terminated,
    ];

    /// A live state occupies a backend: it was submitted and has not
    /// reached TERMINATED yet.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            JobState::Submitted | JobState::Running | JobState::Stopped | JobState::Terminating
        )
    }

    pub fn is_terminal(self) -> bool {
        self == JobState::Terminated
    }

    /// Whether the transition `self -> to` is in the lifecycle table.
    /// Same-state transitions are always permitted (poll no-ops).
    pub fn can_transition(self, to: JobState) -> bool {
        use JobState::*;
        if self == to {
            return true;
        }
        matches!(
            (self, to),
            (New, Submitted)
                | (New, Terminated)
                | (Submitted, Running)
                | (Submitted, Stopped)
                | (Submitted, Terminating)
                | (Submitted, Terminated)
                | (Running, Stopped)
                | (Running, Terminating)
                | (Running, Terminated)
                | (Stopped, Submitted)
                | (Stopped, Terminating)
                | (Stopped, Terminated)
                | (Terminating, Terminated)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::New => "NEW",
            JobState::Submitted => "SUBMITTED",
            JobState::Running => "RUNNING",
            JobState::Stopped => "STOPPED",
            JobState::Terminating => "TERMINATING",
            JobState::Terminated => "TERMINATED",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// TERMINATION AND ABNORMAL MARKERS
// ============================================================================

/// The five reserved abnormal-termination markers, ranked by decreasing
/// specificity. Exactly one applies to an abnormally terminated job;
/// adapters map their native failure reasons onto this closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// The submit call itself failed; the job never reached a backend
    SubmissionFailed,
    /// Remote middleware or infrastructure error
    InfrastructureError,
    /// Input or output data staging failed
    StagingFailure,
    /// Killed by the remote system or its administrator
    KilledBySystem,
    /// Canceled by the caller
    CanceledByUser,
}

impl AbortReason {
    /// Reserved pseudo-signal number for this marker.
    ///
    /// The numbers live in the POSIX signal byte, well above any real
    /// signal, so abnormal termination is distinguishable from a normal
    /// exit exactly the way `waitpid` status words are.
    pub const fn pseudo_signal(self) -> u8 {
        match self {
            AbortReason::SubmissionFailed => 125,
            AbortReason::InfrastructureError => 124,
            AbortReason::StagingFailure => 123,
            AbortReason::KilledBySystem => 122,
            AbortReason::CanceledByUser => 121,
        }
    }

    pub const fn from_pseudo_signal(signal: u8) -> Option<Self> {
        match signal {
            125 => Some(AbortReason::SubmissionFailed),
            124 => Some(AbortReason::InfrastructureError),
            123 => Some(AbortReason::StagingFailure),
            122 => Some(AbortReason::KilledBySystem),
            121 => Some(AbortReason::CanceledByUser),
            _ => None,
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbortReason::SubmissionFailed => "submission failed",
            AbortReason::InfrastructureError => "infrastructure error",
            AbortReason::StagingFailure => "data staging failure",
            AbortReason::KilledBySystem => "killed by remote system",
            AbortReason::CanceledByUser => "canceled by caller",
        };
        write!(f, "{}", s)
    }
}

/// How a job ended: a normal process exit or one of the five reserved
/// abnormal markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Normal process exit with the given status byte
    Exited(u8),
    /// Abnormal termination
    Aborted(AbortReason),
}

impl Termination {
    /// Pack into a POSIX-style wait status word: normal exits occupy the
    /// high byte, abnormal markers the signal byte.
    pub fn to_status(self) -> i32 {
        match self {
            Termination::Exited(code) => (code as i32) << 8,
            Termination::Aborted(reason) => reason.pseudo_signal() as i32,
        }
    }

    /// Unpack from a POSIX-style status word.
    pub fn from_status(status: i32) -> Self {
        let signal = (status & 0x7f) as u8;
        match AbortReason::from_pseudo_signal(signal) {
            Some(reason) => Termination::Aborted(reason),
            None => Termination::Exited(((status >> 8) & 0xff) as u8),
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Termination::Exited(0))
    }

    pub fn is_failure(self) -> bool {
        !self.is_success()
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exited(code) => write!(f, "exit {}", code),
            Termination::Aborted(reason) => write!(f, "{}", reason),
        }
    }
}

// ============================================================================
// BACKEND REFERENCE AND SLOT LEASE
// ============================================================================

/// Handle to a job living on a backend: which resource executes it and the
/// backend-native identifier for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendJobRef {
    pub resource: ResourceName,
    pub remote_id: String,
}

/// Execution slots held on a resource while a job is live.
/// Taken at submission, released exactly once when the job vacates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLease {
    pub resource: ResourceName,
    pub slots: u32,
}

// ============================================================================
// EXECUTION RECORD
// ============================================================================

/// Per-job execution record: state, backend binding, timestamps, outcome.
///
/// All state changes go through [`Execution::transition`], which enforces
/// the lifecycle table. Invalid transitions are configuration or adapter
/// bugs and are rejected, never silently absorbed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    state: JobState,
    /// Set if and only if the job is live (or terminated after running)
    pub backend_ref: Option<BackendJobRef>,
    /// Final outcome; set no later than the TERMINATED transition
    pub termination: Option<Termination>,
    pub created_at: u64,
    pub submitted_at: Option<u64>,
    pub terminated_at: Option<u64>,
    /// Slots still held on a resource; `None` once released
    pub lease: Option<SlotLease>,
}

impl Execution {
    pub fn new() -> Self {
        Self {
            state: JobState::New,
            backend_ref: None,
            termination: None,
            created_at: now_secs(),
            submitted_at: None,
            terminated_at: None,
            lease: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Apply a state transition, enforcing the lifecycle table.
    /// Same-state transitions are accepted and do nothing.
    pub fn transition(&mut self, to: JobState) -> Result<(), TransitionError> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition(to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }

        match to {
            JobState::Submitted if self.submitted_at.is_none() => {
                self.submitted_at = Some(now_secs());
            }
            JobState::Terminated => {
                self.terminated_at = Some(now_secs());
            }
            _ => {}
        }
        self.state = to;
        Ok(())
    }

    /// Take the slot lease, if still held. Returns it at most once.
    pub fn take_lease(&mut self) -> Option<SlotLease> {
        self.lease.take()
    }

    /// Wall-clock turnaround (submission to termination), if known.
    pub fn turnaround_secs(&self) -> Option<u64> {
        match (self.submitted_at, self.terminated_at) {
            (Some(s), Some(t)) => Some(t.saturating_sub(s)),
            _ => None,
        }
    }

    /// The retry intent: return to a fresh NEW record.
    ///
    /// Clears backend binding, outcome and timestamps. Only valid from
    /// TERMINATED; the engine never calls this on a live job.
    pub fn reset(&mut self) -> Result<(), TransitionError> {
        if self.state != JobState::Terminated {
            return Err(TransitionError {
                from: self.state,
                to: JobState::New,
            });
        }
        *self = Execution::new();
        Ok(())
    }
}

impl Default for Execution {
    fn default() -> Self {
        Self::new()
    }
}

/// Attempted a state change outside the lifecycle table
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("invalid lifecycle transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobState,
    pub to: JobState,
}

// ============================================================================
// TESTS
// ============================================================================
