//! Error types with fix suggestions
//!
//! One taxonomy for the whole crate:
//! - configuration errors are rejected synchronously at the call that
//!   introduced them;
//! - backend errors carry the adapter failure;
//! - per-job errors inside a cycle are suppressed by default and logged,
//!   unless their [`ErrorCategory`] is on the [`PropagationPolicy`]
//!   allow-list.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::backend::AdapterError;
use crate::execution::{JobState, TransitionError};

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// All error variants are part of the public API.
#[derive(Error, Debug)]
pub enum GridflowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session file error: {0}")]
    SessionFormat(#[from] serde_json::Error),

    #[error("Job spec parse error: {0}")]
    SpecParse(#[from] serde_yaml::Error),

    // ─────────────────────────────────────────────────────────────
    // Roster lookup and caller operations (GF-010 to GF-014)
    // ─────────────────────────────────────────────────────────────
    #[error("GF-010: unknown task '{id}'")]
    UnknownTask { id: String },

    #[error("GF-011: task '{id}' is {state}, not TERMINATED")]
    NotTerminated { id: String, state: JobState },

    #[error("GF-012: output of '{id}' was already collected")]
    OutputAlreadyCollected { id: String },

    #[error("GF-013: output of '{id}' is unavailable: {reason}")]
    OutputUnavailable { id: String, reason: String },

    #[error("GF-014: duplicate task id '{id}'")]
    DuplicateTask { id: String },

    #[error("GF-015: invalid task id: {0}")]
    InvalidId(#[from] crate::types::JobIdError),

    // ─────────────────────────────────────────────────────────────
    // Lifecycle (GF-020)
    // ─────────────────────────────────────────────────────────────
    #[error("GF-020: {0}")]
    Lifecycle(#[from] TransitionError),

    // ─────────────────────────────────────────────────────────────
    // Backends and resources (GF-030 to GF-031)
    // ─────────────────────────────────────────────────────────────
    #[error("GF-030: no adapter registered for resource '{resource}'")]
    UnknownResource { resource: String },

    #[error("GF-031: backend error on '{id}': {source}")]
    Backend { id: String, source: AdapterError },

    // ─────────────────────────────────────────────────────────────
    // Dependency graphs (GF-040 to GF-042)
    // ─────────────────────────────────────────────────────────────
    #[error("GF-040: dependency cycle involving '{id}'")]
    DependencyCycle { id: String },

    #[error("GF-041: precedence edge references unknown task '{id}'")]
    UnknownGraphNode { id: String },

    #[error("GF-042: task '{id}' depends on itself")]
    SelfDependency { id: String },

    // ─────────────────────────────────────────────────────────────
    // Session locking (GF-050)
    // ─────────────────────────────────────────────────────────────
    #[error("GF-050: session is locked by process {pid}")]
    LockConflict { pid: u32 },
}

impl GridflowError {
    /// Coarse category used by the propagation allow-list.
    pub fn category(&self) -> ErrorCategory {
        match self {
            GridflowError::Io(_) => ErrorCategory::Io,
            GridflowError::SessionFormat(_) | GridflowError::SpecParse(_) => {
                ErrorCategory::Persistence
            }
            GridflowError::UnknownTask { .. }
            | GridflowError::NotTerminated { .. }
            | GridflowError::OutputAlreadyCollected { .. }
            | GridflowError::OutputUnavailable { .. } => ErrorCategory::Caller,
            GridflowError::DuplicateTask { .. }
            | GridflowError::InvalidId(_)
            | GridflowError::DependencyCycle { .. }
            | GridflowError::UnknownGraphNode { .. }
            | GridflowError::SelfDependency { .. } => ErrorCategory::Configuration,
            GridflowError::Lifecycle(_) => ErrorCategory::Lifecycle,
            GridflowError::UnknownResource { .. } | GridflowError::Backend { .. } => {
                ErrorCategory::Backend
            }
            GridflowError::LockConflict { .. } => ErrorCategory::Lock,
        }
    }
}

impl FixSuggestion for GridflowError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            GridflowError::Io(_) => Some("Check file path and permissions"),
            GridflowError::SessionFormat(_) => {
                Some("Session file is corrupt; restore from backup or start a new session")
            }
            GridflowError::SpecParse(_) => Some("Check YAML syntax: indentation and quoting"),
            GridflowError::UnknownTask { .. } => {
                Some("List tracked tasks with `gridflow status -l`")
            }
            GridflowError::NotTerminated { .. } => {
                Some("Run more cycles until the task reaches TERMINATED")
            }
            GridflowError::OutputAlreadyCollected { .. } => {
                Some("Output can be collected exactly once; look where the first fetch put it")
            }
            GridflowError::OutputUnavailable { .. } => None,
            GridflowError::DuplicateTask { .. } => Some("Use unique task ids within a session"),
            GridflowError::InvalidId(_) => {
                Some("Task ids are alphanumeric plus '-', '_' and '.', at most 64 characters")
            }
            GridflowError::Lifecycle(_) => None,
            GridflowError::UnknownResource { .. } => {
                Some("Register an adapter for this resource before running a cycle")
            }
            GridflowError::Backend { .. } => None,
            GridflowError::DependencyCycle { .. } => {
                Some("Remove the cycle; precedence graphs must be acyclic")
            }
            GridflowError::UnknownGraphNode { .. } => {
                Some("Every edge endpoint must name a child of the collection")
            }
            GridflowError::SelfDependency { .. } => {
                Some("Remove the self edge; tasks cannot depend on themselves")
            }
            GridflowError::LockConflict { .. } => {
                Some("Another engine is processing this session; wait or stop it")
            }
        }
    }
}

// ============================================================================
// PROPAGATION POLICY
// ============================================================================

/// Coarse error classes, used to decide whether a per-job error should
/// abort the whole cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorCategory {
    Io,
    Persistence,
    Caller,
    Configuration,
    Lifecycle,
    Backend,
    Lock,
}

/// Allow-list of error categories that propagate out of a cycle instead of
/// being logged and suppressed.
///
/// By default nothing propagates: one job's failure never prevents other
/// jobs in the same cycle from being processed.
#[derive(Debug, Clone, Default)]
pub struct PropagationPolicy {
    propagate: BTreeSet<ErrorCategory>,
}

impl PropagationPolicy {
    /// Suppress everything (the default)
    pub fn suppress_all() -> Self {
        Self::default()
    }

    /// Propagate everything (debugging aid)
    pub fn propagate_all() -> Self {
        let mut policy = Self::default();
        for cat in [
            ErrorCategory::Io,
            ErrorCategory::Persistence,
            ErrorCategory::Caller,
            ErrorCategory::Configuration,
            ErrorCategory::Lifecycle,
            ErrorCategory::Backend,
            ErrorCategory::Lock,
        ] {
            policy.propagate.insert(cat);
        }
        policy
    }

    /// Add a category to the allow-list
    pub fn propagate(mut self, category: ErrorCategory) -> Self {
        self.propagate.insert(category);
        self
    }

    pub fn should_propagate(&self, category: ErrorCategory) -> bool {
        self.propagate.contains(&category)
    }
}

// ============================================================================
// TESTS
// ============================================================================
