//! Job: a single unit of remote asynchronous computation
//!
//! A [`Job`] pairs an immutable [`JobSpec`] with a mutable [`Execution`]
//! record. Only the engine mutates jobs once they are tracked; callers
//! express themselves through the cancel and retry intents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::backend::JobOutput;
use crate::error::GridflowError;
use crate::execution::{Execution, JobState, Termination};
use crate::types::JobId;

fn default_slots() -> u32 {
    1
}

// ============================================================================
// JOB SPEC
// ============================================================================

/// What to run and what it needs.
///
/// The `attributes` bag carries free-form policy data (requested memory,
/// queue hints); the core only interprets `requested_slots`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Human-readable name; defaults to the command
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Executable to run on the backend
    pub command: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,

    /// Execution slots requested from the chosen resource
    #[serde(default = "default_slots")]
    pub requested_slots: u32,

    /// Free-form attributes consumed by policy layers, not the core
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Default for JobSpec {
    fn default() -> Self {
        Self {
            name: None,
            command: String::new(),
            arguments: Vec::new(),
            requested_slots: default_slots(),
            attributes: BTreeMap::new(),
        }
    }
}

impl JobSpec {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.command)
    }
}

// ============================================================================
// JOB
// ============================================================================

/// A tracked job. Identity is stable and never reused; once TERMINATED the
/// record is immutable except for the one-time output retrieval flag and
/// the explicit retry intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub spec: JobSpec,
    pub execution: Execution,

    /// Flips to true exactly once, and only while TERMINATED
    output_retrieved: bool,

    /// Output staged by the engine, awaiting collection
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<JobOutput>,

    /// Cooperative cancel: intent recorded immediately, confirmed by a
    /// later poll
    cancel_requested: bool,
    /// The backend acknowledged our cancel request; do not resend
    cancel_sent: bool,
}

impl Job {
    pub fn new(id: JobId, spec: JobSpec) -> Self {
        Self {
            id,
            spec,
            execution: Execution::new(),
            output_retrieved: false,
            output: None,
            cancel_requested: false,
            cancel_sent: false,
        }
    }

    pub fn state(&self) -> JobState {
        self.execution.state()
    }

    pub fn termination(&self) -> Option<Termination> {
        self.execution.termination
    }

    // ────────────────────────────────────────────────────────────
    // Cancel intent
    // ────────────────────────────────────────────────────────────

    pub fn request_cancel(&mut self) {
        if !self.state().is_terminal() {
            self.cancel_requested = true;
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn cancel_sent(&self) -> bool {
        self.cancel_sent
    }

    pub fn mark_cancel_sent(&mut self) {
        self.cancel_sent = true;
    }

    // ────────────────────────────────────────────────────────────
    // Output retrieval (one-shot)
    // ────────────────────────────────────────────────────────────

    pub fn output_retrieved(&self) -> bool {
        self.output_retrieved
    }

    /// Store staged output. The engine calls this once, when the backend
    /// fetch succeeds.
    pub fn store_output(&mut self, output: JobOutput) {
        self.output = Some(output);
    }

    pub fn has_staged_output(&self) -> bool {
        self.output.is_some()
    }

    /// Collect the staged output. Fails if the job is not TERMINATED or if
    /// output was already collected; a failed second call has no side
    /// effects.
    pub fn collect_output(&mut self) -> Result<JobOutput, GridflowError> {
        if self.state() != JobState::Terminated {
            return Err(GridflowError::NotTerminated {
                id: self.id.to_string(),
                state: self.state(),
            });
        }
        if self.output_retrieved {
            return Err(GridflowError::OutputAlreadyCollected {
                id: self.id.to_string(),
            });
        }
        let output = self.output.clone().ok_or_else(|| GridflowError::OutputUnavailable {
            id: self.id.to_string(),
            reason: self
                .termination()
                .map(|t| t.to_string())
                .unwrap_or_else(|| "no output was staged".into()),
        })?;

        self.output_retrieved = true;
        Ok(output)
    }

    // ────────────────────────────────────────────────────────────
    // Retry intent
    // ────────────────────────────────────────────────────────────

    /// Return a TERMINATED job to NEW, clearing backend binding, outcome,
    /// staged output and the retrieval flag.
    pub fn reset_for_retry(&mut self) -> Result<(), GridflowError> {
        self.execution.reset()?;
        self.output = None;
        self.output_retrieved = false;
        self.cancel_requested = false;
        self.cancel_sent = false;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
