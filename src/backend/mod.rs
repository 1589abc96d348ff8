//! # Backend Adapter Layer
//!
//! Trait and implementations for remote execution facilities.
//!
//! A backend adapter knows how to drive one class of facility (a batch
//! queue, a cloud API, local subprocesses) through five operations:
//! submit, poll, cancel, fetch-output and peek. The core maps every
//! adapter-native status and failure onto the closed sets of
//! [`RemoteStatus`] and [`crate::execution::AbortReason`]; nothing
//! backend-specific leaks past this module.
//!
//! Transient failures (network hiccups, rate limiting, timeouts) are the
//! adapter layer's business to retry; when surfaced, the engine logs them
//! and tries again next cycle without any state transition.

mod localhost;
mod mock;

pub use localhost::LocalhostAdapter;
pub use mock::MockAdapter;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::execution::{AbortReason, BackendJobRef};
use crate::job::JobSpec;
use crate::types::ResourceName;

// ============================================================================
// REMOTE STATUS
// ============================================================================

/// Backend-reported status of a live job, already normalized to the
/// closed set the lifecycle machine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    /// Accepted and queued
    Queued,
    /// Executing
    Running,
    /// Held or suspended by the remote system
    Held,
    /// Finished; `output_staged` tells whether output is already local
    /// (no TERMINATING phase needed) or must still be fetched
    Finished { exit_status: u8, output_staged: bool },
    /// Failed for one of the reserved abnormal reasons
    Failed(AbortReason),
}

/// Output of a terminated job, as staged by `fetch_output`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    pub stdout: String,
    pub stderr: String,
    /// Additional staged files, name -> contents
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
}

// ============================================================================
// ADAPTER ERRORS
// ============================================================================

/// Failure of a single adapter operation.
///
/// Transient errors never cause a state transition; the engine retries on
/// the next cycle. Everything else is classified by the caller.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("backend operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend rejected the operation: {0}")]
    Rejected(String),

    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    #[error("backend IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    /// Timeouts count as transient: surfaced, logged, retried next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_) | AdapterError::Timeout(_))
    }
}

// ============================================================================
// ADAPTER TRAIT
// ============================================================================

/// Contract every execution facility must satisfy.
///
/// Object-safe; the engine holds adapters as `Arc<dyn BackendAdapter>`
/// and treats each call as atomic from its own perspective: it succeeds,
/// fails, or times out.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Adapter class name (e.g. "localhost", "mock")
    fn name(&self) -> &str;

    /// Hand a job to the facility. On success the returned ref is stable
    /// for the job's whole remote lifetime.
    async fn submit(
        &self,
        spec: &JobSpec,
        resource: &ResourceName,
    ) -> Result<BackendJobRef, AdapterError>;

    /// Non-blocking status probe.
    async fn poll(&self, job: &BackendJobRef) -> Result<RemoteStatus, AdapterError>;

    /// Request cancellation. The ack only means the request was accepted;
    /// the terminal state is confirmed by a later poll.
    async fn cancel(&self, job: &BackendJobRef) -> Result<(), AdapterError>;

    /// Stage the job's output. Meaningful at most once per job; the core
    /// guarantees it is not called twice.
    async fn fetch_output(&self, job: &BackendJobRef) -> Result<JobOutput, AdapterError>;

    /// Best-effort snapshot of a live job's output stream.
    async fn peek(&self, _job: &BackendJobRef) -> Result<String, AdapterError> {
        Err(AdapterError::Unsupported("peek"))
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Adapters keyed by the resource they serve (lock-free reads).
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Arc<DashMap<ResourceName, Arc<dyn BackendAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, resource: ResourceName, adapter: Arc<dyn BackendAdapter>) {
        self.adapters.insert(resource, adapter);
    }

    pub fn get(&self, resource: &ResourceName) -> Option<Arc<dyn BackendAdapter>> {
        self.adapters.get(resource).map(|a| Arc::clone(a.value()))
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("len", &self.adapters.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
