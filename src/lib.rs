//! Gridflow - session-based orchestration of asynchronous jobs

pub mod backend;
pub mod collection;
pub mod dag;
pub mod engine;
pub mod error;
pub mod event_log;
pub mod execution;
pub mod job;
pub mod resource;
pub mod scheduler;
pub mod session;
pub mod types;

pub use backend::{
    AdapterError, AdapterRegistry, BackendAdapter, JobOutput, LocalhostAdapter, MockAdapter,
    RemoteStatus,
};
pub use collection::{
    DependentCollection, DependentStatus, ParallelCollection, RetryableTask,
    SequentialCollection, TaskControl, TaskUnit,
};
pub use dag::PrecedenceGraph;
pub use engine::{Core, CycleStats, Engine, TaskStatus};
pub use error::{ErrorCategory, FixSuggestion, GridflowError, PropagationPolicy};
pub use event_log::{Event, EventKind, EventLog};
pub use execution::{AbortReason, BackendJobRef, Execution, JobState, SlotLease, Termination};
pub use job::{Job, JobSpec};
pub use resource::{ReliabilityStats, Resource, ResourcePool};
pub use scheduler::{GreedyScheduler, ReliabilityScheduler, Scheduler};
pub use session::{FileSessionStore, SessionData, SessionLock, SessionStore};
pub use types::{JobId, ResourceName};
