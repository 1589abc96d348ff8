//! Composite tasks: parallel, sequential, dependent (DAG) and retryable
//!
//! Every job-like entity satisfies the same capability set — state,
//! poll-or-recompute, cancel, retry — chosen at construction through the
//! [`TaskUnit`] enum, so collections nest arbitrarily and the engine never
//! inspects runtime types.
//!
//! Within one cycle, children are resolved before their parent's aggregate
//! state is recomputed, and dependency eligibility is recomputed only after
//! all predecessor polls complete.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dag::PrecedenceGraph;
use crate::engine::Core;
use crate::error::GridflowError;
use crate::event_log::EventKind;
use crate::execution::{JobState, Termination};
use crate::job::Job;
use crate::types::JobId;

// ============================================================================
// THE CAPABILITY SET
// ============================================================================

/// The one polymorphic contract every tracked entity satisfies.
#[async_trait]
pub trait TaskControl {
    fn id(&self) -> &JobId;

    /// Current lifecycle state (derived for collections).
    fn state(&self) -> JobState;

    /// Final outcome, once TERMINATED. For collections this is a synthetic
    /// summary: the count of failed children, packed as an exit status.
    fn termination(&self) -> Option<Termination>;

    /// Advance one step: submit if NEW, poll if live, recompute if
    /// composite. Called once per engine cycle.
    async fn advance(&mut self, core: &Core) -> Result<(), GridflowError>;

    /// Record cancel intent (cooperative; confirmed on a later poll).
    async fn cancel(&mut self, core: &Core) -> Result<(), GridflowError>;

    /// The retry intent: TERMINATED back to NEW. The sole backward move.
    fn reset_for_retry(&mut self) -> Result<(), GridflowError>;
}

#[async_trait]
impl TaskControl for Job {
    fn id(&self) -> &JobId {
        &self.id
    }

    fn state(&self) -> JobState {
        self.execution.state()
    }

    fn termination(&self) -> Option<Termination> {
        self.execution.termination
    }

    async fn advance(&mut self, core: &Core) -> Result<(), GridflowError> {
        match self.execution.state() {
            JobState::New => core.submit_job(self).await,
            JobState::Terminated => Ok(()),
            _ => core.update_job(self).await,
        }
    }

    async fn cancel(&mut self, core: &Core) -> Result<(), GridflowError> {
        if self.execution.state().is_terminal() {
            return Ok(());
        }
        self.request_cancel();
        core.events().emit(EventKind::CancelRequested {
            job_id: self.id.clone(),
        });
        // A job that never reached a backend terminates on the spot.
        if self.execution.state() == JobState::New {
            core.terminate_unsubmitted(self);
        }
        Ok(())
    }

    fn reset_for_retry(&mut self) -> Result<(), GridflowError> {
        Job::reset_for_retry(self)
    }
}

// ============================================================================
// STATE AGGREGATION
// ============================================================================

/// Derive a collection state from child states.
///
/// - all NEW (or no children) -> NEW / TERMINATED respectively
/// - all TERMINATED -> TERMINATED
/// - any STOPPED with nothing queued or executing -> STOPPED
/// - only TERMINATING/TERMINATED left -> TERMINATING
/// - anything else in motion -> RUNNING
fn aggregate_states(states: &[JobState]) -> JobState {
    use JobState::*;

    if states.is_empty() {
        return Terminated;
    }
    if states.iter().all(|s| *s == New) {
        return New;
    }
    if states.iter().all(|s| *s == Terminated) {
        return Terminated;
    }
    let any_moving = states.iter().any(|s| matches!(s, Running | Submitted));
    if states.contains(&Stopped) && !any_moving {
        return Stopped;
    }
    if states.iter().all(|s| matches!(s, Terminating | Terminated)) {
        return Terminating;
    }
    Running
}

/// Synthetic collection return code: the count of failed children.
fn synthetic_termination(failed_children: usize) -> Termination {
    Termination::Exited(failed_children.min(255) as u8)
}

fn child_failed(child: &TaskUnit) -> bool {
    child.state() == JobState::Terminated
        && child.termination().map_or(true, |t| t.is_failure())
}

/// Ensure child ids are unique within one collection.
fn check_unique_ids(children: &[TaskUnit]) -> Result<(), GridflowError> {
    let mut seen = BTreeSet::new();
    for child in children {
        if !seen.insert(child.id().clone()) {
            return Err(GridflowError::DuplicateTask {
                id: child.id().to_string(),
            });
        }
    }
    Ok(())
}

// ============================================================================
// PARALLEL
// ============================================================================

/// All children run independently; the collection terminates when every
/// child has.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelCollection {
    pub id: JobId,
    children: Vec<TaskUnit>,
}

impl ParallelCollection {
    pub fn new(id: JobId, children: Vec<TaskUnit>) -> Result<Self, GridflowError> {
        check_unique_ids(&children)?;
        Ok(Self { id, children })
    }

    pub fn children(&self) -> &[TaskUnit] {
        &self.children
    }

    fn failed_children(&self) -> usize {
        self.children.iter().filter(|c| child_failed(c)).count()
    }
}

#[async_trait]
impl TaskControl for ParallelCollection {
    fn id(&self) -> &JobId {
        &self.id
    }

    fn state(&self) -> JobState {
        let states: Vec<JobState> = self.children.iter().map(|c| c.state()).collect();
        aggregate_states(&states)
    }

    fn termination(&self) -> Option<Termination> {
        (self.state() == JobState::Terminated)
            .then(|| synthetic_termination(self.failed_children()))
    }

    async fn advance(&mut self, core: &Core) -> Result<(), GridflowError> {
        // One child's failure must not starve its siblings this cycle.
        let mut first_err = None;
        for child in &mut self.children {
            if let Err(e) = child.advance(core).await {
                tracing::warn!(child = %child.id(), error = %e, "child advance failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn cancel(&mut self, core: &Core) -> Result<(), GridflowError> {
        for child in &mut self.children {
            child.cancel(core).await?;
        }
        Ok(())
    }

    fn reset_for_retry(&mut self) -> Result<(), GridflowError> {
        for child in &mut self.children {
            if child.state() == JobState::Terminated {
                child.reset_for_retry()?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// SEQUENTIAL
// ============================================================================

/// Children run one at a time, in order. A failed child lets the sequence
/// continue unless `abort_on_failure` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequentialCollection {
    pub id: JobId,
    children: Vec<TaskUnit>,
    abort_on_failure: bool,
    cursor: usize,
    aborted: bool,
}

impl SequentialCollection {
    pub fn new(id: JobId, children: Vec<TaskUnit>) -> Result<Self, GridflowError> {
        check_unique_ids(&children)?;
        Ok(Self {
            id,
            children,
            abort_on_failure: false,
            cursor: 0,
            aborted: false,
        })
    }

    /// Stop submitting further children after the first failure.
    pub fn abort_on_failure(mut self) -> Self {
        self.abort_on_failure = true;
        self
    }

    pub fn children(&self) -> &[TaskUnit] {
        &self.children
    }

    /// Index of the child currently being driven.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn was_aborted(&self) -> bool {
        self.aborted
    }

    fn failed_children(&self) -> usize {
        self.children.iter().filter(|c| child_failed(c)).count()
    }
}

#[async_trait]
impl TaskControl for SequentialCollection {
    fn id(&self) -> &JobId {
        &self.id
    }

    fn state(&self) -> JobState {
        if self.aborted || self.cursor >= self.children.len() {
            return JobState::Terminated;
        }
        match self.children[self.cursor].state() {
            // Nothing started yet
            JobState::New if self.cursor == 0 => JobState::New,
            // Between children: the next one has not been submitted yet
            JobState::New => JobState::Running,
            s => s,
        }
    }

    fn termination(&self) -> Option<Termination> {
        (self.state() == JobState::Terminated)
            .then(|| synthetic_termination(self.failed_children()))
    }

    async fn advance(&mut self, core: &Core) -> Result<(), GridflowError> {
        // A child terminating releases the next one within the same cycle.
        while self.cursor < self.children.len() && !self.aborted {
            let child = &mut self.children[self.cursor];
            if child.state() != JobState::Terminated {
                child.advance(core).await?;
            }
            if child.state() != JobState::Terminated {
                break;
            }
            let failed = child.termination().map_or(true, |t| t.is_failure());
            if failed && self.abort_on_failure {
                self.aborted = true;
                break;
            }
            self.cursor += 1;
        }
        Ok(())
    }

    async fn cancel(&mut self, core: &Core) -> Result<(), GridflowError> {
        for child in &mut self.children {
            child.cancel(core).await?;
        }
        // Unsubmitted successors must not start after a cancel.
        self.aborted = true;
        Ok(())
    }

    fn reset_for_retry(&mut self) -> Result<(), GridflowError> {
        for child in &mut self.children {
            if child.state() == JobState::Terminated {
                child.reset_for_retry()?;
            }
        }
        self.cursor = 0;
        self.aborted = false;
        Ok(())
    }
}

// ============================================================================
// DEPENDENT (DAG)
// ============================================================================

/// Caller-visible status of a dependent collection's child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependentStatus {
    /// Normal lifecycle state
    State(JobState),
    /// A predecessor failed; this child will never be submitted
    FailedDependency,
}

/// Children plus a precedence DAG: a child becomes eligible only once all
/// its predecessors terminated successfully. A predecessor failure marks
/// every transitive dependent as permanently blocked, in one pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependentCollection {
    pub id: JobId,
    children: Vec<TaskUnit>,
    graph: PrecedenceGraph,
    blocked: BTreeSet<JobId>,
}

impl DependentCollection {
    /// `edges` are (predecessor, dependent) pairs over child ids. Cycles
    /// and unknown endpoints are configuration errors, rejected here.
    pub fn new(
        id: JobId,
        children: Vec<TaskUnit>,
        edges: &[(JobId, JobId)],
    ) -> Result<Self, GridflowError> {
        check_unique_ids(&children)?;
        let nodes: Vec<JobId> = children.iter().map(|c| c.id().clone()).collect();
        let graph = PrecedenceGraph::new(nodes, edges)?;
        Ok(Self {
            id,
            children,
            graph,
            blocked: BTreeSet::new(),
        })
    }

    pub fn children(&self) -> &[TaskUnit] {
        &self.children
    }

    /// Status of one child, including the failed-dependency verdict.
    pub fn child_status(&self, id: &JobId) -> Option<DependentStatus> {
        if self.blocked.contains(id) {
            return Some(DependentStatus::FailedDependency);
        }
        self.children
            .iter()
            .find(|c| c.id() == id)
            .map(|c| DependentStatus::State(c.state()))
    }

    pub fn blocked_children(&self) -> impl Iterator<Item = &JobId> {
        self.blocked.iter()
    }

    fn child(&self, id: &JobId) -> Option<&TaskUnit> {
        self.children.iter().find(|c| c.id() == id)
    }

    fn predecessors_satisfied(&self, id: &JobId) -> bool {
        self.graph.predecessors_of(id).iter().all(|p| {
            self.child(p).map_or(false, |c| {
                c.state() == JobState::Terminated
                    && c.termination().map_or(false, |t| t.is_success())
            })
        })
    }

    fn failed_or_blocked_children(&self) -> usize {
        self.children
            .iter()
            .filter(|c| child_failed(c) || self.blocked.contains(c.id()))
            .count()
    }
}

#[async_trait]
impl TaskControl for DependentCollection {
    fn id(&self) -> &JobId {
        &self.id
    }

    fn state(&self) -> JobState {
        // Blocked children count as resolved: they will never run.
        let states: Vec<JobState> = self
            .children
            .iter()
            .map(|c| {
                if self.blocked.contains(c.id()) {
                    JobState::Terminated
                } else {
                    c.state()
                }
            })
            .collect();
        aggregate_states(&states)
    }

    fn termination(&self) -> Option<Termination> {
        (self.state() == JobState::Terminated)
            .then(|| synthetic_termination(self.failed_or_blocked_children()))
    }

    async fn advance(&mut self, core: &Core) -> Result<(), GridflowError> {
        // 1. Poll everything already in flight.
        let mut first_err = None;
        for child in &mut self.children {
            if child.state() != JobState::New && child.state() != JobState::Terminated {
                if let Err(e) = child.advance(core).await {
                    tracing::warn!(child = %child.id(), error = %e, "child advance failed");
                    first_err.get_or_insert(e);
                }
            }
        }

        // 2. One pass over fresh failures: block all transitive dependents
        //    that never started. Resolved here, never polled again.
        let failures: Vec<JobId> = self
            .children
            .iter()
            .filter(|c| child_failed(c))
            .map(|c| c.id().clone())
            .collect();
        for failed in &failures {
            for dep in self.graph.transitive_dependents(failed) {
                let never_started = self
                    .child(&dep)
                    .map_or(false, |c| c.state() == JobState::New);
                if never_started && self.blocked.insert(dep.clone()) {
                    core.events().emit(EventKind::DependencyBlocked {
                        job_id: dep,
                        failed_predecessor: failed.clone(),
                    });
                }
            }
        }

        // 3. Eligibility, recomputed only after all predecessor polls above:
        //    submit NEW children whose predecessors all succeeded.
        let eligible: Vec<JobId> = self
            .children
            .iter()
            .filter(|c| c.state() == JobState::New && !self.blocked.contains(c.id()))
            .filter(|c| self.predecessors_satisfied(c.id()))
            .map(|c| c.id().clone())
            .collect();
        for id in eligible {
            if let Some(child) = self.children.iter_mut().find(|c| c.id() == &id) {
                if let Err(e) = child.advance(core).await {
                    tracing::warn!(child = %id, error = %e, "child submit failed");
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn cancel(&mut self, core: &Core) -> Result<(), GridflowError> {
        for child in &mut self.children {
            child.cancel(core).await?;
        }
        Ok(())
    }

    fn reset_for_retry(&mut self) -> Result<(), GridflowError> {
        for child in &mut self.children {
            if child.state() == JobState::Terminated {
                child.reset_for_retry()?;
            }
        }
        self.blocked.clear();
        Ok(())
    }
}

// ============================================================================
// RETRYABLE
// ============================================================================

/// Wraps a single task; failed terminations are retried automatically
/// until the attempt bound is reached, then the last failure is final.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryableTask {
    pub id: JobId,
    inner: Box<TaskUnit>,
    max_attempts: u32,
    attempts: u32,
    exhausted: bool,
}

impl RetryableTask {
    pub fn new(id: JobId, inner: TaskUnit, max_attempts: u32) -> Self {
        Self {
            id,
            inner: Box::new(inner),
            max_attempts: max_attempts.max(1),
            attempts: 0,
            exhausted: false,
        }
    }

    /// Attempts made so far (terminal failures observed).
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn inner(&self) -> &TaskUnit {
        &self.inner
    }
}

#[async_trait]
impl TaskControl for RetryableTask {
    fn id(&self) -> &JobId {
        &self.id
    }

    fn state(&self) -> JobState {
        self.inner.state()
    }

    fn termination(&self) -> Option<Termination> {
        self.inner.termination()
    }

    async fn advance(&mut self, core: &Core) -> Result<(), GridflowError> {
        if self.exhausted {
            return Ok(());
        }
        self.inner.advance(core).await?;

        if self.inner.state() != JobState::Terminated {
            return Ok(());
        }
        match self.inner.termination() {
            Some(t) if t.is_failure() => {
                self.attempts += 1;
                if self.attempts < self.max_attempts {
                    self.inner.reset_for_retry()?;
                    core.events().emit(EventKind::RetryScheduled {
                        job_id: self.id.clone(),
                        attempt: self.attempts + 1,
                    });
                } else {
                    // Bound reached: the last attempt's failure is final.
                    self.exhausted = true;
                }
            }
            _ => {
                self.attempts += 1;
                self.exhausted = true;
            }
        }
        Ok(())
    }

    async fn cancel(&mut self, core: &Core) -> Result<(), GridflowError> {
        // Canceling also stops the retry loop.
        self.exhausted = true;
        self.inner.cancel(core).await
    }

    fn reset_for_retry(&mut self) -> Result<(), GridflowError> {
        self.inner.reset_for_retry()?;
        self.attempts = 0;
        self.exhausted = false;
        Ok(())
    }
}

// ============================================================================
// TASK UNIT
// ============================================================================

/// Any tracked entity: a simple job or one of the composite kinds.
/// The composition is picked at construction; nesting is arbitrary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskUnit {
    Job(Job),
    Parallel(ParallelCollection),
    Sequential(SequentialCollection),
    Dependent(DependentCollection),
    Retryable(RetryableTask),
}

impl TaskUnit {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskUnit::Job(_) => "job",
            TaskUnit::Parallel(_) => "parallel",
            TaskUnit::Sequential(_) => "sequential",
            TaskUnit::Dependent(_) => "dependent",
            TaskUnit::Retryable(_) => "retryable",
        }
    }

    fn children(&self) -> &[TaskUnit] {
        match self {
            TaskUnit::Job(_) => &[],
            TaskUnit::Parallel(c) => c.children(),
            TaskUnit::Sequential(c) => c.children(),
            TaskUnit::Dependent(c) => c.children(),
            TaskUnit::Retryable(r) => std::slice::from_ref(r.inner.as_ref()),
        }
    }

    /// Find self or a descendant by id.
    pub fn find(&self, id: &JobId) -> Option<&TaskUnit> {
        if self.id() == id {
            return Some(self);
        }
        self.children().iter().find_map(|c| c.find(id))
    }

    /// Mutable lookup of self or a descendant by id.
    pub fn find_mut(&mut self, id: &JobId) -> Option<&mut TaskUnit> {
        if self.id() == id {
            return Some(self);
        }
        match self {
            TaskUnit::Job(_) => None,
            TaskUnit::Parallel(c) => c.children.iter_mut().find_map(|u| u.find_mut(id)),
            TaskUnit::Sequential(c) => c.children.iter_mut().find_map(|u| u.find_mut(id)),
            TaskUnit::Dependent(c) => c.children.iter_mut().find_map(|u| u.find_mut(id)),
            TaskUnit::Retryable(r) => r.inner.find_mut(id),
        }
    }

    /// All ids in this unit, self included.
    pub fn collect_ids(&self, out: &mut Vec<JobId>) {
        out.push(self.id().clone());
        for child in self.children() {
            child.collect_ids(out);
        }
    }

    /// Count of live leaf jobs (occupying backends) under this unit.
    pub fn live_jobs(&self) -> usize {
        match self {
            TaskUnit::Job(j) => usize::from(j.state().is_live()),
            _ => self.children().iter().map(|c| c.live_jobs()).sum(),
        }
    }

    /// Count of leaf jobs currently queued on a backend.
    pub fn submitted_jobs(&self) -> usize {
        match self {
            TaskUnit::Job(j) => usize::from(j.state() == JobState::Submitted),
            _ => self.children().iter().map(|c| c.submitted_jobs()).sum(),
        }
    }

    /// Slot leases still held by leaf jobs under this unit.
    pub fn active_leases(&self, out: &mut Vec<crate::execution::SlotLease>) {
        match self {
            TaskUnit::Job(j) => {
                if let Some(lease) = &j.execution.lease {
                    out.push(lease.clone());
                }
            }
            _ => {
                for child in self.children() {
                    child.active_leases(out);
                }
            }
        }
    }

    /// True if `id` sits blocked behind a failed predecessor in some
    /// dependent collection under this unit.
    pub fn is_blocked(&self, id: &JobId) -> bool {
        if let TaskUnit::Dependent(c) = self {
            if c.blocked.contains(id) {
                return true;
            }
        }
        self.children().iter().any(|c| c.is_blocked(id))
    }
}

#[async_trait]
impl TaskControl for TaskUnit {
    fn id(&self) -> &JobId {
        match self {
            TaskUnit::Job(j) => &j.id,
            TaskUnit::Parallel(c) => &c.id,
            TaskUnit::Sequential(c) => &c.id,
            TaskUnit::Dependent(c) => &c.id,
            TaskUnit::Retryable(r) => &r.id,
        }
    }

    fn state(&self) -> JobState {
        match self {
            TaskUnit::Job(j) => TaskControl::state(j),
            TaskUnit::Parallel(c) => c.state(),
            TaskUnit::Sequential(c) => c.state(),
            TaskUnit::Dependent(c) => c.state(),
            TaskUnit::Retryable(r) => r.state(),
        }
    }

    fn termination(&self) -> Option<Termination> {
        match self {
            TaskUnit::Job(j) => TaskControl::termination(j),
            TaskUnit::Parallel(c) => c.termination(),
            TaskUnit::Sequential(c) => c.termination(),
            TaskUnit::Dependent(c) => c.termination(),
            TaskUnit::Retryable(r) => r.termination(),
        }
    }

    async fn advance(&mut self, core: &Core) -> Result<(), GridflowError> {
        match self {
            TaskUnit::Job(j) => j.advance(core).await,
            TaskUnit::Parallel(c) => c.advance(core).await,
            TaskUnit::Sequential(c) => c.advance(core).await,
            TaskUnit::Dependent(c) => c.advance(core).await,
            TaskUnit::Retryable(r) => r.advance(core).await,
        }
    }

    async fn cancel(&mut self, core: &Core) -> Result<(), GridflowError> {
        match self {
            TaskUnit::Job(j) => j.cancel(core).await,
            TaskUnit::Parallel(c) => c.cancel(core).await,
            TaskUnit::Sequential(c) => c.cancel(core).await,
            TaskUnit::Dependent(c) => c.cancel(core).await,
            TaskUnit::Retryable(r) => r.cancel(core).await,
        }
    }

    fn reset_for_retry(&mut self) -> Result<(), GridflowError> {
        match self {
            TaskUnit::Job(j) => Job::reset_for_retry(j),
            TaskUnit::Parallel(c) => c.reset_for_retry(),
            TaskUnit::Sequential(c) => c.reset_for_retry(),
            TaskUnit::Dependent(c) => c.reset_for_retry(),
            TaskUnit::Retryable(r) => r.reset_for_retry(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
