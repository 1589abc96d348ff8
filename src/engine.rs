//! The orchestration core and the cycle engine
//!
//! [`Core`] performs the three backend-facing moves on a single job:
//! submit, poll-and-apply, stage output. It owns the adapter registry,
//! the resource pool and the scheduling policy, and conserves slot
//! capacity: a lease taken at submission is released exactly once, on the
//! first transition into TERMINATING or TERMINATED.
//!
//! [`Engine`] drives the roster: one `progress()` call is one cycle.
//! Per-task errors inside a cycle are logged and suppressed unless their
//! category is on the [`PropagationPolicy`] allow-list, so one task's
//! failure never starves its neighbours.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::backend::{AdapterRegistry, BackendAdapter, JobOutput, RemoteStatus};
use crate::collection::{TaskControl, TaskUnit};
use crate::error::{GridflowError, PropagationPolicy};
use crate::event_log::{EventKind, EventLog};
use crate::execution::{AbortReason, BackendJobRef, JobState, SlotLease, Termination};
use crate::job::{Job, JobSpec};
use crate::resource::ResourcePool;
use crate::scheduler::Scheduler;
use crate::session::SessionData;
use crate::types::JobId;

// ============================================================================
// SUBMISSION BUDGET
// ============================================================================

const UNLIMITED: usize = usize::MAX;

/// Per-cycle allowance for new submissions. The engine sets it from its
/// caps at the start of every cycle; [`Core::submit_job`] spends it, so
/// leaf jobs nested in collections honor the caps too.
#[derive(Debug)]
struct SubmitBudget {
    in_flight: AtomicUsize,
    queued: AtomicUsize,
}

impl Default for SubmitBudget {
    fn default() -> Self {
        Self {
            in_flight: AtomicUsize::new(UNLIMITED),
            queued: AtomicUsize::new(UNLIMITED),
        }
    }
}

impl SubmitBudget {
    fn set(&self, in_flight: usize, queued: usize) {
        self.in_flight.store(in_flight, Ordering::SeqCst);
        self.queued.store(queued, Ordering::SeqCst);
    }

    fn clear(&self) {
        self.set(UNLIMITED, UNLIMITED);
    }

    fn exhausted(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0 || self.queued.load(Ordering::SeqCst) == 0
    }

    /// A fresh submission counts against both caps: the job is live and
    /// sits in a remote queue.
    fn consume(&self) {
        for slot in [&self.in_flight, &self.queued] {
            let left = slot.load(Ordering::SeqCst);
            if left != UNLIMITED {
                slot.store(left.saturating_sub(1), Ordering::SeqCst);
            }
        }
    }
}

// ============================================================================
// CORE
// ============================================================================

/// Backend-facing operations on single jobs.
pub struct Core {
    registry: AdapterRegistry,
    pool: ResourcePool,
    scheduler: Box<dyn Scheduler>,
    events: EventLog,
    budget: SubmitBudget,
}

impl Core {
    pub fn new(registry: AdapterRegistry, pool: ResourcePool, scheduler: Box<dyn Scheduler>) -> Self {
        Self {
            registry,
            pool,
            scheduler,
            events: EventLog::new(),
            budget: SubmitBudget::default(),
        }
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    pub fn scheduler_name(&self) -> &str {
        self.scheduler.name()
    }

    // ────────────────────────────────────────────────────────────
    // Submission
    // ────────────────────────────────────────────────────────────

    /// Try to hand a NEW job to a resource. If no resource fits, the job
    /// stays NEW and is retried next cycle; a permanent submit failure
    /// terminates it with the submission-failed marker.
    #[instrument(skip(self, job), fields(job = %job.id))]
    pub async fn submit_job(&self, job: &mut Job) -> Result<(), GridflowError> {
        if job.state() != JobState::New {
            return Ok(());
        }
        if job.cancel_requested() {
            self.terminate_unsubmitted(job);
            return Ok(());
        }
        if self.budget.exhausted() {
            debug!(job = %job.id, "submission allowance exhausted this cycle; staying NEW");
            return Ok(());
        }

        let slots = job.spec.requested_slots;
        let snapshot = self.pool.snapshot();
        let Some(resource) = self.scheduler.choose(&snapshot, slots) else {
            debug!(job = %job.id, slots, "no resource with enough free slots; staying NEW");
            return Ok(());
        };
        let adapter =
            self.registry
                .get(&resource)
                .ok_or_else(|| GridflowError::UnknownResource {
                    resource: resource.to_string(),
                })?;

        // The snapshot may have gone stale between choose and take.
        if !self.pool.take(&resource, slots) {
            debug!(job = %job.id, %resource, "scheduling decision went stale; retrying next cycle");
            return Ok(());
        }

        match adapter.submit(&job.spec, &resource).await {
            Ok(backend_ref) => {
                self.events.emit(EventKind::JobSubmitted {
                    job_id: job.id.clone(),
                    resource: resource.clone(),
                    remote_id: backend_ref.remote_id.clone(),
                });
                job.execution.backend_ref = Some(backend_ref);
                job.execution.lease = Some(SlotLease { resource, slots });
                self.change_state(job, JobState::Submitted)?;
                self.budget.consume();
                Ok(())
            }
            Err(e) if e.is_transient() => {
                self.pool.release(&resource, slots);
                warn!(job = %job.id, error = %e, "transient submit failure; staying NEW");
                Ok(())
            }
            Err(e) => {
                self.pool.release(&resource, slots);
                self.events.emit(EventKind::SubmissionFailed {
                    job_id: job.id.clone(),
                    error: e.to_string(),
                });
                job.execution.termination =
                    Some(Termination::Aborted(AbortReason::SubmissionFailed));
                self.change_state(job, JobState::Terminated)?;
                self.events.emit(EventKind::JobTerminated {
                    job_id: job.id.clone(),
                    termination: Termination::Aborted(AbortReason::SubmissionFailed),
                });
                Ok(())
            }
        }
    }

    // ────────────────────────────────────────────────────────────
    // Polling
    // ────────────────────────────────────────────────────────────

    /// Poll a live job and apply whatever the backend reports. TERMINATING
    /// jobs skip the poll and go straight to output staging.
    pub async fn update_job(&self, job: &mut Job) -> Result<(), GridflowError> {
        let state = job.state();
        if !state.is_live() {
            return Ok(());
        }
        let Some(backend_ref) = job.execution.backend_ref.clone() else {
            warn!(job = %job.id, %state, "live job without backend reference; skipping");
            return Ok(());
        };
        let adapter = self.registry.get(&backend_ref.resource).ok_or_else(|| {
            GridflowError::UnknownResource {
                resource: backend_ref.resource.to_string(),
            }
        })?;

        // Forward a pending cancel intent before polling; the terminal
        // state is only confirmed by a later poll.
        if job.cancel_requested() && !job.cancel_sent() && state != JobState::Terminating {
            match adapter.cancel(&backend_ref).await {
                Ok(()) => job.mark_cancel_sent(),
                Err(e) if e.is_transient() => {
                    warn!(job = %job.id, error = %e, "cancel not delivered; retrying next cycle");
                }
                Err(e) => {
                    return Err(GridflowError::Backend {
                        id: job.id.to_string(),
                        source: e,
                    })
                }
            }
        }

        if state == JobState::Terminating {
            return self.stage_output(job, adapter.as_ref(), &backend_ref).await;
        }

        let status = match adapter.poll(&backend_ref).await {
            Ok(s) => s,
            Err(e) if e.is_transient() => {
                debug!(job = %job.id, error = %e, "transient poll failure; no transition");
                return Ok(());
            }
            Err(e) => {
                return Err(GridflowError::Backend {
                    id: job.id.to_string(),
                    source: e,
                })
            }
        };
        self.apply_status(job, status, adapter.as_ref(), &backend_ref)
            .await
    }

    async fn apply_status(
        &self,
        job: &mut Job,
        status: RemoteStatus,
        adapter: &dyn BackendAdapter,
        backend_ref: &BackendJobRef,
    ) -> Result<(), GridflowError> {
        let from = job.state();
        match status {
            RemoteStatus::Queued => {
                // A held job released by the remote system resurfaces as
                // queued. A queued report on a RUNNING job is stale.
                if from != JobState::Running {
                    self.change_state(job, JobState::Submitted)?;
                }
            }
            RemoteStatus::Running => {
                // STOPPED leaves only towards the queue, never directly to
                // RUNNING.
                if from == JobState::Stopped {
                    self.change_state(job, JobState::Submitted)?;
                } else {
                    self.change_state(job, JobState::Running)?;
                }
            }
            RemoteStatus::Held => {
                self.change_state(job, JobState::Stopped)?;
            }
            RemoteStatus::Finished {
                exit_status,
                output_staged,
            } => {
                job.execution.termination = Some(Termination::Exited(exit_status));
                self.release_lease(job);
                self.change_state(job, JobState::Terminating)?;
                if output_staged {
                    self.stage_output(job, adapter, backend_ref).await?;
                }
                // Otherwise remote staging is still in progress; the fetch
                // happens on a later cycle.
            }
            RemoteStatus::Failed(reason) => {
                let termination = Termination::Aborted(reason);
                job.execution.termination = Some(termination);
                self.release_lease(job);
                self.change_state(job, JobState::Terminated)?;
                self.record_outcome(job);
                self.events.emit(EventKind::JobTerminated {
                    job_id: job.id.clone(),
                    termination,
                });
            }
        }
        Ok(())
    }

    /// Fetch the staged output of a TERMINATING job, then finish the
    /// lifecycle. A permanent fetch failure terminates with the
    /// staging-failure marker; a transient one leaves the job TERMINATING.
    async fn stage_output(
        &self,
        job: &mut Job,
        adapter: &dyn BackendAdapter,
        backend_ref: &BackendJobRef,
    ) -> Result<(), GridflowError> {
        match adapter.fetch_output(backend_ref).await {
            Ok(output) => {
                job.store_output(output);
                self.events.emit(EventKind::OutputStaged {
                    job_id: job.id.clone(),
                });
            }
            Err(e) if e.is_transient() => {
                debug!(job = %job.id, error = %e, "output not staged yet; retrying next cycle");
                return Ok(());
            }
            Err(e) => {
                warn!(job = %job.id, error = %e, "output staging failed");
                job.execution.termination =
                    Some(Termination::Aborted(AbortReason::StagingFailure));
            }
        }
        self.change_state(job, JobState::Terminated)?;
        self.record_outcome(job);
        if let Some(termination) = job.termination() {
            self.events.emit(EventKind::JobTerminated {
                job_id: job.id.clone(),
                termination,
            });
        }
        Ok(())
    }

    /// Snapshot a live job's output stream, where the adapter supports it.
    pub async fn peek_job(&self, job: &Job) -> Result<String, GridflowError> {
        let backend_ref = job.execution.backend_ref.as_ref().ok_or_else(|| {
            GridflowError::OutputUnavailable {
                id: job.id.to_string(),
                reason: "job was never submitted".into(),
            }
        })?;
        let adapter = self.registry.get(&backend_ref.resource).ok_or_else(|| {
            GridflowError::UnknownResource {
                resource: backend_ref.resource.to_string(),
            }
        })?;
        adapter
            .peek(backend_ref)
            .await
            .map_err(|e| GridflowError::Backend {
                id: job.id.to_string(),
                source: e,
            })
    }

    /// Terminate a job that never reached a backend (cancel before
    /// submission). No lease is held, so nothing to release.
    pub(crate) fn terminate_unsubmitted(&self, job: &mut Job) {
        let termination = Termination::Aborted(AbortReason::CanceledByUser);
        job.execution.termination = Some(termination);
        if self.change_state(job, JobState::Terminated).is_ok() {
            self.events.emit(EventKind::JobTerminated {
                job_id: job.id.clone(),
                termination,
            });
        }
    }

    // ────────────────────────────────────────────────────────────
    // Internals
    // ────────────────────────────────────────────────────────────

    fn change_state(&self, job: &mut Job, to: JobState) -> Result<(), GridflowError> {
        let from = job.state();
        job.execution.transition(to)?;
        if from != to {
            debug!(job = %job.id, %from, %to, "state change");
            self.events.emit(EventKind::StateChanged {
                job_id: job.id.clone(),
                from,
                to,
            });
        }
        Ok(())
    }

    /// Release the slot lease on the first move out of the live states.
    /// `take_lease` yields at most once, so double release is impossible.
    fn release_lease(&self, job: &mut Job) {
        if let Some(lease) = job.execution.take_lease() {
            self.pool.release(&lease.resource, lease.slots);
        }
    }

    fn record_outcome(&self, job: &Job) {
        let Some(backend_ref) = &job.execution.backend_ref else {
            return;
        };
        let success = job.termination().map_or(false, |t| t.is_success());
        let turnaround = job.execution.turnaround_secs().unwrap_or(0);
        self.pool
            .record_outcome(&backend_ref.resource, success, turnaround);
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("scheduler", &self.scheduler.name())
            .field("free_slots", &self.pool.total_free())
            .finish()
    }
}

// ============================================================================
// CYCLE STATISTICS
// ============================================================================

/// Per-state counts over the top-level roster after one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleStats {
    pub new: usize,
    pub submitted: usize,
    pub running: usize,
    pub stopped: usize,
    pub terminating: usize,
    pub terminated: usize,
    /// Of the terminated: successes
    pub ok: usize,
    /// Of the terminated: failures
    pub failed: usize,
    /// Per-task errors suppressed during the cycle
    pub errors: usize,
}

impl CycleStats {
    fn count(&mut self, state: JobState, termination: Option<Termination>) {
        match state {
            JobState::New => self.new += 1,
            JobState::Submitted => self.submitted += 1,
            JobState::Running => self.running += 1,
            JobState::Stopped => self.stopped += 1,
            JobState::Terminating => self.terminating += 1,
            JobState::Terminated => {
                self.terminated += 1;
                match termination {
                    Some(t) if t.is_success() => self.ok += 1,
                    _ => self.failed += 1,
                }
            }
        }
    }

    pub fn total(&self) -> usize {
        self.new + self.submitted + self.running + self.stopped + self.terminating + self.terminated
    }

    /// Everything tracked has terminated.
    pub fn all_done(&self) -> bool {
        self.total() == self.terminated
    }

    /// (label, count) rows in lifecycle order, for status tables.
    pub fn rows(&self) -> [(&'static str, usize); 6] {
        [
            ("NEW", self.new),
            ("SUBMITTED", self.submitted),
            ("RUNNING", self.running),
            ("STOPPED", self.stopped),
            ("TERMINATING", self.terminating),
            ("TERMINATED", self.terminated),
        ]
    }
}

// ============================================================================
// TASK STATUS
// ============================================================================

/// Caller-visible snapshot of one tracked task.
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub id: JobId,
    pub kind: &'static str,
    pub state: JobState,
    pub termination: Option<Termination>,
    /// A failed predecessor keeps this task from ever being submitted
    pub blocked: bool,
}

// ============================================================================
// ENGINE
// ============================================================================

/// Drives the roster of tracked tasks, one cycle per `progress()` call.
#[derive(Debug)]
pub struct Engine {
    core: Core,
    roster: Vec<TaskUnit>,
    next_id: u64,
    policy: PropagationPolicy,
    /// Cap on live leaf jobs; NEW jobs wait while at the cap, collection
    /// children included
    max_in_flight: Option<usize>,
    /// Cap on leaf jobs sitting in remote queues
    max_submitted: Option<usize>,
}

impl Engine {
    pub fn new(core: Core) -> Self {
        Self {
            core,
            roster: Vec::new(),
            next_id: 1,
            policy: PropagationPolicy::suppress_all(),
            max_in_flight: None,
            max_submitted: None,
        }
    }

    pub fn with_policy(mut self, policy: PropagationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = Some(max);
        self
    }

    pub fn with_max_submitted(mut self, max: usize) -> Self {
        self.max_submitted = Some(max);
        self
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn roster(&self) -> &[TaskUnit] {
        &self.roster
    }

    // ────────────────────────────────────────────────────────────
    // Roster management
    // ────────────────────────────────────────────────────────────

    /// Track a task. Every id in the unit (children included) must be new
    /// to this engine.
    pub fn add(&mut self, unit: TaskUnit) -> Result<(), GridflowError> {
        let mut incoming = Vec::new();
        unit.collect_ids(&mut incoming);
        for id in &incoming {
            if self.find(id).is_some() {
                return Err(GridflowError::DuplicateTask { id: id.to_string() });
            }
        }
        self.roster.push(unit);
        Ok(())
    }

    /// Track a single job under a generated id.
    pub fn submit_new(&mut self, spec: JobSpec) -> Result<JobId, GridflowError> {
        let id = JobId::new(format!("job-{:06}", self.next_id))?;
        self.next_id += 1;
        self.add(TaskUnit::Job(Job::new(id.clone(), spec)))?;
        Ok(id)
    }

    pub fn find(&self, id: &JobId) -> Option<&TaskUnit> {
        self.roster.iter().find_map(|u| u.find(id))
    }

    fn find_mut<'a>(roster: &'a mut [TaskUnit], id: &JobId) -> Option<&'a mut TaskUnit> {
        roster.iter_mut().find_map(|u| u.find_mut(id))
    }

    // ────────────────────────────────────────────────────────────
    // The cycle
    // ────────────────────────────────────────────────────────────

    /// Run one cycle: submit what is NEW, poll what is live, recompute
    /// collections. Children are always resolved before their parents, by
    /// construction of the composite advance.
    #[instrument(skip(self))]
    pub async fn progress(&mut self) -> Result<CycleStats, GridflowError> {
        let Self {
            ref core,
            ref mut roster,
            ref policy,
            max_in_flight,
            max_submitted,
            ..
        } = *self;

        core.events.emit(EventKind::CycleStarted {
            roster_len: roster.len(),
        });

        // Leaf jobs count against the caps wherever they are nested, so
        // the allowance is computed once and spent inside submit_job.
        let live: usize = roster.iter().map(|u| u.live_jobs()).sum();
        let queued: usize = roster.iter().map(|u| u.submitted_jobs()).sum();
        core.budget.set(
            max_in_flight.map_or(UNLIMITED, |m| m.saturating_sub(live)),
            max_submitted.map_or(UNLIMITED, |m| m.saturating_sub(queued)),
        );

        let mut advanced = 0usize;
        let mut suppressed = 0usize;
        for i in 0..roster.len() {
            match roster[i].advance(core).await {
                Ok(()) => advanced += 1,
                Err(e) => {
                    if policy.should_propagate(e.category()) {
                        core.budget.clear();
                        return Err(e);
                    }
                    warn!(task = %roster[i].id(), error = %e, "task error suppressed this cycle");
                    suppressed += 1;
                }
            }
        }
        core.budget.clear();

        let mut stats = self.stats();
        stats.errors = suppressed;
        self.core.events.emit(EventKind::CycleCompleted {
            processed: advanced,
            suppressed_errors: suppressed,
        });
        Ok(stats)
    }

    /// Per-state counts over the top-level roster, without advancing.
    pub fn stats(&self) -> CycleStats {
        let mut stats = CycleStats::default();
        for unit in &self.roster {
            stats.count(unit.state(), unit.termination());
        }
        stats
    }

    // ────────────────────────────────────────────────────────────
    // Caller operations
    // ────────────────────────────────────────────────────────────

    /// Status snapshot of a tracked task (top-level or nested).
    pub fn query(&self, id: &JobId) -> Result<TaskStatus, GridflowError> {
        let unit = self.find(id).ok_or_else(|| GridflowError::UnknownTask {
            id: id.to_string(),
        })?;
        let blocked = self.roster.iter().any(|u| u.is_blocked(id));
        Ok(TaskStatus {
            id: id.clone(),
            kind: unit.kind(),
            state: unit.state(),
            termination: unit.termination(),
            blocked,
        })
    }

    /// Record the cancel intent on a task and everything under it.
    pub async fn cancel(&mut self, id: &JobId) -> Result<(), GridflowError> {
        let Self {
            ref core,
            ref mut roster,
            ..
        } = *self;
        let unit = Self::find_mut(roster, id).ok_or_else(|| GridflowError::UnknownTask {
            id: id.to_string(),
        })?;
        unit.cancel(core).await
    }

    /// The retry intent: TERMINATED back to NEW.
    pub fn retry(&mut self, id: &JobId) -> Result<(), GridflowError> {
        let unit =
            Self::find_mut(&mut self.roster, id).ok_or_else(|| GridflowError::UnknownTask {
                id: id.to_string(),
            })?;
        if unit.state() != JobState::Terminated {
            return Err(GridflowError::NotTerminated {
                id: id.to_string(),
                state: unit.state(),
            });
        }
        unit.reset_for_retry()
    }

    /// Collect a terminated job's staged output. One-shot.
    pub fn collect_output(&mut self, id: &JobId) -> Result<JobOutput, GridflowError> {
        let Self {
            ref core,
            ref mut roster,
            ..
        } = *self;
        let unit = Self::find_mut(roster, id).ok_or_else(|| GridflowError::UnknownTask {
            id: id.to_string(),
        })?;
        let TaskUnit::Job(job) = unit else {
            return Err(GridflowError::OutputUnavailable {
                id: id.to_string(),
                reason: "collections have no output of their own".into(),
            });
        };
        let output = job.collect_output()?;
        core.events.emit(EventKind::OutputCollected {
            job_id: id.clone(),
        });
        Ok(output)
    }

    /// Snapshot a live job's output stream.
    pub async fn peek(&self, id: &JobId) -> Result<String, GridflowError> {
        let unit = self.find(id).ok_or_else(|| GridflowError::UnknownTask {
            id: id.to_string(),
        })?;
        let TaskUnit::Job(job) = unit else {
            return Err(GridflowError::OutputUnavailable {
                id: id.to_string(),
                reason: "collections have no output stream".into(),
            });
        };
        self.core.peek_job(job).await
    }

    // ────────────────────────────────────────────────────────────
    // Session persistence
    // ────────────────────────────────────────────────────────────

    /// Roster and id counter, ready to persist.
    pub fn session_data(&self) -> SessionData {
        SessionData {
            next_id: self.next_id,
            roster: self.roster.clone(),
        }
    }

    /// Restore a persisted roster. Slot leases held by live jobs are
    /// re-reserved on the pool so capacity accounting survives restarts.
    pub fn restore(&mut self, data: SessionData) {
        let mut leases = Vec::new();
        for unit in &data.roster {
            unit.active_leases(&mut leases);
        }
        for lease in leases {
            if !self.core.pool.take(&lease.resource, lease.slots) {
                warn!(
                    resource = %lease.resource,
                    slots = lease.slots,
                    "persisted lease exceeds declared capacity"
                );
            }
        }
        self.next_id = data.next_id;
        self.roster = data.roster;
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockAdapter;
    use crate::collection::ParallelCollection;
    use crate::resource::Resource;
    use crate::scheduler::GreedyScheduler;
    use crate::types::ResourceName;
    use std::sync::Arc;

    fn resource_name() -> ResourceName {
        ResourceName::new("mock-res").unwrap()
    }

    fn engine_with(adapter: MockAdapter, slots: u32) -> Engine {
        let registry = AdapterRegistry::new();
        registry.register(resource_name(), Arc::new(adapter));
        let pool = ResourcePool::new(vec![Resource::new(resource_name(), slots)]);
        Engine::new(Core::new(registry, pool, Box::new(GreedyScheduler)))
    }

    fn spec(name: &str) -> JobSpec {
        JobSpec {
            name: Some(name.into()),
            command: "/bin/true".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn job_walks_full_lifecycle() {
        let mut engine = engine_with(MockAdapter::new(), 4);
        let id = engine.submit_new(spec("j")).unwrap();

        // Cycle 1: NEW -> SUBMITTED
        let stats = engine.progress().await.unwrap();
        assert_eq!(stats.submitted, 1);

        // Cycle 2: queued; cycle 3: running; cycle 4: finished + staged
        engine.progress().await.unwrap();
        let stats = engine.progress().await.unwrap();
        assert_eq!(stats.running, 1);
        let stats = engine.progress().await.unwrap();
        assert_eq!(stats.terminated, 1);
        assert_eq!(stats.ok, 1);
        assert!(stats.all_done());

        let status = engine.query(&id).unwrap();
        assert_eq!(status.termination, Some(Termination::Exited(0)));
    }

    #[tokio::test]
    async fn capacity_is_conserved_across_lifecycle() {
        let mut engine = engine_with(MockAdapter::new(), 4);
        engine.submit_new(spec("j")).unwrap();

        engine.progress().await.unwrap();
        // One slot leased while live
        assert_eq!(engine.core().pool().total_free(), 3);

        for _ in 0..4 {
            engine.progress().await.unwrap();
        }
        assert!(engine.stats().all_done());
        assert_eq!(engine.core().pool().total_free(), 4);
    }

    #[tokio::test]
    async fn permanent_submit_failure_terminates_with_marker() {
        let mut engine = engine_with(MockAdapter::new().with_submit_failure("doomed"), 4);
        let id = engine.submit_new(spec("doomed")).unwrap();

        let stats = engine.progress().await.unwrap();
        assert_eq!(stats.terminated, 1);
        assert_eq!(stats.failed, 1);

        let status = engine.query(&id).unwrap();
        assert_eq!(
            status.termination,
            Some(Termination::Aborted(AbortReason::SubmissionFailed))
        );
        // The failed submission never holds capacity
        assert_eq!(engine.core().pool().total_free(), 4);
    }

    #[tokio::test]
    async fn no_capacity_means_job_stays_new() {
        let mut engine = engine_with(MockAdapter::new(), 1);
        let mut big = spec("big");
        big.requested_slots = 2;
        let id = engine.submit_new(big).unwrap();

        let stats = engine.progress().await.unwrap();
        assert_eq!(stats.new, 1);
        assert_eq!(engine.query(&id).unwrap().state, JobState::New);
    }

    #[tokio::test]
    async fn cancel_before_submission_terminates_immediately() {
        let mut engine = engine_with(MockAdapter::new(), 4);
        let id = engine.submit_new(spec("j")).unwrap();

        engine.cancel(&id).await.unwrap();
        engine.progress().await.unwrap();

        let status = engine.query(&id).unwrap();
        assert_eq!(status.state, JobState::Terminated);
        assert_eq!(
            status.termination,
            Some(Termination::Aborted(AbortReason::CanceledByUser))
        );
    }

    #[tokio::test]
    async fn retry_requires_terminated() {
        let mut engine = engine_with(MockAdapter::new(), 4);
        let id = engine.submit_new(spec("j")).unwrap();
        assert!(matches!(
            engine.retry(&id),
            Err(GridflowError::NotTerminated { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_task_is_rejected() {
        let engine = engine_with(MockAdapter::new(), 4);
        let ghost = JobId::new("ghost").unwrap();
        assert!(matches!(
            engine.query(&ghost),
            Err(GridflowError::UnknownTask { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_ids_rejected_on_add() {
        let mut engine = engine_with(MockAdapter::new(), 4);
        engine
            .add(TaskUnit::Job(Job::new(JobId::new("x").unwrap(), spec("x"))))
            .unwrap();
        let err = engine.add(TaskUnit::Job(Job::new(JobId::new("x").unwrap(), spec("x"))));
        assert!(matches!(err, Err(GridflowError::DuplicateTask { .. })));
    }

    #[tokio::test]
    async fn max_in_flight_defers_submissions() {
        let mut engine = engine_with(MockAdapter::new(), 8).with_max_in_flight(1);
        engine.submit_new(spec("a")).unwrap();
        engine.submit_new(spec("b")).unwrap();

        let stats = engine.progress().await.unwrap();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.new, 1);
    }

    #[tokio::test]
    async fn max_submitted_defers_submissions() {
        // Jobs linger in the queue: the first poll reports Queued forever
        let adapter = MockAdapter::new().with_default_script([RemoteStatus::Queued]);
        let mut engine = engine_with(adapter, 8).with_max_submitted(2);
        for i in 0..4 {
            engine.submit_new(spec(&format!("j{}", i))).unwrap();
        }

        engine.progress().await.unwrap();
        let stats = engine.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.new, 2);
    }

    #[tokio::test]
    async fn max_in_flight_caps_collection_children() {
        // Children never leave the queue, so the live count stays up
        let adapter = MockAdapter::new().with_default_script([RemoteStatus::Queued]);
        let mut engine = engine_with(adapter.clone(), 8).with_max_in_flight(2);

        let children: Vec<TaskUnit> = (0..5)
            .map(|i| {
                let n = format!("c{}", i);
                TaskUnit::Job(Job::new(JobId::new(&n).unwrap(), spec(&n)))
            })
            .collect();
        engine
            .add(TaskUnit::Parallel(
                ParallelCollection::new(JobId::new("par").unwrap(), children).unwrap(),
            ))
            .unwrap();

        engine.progress().await.unwrap();
        assert_eq!(adapter.submission_count(), 2);

        // Nothing terminated, so the cap still holds on the next cycle
        engine.progress().await.unwrap();
        assert_eq!(adapter.submission_count(), 2);
    }

    #[tokio::test]
    async fn cycle_completed_counts_only_advanced_tasks() {
        let mut engine = engine_with(MockAdapter::new(), 4);
        engine.submit_new(spec("ok")).unwrap();

        // A live job pointing at a remote id the adapter never issued
        // fails its poll permanently and is suppressed.
        let mut lost = Job::new(JobId::new("lost").unwrap(), spec("lost"));
        lost.execution.backend_ref = Some(BackendJobRef {
            resource: resource_name(),
            remote_id: "mock-9999".into(),
        });
        lost.execution.transition(JobState::Submitted).unwrap();
        engine.add(TaskUnit::Job(lost)).unwrap();

        let stats = engine.progress().await.unwrap();
        assert_eq!(stats.errors, 1);

        let cycles = engine.core().events().cycle_events();
        match &cycles[1].kind {
            EventKind::CycleCompleted {
                processed,
                suppressed_errors,
            } => {
                assert_eq!(*processed, 1);
                assert_eq!(*suppressed_errors, 1);
            }
            other => panic!("expected a cycle completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cycle_events_bracket_the_cycle() {
        let mut engine = engine_with(MockAdapter::new(), 4);
        engine.submit_new(spec("j")).unwrap();
        engine.progress().await.unwrap();

        let cycles = engine.core().events().cycle_events();
        assert_eq!(cycles.len(), 2);
        assert!(matches!(cycles[0].kind, EventKind::CycleStarted { .. }));
        assert!(matches!(cycles[1].kind, EventKind::CycleCompleted { .. }));
    }
}
