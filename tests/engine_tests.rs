//! End-to-end engine behavior over the mock adapter.

use std::sync::Arc;

use gridflow::{
    AbortReason, AdapterRegistry, Core, DependentCollection, DependentStatus, Engine,
    GreedyScheduler, Job, JobId, JobSpec, JobState, MockAdapter, ParallelCollection,
    RemoteStatus, Resource, ResourcePool, RetryableTask, SequentialCollection, TaskControl,
    TaskUnit, Termination,
};

fn id(s: &str) -> JobId {
    JobId::new(s).unwrap()
}

fn name(s: &str) -> gridflow::ResourceName {
    gridflow::ResourceName::new(s).unwrap()
}

fn spec(n: &str) -> JobSpec {
    JobSpec {
        name: Some(n.into()),
        command: "/bin/true".into(),
        ..Default::default()
    }
}

fn job(n: &str) -> TaskUnit {
    TaskUnit::Job(Job::new(id(n), spec(n)))
}

/// Engine with a single mock resource.
fn engine_with(adapter: &MockAdapter, slots: u32) -> Engine {
    let registry = AdapterRegistry::new();
    registry.register(name("mock-res"), Arc::new(adapter.clone()));
    let pool = ResourcePool::new(vec![Resource::new(name("mock-res"), slots)]);
    Engine::new(Core::new(registry, pool, Box::new(GreedyScheduler)))
}

async fn run_cycles(engine: &mut Engine, n: usize) {
    for _ in 0..n {
        engine.progress().await.unwrap();
    }
}

const FAIL_FAST: [RemoteStatus; 1] = [RemoteStatus::Finished {
    exit_status: 1,
    output_staged: true,
}];

const OK_FAST: [RemoteStatus; 1] = [RemoteStatus::Finished {
    exit_status: 0,
    output_staged: true,
}];

// ────────────────────────────────────────────────────────────────
// Scenario A: largest free capacity wins
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn submission_goes_to_largest_free_capacity() {
    let adapter = MockAdapter::new();
    let registry = AdapterRegistry::new();
    registry.register(name("small"), Arc::new(adapter.clone()));
    registry.register(name("big"), Arc::new(adapter.clone()));
    let pool = ResourcePool::new(vec![
        Resource::new(name("small"), 5),
        Resource::new(name("big"), 8),
    ]);
    let mut engine = Engine::new(Core::new(registry, pool, Box::new(GreedyScheduler)));

    let mut wide = spec("wide");
    wide.requested_slots = 3;
    engine.submit_new(wide).unwrap();
    engine.progress().await.unwrap();

    assert_eq!(engine.core().pool().free_slots(&name("big")), Some(5));
    assert_eq!(engine.core().pool().free_slots(&name("small")), Some(5));
}

// ────────────────────────────────────────────────────────────────
// Scenario B: permanent submission failure
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn failed_submission_terminates_and_has_no_output() {
    let adapter = MockAdapter::new().with_submit_failure("doomed");
    let mut engine = engine_with(&adapter, 4);
    let job_id = engine.submit_new(spec("doomed")).unwrap();

    engine.progress().await.unwrap();

    let status = engine.query(&job_id).unwrap();
    assert_eq!(status.state, JobState::Terminated);
    assert_eq!(
        status.termination,
        Some(Termination::Aborted(AbortReason::SubmissionFailed))
    );

    // Nothing was staged, so collection fails and flips no flag
    let err = engine.collect_output(&job_id);
    assert!(matches!(
        err,
        Err(gridflow::GridflowError::OutputUnavailable { .. })
    ));
}

// ────────────────────────────────────────────────────────────────
// Scenario C: failed predecessor blocks transitive dependents
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn failed_dependency_is_never_submitted() {
    // "a" finishes but its output staging fails -> staging-failure marker
    let adapter = MockAdapter::new()
        .with_script_for("a", OK_FAST)
        .with_fetch_failure("a");
    let mut engine = engine_with(&adapter, 8);

    let dag = DependentCollection::new(
        id("dag"),
        vec![job("a"), job("b")],
        &[(id("a"), id("b"))],
    )
    .unwrap();
    engine.add(TaskUnit::Dependent(dag)).unwrap();

    run_cycles(&mut engine, 5).await;

    // Only "a" ever reached the backend
    assert_eq!(adapter.submitted_names(), vec!["a".to_string()]);

    let a = engine.query(&id("a")).unwrap();
    assert_eq!(
        a.termination,
        Some(Termination::Aborted(AbortReason::StagingFailure))
    );

    let b = engine.query(&id("b")).unwrap();
    assert!(b.blocked);

    let Some(TaskUnit::Dependent(dag)) = engine.find(&id("dag")) else {
        panic!("dag went missing");
    };
    assert_eq!(
        dag.child_status(&id("b")),
        Some(DependentStatus::FailedDependency)
    );
    assert_eq!(dag.state(), JobState::Terminated);
}

#[tokio::test]
async fn diamond_runs_in_dependency_order() {
    let adapter = MockAdapter::new().with_default_script(OK_FAST);
    let mut engine = engine_with(&adapter, 8);

    let dag = DependentCollection::new(
        id("dag"),
        vec![job("a"), job("b"), job("c"), job("d")],
        &[
            (id("a"), id("b")),
            (id("a"), id("c")),
            (id("b"), id("d")),
            (id("c"), id("d")),
        ],
    )
    .unwrap();
    engine.add(TaskUnit::Dependent(dag)).unwrap();

    run_cycles(&mut engine, 8).await;
    assert!(engine.stats().all_done());

    let order = adapter.submitted_names();
    assert_eq!(order.len(), 4);
    assert_eq!(order[0], "a");
    assert_eq!(order[3], "d");
}

// ────────────────────────────────────────────────────────────────
// Scenario D: bounded automatic retry
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn retryable_stops_after_max_attempts() {
    let adapter = MockAdapter::new().with_script_for("flaky", FAIL_FAST);
    let mut engine = engine_with(&adapter, 4);

    let wrapper = RetryableTask::new(id("wrap"), job("flaky"), 3);
    engine.add(TaskUnit::Retryable(wrapper)).unwrap();

    run_cycles(&mut engine, 12).await;

    assert_eq!(adapter.submission_count(), 3);
    let Some(TaskUnit::Retryable(wrapper)) = engine.find(&id("wrap")) else {
        panic!("wrapper went missing");
    };
    assert_eq!(wrapper.attempts(), 3);
    assert_eq!(wrapper.state(), JobState::Terminated);
    assert_eq!(wrapper.termination(), Some(Termination::Exited(1)));
}

#[tokio::test]
async fn retryable_succeeds_midway_and_stops_retrying() {
    // First attempt fails, second succeeds
    let adapter = MockAdapter::new().with_script_for("recovering", FAIL_FAST);
    let mut engine = engine_with(&adapter, 4);
    engine
        .add(TaskUnit::Retryable(RetryableTask::new(
            id("wrap"),
            job("recovering"),
            5,
        )))
        .unwrap();

    // Attempt 1: submit + fail
    run_cycles(&mut engine, 2).await;
    // Rescript: the next submission succeeds
    let _ = adapter.clone().with_script_for("recovering", OK_FAST);

    run_cycles(&mut engine, 6).await;

    assert_eq!(adapter.submission_count(), 2);
    let Some(TaskUnit::Retryable(wrapper)) = engine.find(&id("wrap")) else {
        panic!("wrapper went missing");
    };
    assert_eq!(wrapper.attempts(), 2);
    assert_eq!(wrapper.termination(), Some(Termination::Exited(0)));
}

// ────────────────────────────────────────────────────────────────
// Scenario E: parallel aggregation
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn parallel_collection_waits_for_slowest_children() {
    let slow = [
        RemoteStatus::Running,
        RemoteStatus::Running,
        RemoteStatus::Running,
        RemoteStatus::Finished {
            exit_status: 0,
            output_staged: true,
        },
    ];
    let adapter = MockAdapter::new()
        .with_default_script(OK_FAST)
        .with_script_for("slow-1", slow)
        .with_script_for("slow-2", slow);
    let mut engine = engine_with(&adapter, 8);

    let par = ParallelCollection::new(
        id("par"),
        vec![
            job("fast-1"),
            job("fast-2"),
            job("fast-3"),
            job("slow-1"),
            job("slow-2"),
        ],
    )
    .unwrap();
    engine.add(TaskUnit::Parallel(par)).unwrap();

    // Fast children terminate, slow ones are still running
    run_cycles(&mut engine, 3).await;
    let status = engine.query(&id("par")).unwrap();
    assert_eq!(status.state, JobState::Running);

    run_cycles(&mut engine, 4).await;
    let status = engine.query(&id("par")).unwrap();
    assert_eq!(status.state, JobState::Terminated);
    assert_eq!(status.termination, Some(Termination::Exited(0)));
}

// ────────────────────────────────────────────────────────────────
// Sequential semantics
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn sequential_advances_within_one_cycle() {
    let adapter = MockAdapter::new().with_default_script(OK_FAST);
    let mut engine = engine_with(&adapter, 4);

    let seq = SequentialCollection::new(id("seq"), vec![job("first"), job("second")]).unwrap();
    engine.add(TaskUnit::Sequential(seq)).unwrap();

    // Cycle 1 submits "first" only
    engine.progress().await.unwrap();
    assert_eq!(adapter.submission_count(), 1);

    // Cycle 2: "first" terminates, "second" is submitted in the same cycle
    engine.progress().await.unwrap();
    assert_eq!(adapter.submitted_names(), vec!["first", "second"]);
}

#[tokio::test]
async fn sequential_abort_on_failure_skips_the_rest() {
    let adapter = MockAdapter::new()
        .with_script_for("bad", FAIL_FAST)
        .with_default_script(OK_FAST);
    let mut engine = engine_with(&adapter, 4);

    let seq = SequentialCollection::new(id("seq"), vec![job("bad"), job("never")])
        .unwrap()
        .abort_on_failure();
    engine.add(TaskUnit::Sequential(seq)).unwrap();

    run_cycles(&mut engine, 5).await;

    assert_eq!(adapter.submitted_names(), vec!["bad"]);
    let status = engine.query(&id("seq")).unwrap();
    assert_eq!(status.state, JobState::Terminated);
    assert_eq!(status.termination, Some(Termination::Exited(1)));
}

// ────────────────────────────────────────────────────────────────
// Cooperative cancel
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_of_running_job_confirms_on_poll() {
    let adapter = MockAdapter::new().with_script_for(
        "long",
        [
            RemoteStatus::Queued,
            RemoteStatus::Running,
            RemoteStatus::Running,
            RemoteStatus::Running,
        ],
    );
    let mut engine = engine_with(&adapter, 4);
    let job_id = engine.submit_new(spec("long")).unwrap();

    // Submit, then get it running
    run_cycles(&mut engine, 3).await;
    assert_eq!(engine.query(&job_id).unwrap().state, JobState::Running);

    engine.cancel(&job_id).await.unwrap();
    // Intent is recorded immediately, state unchanged until confirmed
    assert_eq!(engine.query(&job_id).unwrap().state, JobState::Running);

    run_cycles(&mut engine, 2).await;
    let status = engine.query(&job_id).unwrap();
    assert_eq!(status.state, JobState::Terminated);
    assert_eq!(
        status.termination,
        Some(Termination::Aborted(AbortReason::CanceledByUser))
    );
    // The slot came back
    assert_eq!(engine.core().pool().total_free(), 4);
}

// ────────────────────────────────────────────────────────────────
// Capacity accounting
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn capacity_never_exceeded_and_fully_returned() {
    let adapter = MockAdapter::new();
    let mut engine = engine_with(&adapter, 2);
    for i in 0..5 {
        engine.submit_new(spec(&format!("j{}", i))).unwrap();
    }

    engine.progress().await.unwrap();
    // Only two fit
    let stats = engine.stats();
    assert_eq!(stats.submitted, 2);
    assert_eq!(stats.new, 3);
    assert_eq!(engine.core().pool().total_free(), 0);

    run_cycles(&mut engine, 12).await;
    assert!(engine.stats().all_done());
    assert_eq!(engine.core().pool().total_free(), 2);
}

// ────────────────────────────────────────────────────────────────
// Output collection and retry
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn output_collection_is_one_shot_and_retry_clears_it() {
    let adapter = MockAdapter::new();
    let mut engine = engine_with(&adapter, 4);
    let job_id = engine.submit_new(spec("j")).unwrap();

    run_cycles(&mut engine, 5).await;
    assert!(engine.stats().all_done());

    let output = engine.collect_output(&job_id).unwrap();
    assert!(!output.stdout.is_empty());
    assert!(matches!(
        engine.collect_output(&job_id),
        Err(gridflow::GridflowError::OutputAlreadyCollected { .. })
    ));

    // Retry returns the job to NEW with a clean record
    engine.retry(&job_id).unwrap();
    let status = engine.query(&job_id).unwrap();
    assert_eq!(status.state, JobState::New);
    assert_eq!(status.termination, None);

    run_cycles(&mut engine, 5).await;
    assert!(engine.stats().all_done());
    assert!(engine.collect_output(&job_id).is_ok());
}

// ────────────────────────────────────────────────────────────────
// Session persistence
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn restored_session_resumes_with_correct_capacity() {
    let adapter = MockAdapter::new().with_default_script([
        RemoteStatus::Queued,
        RemoteStatus::Running,
        RemoteStatus::Finished {
            exit_status: 0,
            output_staged: true,
        },
    ]);
    let mut first = engine_with(&adapter, 4);
    let a = first.submit_new(spec("a")).unwrap();
    first.submit_new(spec("b")).unwrap();
    first.progress().await.unwrap();
    assert_eq!(first.core().pool().total_free(), 2);

    // Serialize, then restore into a fresh engine over the same adapter
    let raw = serde_json::to_string(&first.session_data()).unwrap();
    let data: gridflow::SessionData = serde_json::from_str(&raw).unwrap();

    let mut second = engine_with(&adapter, 4);
    second.restore(data);
    assert_eq!(second.core().pool().total_free(), 2);

    // Generated ids keep counting from where the first engine stopped
    let c = second.submit_new(spec("c")).unwrap();
    assert_ne!(c, a);

    run_cycles(&mut second, 8).await;
    assert!(second.stats().all_done());
    assert_eq!(second.core().pool().total_free(), 4);
}

// ────────────────────────────────────────────────────────────────
// The STOPPED trap
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn held_job_stops_then_resumes_on_release() {
    let adapter = MockAdapter::new().with_default_script([
        RemoteStatus::Queued,
        RemoteStatus::Held,
        RemoteStatus::Queued,
        RemoteStatus::Running,
        RemoteStatus::Finished {
            exit_status: 0,
            output_staged: true,
        },
    ]);
    let mut engine = engine_with(&adapter, 4);
    let job_id = engine.submit_new(spec("held")).unwrap();

    // Submit, queued, held
    run_cycles(&mut engine, 3).await;
    assert_eq!(engine.query(&job_id).unwrap().state, JobState::Stopped);
    assert_eq!(engine.core().pool().total_free(), 3);

    // The remote release resurfaces the job as queued, never directly
    // as running
    engine.progress().await.unwrap();
    assert_eq!(engine.query(&job_id).unwrap().state, JobState::Submitted);

    run_cycles(&mut engine, 2).await;
    let status = engine.query(&job_id).unwrap();
    assert_eq!(status.state, JobState::Terminated);
    assert_eq!(status.termination, Some(Termination::Exited(0)));
    assert_eq!(engine.core().pool().total_free(), 4);
}

#[tokio::test]
async fn cancel_while_stopped_releases_the_lease_once() {
    let adapter =
        MockAdapter::new().with_default_script([RemoteStatus::Queued, RemoteStatus::Held]);
    let mut engine = engine_with(&adapter, 4);
    let job_id = engine.submit_new(spec("trapped")).unwrap();

    run_cycles(&mut engine, 3).await;
    assert_eq!(engine.query(&job_id).unwrap().state, JobState::Stopped);
    assert_eq!(engine.core().pool().total_free(), 3);

    engine.cancel(&job_id).await.unwrap();
    engine.progress().await.unwrap();

    let status = engine.query(&job_id).unwrap();
    assert_eq!(status.state, JobState::Terminated);
    assert_eq!(
        status.termination,
        Some(Termination::Aborted(AbortReason::CanceledByUser))
    );
    assert_eq!(engine.core().pool().total_free(), 4);

    // Further cycles find a terminal job and release nothing more
    run_cycles(&mut engine, 2).await;
    assert_eq!(engine.core().pool().total_free(), 4);
}
