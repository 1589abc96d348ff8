//! Mock adapter with scripted statuses
//!
//! Test double for the adapter contract: each submitted job walks through
//! a configured sequence of [`RemoteStatus`] values, one per poll, then
//! repeats the last one. Submission and staging failures are injectable
//! per job name.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::backend::{AdapterError, BackendAdapter, JobOutput, RemoteStatus};
use crate::execution::{AbortReason, BackendJobRef};
use crate::job::JobSpec;
use crate::types::ResourceName;

struct MockEntry {
    script: VecDeque<RemoteStatus>,
    last: RemoteStatus,
    fetched: bool,
    fail_fetch: bool,
}

/// Scripted in-memory adapter for tests.
#[derive(Clone, Default)]
pub struct MockAdapter {
    /// Script applied to jobs without a dedicated one
    default_script: Arc<Mutex<Vec<RemoteStatus>>>,
    /// Per-job-name scripts (key: spec name, falling back to command)
    scripts: Arc<DashMap<String, Vec<RemoteStatus>>>,
    /// Job names whose submit call fails
    failing_submissions: Arc<DashMap<String, ()>>,
    /// Job names whose fetch_output call fails
    failing_fetches: Arc<DashMap<String, ()>>,
    /// Live entries, keyed by remote id
    entries: Arc<DashMap<String, Mutex<MockEntry>>>,
    /// Names submitted so far, in order (for assertions)
    submitted: Arc<Mutex<Vec<String>>>,
    next_id: Arc<AtomicU64>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            default_script: Arc::new(Mutex::new(vec![
                RemoteStatus::Queued,
                RemoteStatus::Running,
                RemoteStatus::Finished {
                    exit_status: 0,
                    output_staged: true,
                },
            ])),
            ..Default::default()
        }
    }

    /// Replace the script applied to jobs without a dedicated one.
    pub fn with_default_script(self, script: impl Into<Vec<RemoteStatus>>) -> Self {
        *self.default_script.lock() = script.into();
        self
    }

    /// Script the status sequence for jobs named `name`.
    pub fn with_script_for(self, name: impl Into<String>, script: impl Into<Vec<RemoteStatus>>) -> Self {
        self.scripts.insert(name.into(), script.into());
        self
    }

    /// Make submit fail for jobs named `name`.
    pub fn with_submit_failure(self, name: impl Into<String>) -> Self {
        self.failing_submissions.insert(name.into(), ());
        self
    }

    /// Make fetch_output fail for jobs named `name`.
    pub fn with_fetch_failure(self, name: impl Into<String>) -> Self {
        self.failing_fetches.insert(name.into(), ());
        self
    }

    /// Names submitted so far, in submission order.
    pub fn submitted_names(&self) -> Vec<String> {
        self.submitted.lock().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submitted.lock().len()
    }

    fn script_key(spec: &JobSpec) -> String {
        spec.name.clone().unwrap_or_else(|| spec.command.clone())
    }
}

#[async_trait]
impl BackendAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn submit(
        &self,
        spec: &JobSpec,
        resource: &ResourceName,
    ) -> Result<BackendJobRef, AdapterError> {
        let key = Self::script_key(spec);
        if self.failing_submissions.contains_key(&key) {
            return Err(AdapterError::Rejected(format!(
                "mock submit failure for '{}'",
                key
            )));
        }

        let script: VecDeque<RemoteStatus> = self
            .scripts
            .get(&key)
            .map(|s| s.value().clone())
            .unwrap_or_else(|| self.default_script.lock().clone())
            .into();

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let remote_id = format!("mock-{:04}", n);
        self.entries.insert(
            remote_id.clone(),
            Mutex::new(MockEntry {
                script,
                last: RemoteStatus::Queued,
                fetched: false,
                fail_fetch: self.failing_fetches.contains_key(&key),
            }),
        );
        self.submitted.lock().push(key);

        Ok(BackendJobRef {
            resource: resource.clone(),
            remote_id,
        })
    }

    async fn poll(&self, job: &BackendJobRef) -> Result<RemoteStatus, AdapterError> {
        let entry = self
            .entries
            .get(&job.remote_id)
            .ok_or_else(|| AdapterError::Rejected(format!("unknown job '{}'", job.remote_id)))?;
        let mut entry = entry.lock();

        if let Some(next) = entry.script.pop_front() {
            entry.last = next;
        }
        Ok(entry.last)
    }

    async fn cancel(&self, job: &BackendJobRef) -> Result<(), AdapterError> {
        let entry = self
            .entries
            .get(&job.remote_id)
            .ok_or_else(|| AdapterError::Rejected(format!("unknown job '{}'", job.remote_id)))?;
        let mut entry = entry.lock();

        entry.script.clear();
        entry.last = RemoteStatus::Failed(AbortReason::CanceledByUser);
        Ok(())
    }

    async fn fetch_output(&self, job: &BackendJobRef) -> Result<JobOutput, AdapterError> {
        let entry = self
            .entries
            .get(&job.remote_id)
            .ok_or_else(|| AdapterError::Rejected(format!("unknown job '{}'", job.remote_id)))?;
        let mut entry = entry.lock();

        if entry.fail_fetch {
            return Err(AdapterError::Rejected("mock staging failure".into()));
        }
        if entry.fetched {
            return Err(AdapterError::Rejected("output already fetched".into()));
        }
        entry.fetched = true;

        Ok(JobOutput {
            stdout: format!("output of {}\n", job.remote_id),
            stderr: String::new(),
            ..Default::default()
        })
    }

    async fn peek(&self, job: &BackendJobRef) -> Result<String, AdapterError> {
        Ok(format!("[{}] running...\n", job.remote_id))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> JobSpec {
        JobSpec {
            name: Some(name.into()),
            command: "/bin/true".into(),
            ..Default::default()
        }
    }

    fn resource() -> ResourceName {
        ResourceName::new("mock-res").unwrap()
    }

    #[tokio::test]
    async fn walks_script_then_repeats_last() {
        let adapter = MockAdapter::new().with_script_for(
            "j",
            [
                RemoteStatus::Queued,
                RemoteStatus::Running,
                RemoteStatus::Finished {
                    exit_status: 7,
                    output_staged: true,
                },
            ],
        );

        let job = adapter.submit(&spec("j"), &resource()).await.unwrap();
        assert_eq!(adapter.poll(&job).await.unwrap(), RemoteStatus::Queued);
        assert_eq!(adapter.poll(&job).await.unwrap(), RemoteStatus::Running);

        let done = RemoteStatus::Finished {
            exit_status: 7,
            output_staged: true,
        };
        assert_eq!(adapter.poll(&job).await.unwrap(), done);
        // Script exhausted: last status repeats
        assert_eq!(adapter.poll(&job).await.unwrap(), done);
    }

    #[tokio::test]
    async fn submit_failure_is_injectable() {
        let adapter = MockAdapter::new().with_submit_failure("doomed");
        let err = adapter.submit(&spec("doomed"), &resource()).await;
        assert!(err.is_err());
        assert_eq!(adapter.submission_count(), 0);
    }

    #[tokio::test]
    async fn cancel_overrides_script() {
        let adapter = MockAdapter::new();
        let job = adapter.submit(&spec("j"), &resource()).await.unwrap();

        adapter.cancel(&job).await.unwrap();
        assert_eq!(
            adapter.poll(&job).await.unwrap(),
            RemoteStatus::Failed(AbortReason::CanceledByUser)
        );
    }

    #[tokio::test]
    async fn fetch_is_single_shot() {
        let adapter = MockAdapter::new();
        let job = adapter.submit(&spec("j"), &resource()).await.unwrap();

        assert!(adapter.fetch_output(&job).await.is_ok());
        assert!(adapter.fetch_output(&job).await.is_err());
    }
}
