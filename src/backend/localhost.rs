//! Local subprocess adapter
//!
//! Runs jobs as child processes of the engine host. The one facility that
//! needs no remote infrastructure: output is local by the time the process
//! exits, so jobs skip the TERMINATING phase.
//!
//! Polling is non-blocking (`try_wait`); stdout is streamed into a buffer
//! so `peek` can return a snapshot while the process runs.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::backend::{AdapterError, BackendAdapter, JobOutput, RemoteStatus};
use crate::execution::{AbortReason, BackendJobRef};
use crate::job::JobSpec;
use crate::types::ResourceName;

struct ProcHandle {
    child: tokio::sync::Mutex<Child>,
    stdout: Arc<Mutex<String>>,
    stderr: Arc<Mutex<String>>,
    cancel_requested: AtomicBool,
    exit: Mutex<Option<RemoteStatus>>,
}

/// Adapter executing jobs as local subprocesses.
#[derive(Clone, Default)]
pub struct LocalhostAdapter {
    procs: Arc<DashMap<String, Arc<ProcHandle>>>,
    next_id: Arc<AtomicU64>,
}

impl LocalhostAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, job: &BackendJobRef) -> Result<Arc<ProcHandle>, AdapterError> {
        self.procs
            .get(&job.remote_id)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| AdapterError::Rejected(format!("unknown job '{}'", job.remote_id)))
    }
}

/// Stream a child pipe into a shared buffer, chunk by chunk.
async fn drain<R: tokio::io::AsyncRead + Unpin>(mut pipe: R, buf: Arc<Mutex<String>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.lock().push_str(&String::from_utf8_lossy(&chunk[..n])),
        }
    }
}

#[async_trait]
impl BackendAdapter for LocalhostAdapter {
    fn name(&self) -> &str {
        "localhost"
    }

    async fn submit(
        &self,
        spec: &JobSpec,
        resource: &ResourceName,
    ) -> Result<BackendJobRef, AdapterError> {
        let mut child = Command::new(&spec.command)
            .args(&spec.arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AdapterError::Rejected(format!("spawn '{}': {}", spec.command, e)))?;

        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf = Arc::new(Mutex::new(String::new()));
        if let Some(pipe) = child.stdout.take() {
            tokio::spawn(drain(pipe, Arc::clone(&stdout_buf)));
        }
        if let Some(pipe) = child.stderr.take() {
            tokio::spawn(drain(pipe, Arc::clone(&stderr_buf)));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let remote_id = format!("proc-{:04}", n);
        debug!(remote_id, command = %spec.command, "spawned local job");

        self.procs.insert(
            remote_id.clone(),
            Arc::new(ProcHandle {
                child: tokio::sync::Mutex::new(child),
                stdout: stdout_buf,
                stderr: stderr_buf,
                cancel_requested: AtomicBool::new(false),
                exit: Mutex::new(None),
            }),
        );

        Ok(BackendJobRef {
            resource: resource.clone(),
            remote_id,
        })
    }

    async fn poll(&self, job: &BackendJobRef) -> Result<RemoteStatus, AdapterError> {
        // A handle we do not know means the process belonged to an earlier
        // engine run and is unrecoverable.
        let Ok(handle) = self.handle(job) else {
            debug!(remote_id = %job.remote_id, "no handle for polled job; reporting it lost");
            return Ok(RemoteStatus::Failed(AbortReason::InfrastructureError));
        };
        if let Some(status) = *handle.exit.lock() {
            return Ok(status);
        }

        let mut child = handle.child.lock().await;
        match child.try_wait()? {
            None => Ok(RemoteStatus::Running),
            Some(status) => {
                let remote = match status.code() {
                    // Output is already local once the process is gone.
                    Some(code) => RemoteStatus::Finished {
                        exit_status: (code & 0xff) as u8,
                        output_staged: true,
                    },
                    // No exit code means the process died on a signal.
                    None if handle.cancel_requested.load(Ordering::SeqCst) => {
                        RemoteStatus::Failed(AbortReason::CanceledByUser)
                    }
                    None => RemoteStatus::Failed(AbortReason::KilledBySystem),
                };
                *handle.exit.lock() = Some(remote);
                Ok(remote)
            }
        }
    }

    async fn cancel(&self, job: &BackendJobRef) -> Result<(), AdapterError> {
        let handle = self.handle(job)?;
        handle.cancel_requested.store(true, Ordering::SeqCst);

        let mut child = handle.child.lock().await;
        // Already-exited children make start_kill fail; that is fine, the
        // next poll reports the recorded exit.
        let _ = child.start_kill();
        Ok(())
    }

    async fn fetch_output(&self, job: &BackendJobRef) -> Result<JobOutput, AdapterError> {
        let handle = self.handle(job)?;
        if handle.exit.lock().is_none() {
            return Err(AdapterError::Rejected("job still running".into()));
        }
        let stdout = handle.stdout.lock().clone();
        let stderr = handle.stderr.lock().clone();
        Ok(JobOutput {
            stdout,
            stderr,
            ..Default::default()
        })
    }

    async fn peek(&self, job: &BackendJobRef) -> Result<String, AdapterError> {
        let handle = self.handle(job)?;
        let snapshot = handle.stdout.lock().clone();
        Ok(snapshot)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn resource() -> ResourceName {
        ResourceName::new("localhost").unwrap()
    }

    fn shell(name: &str, cmd: &str) -> JobSpec {
        JobSpec {
            name: Some(name.into()),
            command: "/bin/sh".into(),
            arguments: vec!["-c".into(), cmd.into()],
            ..Default::default()
        }
    }

    async fn poll_until_done(
        adapter: &LocalhostAdapter,
        job: &BackendJobRef,
    ) -> RemoteStatus {
        for _ in 0..100 {
            let status = adapter.poll(job).await.unwrap();
            if !matches!(status, RemoteStatus::Running | RemoteStatus::Queued) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("local job did not finish");
    }

    #[tokio::test]
    async fn captures_exit_status_and_output() {
        let adapter = LocalhostAdapter::new();
        let job = adapter
            .submit(&shell("ok", "echo hello; exit 3"), &resource())
            .await
            .unwrap();

        let status = poll_until_done(&adapter, &job).await;
        assert_eq!(
            status,
            RemoteStatus::Finished {
                exit_status: 3,
                output_staged: true
            }
        );

        let output = adapter.fetch_output(&job).await.unwrap();
        assert_eq!(output.stdout, "hello\n");
    }

    #[tokio::test]
    async fn spawn_failure_is_a_submission_failure() {
        let adapter = LocalhostAdapter::new();
        let spec = JobSpec {
            command: "/no/such/binary".into(),
            ..Default::default()
        };
        assert!(adapter.submit(&spec, &resource()).await.is_err());
    }

    #[tokio::test]
    async fn cancel_kills_the_process() {
        let adapter = LocalhostAdapter::new();
        let job = adapter
            .submit(&shell("sleeper", "sleep 30"), &resource())
            .await
            .unwrap();

        adapter.cancel(&job).await.unwrap();
        let status = poll_until_done(&adapter, &job).await;
        assert_eq!(status, RemoteStatus::Failed(AbortReason::CanceledByUser));
    }

    #[tokio::test]
    async fn peek_snapshots_output_while_running() {
        let adapter = LocalhostAdapter::new();
        let job = adapter
            .submit(&shell("peeker", "echo started; sleep 30"), &resource())
            .await
            .unwrap();

        // The echoed line lands in the buffer while the process still runs
        let mut snapshot = String::new();
        for _ in 0..100 {
            snapshot = adapter.peek(&job).await.unwrap();
            if !snapshot.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(snapshot, "started\n");
        assert_eq!(adapter.poll(&job).await.unwrap(), RemoteStatus::Running);

        adapter.cancel(&job).await.unwrap();
        poll_until_done(&adapter, &job).await;
    }

    #[tokio::test]
    async fn fetch_before_exit_is_rejected() {
        let adapter = LocalhostAdapter::new();
        let job = adapter
            .submit(&shell("sleeper", "sleep 30"), &resource())
            .await
            .unwrap();

        assert!(adapter.fetch_output(&job).await.is_err());
        adapter.cancel(&job).await.unwrap();
        poll_until_done(&adapter, &job).await;
    }
}
