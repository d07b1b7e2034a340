//! Bounded pool of blocking workers on the Tokio runtime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sdv_core::config::JobConfig;
use sdv_core::{VaultError, VaultResult};
use tokio::sync::Semaphore;

use crate::job::{JobHandle, JobStatus};

pub struct JobPool {
    permits: Arc<Semaphore>,
    workers: usize,
    poll_interval: Duration,
}

impl std::fmt::Debug for JobPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobPool")
            .field("workers", &self.workers)
            .field("available", &self.permits.available_permits())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl JobPool {
    pub fn new(workers: usize, poll_interval: Duration) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            poll_interval,
        }
    }

    pub fn from_config(config: &JobConfig) -> Self {
        Self::new(config.worker_count(), config.poll_interval())
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Queue `work` and return immediately.
    ///
    /// Must be called from within a Tokio runtime. At most `workers` jobs
    /// execute at once; the rest stay `Submitted` until a worker frees up.
    pub fn submit<F>(&self, kind: &str, work: F) -> JobHandle
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let handle = JobHandle::new(kind);
        let job = handle.clone();
        let permits = self.permits.clone();

        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    job.advance(JobStatus::Failed("job pool closed".into()));
                    return;
                }
            };
            job.advance(JobStatus::Running);
            let started = Instant::now();
            tracing::debug!(
                job_id = %job.id(),
                kind = job.kind(),
                queued_secs = started.duration_since(job.submitted_at()).as_secs_f64(),
                "job started"
            );

            let status = match tokio::task::spawn_blocking(work).await {
                Ok(Ok(())) => JobStatus::Succeeded,
                Ok(Err(e)) => JobStatus::Failed(format!("{e:#}")),
                Err(e) => JobStatus::Failed(format!("worker panicked: {e}")),
            };

            let elapsed_secs = started.elapsed().as_secs_f64();
            match &status {
                JobStatus::Failed(reason) => tracing::warn!(
                    job_id = %job.id(),
                    kind = job.kind(),
                    elapsed_secs,
                    reason = %reason,
                    "job failed"
                ),
                _ => tracing::debug!(job_id = %job.id(), kind = job.kind(), elapsed_secs, "job ok"),
            }
            job.advance(status);
        });

        tracing::debug!(job_id = %handle.id(), kind, "job submitted");
        handle
    }

    /// Poll `handle` every `poll_interval` until it finishes or `timeout`
    /// elapses. On timeout the job keeps running; waiting again is allowed.
    pub async fn await_completion(&self, handle: &JobHandle, timeout: Duration) -> VaultResult<()> {
        let start = Instant::now();
        loop {
            match handle.status() {
                JobStatus::Succeeded => return Ok(()),
                JobStatus::Failed(reason) => {
                    return Err(VaultError::JobFailed {
                        job_id: handle.id().to_string(),
                        reason,
                    })
                }
                JobStatus::Submitted | JobStatus::Running => {}
            }

            let waited = start.elapsed();
            if waited >= timeout {
                tracing::debug!(job_id = %handle.id(), ?waited, "job wait timed out");
                return Err(VaultError::JobTimeout {
                    job_id: handle.id().to_string(),
                    waited,
                });
            }
            tokio::time::sleep(self.poll_interval.min(timeout - waited)).await;
        }
    }
}
