use std::sync::{Arc, Mutex};
use std::time::Instant;

use uuid::Uuid;

/// Lifecycle of a background job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Queued, waiting for a worker
    Submitted,
    /// Executing on a worker
    Running,
    Succeeded,
    /// Finished with an error; carries the reason
    Failed(String),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed(_))
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Submitted => 0,
            JobStatus::Running => 1,
            JobStatus::Succeeded | JobStatus::Failed(_) => 2,
        }
    }
}

/// Shared view of one submitted job. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: Uuid,
    kind: Arc<str>,
    submitted_at: Instant,
    state: Arc<Mutex<JobStatus>>,
}

impl JobHandle {
    pub(crate) fn new(kind: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: Arc::from(kind),
            submitted_at: Instant::now(),
            state: Arc::new(Mutex::new(JobStatus::Submitted)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Short description of the work, e.g. `"keygen"`
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub fn status(&self) -> JobStatus {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// `None` until the job reaches a terminal state.
    pub fn result(&self) -> Option<Result<(), String>> {
        match self.status() {
            JobStatus::Succeeded => Some(Ok(())),
            JobStatus::Failed(reason) => Some(Err(reason)),
            JobStatus::Submitted | JobStatus::Running => None,
        }
    }

    /// Move forward to `next`. Transitions that would go backwards or leave
    /// a terminal state are ignored; returns whether the state changed.
    pub(crate) fn advance(&self, next: JobStatus) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_terminal() || next.rank() <= state.rank() {
            return false;
        }
        *state = next;
        true
    }
}
