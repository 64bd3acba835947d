use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Deferred work the CHILD_SA task hands off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Tear down the whole IKE_SA, used when the first CHILD fails and the
    /// configuration demands it.
    DeleteIkeSa { ike_sa: Uuid },
    /// Close an idle CHILD_SA after its inactivity timeout.
    Inactivity {
        child_id: u32,
        timeout: Duration,
        close_ike: bool,
    },
}

pub trait Scheduler: Send + Sync {
    fn schedule_job(&self, job: Job, delay: Duration);
}

/// Scheduler backed by the tokio runtime; fires jobs as log events for the
/// daemon's job dispatcher to pick up.
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule_job(&self, job: Job, delay: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracing::debug!("scheduled job due: {:?}", job);
        });
    }
}

/// Records scheduled jobs for inspection, used by tests.
#[derive(Default)]
pub struct RecordingScheduler {
    pub jobs: Mutex<Vec<(Job, Duration)>>,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<(Job, Duration)> {
        self.jobs.lock().unwrap().clone()
    }
}

impl Scheduler for RecordingScheduler {
    fn schedule_job(&self, job: Job, delay: Duration) {
        self.jobs.lock().unwrap().push((job, delay));
    }
}
