// Schedule Manager Port - owns the execution loop for repair jobs

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::JobId;

/// Outcome of driving one task of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// A task ran; the job has more work queued.
    Progressed,
    /// Nothing could run right now (lock contention, transient failure);
    /// retry later.
    Deferred,
    /// The job reached a terminal state and must leave the schedule.
    Finished,
}

/// A unit the schedule manager drives one task at a time.
///
/// Ranges of one job never run concurrently: the manager re-enqueues a job
/// only after its current task has returned.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn job_id(&self) -> JobId;

    /// Drive at most one unit of work.
    async fn execute_next(&self) -> TaskOutcome;
}

/// Registration surface of the execution loop.
///
/// Both operations are synchronous so callers can pair them with their own
/// map mutation under a single mutex.
pub trait ScheduleManager: Send + Sync {
    fn schedule(&self, job: Arc<dyn ScheduledJob>);
    fn deschedule(&self, job_id: JobId);
}

pub mod mocks {
    use std::sync::{Arc, Mutex};

    use crate::domain::JobId;

    use super::{ScheduleManager, ScheduledJob, TaskOutcome};

    /// Records registrations and lets tests drive jobs by hand.
    #[derive(Default)]
    pub struct ManualScheduleManager {
        jobs: Mutex<Vec<Arc<dyn ScheduledJob>>>,
    }

    impl ManualScheduleManager {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn scheduled_jobs(&self) -> Vec<Arc<dyn ScheduledJob>> {
            self.jobs.lock().expect("manager mock poisoned").clone()
        }

        pub fn scheduled_count(&self) -> usize {
            self.jobs.lock().expect("manager mock poisoned").len()
        }

        /// Drive every registered job until it reports `Finished`, bounded
        /// to catch livelocks in tests.
        pub async fn run_to_completion(&self, max_steps: usize) {
            for _ in 0..max_steps {
                let jobs = self.scheduled_jobs();
                if jobs.is_empty() {
                    return;
                }
                for job in jobs {
                    if job.execute_next().await == TaskOutcome::Finished {
                        self.deschedule(job.job_id());
                    }
                }
            }
            panic!("jobs did not finish within {max_steps} steps");
        }
    }

    impl ScheduleManager for ManualScheduleManager {
        fn schedule(&self, job: Arc<dyn ScheduledJob>) {
            let mut jobs = self.jobs.lock().expect("manager mock poisoned");
            if jobs.iter().all(|j| j.job_id() != job.job_id()) {
                jobs.push(job);
            }
        }

        fn deschedule(&self, job_id: JobId) {
            self.jobs
                .lock()
                .expect("manager mock poisoned")
                .retain(|j| j.job_id() != job_id);
        }
    }
}
