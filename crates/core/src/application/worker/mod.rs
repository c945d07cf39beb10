// Schedule Worker - drives repair jobs one task at a time

mod shutdown;

pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::domain::JobId;
use crate::port::{ScheduleManager, ScheduledJob, TaskOutcome};

/// Sleep while the queue is empty
const IDLE_SLEEP_DURATION: Duration = Duration::from_millis(200);

/// Sleep after a deferred task before the queue is polled again
const DEFER_SLEEP_DURATION: Duration = Duration::from_millis(500);

struct WorkerState {
    queue: VecDeque<Arc<dyn ScheduledJob>>,
    // descheduled while mid-execution; dropped at the next touch
    cancelled: HashSet<JobId>,
}

/// Round-robin execution loop behind the `ScheduleManager` port.
///
/// A job appears in the queue at most once and is re-enqueued only after
/// its current task returns, so one job's ranges never run concurrently.
/// Running several `run` loops over one worker bounds global concurrency.
pub struct ScheduleWorker {
    state: Mutex<WorkerState>,
    notify: Notify,
    idle_sleep: Duration,
    defer_sleep: Duration,
}

impl ScheduleWorker {
    pub fn new() -> Self {
        Self::with_pacing(IDLE_SLEEP_DURATION, DEFER_SLEEP_DURATION)
    }

    /// Custom pacing, mainly for tests that want tight loops.
    pub fn with_pacing(idle_sleep: Duration, defer_sleep: Duration) -> Self {
        Self {
            state: Mutex::new(WorkerState {
                queue: VecDeque::new(),
                cancelled: HashSet::new(),
            }),
            notify: Notify::new(),
            idle_sleep,
            defer_sleep,
        }
    }

    pub fn queued_count(&self) -> usize {
        self.lock_state().queue.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, WorkerState> {
        self.state.lock().expect("worker state lock poisoned")
    }

    fn pop_next(&self) -> Option<Arc<dyn ScheduledJob>> {
        let mut state = self.lock_state();
        while let Some(job) = state.queue.pop_front() {
            if state.cancelled.remove(&job.job_id()) {
                debug!(job_id = %job.job_id(), "Dropping descheduled job");
                continue;
            }
            return Some(job);
        }
        None
    }

    fn requeue(&self, job: Arc<dyn ScheduledJob>) {
        let mut state = self.lock_state();
        if state.cancelled.remove(&job.job_id()) {
            debug!(job_id = %job.job_id(), "Dropping descheduled job after its task");
            return;
        }
        state.queue.push_back(job);
    }

    /// Drive scheduled jobs until shutdown. In-flight tasks are never
    /// interrupted; shutdown takes effect between tasks.
    pub async fn run(&self, mut shutdown: ShutdownToken) {
        info!("Schedule worker started");
        loop {
            if shutdown.is_shutdown() {
                break;
            }
            let Some(job) = self.pop_next() else {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = sleep(self.idle_sleep) => {}
                    _ = shutdown.wait() => break,
                }
                continue;
            };

            let job_id = job.job_id();
            match job.execute_next().await {
                TaskOutcome::Progressed => {
                    self.requeue(job);
                    self.notify.notify_one();
                }
                TaskOutcome::Deferred => {
                    debug!(job_id = %job_id, "Job deferred, retrying later");
                    self.requeue(job);
                    tokio::select! {
                        _ = sleep(self.defer_sleep) => {}
                        _ = shutdown.wait() => break,
                    }
                }
                TaskOutcome::Finished => {
                    debug!(job_id = %job_id, "Job left the schedule");
                    self.lock_state().cancelled.remove(&job_id);
                }
            }
        }
        info!("Schedule worker stopped");
    }
}

impl Default for ScheduleWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleManager for ScheduleWorker {
    fn schedule(&self, job: Arc<dyn ScheduledJob>) {
        let job_id = job.job_id();
        {
            let mut state = self.lock_state();
            state.cancelled.remove(&job_id);
            if state.queue.iter().any(|j| j.job_id() == job_id) {
                warn!(job_id = %job_id, "Job is already scheduled, ignoring");
                return;
            }
            state.queue.push_back(job);
        }
        self.notify.notify_one();
    }

    fn deschedule(&self, job_id: JobId) {
        let mut state = self.lock_state();
        let before = state.queue.len();
        state.queue.retain(|j| j.job_id() != job_id);
        if state.queue.len() == before {
            // mid-execution or already gone; the marker is consumed at the
            // next requeue or finish
            state.cancelled.insert(job_id);
        }
    }
}
