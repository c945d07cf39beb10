// On-Demand Repair Job - the schedulable unit wrapping one ongoing job

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{JobId, OngoingJob, TableReference, TokenRange};
use crate::error::AppError;
use crate::port::{
    LockFactory, LockHandle, LockType, OnDemandStatusStore, RepairConfiguration, RepairHistory,
    RepairMetrics, RepairOutcome, RepairRunner, RepairSession, ReplicationState, ScheduledJob,
    TaskOutcome, TimeProvider,
};

/// Callback invoked once when the job reaches a terminal state. The
/// scheduler uses it to drop the job from its in-memory map.
pub type OnFinished = Arc<dyn Fn(JobId) + Send + Sync>;

/// Collaborators shared by every on-demand repair job of one scheduler.
pub struct RepairJobContext {
    pub store: Arc<dyn OnDemandStatusStore>,
    pub replication: Arc<dyn ReplicationState>,
    pub lock_factory: Arc<dyn LockFactory>,
    pub lock_type: LockType,
    pub repair_runner: Arc<dyn RepairRunner>,
    pub repair_config: RepairConfiguration,
    pub repair_history: Arc<dyn RepairHistory>,
    pub metrics: Arc<dyn RepairMetrics>,
    pub time: Arc<dyn TimeProvider>,
}

enum Step {
    Fail,
    Finalize,
    Repair(TokenRange),
}

/// Drives one `OngoingJob` through the lock-protected pipeline, one range
/// per task. Ranges whose repair fails simply stay pending; the job only
/// fails outright when topology ownership is lost.
pub struct OnDemandRepairJob {
    job_id: JobId,
    table: TableReference,
    job: Mutex<OngoingJob>,
    ctx: Arc<RepairJobContext>,
    on_finished: OnFinished,
}

impl OnDemandRepairJob {
    pub fn new(job: OngoingJob, ctx: Arc<RepairJobContext>, on_finished: OnFinished) -> Self {
        Self {
            job_id: job.job_id(),
            table: job.table().clone(),
            job: Mutex::new(job),
            ctx,
            on_finished,
        }
    }

    pub fn table(&self) -> &TableReference {
        &self.table
    }

    /// Clone of the current job state, for view construction.
    pub async fn snapshot(&self) -> OngoingJob {
        self.job.lock().await.clone()
    }

    async fn repair_range(&self, range: TokenRange) -> TaskOutcome {
        let locks = match self.acquire_locks(&range).await {
            Some(locks) => locks,
            None => return TaskOutcome::Deferred,
        };

        let replicas = match self.ctx.replication.replicas(&self.table, &range).await {
            Ok(replicas) => replicas,
            Err(e) => {
                warn!(
                    job_id = %self.job_id,
                    range = %range,
                    error = %e,
                    "Replica lookup failed, deferring"
                );
                self.release_locks(locks).await;
                return TaskOutcome::Deferred;
            }
        };

        let started_at = self.ctx.time.now_millis();
        let outcome = self
            .ctx
            .repair_runner
            .repair(&self.table, &range, &replicas, &self.ctx.repair_config)
            .await;
        let finished_at = self.ctx.time.now_millis();
        let duration_ms = finished_at - started_at;

        let result = match outcome {
            Ok(RepairOutcome::Repaired) | Ok(RepairOutcome::NothingToRepair) => {
                self.record_session(range, replicas, started_at, finished_at, true)
                    .await;
                self.ctx
                    .metrics
                    .range_repaired(&self.table, &range, true, duration_ms);
                self.commit_range(range, finished_at).await
            }
            Ok(RepairOutcome::Failed) => {
                warn!(
                    job_id = %self.job_id,
                    range = %range,
                    "Repair action failed, range stays pending"
                );
                self.record_session(range, replicas, started_at, finished_at, false)
                    .await;
                self.ctx
                    .metrics
                    .range_repaired(&self.table, &range, false, duration_ms);
                TaskOutcome::Deferred
            }
            Err(e) => {
                warn!(
                    job_id = %self.job_id,
                    range = %range,
                    error = %e,
                    "Repair action error, range stays pending"
                );
                self.ctx
                    .metrics
                    .range_repaired(&self.table, &range, false, duration_ms);
                TaskOutcome::Deferred
            }
        };

        self.release_locks(locks).await;
        result
    }

    /// Acquire every lock resource for the range; `None` means contended or
    /// lock-backend trouble, and the task defers.
    async fn acquire_locks(&self, range: &TokenRange) -> Option<Vec<Box<dyn LockHandle>>> {
        let datacenters = if self.ctx.lock_type == LockType::Datacenter {
            match self.ctx.replication.datacenters(&self.table, range).await {
                Ok(datacenters) => datacenters,
                Err(e) => {
                    warn!(
                        job_id = %self.job_id,
                        range = %range,
                        error = %e,
                        "Datacenter lookup failed, deferring"
                    );
                    return None;
                }
            }
        } else {
            Vec::new()
        };

        let resources = self.ctx.lock_type.resources(&self.table, range, &datacenters);
        let mut handles = Vec::with_capacity(resources.len());
        for resource in &resources {
            match self.ctx.lock_factory.try_lock(resource).await {
                Ok(Some(handle)) => handles.push(handle),
                Ok(None) => {
                    debug!(
                        job_id = %self.job_id,
                        resource = %resource,
                        "Repair lock contended, deferring"
                    );
                    self.release_locks(handles).await;
                    return None;
                }
                Err(e) => {
                    warn!(
                        job_id = %self.job_id,
                        resource = %resource,
                        error = %e,
                        "Lock backend failure, deferring"
                    );
                    self.release_locks(handles).await;
                    return None;
                }
            }
        }
        Some(handles)
    }

    async fn release_locks(&self, locks: Vec<Box<dyn LockHandle>>) {
        for lock in locks {
            if let Err(e) = lock.release().await {
                warn!(job_id = %self.job_id, error = %e, "Failed to release repair lock");
            }
        }
    }

    /// Durably record the range, then update the in-memory mirror. A crash
    /// between lock release and commit leaves the range pending, which is
    /// safe because range repair is idempotent.
    async fn commit_range(&self, range: TokenRange, repaired_at_ms: i64) -> TaskOutcome {
        if let Err(e) = self
            .ctx
            .store
            .finish_range(self.job_id, range, repaired_at_ms)
            .await
        {
            warn!(
                job_id = %self.job_id,
                range = %range,
                error = %e,
                "Failed to persist range completion, range stays pending"
            );
            return TaskOutcome::Deferred;
        }

        let mut job = self.job.lock().await;
        if let Err(e) = job.mark_range_finished(range, repaired_at_ms) {
            // Range came out of this job's own remainder; rejection here
            // means the process state is corrupted.
            panic!("on-demand job state corrupted: {e}");
        }
        debug!(
            job_id = %self.job_id,
            range = %range,
            remaining = job.remaining_ranges().len(),
            "Range repaired"
        );
        TaskOutcome::Progressed
    }

    /// All owned ranges are repaired: persist the terminal transition and
    /// leave the schedule.
    async fn finalize(&self) -> TaskOutcome {
        let now = self.ctx.time.now_millis();
        match self.ctx.store.finish(self.job_id, now).await {
            Ok(()) => {}
            Err(AppError::Conflict(_)) => {
                // someone else completed the transition; converge on it
                debug!(job_id = %self.job_id, "Finish raced with another transition");
            }
            Err(e) => {
                warn!(
                    job_id = %self.job_id,
                    error = %e,
                    "Failed to persist job completion, retrying"
                );
                return TaskOutcome::Deferred;
            }
        }

        {
            let mut job = self.job.lock().await;
            if job.status() == crate::domain::RepairStatus::Started {
                if let Err(e) = job.finish(now) {
                    warn!(job_id = %self.job_id, error = %e, "In-memory finish rejected");
                }
            }
            self.ctx.metrics.job_completed(&self.table, job.status());
        }

        info!(
            job_id = %self.job_id,
            table = %self.table,
            "On-demand repair job finished"
        );
        (self.on_finished)(self.job_id);
        TaskOutcome::Finished
    }

    /// Terminal failure: topology ownership was lost.
    async fn fail_job(&self, reason: &str) -> TaskOutcome {
        let now = self.ctx.time.now_millis();
        warn!(
            job_id = %self.job_id,
            table = %self.table,
            reason = reason,
            "Failing on-demand repair job"
        );

        match self.ctx.store.fail(self.job_id, now).await {
            Ok(()) | Err(AppError::Conflict(_)) => {}
            Err(e) => {
                warn!(
                    job_id = %self.job_id,
                    error = %e,
                    "Failed to persist job failure, retrying"
                );
                return TaskOutcome::Deferred;
            }
        }

        {
            let mut job = self.job.lock().await;
            if !job.status().is_terminal() {
                if let Err(e) = job.fail(now) {
                    warn!(job_id = %self.job_id, error = %e, "In-memory fail rejected");
                }
            }
            self.ctx.metrics.job_completed(&self.table, job.status());
        }

        (self.on_finished)(self.job_id);
        TaskOutcome::Finished
    }

    async fn record_session(
        &self,
        range: TokenRange,
        replicas: Vec<crate::domain::NodeId>,
        started_at_ms: i64,
        finished_at_ms: i64,
        successful: bool,
    ) {
        let session = RepairSession {
            table: self.table.clone(),
            range,
            replicas,
            started_at_ms,
            finished_at_ms,
            successful,
        };
        if let Err(e) = self.ctx.repair_history.record_session(&session).await {
            debug!(job_id = %self.job_id, error = %e, "Failed to record repair session");
        }
    }
}

#[async_trait]
impl ScheduledJob for OnDemandRepairJob {
    fn job_id(&self) -> JobId {
        self.job_id
    }

    async fn execute_next(&self) -> TaskOutcome {
        // Ownership re-check before any work on this task.
        let current_hash = match self.ctx.replication.token_map_hash(&self.table).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!(
                    job_id = %self.job_id,
                    error = %e,
                    "Topology lookup failed, deferring"
                );
                return TaskOutcome::Deferred;
            }
        };

        let step = {
            let job = self.job.lock().await;
            if job.status().is_terminal() {
                return TaskOutcome::Finished;
            }
            if job.has_lost_ownership(current_hash) {
                Step::Fail
            } else if let Some(range) = job.remaining_ranges().into_iter().next() {
                Step::Repair(range)
            } else {
                Step::Finalize
            }
        };

        match step {
            Step::Fail => self.fail_job("token map changed since the job was created").await,
            Step::Finalize => self.finalize().await,
            Step::Repair(range) => self.repair_range(range).await,
        }
    }
}
