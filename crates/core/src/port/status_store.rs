// On-Demand Status Store Port

use std::collections::HashMap;

use async_trait::async_trait;

use crate::domain::{JobId, NodeId, OngoingJob, RepairStatus, TableReference, TokenRange};
use crate::error::Result;

use super::replication::ReplicationState;

/// Insert payload for a new on-demand job facet.
///
/// Cluster-wide scheduling inserts one record per participating host; each
/// record is executed by the daemon owning `host_id`.
#[derive(Debug, Clone)]
pub struct NewJobRecord {
    pub job_id: JobId,
    pub host_id: NodeId,
    pub table: TableReference,
    pub token_map_hash: i64,
    pub cluster_wide: bool,
    pub started_at_ms: i64,
}

/// Durable record of on-demand repair jobs, shared by every daemon in the
/// cluster.
///
/// This is the single source of truth for cross-daemon coordination. Rows
/// are keyed by `(host_id, job_id)`; terminal transitions compare-and-set
/// the status column so concurrent daemons cannot both win. The backing
/// schema never leaks past this trait.
#[async_trait]
pub trait OnDemandStatusStore: Send + Sync {
    /// Stable id of the daemon this store instance belongs to.
    fn host_id(&self) -> NodeId;

    /// Insert a new record in state `started` with no repaired ranges.
    /// Fails with a conflict if `(host_id, job_id)` already exists.
    async fn add_new_job(&self, record: &NewJobRecord) -> Result<()>;

    /// Durably add one range to the repaired set. Idempotent; a no-op once
    /// the job is terminal. Must commit before the caller treats the range
    /// as done.
    async fn finish_range(
        &self,
        job_id: JobId,
        range: TokenRange,
        repaired_at_ms: i64,
    ) -> Result<()>;

    /// Transition `started -> finished`. The caller guarantees every owned
    /// range is repaired; a lost race surfaces as `AppError::Conflict`.
    async fn finish(&self, job_id: JobId, completed_at_ms: i64) -> Result<()>;

    /// Transition any non-terminal state to `failed`.
    async fn fail(&self, job_id: JobId, completed_at_ms: i64) -> Result<()>;

    /// Jobs owned by this host still in `started`, hydrated with ranges
    /// reconstructed from the oracle. The caller must fail (and not run)
    /// any job whose persisted hash no longer matches the live topology.
    async fn get_ongoing_jobs(&self, replication: &dyn ReplicationState)
        -> Result<Vec<OngoingJob>>;

    /// All jobs owned by this host, any status (local reporting).
    async fn get_all_jobs(&self, replication: &dyn ReplicationState) -> Result<Vec<OngoingJob>>;

    /// All cluster-wide job facets across every host (cluster reporting).
    async fn get_all_cluster_wide_jobs(
        &self,
        replication: &dyn ReplicationState,
    ) -> Result<Vec<OngoingJob>>;
}

/// Rebuild an `OngoingJob` from its persisted columns. The owned range set
/// is reconstructed from the oracle; a table no longer known to the oracle
/// hydrates with only its persisted completions, which is enough for the
/// caller to fail and report it.
#[allow(clippy::too_many_arguments)]
pub async fn hydrate_job(
    job_id: JobId,
    host_id: NodeId,
    table: TableReference,
    token_map_hash: i64,
    repaired: HashMap<TokenRange, i64>,
    status: RepairStatus,
    cluster_wide: bool,
    started_at_ms: i64,
    completed_at_ms: Option<i64>,
    replication: &dyn ReplicationState,
) -> OngoingJob {
    let all_ranges = replication
        .ranges_for_node(&table, host_id)
        .await
        .unwrap_or_default();
    OngoingJob::hydrate(
        job_id,
        host_id,
        table,
        token_map_hash,
        all_ranges,
        repaired,
        status,
        cluster_wide,
        started_at_ms,
        completed_at_ms,
    )
}

pub mod mocks {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use crate::domain::{JobId, NodeId, OngoingJob, RepairStatus, TableReference, TokenRange};
    use crate::error::{AppError, Result};
    use crate::port::replication::ReplicationState;

    use super::{hydrate_job, NewJobRecord, OnDemandStatusStore};

    #[derive(Debug, Clone)]
    struct StoredJob {
        table: TableReference,
        token_map_hash: i64,
        repaired: HashMap<TokenRange, i64>,
        status: RepairStatus,
        cluster_wide: bool,
        started_at_ms: i64,
        completed_at_ms: Option<i64>,
    }

    type SharedRows = Arc<Mutex<HashMap<(NodeId, JobId), StoredJob>>>;

    /// In-memory status store. Several instances can share one backing map
    /// to model several daemons coordinating through the same database.
    pub struct InMemoryStatusStore {
        host_id: NodeId,
        rows: SharedRows,
    }

    impl InMemoryStatusStore {
        pub fn new(host_id: NodeId) -> Self {
            Self {
                host_id,
                rows: Arc::new(Mutex::new(HashMap::new())),
            }
        }

        /// Another daemon's view of the same backing store.
        pub fn shared_with(&self, host_id: NodeId) -> Self {
            Self {
                host_id,
                rows: Arc::clone(&self.rows),
            }
        }

        pub fn row_count(&self) -> usize {
            self.lock_rows().len()
        }

        pub fn status_of(&self, host_id: NodeId, job_id: JobId) -> Option<RepairStatus> {
            self.lock_rows().get(&(host_id, job_id)).map(|row| row.status)
        }

        pub fn repaired_ranges_of(&self, host_id: NodeId, job_id: JobId) -> Vec<TokenRange> {
            self.lock_rows()
                .get(&(host_id, job_id))
                .map(|row| row.repaired.keys().copied().collect())
                .unwrap_or_default()
        }

        fn lock_rows(&self) -> std::sync::MutexGuard<'_, HashMap<(NodeId, JobId), StoredJob>> {
            self.rows.lock().expect("status store lock poisoned")
        }

        async fn hydrate_rows(
            &self,
            selected: Vec<(NodeId, JobId, StoredJob)>,
            replication: &dyn ReplicationState,
        ) -> Vec<OngoingJob> {
            let mut jobs = Vec::with_capacity(selected.len());
            for (host_id, job_id, row) in selected {
                jobs.push(
                    hydrate_job(
                        job_id,
                        host_id,
                        row.table,
                        row.token_map_hash,
                        row.repaired,
                        row.status,
                        row.cluster_wide,
                        row.started_at_ms,
                        row.completed_at_ms,
                        replication,
                    )
                    .await,
                );
            }
            jobs
        }

        fn select<F>(&self, predicate: F) -> Vec<(NodeId, JobId, StoredJob)>
        where
            F: Fn(NodeId, &StoredJob) -> bool,
        {
            let rows = self.lock_rows();
            let mut selected = Vec::new();
            for ((host, job), row) in rows.iter() {
                if predicate(*host, row) {
                    selected.push((*host, *job, row.clone()));
                }
            }
            selected
        }
    }

    #[async_trait]
    impl OnDemandStatusStore for InMemoryStatusStore {
        fn host_id(&self) -> NodeId {
            self.host_id
        }

        async fn add_new_job(&self, record: &NewJobRecord) -> Result<()> {
            let mut rows = self.lock_rows();
            let key = (record.host_id, record.job_id);
            if rows.contains_key(&key) {
                return Err(AppError::Conflict(format!(
                    "Job {} already exists for host {}",
                    record.job_id, record.host_id
                )));
            }
            rows.insert(
                key,
                StoredJob {
                    table: record.table.clone(),
                    token_map_hash: record.token_map_hash,
                    repaired: HashMap::new(),
                    status: RepairStatus::Started,
                    cluster_wide: record.cluster_wide,
                    started_at_ms: record.started_at_ms,
                    completed_at_ms: None,
                },
            );
            Ok(())
        }

        async fn finish_range(
            &self,
            job_id: JobId,
            range: TokenRange,
            repaired_at_ms: i64,
        ) -> Result<()> {
            let mut rows = self.lock_rows();
            let row = rows
                .get_mut(&(self.host_id, job_id))
                .ok_or_else(|| AppError::Store(format!("No such job: {job_id}")))?;
            if row.status == RepairStatus::Started {
                row.repaired.entry(range).or_insert(repaired_at_ms);
            }
            Ok(())
        }

        async fn finish(&self, job_id: JobId, completed_at_ms: i64) -> Result<()> {
            let mut rows = self.lock_rows();
            let row = rows
                .get_mut(&(self.host_id, job_id))
                .ok_or_else(|| AppError::Store(format!("No such job: {job_id}")))?;
            if row.status != RepairStatus::Started {
                return Err(AppError::Conflict(format!(
                    "Job {job_id} is {}, not started",
                    row.status
                )));
            }
            row.status = RepairStatus::Finished;
            row.completed_at_ms = Some(completed_at_ms);
            Ok(())
        }

        async fn fail(&self, job_id: JobId, completed_at_ms: i64) -> Result<()> {
            let mut rows = self.lock_rows();
            let row = rows
                .get_mut(&(self.host_id, job_id))
                .ok_or_else(|| AppError::Store(format!("No such job: {job_id}")))?;
            if row.status.is_terminal() {
                return Err(AppError::Conflict(format!(
                    "Job {job_id} is already {}",
                    row.status
                )));
            }
            row.status = RepairStatus::Failed;
            row.completed_at_ms = Some(completed_at_ms);
            Ok(())
        }

        async fn get_ongoing_jobs(
            &self,
            replication: &dyn ReplicationState,
        ) -> Result<Vec<OngoingJob>> {
            let selected = self.select(|host, row| {
                host == self.host_id && row.status == RepairStatus::Started
            });
            Ok(self.hydrate_rows(selected, replication).await)
        }

        async fn get_all_jobs(
            &self,
            replication: &dyn ReplicationState,
        ) -> Result<Vec<OngoingJob>> {
            let selected = self.select(|host, _| host == self.host_id);
            Ok(self.hydrate_rows(selected, replication).await)
        }

        async fn get_all_cluster_wide_jobs(
            &self,
            replication: &dyn ReplicationState,
        ) -> Result<Vec<OngoingJob>> {
            let selected = self.select(|_, row| row.cluster_wide);
            Ok(self.hydrate_rows(selected, replication).await)
        }
    }
}
