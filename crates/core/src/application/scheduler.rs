// On-Demand Repair Scheduler - the public facade

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::config::OnDemandSchedulerConfig;
use crate::application::on_demand_job::{OnDemandRepairJob, OnFinished, RepairJobContext};
use crate::application::views;
use crate::application::worker::{shutdown_channel, ShutdownSender, ShutdownToken};
use crate::domain::{JobId, OnDemandRepairJobView, OngoingJob, TableReference};
use crate::error::{AppError, Result};
use crate::port::{
    JobIdProvider, LockFactory, LockType, NewJobRecord, OnDemandStatusStore, RepairConfiguration,
    RepairHistory, RepairMetrics, RepairRunner, ReplicationState, ScheduleManager, ScheduledJob,
    TimeProvider,
};

/// Everything the scheduler needs, passed to one constructor. A missing
/// collaborator is a construction-time type error, not a null dereference
/// at first use.
pub struct SchedulerDependencies {
    pub store: Arc<dyn OnDemandStatusStore>,
    pub replication: Arc<dyn ReplicationState>,
    pub schedule_manager: Arc<dyn ScheduleManager>,
    pub lock_factory: Arc<dyn LockFactory>,
    pub lock_type: LockType,
    pub repair_runner: Arc<dyn RepairRunner>,
    pub repair_config: RepairConfiguration,
    pub repair_history: Arc<dyn RepairHistory>,
    pub metrics: Arc<dyn RepairMetrics>,
    pub time: Arc<dyn TimeProvider>,
    pub job_ids: Arc<dyn JobIdProvider>,
    pub config: OnDemandSchedulerConfig,
}

struct SchedulerInner {
    // The coarse mutex of the scheduler: guards the map AND its pairing
    // with schedule-manager registration. Never held across an await.
    jobs: Mutex<HashMap<JobId, Arc<OnDemandRepairJob>>>,
    store: Arc<dyn OnDemandStatusStore>,
    replication: Arc<dyn ReplicationState>,
    schedule_manager: Arc<dyn ScheduleManager>,
    time: Arc<dyn TimeProvider>,
    job_ids: Arc<dyn JobIdProvider>,
    ctx: Arc<RepairJobContext>,
}

impl SchedulerInner {
    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Arc<OnDemandRepairJob>>> {
        self.jobs.lock().expect("scheduler job map lock poisoned")
    }

    /// Remove a job from the map and the schedule manager as one atomic
    /// step. Invoked by the per-job on-finished hook.
    fn remove_scheduled_job(&self, job_id: JobId) {
        let mut jobs = self.lock_jobs();
        if jobs.remove(&job_id).is_some() {
            self.schedule_manager.deschedule(job_id);
        }
    }
}

fn on_finished_hook(inner: &Arc<SchedulerInner>) -> OnFinished {
    let weak: Weak<SchedulerInner> = Arc::downgrade(inner);
    Arc::new(move |job_id: JobId| {
        if let Some(inner) = weak.upgrade() {
            inner.remove_scheduled_job(job_id);
        }
    })
}

/// Insert the job into the map and hand it to the schedule manager, both
/// under the coarse mutex. Put-if-absent: an already-present job id wins.
fn install_job(inner: &Arc<SchedulerInner>, ongoing: OngoingJob) -> Arc<OnDemandRepairJob> {
    let job = Arc::new(OnDemandRepairJob::new(
        ongoing,
        inner.ctx.clone(),
        on_finished_hook(inner),
    ));
    let mut jobs = inner.lock_jobs();
    match jobs.entry(job.job_id()) {
        Entry::Occupied(existing) => existing.get().clone(),
        Entry::Vacant(slot) => {
            slot.insert(job.clone());
            inner.schedule_manager.schedule(job.clone());
            job
        }
    }
}

async fn create_job(
    inner: &Arc<SchedulerInner>,
    table: &TableReference,
    cluster_wide: bool,
) -> Result<Arc<OnDemandRepairJob>> {
    if !inner.replication.table_exists(table).await? {
        return Err(AppError::InvalidInput(format!(
            "keyspace/table does not exist: {table}"
        )));
    }

    let host_id = inner.store.host_id();
    let job_id = inner.job_ids.new_job_id();
    let token_map_hash = inner.replication.token_map_hash(table).await?;
    let now = inner.time.now_millis();

    if cluster_wide {
        // One persisted facet per participating host. Peers adopt their
        // facets through their own sweeps; the requesting daemon always
        // records one for itself.
        let mut hosts = inner.replication.nodes(table).await?;
        if !hosts.contains(&host_id) {
            hosts.push(host_id);
        }
        for host in hosts {
            inner
                .store
                .add_new_job(&NewJobRecord {
                    job_id,
                    host_id: host,
                    table: table.clone(),
                    token_map_hash,
                    cluster_wide: true,
                    started_at_ms: now,
                })
                .await?;
        }
    } else {
        inner
            .store
            .add_new_job(&NewJobRecord {
                job_id,
                host_id,
                table: table.clone(),
                token_map_hash,
                cluster_wide: false,
                started_at_ms: now,
            })
            .await?;
    }

    let ranges = inner.replication.ranges_for_node(table, host_id).await?;
    let ongoing = OngoingJob::new(
        job_id,
        host_id,
        table.clone(),
        token_map_hash,
        ranges,
        cluster_wide,
        now,
    );

    info!(
        job_id = %job_id,
        table = %table,
        cluster_wide = cluster_wide,
        "Scheduled on-demand repair job"
    );
    Ok(install_job(inner, ongoing))
}

/// Adopt persisted jobs this daemon is responsible for: restart recovery
/// and cluster-wide facets created by peers both arrive through here.
async fn sweep_once(inner: &Arc<SchedulerInner>) -> Result<()> {
    let ongoing = inner
        .store
        .get_ongoing_jobs(inner.replication.as_ref())
        .await?;

    for job in ongoing {
        let job_id = job.job_id();
        if inner.lock_jobs().contains_key(&job_id) {
            continue;
        }

        let current_hash = match inner.replication.token_map_hash(job.table()).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!(
                    job_id = %job_id,
                    table = %job.table(),
                    error = %e,
                    "Topology lookup failed for persisted job, skipping"
                );
                continue;
            }
        };

        if job.has_lost_ownership(current_hash) {
            warn!(
                job_id = %job_id,
                table = %job.table(),
                "Token map changed while job was parked, failing it"
            );
            match inner.store.fail(job_id, inner.time.now_millis()).await {
                Ok(()) | Err(AppError::Conflict(_)) => {}
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Failed to fail stale job");
                }
            }
            continue;
        }

        debug!(job_id = %job_id, table = %job.table(), "Adopting persisted on-demand job");
        install_job(inner, job);
    }
    Ok(())
}

async fn sweep_loop(inner: Arc<SchedulerInner>, interval: Duration, mut shutdown: ShutdownToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait() => break,
        }
        if shutdown.is_shutdown() {
            break;
        }
        // the sweep never throws out of its tick
        if let Err(e) = sweep_once(&inner).await {
            warn!(error = %e, "On-demand sweep failed, retrying on the next tick");
        }
    }
    debug!("On-demand sweep stopped");
}

/// The on-demand repair scheduler facade.
///
/// Instantiated once per daemon. Accepts user requests, persists them,
/// drives them through the schedule manager and periodically adopts jobs
/// persisted by peer daemons.
pub struct OnDemandRepairScheduler {
    inner: Arc<SchedulerInner>,
    shutdown: ShutdownSender,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl OnDemandRepairScheduler {
    pub fn new(deps: SchedulerDependencies) -> Result<Self> {
        deps.config.validate()?;

        let ctx = Arc::new(RepairJobContext {
            store: deps.store.clone(),
            replication: deps.replication.clone(),
            lock_factory: deps.lock_factory,
            lock_type: deps.lock_type,
            repair_runner: deps.repair_runner,
            repair_config: deps.repair_config,
            repair_history: deps.repair_history,
            metrics: deps.metrics,
            time: deps.time.clone(),
        });
        let inner = Arc::new(SchedulerInner {
            jobs: Mutex::new(HashMap::new()),
            store: deps.store,
            replication: deps.replication,
            schedule_manager: deps.schedule_manager,
            time: deps.time,
            job_ids: deps.job_ids,
            ctx,
        });

        let (shutdown, token) = shutdown_channel();
        let handle = tokio::spawn(sweep_loop(
            inner.clone(),
            deps.config.sweep_interval,
            token,
        ));

        Ok(Self {
            inner,
            shutdown,
            sweep_handle: Mutex::new(Some(handle)),
        })
    }

    /// Local-only on-demand repair of one table.
    pub async fn schedule_job(&self, table: &TableReference) -> Result<OnDemandRepairJobView> {
        let job = create_job(&self.inner, table, false).await?;
        let snapshot = job.snapshot().await;
        Ok(views::job_view(&snapshot, self.inner.replication.as_ref()).await)
    }

    /// Cluster-wide on-demand repair: one facet per participating host.
    /// Returns the cluster-wide views carrying the new job id; facets
    /// executed by peers keep appearing through
    /// `get_all_cluster_wide_repair_jobs`.
    pub async fn schedule_cluster_wide_job(
        &self,
        table: &TableReference,
    ) -> Result<Vec<OnDemandRepairJobView>> {
        let job = create_job(&self.inner, table, true).await?;
        let job_id = job.job_id();
        let all = self.get_all_cluster_wide_repair_jobs().await?;
        Ok(all.into_iter().filter(|view| view.id == job_id).collect())
    }

    /// Snapshot of the jobs currently scheduled in this daemon.
    pub async fn get_active_repair_jobs(&self) -> Vec<OnDemandRepairJobView> {
        // snapshot under the mutex, materialize views outside it
        let jobs: Vec<Arc<OnDemandRepairJob>> =
            self.inner.lock_jobs().values().cloned().collect();
        let mut result = Vec::with_capacity(jobs.len());
        for job in jobs {
            let snapshot = job.snapshot().await;
            result.push(views::job_view(&snapshot, self.inner.replication.as_ref()).await);
        }
        result
    }

    /// Every job this host owns, any status, straight from the store.
    pub async fn get_all_repair_jobs(&self) -> Result<Vec<OnDemandRepairJobView>> {
        let jobs = self
            .inner
            .store
            .get_all_jobs(self.inner.replication.as_ref())
            .await?;
        Ok(self.materialize(jobs).await)
    }

    /// Every cluster-wide job facet across all hosts, from the store.
    pub async fn get_all_cluster_wide_repair_jobs(&self) -> Result<Vec<OnDemandRepairJobView>> {
        let jobs = self
            .inner
            .store
            .get_all_cluster_wide_jobs(self.inner.replication.as_ref())
            .await?;
        Ok(self.materialize(jobs).await)
    }

    async fn materialize(&self, jobs: Vec<OngoingJob>) -> Vec<OnDemandRepairJobView> {
        let mut result = Vec::with_capacity(jobs.len());
        for job in jobs {
            result.push(views::job_view(&job, self.inner.replication.as_ref()).await);
        }
        result
    }

    /// Stop the sweep and deschedule every in-memory job. In-flight repair
    /// actions finish on their own.
    pub fn close(&self) {
        info!("Closing on-demand repair scheduler");
        self.shutdown.shutdown();
        if let Some(handle) = self
            .sweep_handle
            .lock()
            .expect("sweep handle lock poisoned")
            .take()
        {
            handle.abort();
        }

        let mut jobs = self.inner.lock_jobs();
        for job_id in jobs.keys().copied().collect::<Vec<_>>() {
            self.inner.schedule_manager.deschedule(job_id);
        }
        jobs.clear();
    }
}

impl Drop for OnDemandRepairScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RepairStatus, TokenRange};
    use crate::port::lock::mocks::InMemoryLockFactory;
    use crate::port::repair_runner::mocks::MockRepairRunner;
    use crate::port::replication::{RangeAssignment, StaticReplicationState};
    use crate::port::schedule_manager::mocks::ManualScheduleManager;
    use crate::port::status_store::mocks::InMemoryStatusStore;
    use crate::port::time_provider::mocks::FixedTimeProvider;
    use crate::port::{NoopRepairHistory, NoopRepairMetrics, UuidJobIdProvider};
    use crate::domain::NodeId;
    use uuid::Uuid;

    struct Fixture {
        node: NodeId,
        table: TableReference,
        oracle: Arc<StaticReplicationState>,
        store: Arc<InMemoryStatusStore>,
        manager: Arc<ManualScheduleManager>,
        runner: Arc<MockRepairRunner>,
    }

    impl Fixture {
        fn new(ranges: &[(i64, i64)]) -> Self {
            let node = Uuid::new_v4();
            let table = TableReference::new("ks", "t", Uuid::new_v4());
            let oracle = Arc::new(StaticReplicationState::new());
            oracle.add_node(node, "dc1");
            oracle.set_table(
                &table,
                ranges
                    .iter()
                    .map(|&(s, e)| RangeAssignment {
                        range: TokenRange::new(s, e),
                        replicas: vec![node],
                    })
                    .collect(),
            );
            Self {
                node,
                table,
                oracle,
                store: Arc::new(InMemoryStatusStore::new(node)),
                manager: Arc::new(ManualScheduleManager::new()),
                runner: Arc::new(MockRepairRunner::new()),
            }
        }

        fn scheduler(&self) -> OnDemandRepairScheduler {
            self.scheduler_with_interval(Duration::from_secs(10))
        }

        fn scheduler_with_interval(&self, sweep_interval: Duration) -> OnDemandRepairScheduler {
            OnDemandRepairScheduler::new(SchedulerDependencies {
                store: self.store.clone(),
                replication: self.oracle.clone(),
                schedule_manager: self.manager.clone(),
                lock_factory: Arc::new(InMemoryLockFactory::new()),
                lock_type: LockType::Vnode,
                repair_runner: self.runner.clone(),
                repair_config: RepairConfiguration::default(),
                repair_history: Arc::new(NoopRepairHistory),
                metrics: Arc::new(NoopRepairMetrics),
                time: Arc::new(FixedTimeProvider::new(1_000)),
                job_ids: Arc::new(UuidJobIdProvider),
                config: OnDemandSchedulerConfig { sweep_interval },
            })
            .expect("scheduler construction")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_job_happy_path() {
        let fixture = Fixture::new(&[(0, 10), (10, 20), (20, 30)]);
        let scheduler = fixture.scheduler();

        let view = scheduler.schedule_job(&fixture.table).await.unwrap();
        assert_eq!(view.status, RepairStatus::Started);
        assert_eq!(view.completed_ratio, 0.0);
        assert_eq!(view.virtual_nodes.len(), 3);
        assert_eq!(
            fixture.store.status_of(fixture.node, view.id),
            Some(RepairStatus::Started)
        );
        assert_eq!(scheduler.get_active_repair_jobs().await.len(), 1);

        fixture.manager.run_to_completion(50).await;

        assert_eq!(
            fixture.store.status_of(fixture.node, view.id),
            Some(RepairStatus::Finished)
        );
        assert_eq!(
            fixture.store.repaired_ranges_of(fixture.node, view.id).len(),
            3
        );
        // the on-finished hook emptied the in-memory map
        assert!(scheduler.get_active_repair_jobs().await.is_empty());
        assert_eq!(fixture.runner.invocations().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_table_is_rejected() {
        let fixture = Fixture::new(&[(0, 10)]);
        let scheduler = fixture.scheduler();

        let missing = TableReference::new("ks", "missing", Uuid::new_v4());
        let err = scheduler.schedule_job(&missing).await.unwrap_err();

        assert!(err.to_string().contains("keyspace/table does not exist"));
        assert_eq!(fixture.store.row_count(), 0);
        assert!(scheduler.get_active_repair_jobs().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_adopts_persisted_job() {
        let fixture = Fixture::new(&[(0, 10), (10, 20)]);
        let hash = fixture.oracle.token_map_hash(&fixture.table).await.unwrap();
        let job_id = Uuid::new_v4();

        // restart scenario: the row exists with one range already repaired
        fixture
            .store
            .add_new_job(&NewJobRecord {
                job_id,
                host_id: fixture.node,
                table: fixture.table.clone(),
                token_map_hash: hash,
                cluster_wide: false,
                started_at_ms: 500,
            })
            .await
            .unwrap();
        fixture
            .store
            .finish_range(job_id, TokenRange::new(0, 10), 600)
            .await
            .unwrap();

        let scheduler = fixture.scheduler();
        tokio::time::sleep(Duration::from_secs(11)).await;

        let active = scheduler.get_active_repair_jobs().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, job_id);
        assert!((active[0].completed_ratio - 0.5).abs() < f64::EPSILON);

        fixture.manager.run_to_completion(50).await;

        // only the pending range was executed
        assert_eq!(fixture.runner.invocations(), vec![TokenRange::new(10, 20)]);
        assert_eq!(
            fixture.store.status_of(fixture.node, job_id),
            Some(RepairStatus::Finished)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_fails_stale_job_without_running_it() {
        let fixture = Fixture::new(&[(0, 10), (10, 20)]);
        let job_id = Uuid::new_v4();

        // persisted against a hash the oracle no longer reports
        fixture
            .store
            .add_new_job(&NewJobRecord {
                job_id,
                host_id: fixture.node,
                table: fixture.table.clone(),
                token_map_hash: 12345,
                cluster_wide: false,
                started_at_ms: 500,
            })
            .await
            .unwrap();
        fixture
            .store
            .finish_range(job_id, TokenRange::new(0, 10), 600)
            .await
            .unwrap();

        let scheduler = fixture.scheduler();
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(scheduler.get_active_repair_jobs().await.is_empty());
        assert_eq!(
            fixture.store.status_of(fixture.node, job_id),
            Some(RepairStatus::Failed)
        );
        assert!(fixture.runner.invocations().is_empty());

        let all = scheduler.get_all_repair_jobs().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, RepairStatus::Failed);
        assert!((all[0].completed_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cluster_wide_job_creates_one_facet_per_host() {
        let node_b = Uuid::new_v4();
        let fixture = Fixture::new(&[]);
        fixture.oracle.add_node(node_b, "dc1");
        fixture.oracle.set_table(
            &fixture.table,
            vec![
                RangeAssignment {
                    range: TokenRange::new(0, 10),
                    replicas: vec![fixture.node, node_b],
                },
                RangeAssignment {
                    range: TokenRange::new(10, 20),
                    replicas: vec![node_b],
                },
            ],
        );

        let scheduler = fixture.scheduler();
        let views = scheduler
            .schedule_cluster_wide_job(&fixture.table)
            .await
            .unwrap();

        // one facet per participating host, all carrying the same job id
        assert_eq!(views.len(), 2);
        let job_id = views[0].id;
        assert!(views.iter().all(|view| view.id == job_id));
        assert_eq!(fixture.store.row_count(), 2);
        assert_eq!(
            fixture.store.status_of(node_b, job_id),
            Some(RepairStatus::Started)
        );

        // this daemon only has its own facet active
        let active = scheduler.get_active_repair_jobs().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].host_id, fixture.node);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_daemon_sees_and_adopts_cluster_wide_facet() {
        let node_b = Uuid::new_v4();
        let fixture = Fixture::new(&[]);
        fixture.oracle.add_node(node_b, "dc1");
        fixture.oracle.set_table(
            &fixture.table,
            vec![RangeAssignment {
                range: TokenRange::new(0, 10),
                replicas: vec![fixture.node, node_b],
            }],
        );

        let scheduler_a = fixture.scheduler();
        let views = scheduler_a
            .schedule_cluster_wide_job(&fixture.table)
            .await
            .unwrap();
        let job_id = views[0].id;

        // daemon B shares the store backing and runs its own scheduler
        let store_b = Arc::new(fixture.store.shared_with(node_b));
        let manager_b = Arc::new(ManualScheduleManager::new());
        let runner_b = Arc::new(fixture.runner.shared_with());
        let scheduler_b = OnDemandRepairScheduler::new(SchedulerDependencies {
            store: store_b,
            replication: fixture.oracle.clone(),
            schedule_manager: manager_b.clone(),
            lock_factory: Arc::new(InMemoryLockFactory::new()),
            lock_type: LockType::Vnode,
            repair_runner: runner_b,
            repair_config: RepairConfiguration::default(),
            repair_history: Arc::new(NoopRepairHistory),
            metrics: Arc::new(NoopRepairMetrics),
            time: Arc::new(FixedTimeProvider::new(1_000)),
            job_ids: Arc::new(UuidJobIdProvider),
            config: OnDemandSchedulerConfig::default(),
        })
        .unwrap();

        let cluster_wide = scheduler_b.get_all_cluster_wide_repair_jobs().await.unwrap();
        assert!(cluster_wide.iter().any(|view| view.id == job_id));

        tokio::time::sleep(Duration::from_secs(11)).await;

        let active_b = scheduler_b.get_active_repair_jobs().await;
        assert_eq!(active_b.len(), 1);
        assert_eq!(active_b[0].id, job_id);
        assert_eq!(active_b[0].host_id, node_b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_deschedules_everything() {
        let fixture = Fixture::new(&[(0, 10)]);
        let scheduler = fixture.scheduler();
        scheduler.schedule_job(&fixture.table).await.unwrap();
        assert_eq!(fixture.manager.scheduled_count(), 1);

        scheduler.close();

        assert!(scheduler.get_active_repair_jobs().await.is_empty());
        assert_eq!(fixture.manager.scheduled_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_survives_lookup_errors() {
        // dropping the table makes every topology lookup fail; the sweep
        // must skip the job and keep ticking
        let fixture = Fixture::new(&[(0, 10)]);
        let hash = fixture.oracle.token_map_hash(&fixture.table).await.unwrap();
        let job_id = Uuid::new_v4();
        fixture
            .store
            .add_new_job(&NewJobRecord {
                job_id,
                host_id: fixture.node,
                table: fixture.table.clone(),
                token_map_hash: hash,
                cluster_wide: false,
                started_at_ms: 500,
            })
            .await
            .unwrap();
        fixture.oracle.remove_table(&fixture.table);

        let scheduler = fixture.scheduler();
        // two ticks: the job cannot be hydrated against a live hash, so it
        // is skipped each time, and the sweep keeps running
        tokio::time::sleep(Duration::from_secs(21)).await;

        assert!(scheduler.get_active_repair_jobs().await.is_empty());
        assert_eq!(
            fixture.store.status_of(fixture.node, job_id),
            Some(RepairStatus::Started)
        );
    }
}
