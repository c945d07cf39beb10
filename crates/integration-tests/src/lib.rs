// Shared harness for cross-crate scenarios: real sqlite store and lock
// factory, real schedule worker, scripted repair runner.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use uuid::Uuid;

use ringmend_core::application::config::OnDemandSchedulerConfig;
use ringmend_core::application::scheduler::{OnDemandRepairScheduler, SchedulerDependencies};
use ringmend_core::application::worker::{shutdown_channel, ScheduleWorker, ShutdownSender};
use ringmend_core::domain::{NodeId, TableReference, TokenRange};
use ringmend_core::port::repair_runner::mocks::MockRepairRunner;
use ringmend_core::port::replication::{RangeAssignment, StaticReplicationState};
use ringmend_core::port::time_provider::mocks::FixedTimeProvider;
use ringmend_core::port::{
    LockType, NoopRepairHistory, NoopRepairMetrics, RepairConfiguration, UuidJobIdProvider,
};
use ringmend_infra_sqlite::{
    connection::create_memory_pool, run_migrations, SqlxLockFactory, SqlxOnDemandStatusStore,
};

/// Sweep interval used by test daemons; adoption assertions poll well past it.
pub const TEST_SWEEP_INTERVAL: Duration = Duration::from_millis(200);

/// A cluster under test: one coordination database, one topology oracle.
pub struct TestCluster {
    pub pool: SqlitePool,
    pub oracle: Arc<StaticReplicationState>,
}

impl TestCluster {
    pub async fn new() -> Self {
        let pool = create_memory_pool().await.expect("memory pool");
        run_migrations(&pool).await.expect("migrations");
        Self {
            pool,
            oracle: Arc::new(StaticReplicationState::new()),
        }
    }

    pub fn table(&self, keyspace: &str, table: &str, ranges: Vec<(TokenRange, Vec<NodeId>)>) -> TableReference {
        let reference = TableReference::new(keyspace, table, Uuid::new_v4());
        self.oracle.set_table(
            &reference,
            ranges
                .into_iter()
                .map(|(range, replicas)| RangeAssignment { range, replicas })
                .collect(),
        );
        reference
    }

    /// Start one daemon: real store and lock factory over the shared pool,
    /// a schedule worker loop, and the scheduler with its sweep.
    pub fn start_daemon(&self, node: NodeId, runner: Arc<MockRepairRunner>) -> TestDaemon {
        self.oracle.add_node(node, "dc1");
        let time = Arc::new(FixedTimeProvider::new(1_000_000));
        let store = Arc::new(SqlxOnDemandStatusStore::new(
            self.pool.clone(),
            node,
            time.clone(),
        ));
        let worker = Arc::new(ScheduleWorker::with_pacing(
            Duration::from_millis(5),
            Duration::from_millis(5),
        ));
        let scheduler = OnDemandRepairScheduler::new(SchedulerDependencies {
            store: store.clone(),
            replication: self.oracle.clone(),
            schedule_manager: worker.clone(),
            lock_factory: Arc::new(SqlxLockFactory::new(self.pool.clone(), node, time.clone())),
            lock_type: LockType::Vnode,
            repair_runner: runner.clone(),
            repair_config: RepairConfiguration::default(),
            repair_history: Arc::new(NoopRepairHistory),
            metrics: Arc::new(NoopRepairMetrics),
            time,
            job_ids: Arc::new(UuidJobIdProvider),
            config: OnDemandSchedulerConfig {
                sweep_interval: TEST_SWEEP_INTERVAL,
            },
        })
        .expect("scheduler construction");

        let (shutdown, token) = shutdown_channel();
        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(token).await }
        });

        TestDaemon {
            node,
            scheduler,
            store,
            runner,
            shutdown,
            worker_handle: Some(handle),
        }
    }
}

/// One running daemon in the test cluster.
pub struct TestDaemon {
    pub node: NodeId,
    pub scheduler: OnDemandRepairScheduler,
    pub store: Arc<SqlxOnDemandStatusStore>,
    pub runner: Arc<MockRepairRunner>,
    shutdown: ShutdownSender,
    worker_handle: Option<tokio::task::JoinHandle<()>>,
}

impl TestDaemon {
    /// Stop the daemon, waiting for the worker loop to exit.
    pub async fn stop(mut self) {
        self.scheduler.close();
        self.shutdown.shutdown();
        if let Some(handle) = self.worker_handle.take() {
            handle.await.expect("worker loop");
        }
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

/// Poll until the condition holds, failing the test after five seconds.
pub async fn wait_until<F, Fut>(description: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Timed out waiting for: {description}");
}
