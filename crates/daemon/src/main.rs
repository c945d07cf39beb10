//! ringmend - on-demand repair orchestration daemon
//! Composition root: configuration, port wiring, lifecycle.

mod nodetool;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ringmend_core::application::config::OnDemandSchedulerConfig;
use ringmend_core::application::scheduler::{OnDemandRepairScheduler, SchedulerDependencies};
use ringmend_core::application::worker::{shutdown_channel, ScheduleWorker};
use ringmend_core::domain::NodeId;
use ringmend_core::port::replication::{StaticReplicationState, Topology};
use ringmend_core::port::{
    LockType, NoopRepairMetrics, RepairConfiguration, SystemTimeProvider, UuidJobIdProvider,
};
use ringmend_infra_sqlite::{
    create_pool, run_migrations, SqlxLockFactory, SqlxOnDemandStatusStore, SqlxRepairHistory,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_DB_PATH: &str = "~/.ringmend/coordination.db";
const DEFAULT_TOPOLOGY_PATH: &str = "~/.ringmend/topology.json";
const DEFAULT_NODETOOL: &str = "nodetool";

/// Period of the maintenance tick that purges aged-out records.
const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize logging
    let log_format = env_or("RINGMEND_LOG_FORMAT", "pretty");
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("ringmend=info"))
        .context("Failed to create env filter")?;

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .init();
        }
    }

    info!("ringmend v{} starting...", VERSION);

    // 2. Load configuration
    let host_id: NodeId = std::env::var("RINGMEND_HOST_ID")
        .context("RINGMEND_HOST_ID must be set to this node's id")?
        .parse()
        .context("RINGMEND_HOST_ID must be a UUID")?;
    let db_path = shellexpand::tilde(&env_or("RINGMEND_DB_PATH", DEFAULT_DB_PATH)).into_owned();
    let topology_path =
        shellexpand::tilde(&env_or("RINGMEND_TOPOLOGY", DEFAULT_TOPOLOGY_PATH)).into_owned();
    let nodetool_command = env_or("RINGMEND_NODETOOL", DEFAULT_NODETOOL);
    let worker_count: usize = std::env::var("RINGMEND_WORKERS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1);

    // 3. Initialize the coordination database
    info!(db_path = %db_path, "Initializing coordination database...");
    let pool = create_pool(&format!("sqlite://{db_path}"))
        .await
        .map_err(|e| anyhow::anyhow!("Pool creation failed: {e}"))?;
    run_migrations(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Migration failed: {e}"))?;

    // 4. Load the replication topology
    info!(topology_path = %topology_path, "Loading topology...");
    let raw = std::fs::read_to_string(&topology_path)
        .with_context(|| format!("Failed to read topology file {topology_path}"))?;
    let topology: Topology =
        serde_json::from_str(&raw).context("Failed to parse topology file")?;
    let replication = Arc::new(StaticReplicationState::from_topology(topology));

    // 5. Wire the ports
    let time = Arc::new(SystemTimeProvider);
    let store = Arc::new(SqlxOnDemandStatusStore::new(
        pool.clone(),
        host_id,
        time.clone(),
    ));
    let lock_factory = Arc::new(SqlxLockFactory::new(pool.clone(), host_id, time.clone()));
    let repair_history = Arc::new(SqlxRepairHistory::new(pool.clone()));
    let repair_runner = Arc::new(nodetool::NodetoolRepairRunner::new(
        nodetool_command,
        time.clone(),
    ));
    let worker = Arc::new(ScheduleWorker::new());

    // 6. Build the scheduler; its first sweep adopts any jobs persisted
    //    before a restart
    let scheduler = OnDemandRepairScheduler::new(SchedulerDependencies {
        store: store.clone(),
        replication,
        schedule_manager: worker.clone(),
        lock_factory,
        lock_type: LockType::Vnode,
        repair_runner,
        repair_config: RepairConfiguration::default(),
        repair_history,
        metrics: Arc::new(NoopRepairMetrics),
        time,
        job_ids: Arc::new(UuidJobIdProvider),
        config: OnDemandSchedulerConfig::default(),
    })
    .map_err(|e| anyhow::anyhow!("Scheduler construction failed: {e}"))?;

    // 7. Start the execution loops and the maintenance tick
    let (shutdown_tx, _) = shutdown_channel();
    let mut handles = Vec::with_capacity(worker_count + 1);
    for _ in 0..worker_count {
        let worker = worker.clone();
        let token = shutdown_tx.token();
        handles.push(tokio::spawn(async move { worker.run(token).await }));
    }
    {
        let store = store.clone();
        let mut token = shutdown_tx.token();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PURGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = token.wait() => break,
                }
                if let Err(e) = store.purge_expired().await {
                    warn!(error = %e, "Record purge failed");
                }
            }
        }));
    }

    info!(workers = worker_count, "ringmend is running");

    // 8. Wait for shutdown
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    scheduler.close();
    shutdown_tx.shutdown();
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    info!("ringmend stopped");
    Ok(())
}
