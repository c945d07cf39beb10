// Port Layer - Interfaces for external dependencies

pub mod id_provider;
pub mod lock;
pub mod metrics;
pub mod repair_history;
pub mod repair_runner;
pub mod replication;
pub mod schedule_manager;
pub mod status_store;
pub mod time_provider;

// Re-exports
pub use id_provider::{JobIdProvider, UuidJobIdProvider};
pub use lock::{LockFactory, LockHandle, LockType};
pub use metrics::{NoopRepairMetrics, RepairMetrics};
pub use repair_history::{NoopRepairHistory, RepairHistory, RepairSession};
pub use repair_runner::{
    RepairConfiguration, RepairOutcome, RepairParallelism, RepairRunner, RepairType,
};
pub use replication::{ReplicationState, StaticReplicationState, Topology};
pub use schedule_manager::{ScheduleManager, ScheduledJob, TaskOutcome};
pub use status_store::{NewJobRecord, OnDemandStatusStore};
pub use time_provider::{SystemTimeProvider, TimeProvider};
