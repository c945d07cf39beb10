// Repair Metrics Hooks - emission backends are wired by the daemon

use crate::domain::{RepairStatus, TableReference, TokenRange};

/// Typed metric hooks the core calls. Implementations forward to whatever
/// emission backend the deployment uses; the core never formats metric
/// names or labels itself.
pub trait RepairMetrics: Send + Sync {
    /// One range task finished, successfully or not.
    fn range_repaired(
        &self,
        table: &TableReference,
        range: &TokenRange,
        successful: bool,
        duration_ms: i64,
    );

    /// A job reached a terminal status.
    fn job_completed(&self, table: &TableReference, status: RepairStatus);
}

/// Drops all metrics (tests, minimal deployments).
pub struct NoopRepairMetrics;

impl RepairMetrics for NoopRepairMetrics {
    fn range_repaired(
        &self,
        _table: &TableReference,
        _range: &TokenRange,
        _successful: bool,
        _duration_ms: i64,
    ) {
    }

    fn job_completed(&self, _table: &TableReference, _status: RepairStatus) {}
}

pub mod mocks {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::domain::{RepairStatus, TableReference, TokenRange};

    use super::RepairMetrics;

    /// Counts hook invocations for assertions.
    #[derive(Default)]
    pub struct CountingRepairMetrics {
        pub ranges_ok: AtomicUsize,
        pub ranges_failed: AtomicUsize,
        pub jobs_finished: AtomicUsize,
        pub jobs_failed: AtomicUsize,
    }

    impl CountingRepairMetrics {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl RepairMetrics for CountingRepairMetrics {
        fn range_repaired(
            &self,
            _table: &TableReference,
            _range: &TokenRange,
            successful: bool,
            _duration_ms: i64,
        ) {
            if successful {
                self.ranges_ok.fetch_add(1, Ordering::SeqCst);
            } else {
                self.ranges_failed.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn job_completed(&self, _table: &TableReference, status: RepairStatus) {
            match status {
                RepairStatus::Failed => self.jobs_failed.fetch_add(1, Ordering::SeqCst),
                _ => self.jobs_finished.fetch_add(1, Ordering::SeqCst),
            };
        }
    }
}
