// Repair Runner Port - instructs the local node to repair one range

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{NodeId, TableReference, TokenRange};
use crate::error::Result;

/// How a repair session is driven across replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairParallelism {
    Sequential,
    Parallel,
    DatacenterAware,
}

/// Full anti-entropy versus incremental repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairType {
    Full,
    Incremental,
}

/// Parameters handed to the repair action for every range.
#[derive(Debug, Clone)]
pub struct RepairConfiguration {
    pub parallelism: RepairParallelism,
    pub repair_type: RepairType,
    /// Verify repaired data after the session.
    pub validate: bool,
    /// Relative priority against other management operations on the node.
    pub priority: i32,
    /// Upper bound for one range action; enforced inside the runner.
    pub action_timeout: Duration,
}

impl Default for RepairConfiguration {
    fn default() -> Self {
        Self {
            parallelism: RepairParallelism::Parallel,
            repair_type: RepairType::Full,
            validate: false,
            priority: 0,
            action_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// Outcome of one range repair action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Replicas were reconciled.
    Repaired,
    /// Nothing to reconcile; counts as done.
    NothingToRepair,
    /// The action failed; the range stays pending and is retried later.
    Failed,
}

/// Drives the local database node's repair of a single range.
///
/// Implementations wrap the node's management interface. Failures that are
/// part of the repair protocol come back as `RepairOutcome::Failed`;
/// transport-level problems come back as `Err`.
#[async_trait]
pub trait RepairRunner: Send + Sync {
    async fn repair(
        &self,
        table: &TableReference,
        range: &TokenRange,
        replicas: &[NodeId],
        config: &RepairConfiguration,
    ) -> Result<RepairOutcome>;
}

pub mod mocks {
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::domain::{NodeId, TableReference, TokenRange};
    use crate::error::Result;

    use super::{RepairConfiguration, RepairOutcome, RepairRunner};

    #[derive(Default)]
    struct RunnerState {
        scripted: HashMap<TokenRange, VecDeque<RepairOutcome>>,
        invocations: Vec<TokenRange>,
        in_flight: HashSet<TokenRange>,
        overlap_detected: bool,
    }

    /// Scripted repair runner. Outcomes are dequeued per range; a range
    /// without a script succeeds. Also detects overlapping executions of
    /// the same range, which the distributed lock must prevent.
    pub struct MockRepairRunner {
        state: Arc<Mutex<RunnerState>>,
        delay: Option<Duration>,
    }

    impl MockRepairRunner {
        pub fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(RunnerState::default())),
                delay: None,
            }
        }

        /// Sharing state with a second runner models the same table being
        /// repaired from two daemons.
        pub fn shared_with(&self) -> Self {
            Self {
                state: Arc::clone(&self.state),
                delay: self.delay,
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        /// Queue outcomes for one range, consumed in order.
        pub fn script(&self, range: TokenRange, outcomes: Vec<RepairOutcome>) {
            self.lock_state()
                .scripted
                .entry(range)
                .or_default()
                .extend(outcomes);
        }

        pub fn invocations(&self) -> Vec<TokenRange> {
            self.lock_state().invocations.clone()
        }

        pub fn invocation_count(&self, range: &TokenRange) -> usize {
            self.lock_state()
                .invocations
                .iter()
                .filter(|r| *r == range)
                .count()
        }

        /// True if two executions of the same range ever overlapped.
        pub fn overlap_detected(&self) -> bool {
            self.lock_state().overlap_detected
        }

        fn lock_state(&self) -> std::sync::MutexGuard<'_, RunnerState> {
            self.state.lock().expect("repair runner mock poisoned")
        }
    }

    impl Default for MockRepairRunner {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl RepairRunner for MockRepairRunner {
        async fn repair(
            &self,
            _table: &TableReference,
            range: &TokenRange,
            _replicas: &[NodeId],
            _config: &RepairConfiguration,
        ) -> Result<RepairOutcome> {
            {
                let mut state = self.lock_state();
                state.invocations.push(*range);
                if !state.in_flight.insert(*range) {
                    state.overlap_detected = true;
                }
            }

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let mut state = self.lock_state();
            state.in_flight.remove(range);
            let outcome = state
                .scripted
                .get_mut(range)
                .and_then(|queue| queue.pop_front())
                .unwrap_or(RepairOutcome::Repaired);
            Ok(outcome)
        }
    }
}
