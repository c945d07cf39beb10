// Repair History Port - sink for completed range sessions

use async_trait::async_trait;

use crate::domain::{NodeId, TableReference, TokenRange};
use crate::error::Result;

/// One attempted repair session over a single range.
#[derive(Debug, Clone)]
pub struct RepairSession {
    pub table: TableReference,
    pub range: TokenRange,
    pub replicas: Vec<NodeId>,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    pub successful: bool,
}

/// Sink for repair sessions. The time-driven scheduler reads this history
/// to decide its cadence; on-demand repair only writes it.
#[async_trait]
pub trait RepairHistory: Send + Sync {
    async fn record_session(&self, session: &RepairSession) -> Result<()>;
}

/// Discards history (tests, minimal deployments).
pub struct NoopRepairHistory;

#[async_trait]
impl RepairHistory for NoopRepairHistory {
    async fn record_session(&self, _session: &RepairSession) -> Result<()> {
        Ok(())
    }
}

pub mod mocks {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::Result;

    use super::{RepairHistory, RepairSession};

    /// Records every session for assertions.
    #[derive(Default)]
    pub struct RecordingRepairHistory {
        sessions: Mutex<Vec<RepairSession>>,
    }

    impl RecordingRepairHistory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn sessions(&self) -> Vec<RepairSession> {
            self.sessions
                .lock()
                .expect("history mock poisoned")
                .clone()
        }
    }

    #[async_trait]
    impl RepairHistory for RecordingRepairHistory {
        async fn record_session(&self, session: &RepairSession) -> Result<()> {
            self.sessions
                .lock()
                .expect("history mock poisoned")
                .push(session.clone());
            Ok(())
        }
    }
}
