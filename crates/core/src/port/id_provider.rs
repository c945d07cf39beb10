// Job ID Provider Port (for deterministic testing)

use crate::domain::JobId;

/// Job id provider interface (allows deterministic ids in tests)
pub trait JobIdProvider: Send + Sync {
    /// Generate a new unique job id
    fn new_job_id(&self) -> JobId;
}

/// UUID v4 provider (production)
pub struct UuidJobIdProvider;

impl JobIdProvider for UuidJobIdProvider {
    fn new_job_id(&self) -> JobId {
        uuid::Uuid::new_v4()
    }
}

pub mod mocks {
    use super::JobIdProvider;
    use crate::domain::JobId;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Hands out a predetermined sequence of ids, then falls back to random.
    pub struct SequenceJobIdProvider {
        ids: Mutex<VecDeque<JobId>>,
    }

    impl SequenceJobIdProvider {
        pub fn new(ids: Vec<JobId>) -> Self {
            Self {
                ids: Mutex::new(ids.into()),
            }
        }
    }

    impl JobIdProvider for SequenceJobIdProvider {
        fn new_job_id(&self) -> JobId {
            self.ids
                .lock()
                .expect("id sequence lock poisoned")
                .pop_front()
                .unwrap_or_else(uuid::Uuid::new_v4)
        }
    }
}
