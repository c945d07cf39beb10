// Distributed Lock Port

use async_trait::async_trait;

use crate::domain::{TableReference, TokenRange};
use crate::error::Result;

/// Lock granularity policy for repair tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    /// One lock per token range.
    Vnode,
    /// One lock per replica datacenter per table.
    Datacenter,
}

impl LockType {
    /// Resource names a range task must hold before its repair action runs.
    pub fn resources(
        &self,
        table: &TableReference,
        range: &TokenRange,
        datacenters: &[String],
    ) -> Vec<String> {
        match self {
            LockType::Vnode => vec![format!(
                "repair-{}-{}-{}-{}",
                table.keyspace(),
                table.table(),
                range.start,
                range.end
            )],
            LockType::Datacenter => datacenters
                .iter()
                .map(|dc| format!("repair-{}-{}-{}", dc, table.keyspace(), table.table()))
                .collect(),
        }
    }
}

/// A held distributed lock. Release is explicit; implementations may also
/// expire leases so a crashed holder frees the resource eventually.
#[async_trait]
pub trait LockHandle: Send + Sync {
    async fn release(&self) -> Result<()>;
}

/// Cluster-scoped mutual exclusion factory.
#[async_trait]
pub trait LockFactory: Send + Sync {
    /// Try to acquire one named resource. `Ok(None)` means contended, which
    /// is an expected outcome rather than an error; the caller defers and
    /// retries later.
    async fn try_lock(&self, resource: &str) -> Result<Option<Box<dyn LockHandle>>>;
}

pub mod mocks {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use crate::error::Result;

    use super::{LockFactory, LockHandle};

    type Held = Arc<Mutex<HashSet<String>>>;

    /// In-memory lock factory. Instances created via `shared_with` contend
    /// on the same resources, modeling several daemons against one lock
    /// backend.
    pub struct InMemoryLockFactory {
        held: Held,
        refuse_all: Arc<Mutex<bool>>,
    }

    impl InMemoryLockFactory {
        pub fn new() -> Self {
            Self {
                held: Arc::new(Mutex::new(HashSet::new())),
                refuse_all: Arc::new(Mutex::new(false)),
            }
        }

        /// Another daemon's handle on the same lock backend.
        pub fn shared_with(&self) -> Self {
            Self {
                held: Arc::clone(&self.held),
                refuse_all: Arc::clone(&self.refuse_all),
            }
        }

        /// Make every subsequent `try_lock` contend.
        pub fn set_refuse_all(&self, refuse: bool) {
            *self.refuse_all.lock().expect("lock mock poisoned") = refuse;
        }

        pub fn is_held(&self, resource: &str) -> bool {
            self.held
                .lock()
                .expect("lock mock poisoned")
                .contains(resource)
        }

        /// Hold a resource out-of-band, as a contending peer would.
        pub fn seize(&self, resource: &str) {
            self.held
                .lock()
                .expect("lock mock poisoned")
                .insert(resource.to_string());
        }

        pub fn free(&self, resource: &str) {
            self.held
                .lock()
                .expect("lock mock poisoned")
                .remove(resource);
        }
    }

    impl Default for InMemoryLockFactory {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl LockFactory for InMemoryLockFactory {
        async fn try_lock(&self, resource: &str) -> Result<Option<Box<dyn LockHandle>>> {
            if *self.refuse_all.lock().expect("lock mock poisoned") {
                return Ok(None);
            }
            let mut held = self.held.lock().expect("lock mock poisoned");
            if !held.insert(resource.to_string()) {
                return Ok(None);
            }
            Ok(Some(Box::new(InMemoryLockHandle {
                resource: resource.to_string(),
                held: Arc::clone(&self.held),
                released: std::sync::atomic::AtomicBool::new(false),
            })))
        }
    }

    struct InMemoryLockHandle {
        resource: String,
        held: Held,
        released: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl LockHandle for InMemoryLockHandle {
        async fn release(&self) -> Result<()> {
            self.released
                .store(true, std::sync::atomic::Ordering::SeqCst);
            self.held
                .lock()
                .expect("lock mock poisoned")
                .remove(&self.resource);
            Ok(())
        }
    }

    // Safety net so a panicking test does not leave the resource held. A
    // handle already released must not touch the resource again, the name
    // may have been re-acquired by someone else.
    impl Drop for InMemoryLockHandle {
        fn drop(&mut self) {
            if self.released.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }
            if let Ok(mut held) = self.held.lock() {
                held.remove(&self.resource);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_vnode_resource_per_range() {
        let table = TableReference::new("ks", "t", Uuid::new_v4());
        let resources =
            LockType::Vnode.resources(&table, &TokenRange::new(0, 10), &["dc1".to_string()]);
        assert_eq!(resources, vec!["repair-ks-t-0-10".to_string()]);
    }

    #[test]
    fn test_datacenter_resource_per_dc() {
        let table = TableReference::new("ks", "t", Uuid::new_v4());
        let dcs = vec!["dc1".to_string(), "dc2".to_string()];
        let resources = LockType::Datacenter.resources(&table, &TokenRange::new(0, 10), &dcs);
        assert_eq!(
            resources,
            vec!["repair-dc1-ks-t".to_string(), "repair-dc2-ks-t".to_string()]
        );
    }

    #[tokio::test]
    async fn test_mock_factory_is_exclusive() {
        let factory = mocks::InMemoryLockFactory::new();
        let peer = factory.shared_with();

        let handle = factory.try_lock("r").await.unwrap().expect("first grab");
        assert!(peer.try_lock("r").await.unwrap().is_none());

        handle.release().await.unwrap();
        assert!(peer.try_lock("r").await.unwrap().is_some());
    }
}
