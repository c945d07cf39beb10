// SQL Lock Factory - lease rows as cluster-scoped mutual exclusion

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::debug;

use ringmend_core::domain::NodeId;
use ringmend_core::error::{AppError, Result};
use ringmend_core::port::{LockFactory, LockHandle, TimeProvider};

/// Leases are sized to outlast one range session; a crashed holder frees
/// the resource when the lease lapses.
const DEFAULT_LEASE_MS: i64 = 4 * 60 * 60 * 1000;

/// Mutual exclusion through insert-if-absent lease rows. Acquisition first
/// clears a lapsed lease, then claims the keyed row; losing the insert race
/// means the resource is contended.
pub struct SqlxLockFactory {
    pool: SqlitePool,
    owner: String,
    time: Arc<dyn TimeProvider>,
    lease_ms: i64,
}

impl SqlxLockFactory {
    pub fn new(pool: SqlitePool, owner: NodeId, time: Arc<dyn TimeProvider>) -> Self {
        Self::with_lease(pool, owner, time, DEFAULT_LEASE_MS)
    }

    pub fn with_lease(
        pool: SqlitePool,
        owner: NodeId,
        time: Arc<dyn TimeProvider>,
        lease_ms: i64,
    ) -> Self {
        Self {
            pool,
            owner: owner.to_string(),
            time,
            lease_ms,
        }
    }
}

#[async_trait]
impl LockFactory for SqlxLockFactory {
    async fn try_lock(&self, resource: &str) -> Result<Option<Box<dyn LockHandle>>> {
        let now = self.time.now_millis();

        sqlx::query("DELETE FROM repair_locks WHERE resource = ? AND expires_at <= ?")
            .bind(resource)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Lock(e.to_string()))?;

        let result = sqlx::query(
            "INSERT OR IGNORE INTO repair_locks (resource, owner, acquired_at, expires_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(resource)
        .bind(&self.owner)
        .bind(now)
        .bind(now + self.lease_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Lock(e.to_string()))?;

        if result.rows_affected() == 0 {
            debug!(resource = resource, "Lock is held elsewhere");
            return Ok(None);
        }

        Ok(Some(Box::new(SqlxLockHandle {
            pool: self.pool.clone(),
            resource: resource.to_string(),
            owner: self.owner.clone(),
        })))
    }
}

struct SqlxLockHandle {
    pool: SqlitePool,
    resource: String,
    owner: String,
}

#[async_trait]
impl LockHandle for SqlxLockHandle {
    async fn release(&self) -> Result<()> {
        // owner-checked so a lapsed-and-stolen lease is never deleted
        sqlx::query("DELETE FROM repair_locks WHERE resource = ? AND owner = ?")
            .bind(&self.resource)
            .bind(&self.owner)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Lock(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::create_memory_pool;
    use crate::migration::run_migrations;
    use ringmend_core::port::time_provider::mocks::FixedTimeProvider;
    use uuid::Uuid;

    async fn factories() -> (SqlxLockFactory, SqlxLockFactory, Arc<FixedTimeProvider>) {
        let pool = create_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        let time = Arc::new(FixedTimeProvider::new(1_000));
        let a = SqlxLockFactory::with_lease(pool.clone(), Uuid::new_v4(), time.clone(), 10_000);
        let b = SqlxLockFactory::with_lease(pool, Uuid::new_v4(), time.clone(), 10_000);
        (a, b, time)
    }

    #[tokio::test]
    async fn test_exclusive_until_released() {
        let (a, b, _) = factories().await;

        let handle = a.try_lock("repair-ks-t-0-10").await.unwrap().expect("grab");
        assert!(b.try_lock("repair-ks-t-0-10").await.unwrap().is_none());
        // unrelated resources stay free
        assert!(b.try_lock("repair-ks-t-10-20").await.unwrap().is_some());

        handle.release().await.unwrap();
        assert!(b.try_lock("repair-ks-t-0-10").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lapsed_lease_is_stolen() {
        let (a, b, time) = factories().await;

        let _orphaned = a.try_lock("r").await.unwrap().expect("grab");
        assert!(b.try_lock("r").await.unwrap().is_none());

        time.advance(10_001);
        assert!(b.try_lock("r").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_after_steal_keeps_new_owner() {
        let (a, b, time) = factories().await;

        let stale = a.try_lock("r").await.unwrap().expect("grab");
        time.advance(10_001);
        let _current = b.try_lock("r").await.unwrap().expect("steal");

        // the old holder's release is owner-checked and does nothing
        stale.release().await.unwrap();
        assert!(a.try_lock("r").await.unwrap().is_none());
    }
}
