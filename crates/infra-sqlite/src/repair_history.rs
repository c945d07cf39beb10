// SQL Repair History sink

use async_trait::async_trait;
use sqlx::SqlitePool;

use ringmend_core::error::{AppError, Result};
use ringmend_core::port::{RepairHistory, RepairSession};

/// Persists completed range sessions into the table the time-driven
/// scheduler reads its cadence from.
pub struct SqlxRepairHistory {
    pool: SqlitePool,
}

impl SqlxRepairHistory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RepairHistory for SqlxRepairHistory {
    async fn record_session(&self, session: &RepairSession) -> Result<()> {
        let replicas = serde_json::to_string(
            &session
                .replicas
                .iter()
                .map(|node| node.to_string())
                .collect::<Vec<_>>(),
        )?;

        sqlx::query(
            "INSERT OR IGNORE INTO repair_history \
             (keyspace_name, table_name, range_start, range_end, \
              started_at, finished_at, successful, replicas) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.table.keyspace())
        .bind(session.table.table())
        .bind(session.range.start)
        .bind(session.range.end)
        .bind(session.started_at_ms)
        .bind(session.finished_at_ms)
        .bind(session.successful)
        .bind(replicas)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;
        Ok(())
    }
}
