// SQL On-Demand Status Store

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use ringmend_core::domain::{JobId, NodeId, OngoingJob, RepairStatus, TableReference, TokenRange};
use ringmend_core::error::{AppError, Result};
use ringmend_core::port::status_store::{hydrate_job, NewJobRecord, OnDemandStatusStore};
use ringmend_core::port::{ReplicationState, TimeProvider};

/// Records age out of the coordination table after ~30 days.
const DEFAULT_RECORD_TTL_MS: i64 = 30 * 24 * 60 * 60 * 1000;

// Helper to fold sqlx errors into the core error enum. Keyed-row collisions
// surface as conflicts so callers can treat them as "someone else won".
fn map_sqlx_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                // SQLite 1555/2067: primary key / unique constraint failed
                let code = code.as_ref();
                if code == "1555" || code == "2067" {
                    return AppError::Conflict(format!("Row already exists: {}", db_err.message()));
                }
            }
            AppError::Store(format!("Database error: {}", db_err.message()))
        }
        sqlx::Error::RowNotFound => AppError::Store("Row not found".to_string()),
        _ => AppError::Store(err.to_string()),
    }
}

fn parse_uuid(column: &str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| AppError::Store(format!("Corrupt {column} column '{value}': {e}")))
}

#[derive(sqlx::FromRow)]
struct StatusRow {
    host_id: String,
    job_id: String,
    keyspace_name: String,
    table_name: String,
    table_id: String,
    token_map_hash: i64,
    status: String,
    cluster_wide: bool,
    started_at: i64,
    completed_at: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct RangeRow {
    range_start: i64,
    range_end: i64,
    repaired_at: i64,
}

/// Durable on-demand job records in the coordination database shared by
/// every daemon.
///
/// Terminal transitions compare-and-set the status column; range
/// completions are keyed child rows, so re-inserting one is a no-op. Rows
/// carry an expiry the reads filter on and `purge_expired` enforces.
pub struct SqlxOnDemandStatusStore {
    pool: SqlitePool,
    host_id: NodeId,
    time: Arc<dyn TimeProvider>,
    record_ttl_ms: i64,
}

impl SqlxOnDemandStatusStore {
    pub fn new(pool: SqlitePool, host_id: NodeId, time: Arc<dyn TimeProvider>) -> Self {
        Self::with_ttl(pool, host_id, time, DEFAULT_RECORD_TTL_MS)
    }

    pub fn with_ttl(
        pool: SqlitePool,
        host_id: NodeId,
        time: Arc<dyn TimeProvider>,
        record_ttl_ms: i64,
    ) -> Self {
        Self {
            pool,
            host_id,
            time,
            record_ttl_ms,
        }
    }

    /// Delete aged-out records. The daemon calls this on a maintenance
    /// tick; reads already ignore expired rows.
    pub async fn purge_expired(&self) -> Result<u64> {
        let now = self.time.now_millis();
        sqlx::query(
            "DELETE FROM repair_job_ranges WHERE (host_id, job_id) IN \
             (SELECT host_id, job_id FROM repair_job_status WHERE expires_at <= ?)",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let result = sqlx::query("DELETE FROM repair_job_status WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() > 0 {
            debug!(purged = result.rows_affected(), "Purged expired repair records");
        }
        Ok(result.rows_affected())
    }

    async fn repaired_ranges(&self, host_id: &str, job_id: &str) -> Result<HashMap<TokenRange, i64>> {
        let rows: Vec<RangeRow> = sqlx::query_as(
            "SELECT range_start, range_end, repaired_at FROM repair_job_ranges \
             WHERE host_id = ? AND job_id = ?",
        )
        .bind(host_id)
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows
            .into_iter()
            .map(|row| (TokenRange::new(row.range_start, row.range_end), row.repaired_at))
            .collect())
    }

    async fn hydrate_row(
        &self,
        row: StatusRow,
        replication: &dyn ReplicationState,
    ) -> Result<OngoingJob> {
        let repaired = self.repaired_ranges(&row.host_id, &row.job_id).await?;
        let host_id = parse_uuid("host_id", &row.host_id)?;
        let job_id = parse_uuid("job_id", &row.job_id)?;
        let table_id = parse_uuid("table_id", &row.table_id)?;
        let status = RepairStatus::parse(&row.status)?;
        let table = TableReference::new(row.keyspace_name, row.table_name, table_id);

        Ok(hydrate_job(
            job_id,
            host_id,
            table,
            row.token_map_hash,
            repaired,
            status,
            row.cluster_wide,
            row.started_at,
            row.completed_at,
            replication,
        )
        .await)
    }

    async fn load_jobs(
        &self,
        rows: Vec<StatusRow>,
        replication: &dyn ReplicationState,
    ) -> Result<Vec<OngoingJob>> {
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            jobs.push(self.hydrate_row(row, replication).await?);
        }
        Ok(jobs)
    }
}

const STATUS_COLUMNS: &str = "host_id, job_id, keyspace_name, table_name, table_id, \
     token_map_hash, status, cluster_wide, started_at, completed_at";

#[async_trait]
impl OnDemandStatusStore for SqlxOnDemandStatusStore {
    fn host_id(&self) -> NodeId {
        self.host_id
    }

    async fn add_new_job(&self, record: &NewJobRecord) -> Result<()> {
        let expires_at = record.started_at_ms + self.record_ttl_ms;
        sqlx::query(
            "INSERT INTO repair_job_status (host_id, job_id, keyspace_name, table_name, \
             table_id, token_map_hash, status, cluster_wide, started_at, completed_at, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?)",
        )
        .bind(record.host_id.to_string())
        .bind(record.job_id.to_string())
        .bind(record.table.keyspace())
        .bind(record.table.table())
        .bind(record.table.id().to_string())
        .bind(record.token_map_hash)
        .bind(RepairStatus::Started.as_str())
        .bind(record.cluster_wide)
        .bind(record.started_at_ms)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn finish_range(
        &self,
        job_id: JobId,
        range: TokenRange,
        repaired_at_ms: i64,
    ) -> Result<()> {
        // keyed insert guarded by the parent still being `started`; both
        // re-inserts and post-terminal inserts are no-ops
        sqlx::query(
            "INSERT OR IGNORE INTO repair_job_ranges \
             (host_id, job_id, range_start, range_end, repaired_at) \
             SELECT ?, ?, ?, ?, ? WHERE EXISTS \
             (SELECT 1 FROM repair_job_status \
              WHERE host_id = ? AND job_id = ? AND status = 'started')",
        )
        .bind(self.host_id.to_string())
        .bind(job_id.to_string())
        .bind(range.start)
        .bind(range.end)
        .bind(repaired_at_ms)
        .bind(self.host_id.to_string())
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn finish(&self, job_id: JobId, completed_at_ms: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE repair_job_status SET status = 'finished', completed_at = ? \
             WHERE host_id = ? AND job_id = ? AND status = 'started'",
        )
        .bind(completed_at_ms)
        .bind(self.host_id.to_string())
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "Job {job_id} is not in started state"
            )));
        }
        Ok(())
    }

    async fn fail(&self, job_id: JobId, completed_at_ms: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE repair_job_status SET status = 'failed', completed_at = ? \
             WHERE host_id = ? AND job_id = ? AND status = 'started'",
        )
        .bind(completed_at_ms)
        .bind(self.host_id.to_string())
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "Job {job_id} is already terminal"
            )));
        }
        Ok(())
    }

    async fn get_ongoing_jobs(
        &self,
        replication: &dyn ReplicationState,
    ) -> Result<Vec<OngoingJob>> {
        let rows: Vec<StatusRow> = sqlx::query_as(&format!(
            "SELECT {STATUS_COLUMNS} FROM repair_job_status \
             WHERE host_id = ? AND status = 'started' AND expires_at > ?"
        ))
        .bind(self.host_id.to_string())
        .bind(self.time.now_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        self.load_jobs(rows, replication).await
    }

    async fn get_all_jobs(&self, replication: &dyn ReplicationState) -> Result<Vec<OngoingJob>> {
        let rows: Vec<StatusRow> = sqlx::query_as(&format!(
            "SELECT {STATUS_COLUMNS} FROM repair_job_status \
             WHERE host_id = ? AND expires_at > ?"
        ))
        .bind(self.host_id.to_string())
        .bind(self.time.now_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        self.load_jobs(rows, replication).await
    }

    async fn get_all_cluster_wide_jobs(
        &self,
        replication: &dyn ReplicationState,
    ) -> Result<Vec<OngoingJob>> {
        let rows: Vec<StatusRow> = sqlx::query_as(&format!(
            "SELECT {STATUS_COLUMNS} FROM repair_job_status \
             WHERE cluster_wide = 1 AND expires_at > ?"
        ))
        .bind(self.time.now_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        self.load_jobs(rows, replication).await
    }
}
