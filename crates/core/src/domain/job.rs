// On-demand repair job state machine

use std::collections::HashMap;

use serde::Serialize;

use super::error::{DomainError, Result};
use super::table::TableReference;
use super::token::{NodeId, TokenRange};

/// Job ID (UUID v4, chosen by the creating daemon)
pub type JobId = uuid::Uuid;

/// Durable repair status. `started` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairStatus {
    Started,
    Finished,
    Failed,
}

impl RepairStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RepairStatus::Finished | RepairStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RepairStatus::Started => "started",
            RepairStatus::Finished => "finished",
            RepairStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "started" => Ok(RepairStatus::Started),
            "finished" => Ok(RepairStatus::Finished),
            "failed" => Ok(RepairStatus::Failed),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for RepairStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The durable unit of on-demand repair for one host.
///
/// `all_ranges` is not persisted; it is reconstructed from the replication
/// oracle at creation and rehydration, which is safe because a token-map
/// hash mismatch fails the job before any further range runs. The repaired
/// set and status round-trip through the status store.
///
/// Invariants enforced here:
/// - the repaired set only grows, and only while the job is `started`
/// - `finished` requires every owned range to be repaired
/// - terminal states freeze the repaired set and the completion time
#[derive(Debug, Clone)]
pub struct OngoingJob {
    job_id: JobId,
    host_id: NodeId,
    table: TableReference,
    token_map_hash: i64,
    all_ranges: Vec<TokenRange>,
    repaired: HashMap<TokenRange, i64>,
    status: RepairStatus,
    cluster_wide: bool,
    started_at_ms: i64,
    completed_at_ms: Option<i64>,
}

impl OngoingJob {
    /// New job at creation time: `started`, nothing repaired yet.
    pub fn new(
        job_id: JobId,
        host_id: NodeId,
        table: TableReference,
        token_map_hash: i64,
        all_ranges: Vec<TokenRange>,
        cluster_wide: bool,
        started_at_ms: i64,
    ) -> Self {
        Self {
            job_id,
            host_id,
            table,
            token_map_hash,
            all_ranges,
            repaired: HashMap::new(),
            status: RepairStatus::Started,
            cluster_wide,
            started_at_ms,
            completed_at_ms: None,
        }
    }

    /// Rebuild a job from its persisted record plus oracle-reconstructed
    /// ranges. Already-completed ranges are never re-attempted. Persisted
    /// completions outside the reconstructed set are kept visible so the
    /// completed ratio of a stale job reflects what actually ran.
    #[allow(clippy::too_many_arguments)]
    pub fn hydrate(
        job_id: JobId,
        host_id: NodeId,
        table: TableReference,
        token_map_hash: i64,
        all_ranges: Vec<TokenRange>,
        repaired: HashMap<TokenRange, i64>,
        status: RepairStatus,
        cluster_wide: bool,
        started_at_ms: i64,
        completed_at_ms: Option<i64>,
    ) -> Self {
        let mut all_ranges = all_ranges;
        for range in repaired.keys() {
            if !all_ranges.contains(range) {
                all_ranges.push(*range);
            }
        }
        Self {
            job_id,
            host_id,
            table,
            token_map_hash,
            all_ranges,
            repaired,
            status,
            cluster_wide,
            started_at_ms,
            completed_at_ms,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn host_id(&self) -> NodeId {
        self.host_id
    }

    pub fn table(&self) -> &TableReference {
        &self.table
    }

    pub fn token_map_hash(&self) -> i64 {
        self.token_map_hash
    }

    pub fn status(&self) -> RepairStatus {
        self.status
    }

    pub fn is_cluster_wide(&self) -> bool {
        self.cluster_wide
    }

    pub fn started_at_ms(&self) -> i64 {
        self.started_at_ms
    }

    pub fn completed_at_ms(&self) -> Option<i64> {
        self.completed_at_ms
    }

    /// Every range this host owns for the job, in insertion order.
    pub fn all_ranges(&self) -> &[TokenRange] {
        &self.all_ranges
    }

    /// Completion time of one range, if it has been repaired.
    pub fn repaired_at(&self, range: &TokenRange) -> Option<i64> {
        self.repaired.get(range).copied()
    }

    pub fn repaired_count(&self) -> usize {
        self.repaired.len()
    }

    /// Owned ranges still waiting for repair, in insertion order.
    pub fn remaining_ranges(&self) -> Vec<TokenRange> {
        self.all_ranges
            .iter()
            .filter(|range| !self.repaired.contains_key(range))
            .copied()
            .collect()
    }

    /// Record one repaired range. Idempotent: repeating a range keeps the
    /// first completion time. Rejected for unknown ranges and once the job
    /// is terminal.
    pub fn mark_range_finished(&mut self, range: TokenRange, repaired_at_ms: i64) -> Result<()> {
        if self.status.is_terminal() {
            return Err(DomainError::TerminalJob {
                job_id: self.job_id.to_string(),
                status: self.status.to_string(),
            });
        }
        if !self.all_ranges.contains(&range) {
            return Err(DomainError::RangeNotOwned {
                job_id: self.job_id.to_string(),
                range: range.to_string(),
            });
        }
        self.repaired.entry(range).or_insert(repaired_at_ms);
        Ok(())
    }

    /// Transition `started -> finished`. Requires an empty remainder.
    pub fn finish(&mut self, completed_at_ms: i64) -> Result<()> {
        if self.status != RepairStatus::Started {
            return Err(DomainError::InvalidStatusTransition {
                from: self.status.to_string(),
                to: RepairStatus::Finished.to_string(),
            });
        }
        let remaining = self.remaining_ranges().len();
        if remaining > 0 {
            return Err(DomainError::IncompleteJob {
                job_id: self.job_id.to_string(),
                remaining,
            });
        }
        self.status = RepairStatus::Finished;
        self.completed_at_ms = Some(completed_at_ms);
        Ok(())
    }

    /// Transition any non-terminal state to `failed`.
    pub fn fail(&mut self, completed_at_ms: i64) -> Result<()> {
        if self.status.is_terminal() {
            return Err(DomainError::InvalidStatusTransition {
                from: self.status.to_string(),
                to: RepairStatus::Failed.to_string(),
            });
        }
        self.status = RepairStatus::Failed;
        self.completed_at_ms = Some(completed_at_ms);
        Ok(())
    }

    /// True when the live topology hash no longer matches the hash the job
    /// was created against. Such a job must fail without running further
    /// ranges.
    pub fn has_lost_ownership(&self, current_token_map_hash: i64) -> bool {
        current_token_map_hash != self.token_map_hash
    }

    /// Fraction of owned ranges repaired, in `[0, 1]`. A job with no owned
    /// ranges has nothing left to do and reports 1.0.
    pub fn completed_ratio(&self) -> f64 {
        if self.all_ranges.is_empty() {
            return 1.0;
        }
        self.repaired.len() as f64 / self.all_ranges.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn job_with_ranges(ranges: &[(i64, i64)]) -> OngoingJob {
        OngoingJob::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            TableReference::new("ks", "t", Uuid::new_v4()),
            17,
            ranges.iter().map(|&(s, e)| TokenRange::new(s, e)).collect(),
            false,
            1000,
        )
    }

    #[test]
    fn test_lifecycle_to_finished() {
        let mut job = job_with_ranges(&[(0, 10), (10, 20)]);
        assert_eq!(job.status(), RepairStatus::Started);
        assert_eq!(job.remaining_ranges().len(), 2);

        job.mark_range_finished(TokenRange::new(0, 10), 2000).unwrap();
        assert_eq!(job.remaining_ranges(), vec![TokenRange::new(10, 20)]);
        assert!(job.finish(2500).is_err(), "finish with a remainder must fail");

        job.mark_range_finished(TokenRange::new(10, 20), 3000).unwrap();
        job.finish(3500).unwrap();
        assert_eq!(job.status(), RepairStatus::Finished);
        assert_eq!(job.completed_at_ms(), Some(3500));
        assert!((job.completed_ratio() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_mark_range_is_idempotent() {
        let mut job = job_with_ranges(&[(0, 10), (10, 20)]);
        job.mark_range_finished(TokenRange::new(0, 10), 2000).unwrap();
        job.mark_range_finished(TokenRange::new(0, 10), 9999).unwrap();

        assert_eq!(job.repaired_count(), 1);
        // first completion time wins
        assert_eq!(job.repaired_at(&TokenRange::new(0, 10)), Some(2000));
    }

    #[test]
    fn test_unknown_range_rejected() {
        let mut job = job_with_ranges(&[(0, 10)]);
        let err = job.mark_range_finished(TokenRange::new(50, 60), 2000);
        assert!(matches!(err, Err(DomainError::RangeNotOwned { .. })));
    }

    #[test]
    fn test_terminal_states_freeze_everything() {
        let mut job = job_with_ranges(&[(0, 10)]);
        job.mark_range_finished(TokenRange::new(0, 10), 2000).unwrap();
        job.finish(3000).unwrap();

        assert!(job.mark_range_finished(TokenRange::new(0, 10), 4000).is_err());
        assert!(job.fail(4000).is_err());
        assert!(job.finish(4000).is_err());
        assert_eq!(job.completed_at_ms(), Some(3000));

        let mut failed = job_with_ranges(&[(0, 10)]);
        failed.fail(2000).unwrap();
        assert!(failed.mark_range_finished(TokenRange::new(0, 10), 3000).is_err());
        assert!(failed.fail(3000).is_err());
        assert_eq!(failed.completed_at_ms(), Some(2000));
    }

    #[test]
    fn test_fail_keeps_partial_ratio() {
        let mut job = job_with_ranges(&[(0, 10), (10, 20)]);
        job.mark_range_finished(TokenRange::new(0, 10), 2000).unwrap();
        job.fail(3000).unwrap();

        assert_eq!(job.status(), RepairStatus::Failed);
        assert!((job.completed_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ownership_check() {
        let job = job_with_ranges(&[(0, 10)]);
        assert!(!job.has_lost_ownership(17));
        assert!(job.has_lost_ownership(18));
    }

    #[test]
    fn test_hydrate_skips_completed_ranges() {
        let table = TableReference::new("ks", "t", Uuid::new_v4());
        let mut repaired = HashMap::new();
        repaired.insert(TokenRange::new(0, 10), 1500i64);

        let job = OngoingJob::hydrate(
            Uuid::new_v4(),
            Uuid::new_v4(),
            table,
            17,
            vec![TokenRange::new(0, 10), TokenRange::new(10, 20)],
            repaired,
            RepairStatus::Started,
            false,
            1000,
            None,
        );

        assert_eq!(job.remaining_ranges(), vec![TokenRange::new(10, 20)]);
        assert!((job.completed_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_hydrate_keeps_orphaned_completions_visible() {
        let table = TableReference::new("ks", "t", Uuid::new_v4());
        let mut repaired = HashMap::new();
        repaired.insert(TokenRange::new(90, 100), 1500i64);

        let job = OngoingJob::hydrate(
            Uuid::new_v4(),
            Uuid::new_v4(),
            table,
            17,
            vec![TokenRange::new(0, 10)],
            repaired,
            RepairStatus::Started,
            false,
            1000,
            None,
        );

        // the repaired set stays a subset of the owned ranges
        assert_eq!(job.all_ranges().len(), 2);
        assert_eq!(job.remaining_ranges(), vec![TokenRange::new(0, 10)]);
    }

    #[test]
    fn test_empty_range_set_is_complete() {
        let mut job = job_with_ranges(&[]);
        assert!((job.completed_ratio() - 1.0).abs() < f64::EPSILON);
        job.finish(2000).unwrap();
        assert_eq!(job.status(), RepairStatus::Finished);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [RepairStatus::Started, RepairStatus::Finished, RepairStatus::Failed] {
            assert_eq!(RepairStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(RepairStatus::parse("bogus").is_err());
    }
}
