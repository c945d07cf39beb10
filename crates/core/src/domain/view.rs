// Reporting views - immutable snapshots handed to the outside world

use std::collections::HashMap;

use serde::Serialize;

use super::job::{JobId, OngoingJob, RepairStatus};
use super::token::{NodeId, TokenRange};
use super::vnode::VnodeState;

/// Timestamp reported for a vnode that has not been repaired by this job.
const NEVER_REPAIRED_MS: i64 = -1;

/// Immutable report of a single on-demand repair job facet.
///
/// A view is a snapshot: concurrent mutation of the underlying job does not
/// affect an already-returned view. Serializes to the shape the REST layer
/// exposes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnDemandRepairJobView {
    pub id: JobId,
    pub host_id: NodeId,
    pub keyspace: String,
    pub table: String,
    pub status: RepairStatus,
    pub completed_ratio: f64,
    pub start_time_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_time_ms: Option<i64>,
    pub virtual_nodes: Vec<VnodeState>,
}

impl OnDemandRepairJobView {
    /// Pure function of a job snapshot plus the oracle-derived replica map.
    pub fn from_job(
        job: &OngoingJob,
        replicas_by_range: &HashMap<TokenRange, Vec<NodeId>>,
    ) -> Self {
        let virtual_nodes = job
            .all_ranges()
            .iter()
            .map(|range| {
                let replicas = replicas_by_range.get(range).cloned().unwrap_or_default();
                let last_repaired = job.repaired_at(range).unwrap_or(NEVER_REPAIRED_MS);
                VnodeState::new(*range, replicas, last_repaired, 0)
            })
            .collect();

        Self {
            id: job.job_id(),
            host_id: job.host_id(),
            keyspace: job.table().keyspace().to_string(),
            table: job.table().table().to_string(),
            status: job.status(),
            completed_ratio: job.completed_ratio(),
            start_time_ms: job.started_at_ms(),
            completed_time_ms: job.completed_at_ms(),
            virtual_nodes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TableReference;
    use uuid::Uuid;

    #[test]
    fn test_view_is_a_snapshot() {
        let table = TableReference::new("ks", "t", Uuid::new_v4());
        let mut job = OngoingJob::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            table,
            1,
            vec![TokenRange::new(0, 10), TokenRange::new(10, 20)],
            false,
            1000,
        );
        job.mark_range_finished(TokenRange::new(0, 10), 2000).unwrap();

        let view = OnDemandRepairJobView::from_job(&job, &HashMap::new());

        // mutate after the view was taken
        job.mark_range_finished(TokenRange::new(10, 20), 3000).unwrap();
        job.finish(3000).unwrap();

        assert_eq!(view.status, RepairStatus::Started);
        assert!((view.completed_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(view.virtual_nodes.len(), 2);
        assert!(view.virtual_nodes[0].repaired);
        assert!(!view.virtual_nodes[1].repaired);
    }

    #[test]
    fn test_view_serializes_to_rest_shape() {
        let node = Uuid::new_v4();
        let table = TableReference::new("ks", "t", Uuid::new_v4());
        let mut job = OngoingJob::new(
            Uuid::new_v4(),
            node,
            table,
            1,
            vec![TokenRange::new(0, 10)],
            false,
            1000,
        );
        job.mark_range_finished(TokenRange::new(0, 10), 2000).unwrap();
        job.finish(2500).unwrap();

        let mut replicas = HashMap::new();
        replicas.insert(TokenRange::new(0, 10), vec![node]);

        let json = serde_json::to_value(OnDemandRepairJobView::from_job(&job, &replicas)).unwrap();
        assert_eq!(json["status"], "finished");
        assert_eq!(json["keyspace"], "ks");
        assert_eq!(json["completedRatio"], 1.0);
        assert_eq!(json["startTimeMs"], 1000);
        assert_eq!(json["completedTimeMs"], 2500);
        assert_eq!(json["virtualNodes"][0]["startToken"], 0);
        assert_eq!(json["virtualNodes"][0]["endToken"], 10);
        assert_eq!(json["virtualNodes"][0]["lastRepairedAtInMs"], 2000);
        assert_eq!(json["virtualNodes"][0]["repaired"], true);
    }
}
