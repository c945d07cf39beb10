// View construction - job snapshots joined with the oracle's replica map

use std::collections::HashMap;

use tracing::debug;

use crate::domain::{NodeId, OnDemandRepairJobView, OngoingJob, TokenRange};
use crate::port::ReplicationState;

/// Materialize the reporting view for one job facet.
///
/// Reporting is best-effort about replica sets: a range the oracle can no
/// longer resolve (table dropped, topology moved on) shows an empty replica
/// list rather than failing the whole read.
pub async fn job_view(job: &OngoingJob, replication: &dyn ReplicationState) -> OnDemandRepairJobView {
    let mut replicas_by_range: HashMap<TokenRange, Vec<NodeId>> = HashMap::new();
    for range in job.all_ranges() {
        match replication.replicas(job.table(), range).await {
            Ok(replicas) => {
                replicas_by_range.insert(*range, replicas);
            }
            Err(e) => {
                debug!(
                    job_id = %job.job_id(),
                    range = %range,
                    error = %e,
                    "Replica lookup failed while building view"
                );
            }
        }
    }
    OnDemandRepairJobView::from_job(job, &replicas_by_range)
}
