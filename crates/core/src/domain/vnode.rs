// Virtual node state for the reporting views

use serde::Serialize;

use super::token::{NodeId, TokenRange};

/// Snapshot of a single vnode: the range, who replicates it, and when it
/// was last repaired. `repaired` derives from the timestamp against the
/// caller-supplied threshold.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VnodeState {
    pub start_token: i64,
    pub end_token: i64,
    pub replicas: Vec<NodeId>,
    pub last_repaired_at_in_ms: i64,
    pub repaired: bool,
}

impl VnodeState {
    pub fn new(
        range: TokenRange,
        replicas: Vec<NodeId>,
        last_repaired_at_in_ms: i64,
        repaired_threshold_ms: i64,
    ) -> Self {
        Self {
            start_token: range.start,
            end_token: range.end,
            replicas,
            last_repaired_at_in_ms,
            repaired: last_repaired_at_in_ms > repaired_threshold_ms,
        }
    }
}
