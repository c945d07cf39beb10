// Replication State Port - token ranges, replica sets and the topology fingerprint

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::{NodeId, TableReference, TokenRange};
use crate::error::{AppError, Result};

/// Read-only oracle over the cluster's range -> replica mapping.
///
/// The mapping may be recomputed between calls; callers must not assume it
/// is stable. `token_map_hash` changes exactly when ring membership or
/// ownership changes for the table, which is what lets a parked job detect
/// that its range set is no longer valid.
#[async_trait]
pub trait ReplicationState: Send + Sync {
    /// True when the keyspace/table pair exists in the live schema.
    async fn table_exists(&self, table: &TableReference) -> Result<bool>;

    /// Token ranges replicated by the given node, in ring order.
    async fn ranges_for_node(&self, table: &TableReference, node: NodeId)
        -> Result<Vec<TokenRange>>;

    /// Replica set of one range.
    async fn replicas(&self, table: &TableReference, range: &TokenRange) -> Result<Vec<NodeId>>;

    /// Datacenters hosting replicas of one range (for datacenter-level locks).
    async fn datacenters(&self, table: &TableReference, range: &TokenRange) -> Result<Vec<String>>;

    /// All nodes participating in replication of the table.
    async fn nodes(&self, table: &TableReference) -> Result<Vec<NodeId>>;

    /// Fingerprint of the full range -> replicas mapping.
    async fn token_map_hash(&self, table: &TableReference) -> Result<i64>;
}

/// One vnode and its replica nodes in a topology description.
#[derive(Debug, Clone, Deserialize)]
pub struct RangeAssignment {
    pub range: TokenRange,
    pub replicas: Vec<NodeId>,
}

/// A node entry in a topology description.
#[derive(Debug, Clone, Deserialize)]
pub struct TopologyNode {
    pub id: NodeId,
    pub datacenter: String,
}

/// A replicated table in a topology description.
#[derive(Debug, Clone, Deserialize)]
pub struct TableTopology {
    pub keyspace: String,
    pub table: String,
    pub id: Uuid,
    pub ranges: Vec<RangeAssignment>,
}

/// Full topology description, loadable from JSON by the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Topology {
    pub nodes: Vec<TopologyNode>,
    pub tables: Vec<TableTopology>,
}

struct StaticState {
    datacenter_by_node: HashMap<NodeId, String>,
    assignments_by_table: HashMap<Uuid, Vec<RangeAssignment>>,
}

/// Oracle over an explicit topology description.
///
/// Production deployments feed it the cluster metadata snapshot the daemon
/// was started with; tests mutate it in place to simulate topology changes.
pub struct StaticReplicationState {
    state: RwLock<StaticState>,
}

impl StaticReplicationState {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StaticState {
                datacenter_by_node: HashMap::new(),
                assignments_by_table: HashMap::new(),
            }),
        }
    }

    pub fn from_topology(topology: Topology) -> Self {
        let state = Self::new();
        for node in topology.nodes {
            state.add_node(node.id, node.datacenter);
        }
        for table in topology.tables {
            state.set_table(
                &TableReference::new(table.keyspace, table.table, table.id),
                table.ranges,
            );
        }
        state
    }

    pub fn add_node(&self, node: NodeId, datacenter: impl Into<String>) {
        self.write().datacenter_by_node.insert(node, datacenter.into());
    }

    /// Register or replace a table's range assignments. Replacing the
    /// assignments changes the table's token-map hash.
    pub fn set_table(&self, table: &TableReference, assignments: Vec<RangeAssignment>) {
        self.write()
            .assignments_by_table
            .insert(table.id(), assignments);
    }

    pub fn remove_table(&self, table: &TableReference) {
        self.write().assignments_by_table.remove(&table.id());
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StaticState> {
        self.state.read().expect("topology state lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StaticState> {
        self.state.write().expect("topology state lock poisoned")
    }

    fn assignments(&self, table: &TableReference) -> Result<Vec<RangeAssignment>> {
        self.read()
            .assignments_by_table
            .get(&table.id())
            .cloned()
            .ok_or_else(|| AppError::InvalidInput(format!("keyspace/table does not exist: {table}")))
    }
}

impl Default for StaticReplicationState {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical fingerprint of a range -> replicas mapping. Assignment order
/// and replica order do not affect the digest.
fn hash_assignments(assignments: &[RangeAssignment]) -> i64 {
    let mut ordered: Vec<(TokenRange, Vec<NodeId>)> = assignments
        .iter()
        .map(|a| {
            let mut replicas = a.replicas.clone();
            replicas.sort();
            (a.range, replicas)
        })
        .collect();
    ordered.sort_by_key(|(range, _)| (range.start, range.end));

    let mut hasher = Sha256::new();
    for (range, replicas) in &ordered {
        hasher.update(range.start.to_be_bytes());
        hasher.update(range.end.to_be_bytes());
        for replica in replicas {
            hasher.update(replica.as_bytes());
        }
    }
    let digest = hasher.finalize();
    i64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

#[async_trait]
impl ReplicationState for StaticReplicationState {
    async fn table_exists(&self, table: &TableReference) -> Result<bool> {
        Ok(self.read().assignments_by_table.contains_key(&table.id()))
    }

    async fn ranges_for_node(
        &self,
        table: &TableReference,
        node: NodeId,
    ) -> Result<Vec<TokenRange>> {
        Ok(self
            .assignments(table)?
            .iter()
            .filter(|a| a.replicas.contains(&node))
            .map(|a| a.range)
            .collect())
    }

    async fn replicas(&self, table: &TableReference, range: &TokenRange) -> Result<Vec<NodeId>> {
        Ok(self
            .assignments(table)?
            .iter()
            .find(|a| a.range == *range)
            .map(|a| a.replicas.clone())
            .unwrap_or_default())
    }

    async fn datacenters(
        &self,
        table: &TableReference,
        range: &TokenRange,
    ) -> Result<Vec<String>> {
        let replicas = self.replicas(table, range).await?;
        let state = self.read();
        let mut datacenters: Vec<String> = replicas
            .iter()
            .filter_map(|node| state.datacenter_by_node.get(node).cloned())
            .collect();
        datacenters.sort();
        datacenters.dedup();
        Ok(datacenters)
    }

    async fn nodes(&self, table: &TableReference) -> Result<Vec<NodeId>> {
        let mut nodes: Vec<NodeId> = self
            .assignments(table)?
            .iter()
            .flat_map(|a| a.replicas.iter().copied())
            .collect();
        nodes.sort();
        nodes.dedup();
        Ok(nodes)
    }

    async fn token_map_hash(&self, table: &TableReference) -> Result<i64> {
        Ok(hash_assignments(&self.assignments(table)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableReference {
        TableReference::new("ks", "t", Uuid::new_v4())
    }

    fn assignment(start: i64, end: i64, replicas: Vec<NodeId>) -> RangeAssignment {
        RangeAssignment {
            range: TokenRange::new(start, end),
            replicas,
        }
    }

    #[tokio::test]
    async fn test_table_existence() {
        let oracle = StaticReplicationState::new();
        let known = table();
        oracle.set_table(&known, vec![]);

        assert!(oracle.table_exists(&known).await.unwrap());
        assert!(!oracle.table_exists(&table()).await.unwrap());
    }

    #[tokio::test]
    async fn test_ranges_for_node_filters_by_replica() {
        let oracle = StaticReplicationState::new();
        let t = table();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        oracle.set_table(
            &t,
            vec![
                assignment(0, 10, vec![a, b]),
                assignment(10, 20, vec![b]),
            ],
        );

        assert_eq!(
            oracle.ranges_for_node(&t, a).await.unwrap(),
            vec![TokenRange::new(0, 10)]
        );
        assert_eq!(oracle.ranges_for_node(&t, b).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_hash_is_stable_and_order_insensitive() {
        let oracle = StaticReplicationState::new();
        let t = table();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        oracle.set_table(
            &t,
            vec![assignment(0, 10, vec![a, b]), assignment(10, 20, vec![b])],
        );
        let first = oracle.token_map_hash(&t).await.unwrap();
        assert_eq!(first, oracle.token_map_hash(&t).await.unwrap());

        // same mapping, different declaration order
        oracle.set_table(
            &t,
            vec![assignment(10, 20, vec![b]), assignment(0, 10, vec![b, a])],
        );
        assert_eq!(first, oracle.token_map_hash(&t).await.unwrap());
    }

    #[tokio::test]
    async fn test_hash_changes_with_ownership() {
        let oracle = StaticReplicationState::new();
        let t = table();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        oracle.set_table(&t, vec![assignment(0, 10, vec![a])]);
        let before = oracle.token_map_hash(&t).await.unwrap();

        oracle.set_table(&t, vec![assignment(0, 10, vec![b])]);
        let after = oracle.token_map_hash(&t).await.unwrap();

        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_datacenters_deduplicated() {
        let oracle = StaticReplicationState::new();
        let t = table();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        oracle.add_node(a, "dc1");
        oracle.add_node(b, "dc1");
        oracle.add_node(c, "dc2");
        oracle.set_table(&t, vec![assignment(0, 10, vec![a, b, c])]);

        assert_eq!(
            oracle.datacenters(&t, &TokenRange::new(0, 10)).await.unwrap(),
            vec!["dc1".to_string(), "dc2".to_string()]
        );
    }
}
