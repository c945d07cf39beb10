// Replicated table identity

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a replicated table.
///
/// Two references denote the same table iff their stable table ids match;
/// keyspace and table names are carried for display and lock keys. A table
/// dropped and re-created under the same name gets a new id and is a
/// different table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableReference {
    keyspace: String,
    table: String,
    id: Uuid,
}

impl TableReference {
    pub fn new(keyspace: impl Into<String>, table: impl Into<String>, id: Uuid) -> Self {
        Self {
            keyspace: keyspace.into(),
            table: table.into(),
            id,
        }
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl PartialEq for TableReference {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TableReference {}

impl std::hash::Hash for TableReference {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for TableReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.keyspace, self.table)
    }
}
