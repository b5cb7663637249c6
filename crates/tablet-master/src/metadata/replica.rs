//! Table replica definitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{ReplicaId, TableId, TabletId, Timestamp};

/// Replica state; also used for the per-tablet replica entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaState {
    None,
    Disabled,
    Disabling,
    Enabled,
}

impl Default for ReplicaState {
    fn default() -> Self {
        Self::None
    }
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaState::None => write!(f, "none"),
            ReplicaState::Disabled => write!(f, "disabled"),
            ReplicaState::Disabling => write!(f, "disabling"),
            ReplicaState::Enabled => write!(f, "enabled"),
        }
    }
}

/// Replication mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaMode {
    Sync,
    Async,
}

impl Default for ReplicaMode {
    fn default() -> Self {
        Self::Async
    }
}

impl std::fmt::Display for ReplicaMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaMode::Sync => write!(f, "sync"),
            ReplicaMode::Async => write!(f, "async"),
        }
    }
}

/// Asynchronous replication target of a replicated table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableReplica {
    pub id: ReplicaId,
    pub table_id: TableId,
    pub cluster_name: String,
    pub replica_path: String,
    pub mode: ReplicaMode,
    pub start_replication_timestamp: Timestamp,
    pub state: ReplicaState,
    /// Tablets that have not yet confirmed disablement
    #[serde(default)]
    pub disabling_tablets: BTreeSet<TabletId>,
}

impl TableReplica {
    pub fn new(
        id: ReplicaId,
        table_id: TableId,
        cluster_name: String,
        replica_path: String,
        start_replication_timestamp: Timestamp,
        mode: ReplicaMode,
    ) -> Self {
        Self {
            id,
            table_id,
            cluster_name,
            replica_path,
            mode,
            start_replication_timestamp,
            state: ReplicaState::Disabled,
            disabling_tablets: BTreeSet::new(),
        }
    }
}
