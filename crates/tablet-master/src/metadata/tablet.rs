//! Tablet definitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{AddAssign, SubAssign};

use super::{ActionId, CellId, PivotKey, ReplicaId, ReplicaState, TableId, TabletId, Timestamp};

/// Tablet state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TabletState {
    Mounting,
    Mounted,
    Unmounting,
    Unmounted,
    Freezing,
    Frozen,
    Unfreezing,
    FrozenMounting,
}

impl TabletState {
    /// Whether a tablet in this state is hosted by a cell
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TabletState::Mounting
                | TabletState::FrozenMounting
                | TabletState::Mounted
                | TabletState::Freezing
                | TabletState::Frozen
                | TabletState::Unfreezing
        )
    }
}

impl Default for TabletState {
    fn default() -> Self {
        Self::Unmounted
    }
}

impl std::fmt::Display for TabletState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TabletState::Mounting => write!(f, "mounting"),
            TabletState::Mounted => write!(f, "mounted"),
            TabletState::Unmounting => write!(f, "unmounting"),
            TabletState::Unmounted => write!(f, "unmounted"),
            TabletState::Freezing => write!(f, "freezing"),
            TabletState::Frozen => write!(f, "frozen"),
            TabletState::Unfreezing => write!(f, "unfreezing"),
            TabletState::FrozenMounting => write!(f, "frozen_mounting"),
        }
    }
}

/// In-memory mode of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InMemoryMode {
    None,
    Compressed,
    Uncompressed,
}

impl Default for InMemoryMode {
    fn default() -> Self {
        Self::None
    }
}

impl std::fmt::Display for InMemoryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InMemoryMode::None => write!(f, "none"),
            InMemoryMode::Compressed => write!(f, "compressed"),
            InMemoryMode::Uncompressed => write!(f, "uncompressed"),
        }
    }
}

/// Resource statistics of a tablet, or the sum over the tablets of a cell
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletStatistics {
    pub uncompressed_data_size: i64,
    pub compressed_data_size: i64,
    /// Resident size, depends on in-memory mode
    pub memory_size: i64,
    pub chunk_count: i64,
    pub row_count: i64,
    pub tablet_count: i64,
    #[serde(default)]
    pub tablet_count_per_memory_mode: BTreeMap<InMemoryMode, i64>,
}

impl TabletStatistics {
    /// Number of tablets counted with the given in-memory mode
    pub fn tablet_count_in_mode(&self, mode: InMemoryMode) -> i64 {
        self.tablet_count_per_memory_mode
            .get(&mode)
            .copied()
            .unwrap_or(0)
    }
}

impl AddAssign<&TabletStatistics> for TabletStatistics {
    fn add_assign(&mut self, other: &TabletStatistics) {
        self.uncompressed_data_size += other.uncompressed_data_size;
        self.compressed_data_size += other.compressed_data_size;
        self.memory_size += other.memory_size;
        self.chunk_count += other.chunk_count;
        self.row_count += other.row_count;
        self.tablet_count += other.tablet_count;
        for (mode, count) in &other.tablet_count_per_memory_mode {
            *self.tablet_count_per_memory_mode.entry(*mode).or_insert(0) += count;
        }
    }
}

impl SubAssign<&TabletStatistics> for TabletStatistics {
    fn sub_assign(&mut self, other: &TabletStatistics) {
        self.uncompressed_data_size -= other.uncompressed_data_size;
        self.compressed_data_size -= other.compressed_data_size;
        self.memory_size -= other.memory_size;
        self.chunk_count -= other.chunk_count;
        self.row_count -= other.row_count;
        self.tablet_count -= other.tablet_count;
        for (mode, count) in &other.tablet_count_per_memory_mode {
            let entry = self.tablet_count_per_memory_mode.entry(*mode).or_insert(0);
            *entry -= count;
            if *entry == 0 {
                self.tablet_count_per_memory_mode.remove(mode);
            }
        }
    }
}

/// Per-tablet state of one table replica
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableReplicaInfo {
    pub state: ReplicaState,
    pub current_replication_row_index: i64,
    pub current_replication_timestamp: Timestamp,
}

/// Tablet: one contiguous shard of a table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tablet {
    pub id: TabletId,
    pub table_id: TableId,
    /// Position within the table's tablet list
    pub index: usize,
    /// Lower bound key (sorted tables only, empty for ordered tables)
    #[serde(default)]
    pub pivot_key: PivotKey,
    pub state: TabletState,
    /// Last state set outside of a tablet action
    #[serde(default)]
    pub expected_state: TabletState,
    /// Minted at every mount; stale responses carry an older value
    pub mount_revision: u64,
    pub cell: Option<CellId>,
    /// Cell an unmount was sent to, until the unmount is confirmed
    #[serde(default)]
    pub unmounting_cell: Option<CellId>,
    pub action: Option<ActionId>,
    #[serde(default)]
    pub in_memory_mode: InMemoryMode,
    #[serde(default)]
    pub replicas: BTreeMap<ReplicaId, TableReplicaInfo>,
    #[serde(default)]
    pub trimmed_row_count: i64,
    #[serde(default)]
    pub retained_timestamp: Timestamp,
}

impl Tablet {
    pub fn new(id: TabletId, table_id: TableId, index: usize) -> Self {
        Self {
            id,
            table_id,
            index,
            pivot_key: PivotKey::new(),
            state: TabletState::Unmounted,
            expected_state: TabletState::Unmounted,
            mount_revision: 0,
            cell: None,
            unmounting_cell: None,
            action: None,
            in_memory_mode: InMemoryMode::None,
            replicas: BTreeMap::new(),
            trimmed_row_count: 0,
            retained_timestamp: 0,
        }
    }

    /// Set state; outside of an action the state is also the expected one
    pub fn set_state(&mut self, state: TabletState) {
        self.state = state;
        if self.action.is_none() {
            self.expected_state = state;
        }
    }

    /// Copy persistent attributes from another tablet (used by table cloning)
    pub fn copy_from(&mut self, other: &Tablet) {
        self.index = other.index;
        self.mount_revision = other.mount_revision;
        self.pivot_key = other.pivot_key.clone();
        self.in_memory_mode = other.in_memory_mode;
        self.trimmed_row_count = other.trimmed_row_count;
        self.retained_timestamp = other.retained_timestamp;
    }

    /// Check a notification's mount revision against the current one
    pub fn is_current_revision(&self, mount_revision: u64) -> bool {
        self.mount_revision == mount_revision
    }
}
