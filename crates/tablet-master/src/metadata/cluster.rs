//! Cluster metadata
//!
//! Owns every entity of the control plane in id-keyed arenas. Back references
//! between entities are plain ids resolved through these maps. Secondary
//! indexes are not persisted; they are rebuilt from the primary maps on load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

use super::{
    ActionId, BundleId, CellId, ChunkCatalog, IdGenerator, NodeAddress, NodeInfo, NodeState,
    PeerId, ReplicaId, Table, TableId, TableReplica, Tablet, TabletAction, TabletCell,
    TabletCellBundle, TabletId,
};
use crate::error::{Error, Result};

/// Current snapshot schema version
pub const SNAPSHOT_VERSION: u32 = 3;

/// First version persisting `Tablet::expected_state`
const VERSION_EXPECTED_STATE: u32 = 2;
/// First version persisting action retention and source cells
const VERSION_ACTION_RETENTION: u32 = 3;

/// Retention assumed for finished actions loaded from old snapshots
const LEGACY_ACTION_EXPIRATION_SECS: u64 = 600;

/// Cluster metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMetadata {
    /// Cluster name
    pub name: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// Logical clock; mount revisions are taken from it
    pub revision: u64,
    pub id_generator: IdGenerator,
    pub nodes: BTreeMap<NodeAddress, NodeInfo>,
    pub bundles: BTreeMap<BundleId, TabletCellBundle>,
    pub cells: BTreeMap<CellId, TabletCell>,
    pub tables: BTreeMap<TableId, Table>,
    pub tablets: BTreeMap<TabletId, Tablet>,
    pub replicas: BTreeMap<ReplicaId, TableReplica>,
    pub actions: BTreeMap<ActionId, TabletAction>,
    pub chunks: ChunkCatalog,

    #[serde(skip)]
    bundles_by_name: BTreeMap<String, BundleId>,
    #[serde(skip)]
    tables_by_path: BTreeMap<String, TableId>,
    #[serde(skip)]
    peers_by_address: BTreeMap<NodeAddress, BTreeSet<(CellId, PeerId)>>,
}

impl ClusterMetadata {
    /// Create empty cluster
    pub fn new(name: String, now: DateTime<Utc>) -> Self {
        Self {
            name,
            created_at: now,
            updated_at: now,
            revision: 0,
            id_generator: IdGenerator::new(),
            nodes: BTreeMap::new(),
            bundles: BTreeMap::new(),
            cells: BTreeMap::new(),
            tables: BTreeMap::new(),
            tablets: BTreeMap::new(),
            replicas: BTreeMap::new(),
            actions: BTreeMap::new(),
            chunks: ChunkCatalog::new(),
            bundles_by_name: BTreeMap::new(),
            tables_by_path: BTreeMap::new(),
            peers_by_address: BTreeMap::new(),
        }
    }

    /// Load metadata persisted by the given schema version
    pub fn load(value: serde_json::Value, version: u32) -> std::result::Result<Self, serde_json::Error> {
        let mut metadata: ClusterMetadata = serde_json::from_value(value)?;

        if version < VERSION_EXPECTED_STATE {
            for tablet in metadata.tablets.values_mut() {
                tablet.expected_state = tablet.state;
            }
        }

        if version < VERSION_ACTION_RETENTION {
            for action in metadata.actions.values_mut() {
                action.expiration_timeout_secs = LEGACY_ACTION_EXPIRATION_SECS;
                action.source_cells = action
                    .tablets
                    .iter()
                    .filter_map(|id| {
                        let cell = metadata.tablets.get(id)?.cell?;
                        Some((*id, cell))
                    })
                    .collect();
            }
        }

        metadata.rebuild_indexes();
        Ok(metadata)
    }

    /// Rebuild secondary indexes from primary state
    pub fn rebuild_indexes(&mut self) {
        self.bundles_by_name = self
            .bundles
            .values()
            .map(|b| (b.name.clone(), b.id))
            .collect();
        self.tables_by_path = self
            .tables
            .values()
            .map(|t| (t.path.clone(), t.id))
            .collect();
        self.peers_by_address.clear();
        for cell in self.cells.values() {
            for (peer_id, peer) in cell.peers.iter().enumerate() {
                if let Some(address) = &peer.address {
                    self.peers_by_address
                        .entry(address.clone())
                        .or_default()
                        .insert((cell.id, peer_id));
                }
            }
        }
        info!(
            "Rebuilt indexes: {} bundles, {} tables, {} addresses",
            self.bundles_by_name.len(),
            self.tables_by_path.len(),
            self.peers_by_address.len()
        );
    }

    /// Mark as updated
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    /// Advance the logical clock and return the new mount revision
    pub fn next_mount_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    // ==================== lookups ====================

    pub fn tablet(&self, id: TabletId) -> Result<&Tablet> {
        self.tablets.get(&id).ok_or_else(|| Error::no_such("tablet", id))
    }

    pub fn tablet_mut(&mut self, id: TabletId) -> Result<&mut Tablet> {
        self.tablets.get_mut(&id).ok_or_else(|| Error::no_such("tablet", id))
    }

    pub fn cell(&self, id: CellId) -> Result<&TabletCell> {
        self.cells.get(&id).ok_or_else(|| Error::no_such("tablet cell", id))
    }

    pub fn cell_mut(&mut self, id: CellId) -> Result<&mut TabletCell> {
        self.cells
            .get_mut(&id)
            .ok_or_else(|| Error::no_such("tablet cell", id))
    }

    pub fn bundle(&self, id: BundleId) -> Result<&TabletCellBundle> {
        self.bundles
            .get(&id)
            .ok_or_else(|| Error::no_such("tablet cell bundle", id))
    }

    pub fn bundle_mut(&mut self, id: BundleId) -> Result<&mut TabletCellBundle> {
        self.bundles
            .get_mut(&id)
            .ok_or_else(|| Error::no_such("tablet cell bundle", id))
    }

    pub fn table(&self, id: TableId) -> Result<&Table> {
        self.tables.get(&id).ok_or_else(|| Error::no_such("table", id))
    }

    pub fn table_mut(&mut self, id: TableId) -> Result<&mut Table> {
        self.tables.get_mut(&id).ok_or_else(|| Error::no_such("table", id))
    }

    pub fn replica(&self, id: ReplicaId) -> Result<&TableReplica> {
        self.replicas
            .get(&id)
            .ok_or_else(|| Error::no_such("table replica", id))
    }

    pub fn replica_mut(&mut self, id: ReplicaId) -> Result<&mut TableReplica> {
        self.replicas
            .get_mut(&id)
            .ok_or_else(|| Error::no_such("table replica", id))
    }

    pub fn action(&self, id: ActionId) -> Result<&TabletAction> {
        self.actions
            .get(&id)
            .ok_or_else(|| Error::no_such("tablet action", id))
    }

    pub fn action_mut(&mut self, id: ActionId) -> Result<&mut TabletAction> {
        self.actions
            .get_mut(&id)
            .ok_or_else(|| Error::no_such("tablet action", id))
    }

    // ==================== indexes ====================

    pub fn find_bundle_by_name(&self, name: &str) -> Option<BundleId> {
        self.bundles_by_name.get(name).copied()
    }

    pub fn bundle_by_name(&self, name: &str) -> Result<&TabletCellBundle> {
        let id = self
            .find_bundle_by_name(name)
            .ok_or_else(|| Error::no_such("tablet cell bundle", name))?;
        self.bundle(id)
    }

    pub fn index_bundle(&mut self, name: String, id: BundleId) {
        self.bundles_by_name.insert(name, id);
    }

    pub fn unindex_bundle(&mut self, name: &str) {
        self.bundles_by_name.remove(name);
    }

    pub fn find_table_by_path(&self, path: &str) -> Option<TableId> {
        self.tables_by_path.get(path).copied()
    }

    /// Resolve a table path
    pub fn resolve_table(&self, path: &str) -> Result<TableId> {
        self.find_table_by_path(path)
            .ok_or_else(|| Error::no_such("table", path))
    }

    pub fn index_table(&mut self, path: String, id: TableId) {
        self.tables_by_path.insert(path, id);
    }

    pub fn unindex_table(&mut self, path: &str) {
        self.tables_by_path.remove(path);
    }

    /// Peers assigned to a node
    pub fn peers_at(&self, address: &str) -> impl Iterator<Item = (CellId, PeerId)> + '_ {
        self.peers_by_address
            .get(address)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    /// Number of peer slots in use on a node
    pub fn used_slots(&self, address: &str) -> usize {
        self.peers_by_address
            .get(address)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    pub fn index_peer(&mut self, address: NodeAddress, cell_id: CellId, peer_id: PeerId) {
        self.peers_by_address
            .entry(address)
            .or_default()
            .insert((cell_id, peer_id));
    }

    pub fn unindex_peer(&mut self, address: &str, cell_id: CellId, peer_id: PeerId) {
        if let Some(set) = self.peers_by_address.get_mut(address) {
            set.remove(&(cell_id, peer_id));
            if set.is_empty() {
                self.peers_by_address.remove(address);
            }
        }
    }

    /// Number of online nodes
    pub fn online_node_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.state == NodeState::Online)
            .count()
    }

    /// Get cluster statistics
    pub fn stats(&self) -> ClusterStats {
        ClusterStats {
            node_count: self.nodes.len(),
            online_node_count: self.online_node_count(),
            bundle_count: self.bundles.len(),
            cell_count: self.cells.len(),
            healthy_cell_count: self
                .cells
                .values()
                .filter(|c| c.health() == super::CellHealth::Good)
                .count(),
            table_count: self.tables.len(),
            tablet_count: self.tablets.len(),
            mounted_tablet_count: self
                .tablets
                .values()
                .filter(|t| t.state.is_active())
                .count(),
            action_count: self.actions.len(),
            replica_count: self.replicas.len(),
        }
    }
}

/// Cluster statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStats {
    pub node_count: usize,
    pub online_node_count: usize,
    pub bundle_count: usize,
    pub cell_count: usize,
    pub healthy_cell_count: usize,
    pub table_count: usize,
    pub tablet_count: usize,
    pub mounted_tablet_count: usize,
    pub action_count: usize,
    pub replica_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{BundleOptions, TabletState};

    #[test]
    fn test_load_rebuilds_indexes() {
        let now = Utc::now();
        let mut metadata = ClusterMetadata::new("test".to_string(), now);
        let bundle_id: BundleId = metadata.id_generator.generate();
        metadata.bundles.insert(
            bundle_id,
            TabletCellBundle::new(bundle_id, "default".to_string(), BundleOptions::default()),
        );
        let cell_id: CellId = metadata.id_generator.generate();
        let mut cell = TabletCell::new(cell_id, bundle_id, 2);
        cell.peers[1].address = Some("n1:9012".to_string());
        metadata.cells.insert(cell_id, cell);

        let value = serde_json::to_value(&metadata).unwrap();
        let loaded = ClusterMetadata::load(value, SNAPSHOT_VERSION).unwrap();

        assert_eq!(loaded.find_bundle_by_name("default"), Some(bundle_id));
        assert_eq!(loaded.used_slots("n1:9012"), 1);
        assert_eq!(loaded.peers_at("n1:9012").collect::<Vec<_>>(), vec![(cell_id, 1)]);
    }

    #[test]
    fn test_load_old_version_defaults_expected_state() {
        let now = Utc::now();
        let mut metadata = ClusterMetadata::new("test".to_string(), now);
        let tablet_id: TabletId = metadata.id_generator.generate();
        let mut tablet = Tablet::new(tablet_id, TableId(100), 0);
        tablet.state = TabletState::Frozen;
        metadata.tablets.insert(tablet_id, tablet);

        let mut value = serde_json::to_value(&metadata).unwrap();
        value["tablets"][tablet_id.0.to_string()]
            .as_object_mut()
            .unwrap()
            .remove("expected_state");

        let loaded = ClusterMetadata::load(value, 1).unwrap();
        assert_eq!(loaded.tablets[&tablet_id].expected_state, TabletState::Frozen);
    }

    #[test]
    fn test_mount_revisions_increase() {
        let mut metadata = ClusterMetadata::new("test".to_string(), Utc::now());
        let first = metadata.next_mount_revision();
        let second = metadata.next_mount_revision();
        assert!(second > first);
    }
}
