//! Node heartbeats and node administration

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use super::TabletManager;
use crate::error::{Error, Result};
use crate::metadata::{
    CellId, NodeAddress, NodeInfo, NodeState, PeerId, PeerState, TabletCell, TransactionId,
};

/// State of one tablet slot as reported by a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellSlotReport {
    pub cell_id: CellId,
    #[serde(default)]
    pub peer_id: Option<PeerId>,
    pub state: PeerState,
    #[serde(default)]
    pub config_version: u64,
}

/// Periodic report of a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHeartbeat {
    pub address: NodeAddress,
    pub total_slots: usize,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub cells: Vec<CellSlotReport>,
}

/// Everything a node needs to run one peer of a cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotAssignment {
    pub cell_id: CellId,
    pub peer_id: PeerId,
    pub config_version: u64,
    pub prerequisite_transaction: Option<TransactionId>,
    pub leading_peer_id: PeerId,
    /// Peer addresses by peer id
    pub peers: Vec<Option<NodeAddress>>,
}

/// Instructions returned to a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub slots_to_create: Vec<SlotAssignment>,
    pub slots_to_configure: Vec<SlotAssignment>,
    pub slots_to_remove: Vec<CellId>,
}

/// Administrative change to a node; absent fields stay unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUpdate {
    #[serde(default)]
    pub banned: Option<bool>,
    #[serde(default)]
    pub decommissioned: Option<bool>,
    #[serde(default)]
    pub disable_tablet_cells: Option<bool>,
    #[serde(default)]
    pub tags: Option<BTreeSet<String>>,
}

fn slot_assignment(cell: &TabletCell, peer_id: PeerId) -> SlotAssignment {
    SlotAssignment {
        cell_id: cell.id,
        peer_id,
        config_version: cell.config_version,
        prerequisite_transaction: cell.prerequisite_transaction,
        leading_peer_id: cell.leading_peer_id,
        peers: cell.peers.iter().map(|p| p.address.clone()).collect(),
    }
}

impl TabletManager {
    /// Reconcile the slots a node reports with the peers assigned to it
    pub fn process_heartbeat(&mut self, heartbeat: NodeHeartbeat) -> HeartbeatResponse {
        let now = self.now;
        let address = heartbeat.address;

        let node = self.metadata.nodes.entry(address.clone()).or_insert_with(|| {
            info!("New node registered: {}", address);
            NodeInfo::new(address.clone(), now)
        });
        if node.state == NodeState::Offline {
            info!("Node {} is online", address);
        }
        node.touch(now);
        node.total_slots = heartbeat.total_slots;
        node.tags = heartbeat.tags;

        let mut reported = BTreeSet::new();
        let mut response = HeartbeatResponse::default();

        for slot in heartbeat.cells {
            if slot.state == PeerState::None {
                continue;
            }
            let Some(cell) = self.metadata.cells.get_mut(&slot.cell_id) else {
                debug!("Node {} runs unknown cell {}, removing slot", address, slot.cell_id);
                response.slots_to_remove.push(slot.cell_id);
                continue;
            };
            let Some(peer_id) = cell.find_peer(&address) else {
                debug!("Node {} runs unexpected cell {}, removing slot", address, slot.cell_id);
                response.slots_to_remove.push(slot.cell_id);
                continue;
            };
            if slot.peer_id.map(|reported| reported != peer_id).unwrap_or(false) {
                debug!(
                    "Node {} runs cell {} as a wrong peer, removing slot",
                    address, slot.cell_id
                );
                response.slots_to_remove.push(slot.cell_id);
                continue;
            }

            let peer = &mut cell.peers[peer_id];
            peer.last_seen_time = Some(now);
            peer.last_seen_state = slot.state;
            reported.insert(slot.cell_id);

            if slot.config_version != cell.config_version && cell.prerequisite_transaction.is_some() {
                response.slots_to_configure.push(slot_assignment(cell, peer_id));
            }
        }

        let assigned: Vec<(CellId, PeerId)> = self.metadata.peers_at(&address).collect();
        for (cell_id, peer_id) in assigned {
            if reported.contains(&cell_id) {
                continue;
            }
            let Some(cell) = self.metadata.cells.get_mut(&cell_id) else {
                continue;
            };
            if let Some(peer) = cell.peers.get_mut(peer_id) {
                if peer.last_seen_state != PeerState::None {
                    debug!("Peer {} of cell {} is missing at node {}", peer_id, cell_id, address);
                }
                peer.last_seen_state = PeerState::None;
            }
            if cell.prerequisite_transaction.is_some() {
                response.slots_to_create.push(slot_assignment(cell, peer_id));
            }
        }

        response
    }

    /// Apply an administrative change to a node
    pub fn update_node(&mut self, address: &str, update: NodeUpdate) -> Result<()> {
        let node = self
            .metadata
            .nodes
            .get_mut(address)
            .ok_or_else(|| Error::no_such("node", address))?;
        if let Some(banned) = update.banned {
            node.banned = banned;
        }
        if let Some(decommissioned) = update.decommissioned {
            node.decommissioned = decommissioned;
        }
        if let Some(disable_tablet_cells) = update.disable_tablet_cells {
            node.disable_tablet_cells = disable_tablet_cells;
        }
        if let Some(tags) = update.tags {
            node.tags = tags;
        }
        info!(
            "Updated node {}: banned={}, decommissioned={}, disable_tablet_cells={}",
            address, node.banned, node.decommissioned, node.disable_tablet_cells
        );
        Ok(())
    }

    /// Mark nodes without a recent heartbeat offline; returns their addresses
    pub fn check_node_liveness(&mut self, timeout_secs: i64) -> Vec<NodeAddress> {
        let now = self.now;
        let mut offline = Vec::new();
        for node in self.metadata.nodes.values_mut() {
            if node.state == NodeState::Online && node.is_heartbeat_timeout(now, timeout_secs) {
                warn!("Node {} heartbeat timeout, marking offline", node.address);
                node.state = NodeState::Offline;
                offline.push(node.address.clone());
            }
        }

        for address in &offline {
            let peers: Vec<(CellId, PeerId)> = self.metadata.peers_at(address).collect();
            for (cell_id, peer_id) in peers {
                if let Some(peer) = self
                    .metadata
                    .cells
                    .get_mut(&cell_id)
                    .and_then(|c| c.peers.get_mut(peer_id))
                {
                    peer.last_seen_state = PeerState::None;
                }
            }
        }
        offline
    }
}
