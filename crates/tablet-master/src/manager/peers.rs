//! Peer membership of tablet cells and the prerequisite lease

use tracing::{debug, info, warn};

use super::TabletManager;
use crate::metadata::{CellId, NodeAddress, PeerId, TransactionId};
use crate::tracker::CellCommand;

impl TabletManager {
    /// Apply commands produced by a tracker scan; returns how many applied
    pub fn apply_cell_commands(&mut self, commands: Vec<CellCommand>) -> usize {
        let mut applied = 0;
        for command in commands {
            let cell_id = command.cell_id();
            if !self.metadata.cells.contains_key(&cell_id) {
                debug!("Command for unknown cell {} ignored", cell_id);
                continue;
            }
            match command {
                CellCommand::AssignPeers { assignments, .. } => {
                    self.assign_peers(cell_id, &assignments)
                }
                CellCommand::RevokePeers { peer_ids, .. } => self.revoke_peers(cell_id, &peer_ids),
                CellCommand::SetLeadingPeer { peer_id, .. } => {
                    self.set_leading_peer(cell_id, peer_id)
                }
            }
            applied += 1;
        }
        applied
    }

    fn assign_peers(&mut self, cell_id: CellId, assignments: &[(PeerId, NodeAddress)]) {
        let now = self.now;
        let mut assigned = Vec::new();
        let Some(cell) = self.metadata.cells.get_mut(&cell_id) else {
            return;
        };
        for (peer_id, address) in assignments {
            let Some(peer) = cell.peers.get_mut(*peer_id) else {
                warn!("Cell {} has no peer {}, assignment ignored", cell_id, peer_id);
                continue;
            };
            if peer.address.is_some() {
                continue;
            }
            peer.address = Some(address.clone());
            peer.last_seen_time = Some(now);
            assigned.push((*peer_id, address.clone()));
        }
        if assigned.is_empty() {
            return;
        }

        let leader_assigned = assigned
            .iter()
            .any(|(peer_id, _)| *peer_id == cell.leading_peer_id);
        let has_lease = cell.prerequisite_transaction.is_some();
        for (peer_id, address) in assigned {
            info!("Assigned peer {} of cell {} to node {}", peer_id, cell_id, address);
            self.metadata.index_peer(address, cell_id, peer_id);
        }

        if leader_assigned || !has_lease {
            self.restart_prerequisite(cell_id);
        }
        self.reconfigure_cell(cell_id);
    }

    fn revoke_peers(&mut self, cell_id: CellId, peer_ids: &[PeerId]) {
        let leading_peer_id = match self.metadata.cells.get(&cell_id) {
            Some(cell) => cell.leading_peer_id,
            None => return,
        };

        let mut leader_revoked = false;
        let mut revoked = 0;
        for peer_id in peer_ids {
            if self.do_revoke_peer(cell_id, *peer_id) {
                revoked += 1;
                leader_revoked |= *peer_id == leading_peer_id;
            }
        }
        if revoked == 0 {
            return;
        }

        if leader_revoked {
            self.abort_prerequisite(cell_id);
            self.abort_cell_subtree_transactions(cell_id);
        }
        self.reconfigure_cell(cell_id);
    }

    /// Clear one peer slot; returns whether it was assigned
    fn do_revoke_peer(&mut self, cell_id: CellId, peer_id: PeerId) -> bool {
        let Some(peer) = self
            .metadata
            .cells
            .get_mut(&cell_id)
            .and_then(|c| c.peers.get_mut(peer_id))
        else {
            return false;
        };
        let Some(address) = peer.address.take() else {
            return false;
        };
        peer.last_seen_time = None;
        peer.last_seen_state = Default::default();
        self.metadata.unindex_peer(&address, cell_id, peer_id);
        info!("Revoked peer {} of cell {} from node {}", peer_id, cell_id, address);
        true
    }

    fn set_leading_peer(&mut self, cell_id: CellId, peer_id: PeerId) {
        let Some(cell) = self.metadata.cells.get_mut(&cell_id) else {
            return;
        };
        if peer_id >= cell.peers.len() {
            warn!("Cell {} has no peer {}, leader change ignored", cell_id, peer_id);
            return;
        }
        if cell.leading_peer_id == peer_id {
            return;
        }
        info!(
            "Leading peer of cell {} changed {} -> {}",
            cell_id, cell.leading_peer_id, peer_id
        );
        cell.leading_peer_id = peer_id;

        self.restart_prerequisite(cell_id);
        self.reconfigure_cell(cell_id);
    }

    /// An external abort of a cell's lease
    ///
    /// The cell loses every peer so that the tracker assigns a fresh set.
    pub fn on_prerequisite_aborted(&mut self, transaction_id: TransactionId) -> bool {
        let Some(cell_id) = self
            .metadata
            .cells
            .values()
            .find(|c| c.prerequisite_transaction == Some(transaction_id))
            .map(|c| c.id)
        else {
            debug!("Aborted transaction {} is not a cell lease", transaction_id);
            return false;
        };

        warn!("Prerequisite transaction {} of cell {} aborted", transaction_id, cell_id);
        if let Some(cell) = self.metadata.cells.get_mut(&cell_id) {
            cell.prerequisite_transaction = None;
        }
        self.abort_cell_subtree_transactions(cell_id);

        let peer_count = self
            .metadata
            .cells
            .get(&cell_id)
            .map(|c| c.peers.len())
            .unwrap_or(0);
        for peer_id in 0..peer_count {
            self.do_revoke_peer(cell_id, peer_id);
        }
        self.reconfigure_cell(cell_id);
        true
    }

    fn restart_prerequisite(&mut self, cell_id: CellId) {
        self.abort_prerequisite(cell_id);
        self.abort_cell_subtree_transactions(cell_id);

        let transaction_id: TransactionId = self.metadata.id_generator.generate();
        if let Some(cell) = self.metadata.cells.get_mut(&cell_id) {
            cell.prerequisite_transaction = Some(transaction_id);
            info!("Started prerequisite transaction {} for cell {}", transaction_id, cell_id);
        }
    }

    pub(super) fn abort_prerequisite(&mut self, cell_id: CellId) {
        if let Some(transaction_id) = self
            .metadata
            .cells
            .get_mut(&cell_id)
            .and_then(|c| c.prerequisite_transaction.take())
        {
            info!("Aborted prerequisite transaction {} of cell {}", transaction_id, cell_id);
        }
    }

    fn reconfigure_cell(&mut self, cell_id: CellId) {
        if let Some(cell) = self.metadata.cells.get_mut(&cell_id) {
            cell.reconfigure();
            debug!("Cell {} reconfigured, version {}", cell_id, cell.config_version);
        }
    }
}
