//! Tablet tracker
//!
//! Periodically scans every tablet cell and produces membership commands:
//! move leadership away from a failed leader, assign missing peers to nodes
//! with spare slots, and revoke peers that have been failing for too long.
//! The scan only reads metadata; commands are applied by the tablet manager.

mod candidates;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::config::TabletTrackerConfig;
use crate::metadata::{
    BundleOptions, CellId, CellPeer, ClusterMetadata, NodeAddress, NodeState, PeerId, PeerState,
    TabletCell,
};

pub use candidates::NodeCandidatePool;

/// Membership change for one cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CellCommand {
    AssignPeers {
        cell_id: CellId,
        assignments: Vec<(PeerId, NodeAddress)>,
    },
    RevokePeers {
        cell_id: CellId,
        peer_ids: Vec<PeerId>,
    },
    SetLeadingPeer {
        cell_id: CellId,
        peer_id: PeerId,
    },
}

impl CellCommand {
    pub fn cell_id(&self) -> CellId {
        match self {
            CellCommand::AssignPeers { cell_id, .. }
            | CellCommand::RevokePeers { cell_id, .. }
            | CellCommand::SetLeadingPeer { cell_id, .. } => *cell_id,
        }
    }
}

/// Tablet tracker
pub struct TabletTracker {
    config: TabletTrackerConfig,
    /// Revocations are held back until the master has been up for a while
    started_at: DateTime<Utc>,
}

impl TabletTracker {
    pub fn new(config: TabletTrackerConfig, started_at: DateTime<Utc>) -> Self {
        Self { config, started_at }
    }

    pub fn config(&self) -> &TabletTrackerConfig {
        &self.config
    }

    /// Scan all cells and produce commands, in cell id order
    pub fn scan(&self, metadata: &ClusterMetadata, now: DateTime<Utc>) -> Vec<CellCommand> {
        let online = metadata.online_node_count();
        if online < self.config.safe_online_node_count {
            debug!(
                "Tablet tracker disabled: {} node(s) online, {} required",
                online, self.config.safe_online_node_count
            );
            return Vec::new();
        }

        let mut pool = NodeCandidatePool::new(metadata);
        let mut commands = Vec::new();
        for cell in metadata.cells.values() {
            let Some(bundle) = metadata.bundles.get(&cell.bundle_id) else {
                continue;
            };
            self.schedule_leader_reassignment(metadata, cell, &bundle.options, now, &mut commands);
            self.schedule_peer_assignment(cell, &bundle.options, &mut pool, &mut commands);
            self.schedule_peer_revocation(metadata, cell, &bundle.options, now, &mut commands);
        }

        if !commands.is_empty() {
            info!("Tablet tracker produced {} command(s)", commands.len());
        }
        commands
    }

    fn schedule_leader_reassignment(
        &self,
        metadata: &ClusterMetadata,
        cell: &TabletCell,
        options: &BundleOptions,
        now: DateTime<Utc>,
        commands: &mut Vec<CellCommand>,
    ) {
        let Some(leader) = cell.peers.get(cell.leading_peer_id) else {
            return;
        };
        let timeout = Duration::seconds(self.config.leader_reassignment_timeout_secs as i64);
        if !is_peer_failed(metadata, options, leader, now, timeout) {
            return;
        }

        let candidate = cell
            .peers
            .iter()
            .enumerate()
            .find(|(peer_id, peer)| {
                *peer_id != cell.leading_peer_id && is_peer_good(metadata, options, peer)
            })
            .map(|(peer_id, _)| peer_id);

        if let Some(peer_id) = candidate {
            info!(
                "Reassigning leader of cell {}: peer {} -> {}",
                cell.id, cell.leading_peer_id, peer_id
            );
            commands.push(CellCommand::SetLeadingPeer {
                cell_id: cell.id,
                peer_id,
            });
        }
    }

    fn schedule_peer_assignment(
        &self,
        cell: &TabletCell,
        options: &BundleOptions,
        pool: &mut NodeCandidatePool<'_>,
        commands: &mut Vec<CellCommand>,
    ) {
        // Followers without a leader may still elect one among themselves.
        if cell.has_follower_but_no_leader() {
            return;
        }

        let mut forbidden: BTreeSet<NodeAddress> = cell
            .peers
            .iter()
            .filter_map(|p| p.address.clone())
            .collect();

        let mut assignments = Vec::new();
        for (peer_id, peer) in cell.peers.iter().enumerate() {
            if peer.address.is_some() {
                continue;
            }
            let Some(address) = pool.try_allocate(options, &forbidden) else {
                debug!("No node available for peer {} of cell {}", peer_id, cell.id);
                continue;
            };
            forbidden.insert(address.clone());
            assignments.push((peer_id, address));
        }

        if !assignments.is_empty() {
            commands.push(CellCommand::AssignPeers {
                cell_id: cell.id,
                assignments,
            });
        }
    }

    fn schedule_peer_revocation(
        &self,
        metadata: &ClusterMetadata,
        cell: &TabletCell,
        options: &BundleOptions,
        now: DateTime<Utc>,
        commands: &mut Vec<CellCommand>,
    ) {
        let timeout = Duration::seconds(self.config.peer_revocation_timeout_secs as i64);
        if now < self.started_at + timeout {
            return;
        }

        let peer_ids: Vec<PeerId> = cell
            .peers
            .iter()
            .enumerate()
            .filter(|(_, peer)| is_peer_failed(metadata, options, peer, now, timeout))
            .map(|(peer_id, _)| peer_id)
            .collect();

        if !peer_ids.is_empty() {
            info!("Revoking peers {:?} of cell {}", peer_ids, cell.id);
            commands.push(CellCommand::RevokePeers {
                cell_id: cell.id,
                peer_ids,
            });
        }
    }
}

/// Whether an assigned peer should be given up
///
/// A peer on a node that can no longer host it fails at once. Otherwise it
/// fails when its node has not reported it for longer than `timeout`.
fn is_peer_failed(
    metadata: &ClusterMetadata,
    options: &BundleOptions,
    peer: &CellPeer,
    now: DateTime<Utc>,
    timeout: Duration,
) -> bool {
    let Some(address) = &peer.address else {
        return false;
    };
    if let Some(node) = metadata.nodes.get(address) {
        if node.banned
            || node.decommissioned
            || node.disable_tablet_cells
            || !options.accepts_tags(node.tags.iter())
        {
            return true;
        }
        if node.state == NodeState::Online && peer.last_seen_state != PeerState::None {
            return false;
        }
    }
    match peer.last_seen_time {
        Some(seen) => seen + timeout <= now,
        None => true,
    }
}

/// Whether a peer can take over leadership
fn is_peer_good(metadata: &ClusterMetadata, options: &BundleOptions, peer: &CellPeer) -> bool {
    let Some(node) = peer.address.as_ref().and_then(|a| metadata.nodes.get(a)) else {
        return false;
    };
    node.accepts_peers()
        && options.accepts_tags(node.tags.iter())
        && matches!(
            peer.last_seen_state,
            PeerState::Following | PeerState::Leading
        )
}
