//! Tablet cell definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{ActionId, BundleId, CellId, NodeAddress, PeerId, TabletId, TabletStatistics, TransactionId};

/// Consensus role of a peer as reported by its node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    None,
    Stopped,
    Elections,
    FollowerRecovery,
    Following,
    LeaderRecovery,
    Leading,
}

impl Default for PeerState {
    fn default() -> Self {
        Self::None
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerState::None => write!(f, "none"),
            PeerState::Stopped => write!(f, "stopped"),
            PeerState::Elections => write!(f, "elections"),
            PeerState::FollowerRecovery => write!(f, "follower_recovery"),
            PeerState::Following => write!(f, "following"),
            PeerState::LeaderRecovery => write!(f, "leader_recovery"),
            PeerState::Leading => write!(f, "leading"),
        }
    }
}

/// Cell health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellHealth {
    Initializing,
    Good,
    Degraded,
    Failed,
}

impl std::fmt::Display for CellHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellHealth::Initializing => write!(f, "initializing"),
            CellHealth::Good => write!(f, "good"),
            CellHealth::Degraded => write!(f, "degraded"),
            CellHealth::Failed => write!(f, "failed"),
        }
    }
}

/// One peer slot of a cell
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellPeer {
    /// Node hosting this peer, `None` for an empty slot
    pub address: Option<NodeAddress>,
    pub last_seen_time: Option<DateTime<Utc>>,
    pub last_seen_state: PeerState,
}

/// Tablet cell: a consensus group of peers hosting tablets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletCell {
    pub id: CellId,
    pub bundle_id: BundleId,
    pub peers: Vec<CellPeer>,
    pub leading_peer_id: PeerId,
    /// Bumped on every membership change
    pub config_version: u64,
    /// Prerequisite lease of the current leadership epoch
    pub prerequisite_transaction: Option<TransactionId>,
    /// Pending transactions rooted at the cell's namespace node
    #[serde(default)]
    pub subtree_transactions: BTreeSet<TransactionId>,
    pub total_statistics: TabletStatistics,
    pub tablets: BTreeSet<TabletId>,
    pub actions: BTreeSet<ActionId>,
    /// Set once the cell has hosted at least one tablet
    #[serde(default)]
    pub has_hosted_tablets: bool,
}

impl TabletCell {
    pub fn new(id: CellId, bundle_id: BundleId, peer_count: usize) -> Self {
        Self {
            id,
            bundle_id,
            peers: vec![CellPeer::default(); peer_count],
            leading_peer_id: 0,
            config_version: 0,
            prerequisite_transaction: None,
            subtree_transactions: BTreeSet::new(),
            total_statistics: TabletStatistics::default(),
            tablets: BTreeSet::new(),
            actions: BTreeSet::new(),
            has_hosted_tablets: false,
        }
    }

    /// Health derived from the roles reported by the peers
    pub fn health(&self) -> CellHealth {
        let leader_alive = self
            .peers
            .get(self.leading_peer_id)
            .map(|p| p.address.is_some() && p.last_seen_state == PeerState::Leading)
            .unwrap_or(false);

        if !leader_alive {
            return if self.has_hosted_tablets {
                CellHealth::Failed
            } else {
                CellHealth::Initializing
            };
        }

        let followers_in_sync = self
            .peers
            .iter()
            .enumerate()
            .filter(|(peer_id, _)| *peer_id != self.leading_peer_id)
            .all(|(_, p)| p.address.is_some() && p.last_seen_state == PeerState::Following);

        if followers_in_sync {
            CellHealth::Good
        } else {
            CellHealth::Degraded
        }
    }

    /// Find the peer slot assigned to the given address
    pub fn find_peer(&self, address: &str) -> Option<PeerId> {
        self.peers
            .iter()
            .position(|p| p.address.as_deref() == Some(address))
    }

    /// Whether some peer is following while no peer is leading
    pub fn has_follower_but_no_leader(&self) -> bool {
        let has_follower = self
            .peers
            .iter()
            .any(|p| p.last_seen_state == PeerState::Following);
        let has_leader = self
            .peers
            .iter()
            .any(|p| p.last_seen_state == PeerState::Leading);
        has_follower && !has_leader
    }

    /// Bump configuration version after a membership change
    pub fn reconfigure(&mut self) {
        self.config_version += 1;
    }
}
