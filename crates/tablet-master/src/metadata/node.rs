//! Physical node definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::NodeAddress;

/// Node state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Heartbeats arrive in time
    Online,
    /// Heartbeat timeout
    Offline,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Offline
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Online => write!(f, "online"),
            NodeState::Offline => write!(f, "offline"),
        }
    }
}

/// Node information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub address: NodeAddress,
    pub state: NodeState,
    #[serde(default)]
    pub banned: bool,
    #[serde(default)]
    pub decommissioned: bool,
    /// Node refuses to host tablet cell peers
    #[serde(default)]
    pub disable_tablet_cells: bool,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Peer slots this node offers
    pub total_slots: usize,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl NodeInfo {
    pub fn new(address: NodeAddress, now: DateTime<Utc>) -> Self {
        Self {
            address,
            state: NodeState::Offline,
            banned: false,
            decommissioned: false,
            disable_tablet_cells: false,
            tags: BTreeSet::new(),
            total_slots: 0,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    /// Update heartbeat
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = now;
        self.state = NodeState::Online;
    }

    /// Check if heartbeat timed out
    pub fn is_heartbeat_timeout(&self, now: DateTime<Utc>, timeout_secs: i64) -> bool {
        let elapsed = now.signed_duration_since(self.last_heartbeat);
        elapsed.num_seconds() > timeout_secs
    }

    /// Whether the node may host new tablet cell peers
    pub fn accepts_peers(&self) -> bool {
        self.state == NodeState::Online
            && !self.banned
            && !self.decommissioned
            && !self.disable_tablet_cells
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_heartbeat_timeout() {
        let now = Utc::now();
        let mut node = NodeInfo::new("n1:9012".to_string(), now);
        node.touch(now);
        assert!(!node.is_heartbeat_timeout(now + Duration::seconds(10), 30));
        assert!(node.is_heartbeat_timeout(now + Duration::seconds(31), 30));
    }

    #[test]
    fn test_accepts_peers() {
        let now = Utc::now();
        let mut node = NodeInfo::new("n1:9012".to_string(), now);
        assert!(!node.accepts_peers());

        node.touch(now);
        assert!(node.accepts_peers());

        node.decommissioned = true;
        assert!(!node.accepts_peers());
    }
}
