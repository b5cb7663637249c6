//! Tablet cell bundle definitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{ActionId, BundleId, CellId};

/// Placement and balancing policy shared by the cells of a bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleOptions {
    /// Peers per cell
    #[serde(default = "default_peer_count")]
    pub peer_count: usize,
    /// Tag a node must carry to host peers of this bundle
    #[serde(default)]
    pub node_tag_filter: Option<String>,
    #[serde(default = "default_enable_tablet_balancer")]
    pub enable_tablet_balancer: bool,
    /// Lower tablet size threshold for the balancer
    #[serde(default = "default_min_tablet_size")]
    pub min_tablet_size: i64,
    /// Upper tablet size threshold for the balancer
    #[serde(default = "default_max_tablet_size")]
    pub max_tablet_size: i64,
}

impl Default for BundleOptions {
    fn default() -> Self {
        Self {
            peer_count: default_peer_count(),
            node_tag_filter: None,
            enable_tablet_balancer: default_enable_tablet_balancer(),
            min_tablet_size: default_min_tablet_size(),
            max_tablet_size: default_max_tablet_size(),
        }
    }
}

impl BundleOptions {
    /// Whether a node with given tags passes the tag filter
    pub fn accepts_tags<'a>(&self, mut tags: impl Iterator<Item = &'a String>) -> bool {
        match &self.node_tag_filter {
            Some(tag) => tags.any(|t| t == tag),
            None => true,
        }
    }
}

fn default_peer_count() -> usize {
    1
}

fn default_enable_tablet_balancer() -> bool {
    true
}

fn default_min_tablet_size() -> i64 {
    128 * 1024 * 1024
}

fn default_max_tablet_size() -> i64 {
    20 * 1024 * 1024 * 1024
}

/// Named group of cells
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletCellBundle {
    pub id: BundleId,
    pub name: String,
    pub options: BundleOptions,
    pub cells: BTreeSet<CellId>,
    pub actions: BTreeSet<ActionId>,
    /// Actions not yet in a terminal state
    pub active_action_count: usize,
}

impl TabletCellBundle {
    pub fn new(id: BundleId, name: String, options: BundleOptions) -> Self {
        Self {
            id,
            name,
            options,
            cells: BTreeSet::new(),
            actions: BTreeSet::new(),
            active_action_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_filter() {
        let tags = vec!["ssd".to_string(), "rack1".to_string()];
        let mut options = BundleOptions::default();
        assert!(options.accepts_tags(tags.iter()));

        options.node_tag_filter = Some("ssd".to_string());
        assert!(options.accepts_tags(tags.iter()));

        options.node_tag_filter = Some("hdd".to_string());
        assert!(!options.accepts_tags(tags.iter()));
    }
}
