//! Candidate node pool used by one tracker scan

use std::collections::{BTreeMap, BTreeSet};

use crate::metadata::{BundleOptions, ClusterMetadata, NodeAddress};

/// Nodes eligible to host new peers, grouped by tag filter
///
/// Nodes with more spare slots are picked first, ties broken by address.
/// Allocation decrements the spare count so a single scan never overbooks
/// a node.
pub struct NodeCandidatePool<'a> {
    metadata: &'a ClusterMetadata,
    /// Spare slots per node, shared by all groups
    spare_slots: BTreeMap<NodeAddress, usize>,
    groups: BTreeMap<Option<String>, Vec<NodeAddress>>,
}

impl<'a> NodeCandidatePool<'a> {
    pub fn new(metadata: &'a ClusterMetadata) -> Self {
        let spare_slots = metadata
            .nodes
            .values()
            .filter(|n| n.accepts_peers())
            .filter_map(|n| {
                let spare = n
                    .total_slots
                    .saturating_sub(metadata.used_slots(&n.address));
                (spare > 0).then(|| (n.address.clone(), spare))
            })
            .collect();
        Self {
            metadata,
            spare_slots,
            groups: BTreeMap::new(),
        }
    }

    /// Allocate a node for a peer of a bundle, avoiding `forbidden` addresses
    pub fn try_allocate(
        &mut self,
        options: &BundleOptions,
        forbidden: &BTreeSet<NodeAddress>,
    ) -> Option<NodeAddress> {
        let key = options.node_tag_filter.clone();
        if !self.groups.contains_key(&key) {
            let group = self.build_group(options);
            self.groups.insert(key.clone(), group);
        }

        let spare_slots = &self.spare_slots;
        let spare_of = |address: &NodeAddress| spare_slots.get(address).copied().unwrap_or(0);

        let address = self
            .groups
            .get(&key)?
            .iter()
            .filter(|address| !forbidden.contains(*address) && spare_of(address) > 0)
            .max_by(|a, b| spare_of(a).cmp(&spare_of(b)).then_with(|| b.cmp(a)))?
            .clone();

        if let Some(spare) = self.spare_slots.get_mut(&address) {
            *spare -= 1;
        }
        Some(address)
    }

    fn build_group(&self, options: &BundleOptions) -> Vec<NodeAddress> {
        self.spare_slots
            .keys()
            .filter(|address| {
                self.metadata
                    .nodes
                    .get(*address)
                    .map(|n| options.accepts_tags(n.tags.iter()))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::NodeInfo;
    use chrono::Utc;

    fn make_node(metadata: &mut ClusterMetadata, address: &str, slots: usize, tags: &[&str]) {
        let now = Utc::now();
        let mut node = NodeInfo::new(address.to_string(), now);
        node.touch(now);
        node.total_slots = slots;
        node.tags = tags.iter().map(|t| t.to_string()).collect();
        metadata.nodes.insert(address.to_string(), node);
    }

    #[test]
    fn test_most_spare_node_first() {
        let mut metadata = ClusterMetadata::new("test".to_string(), Utc::now());
        make_node(&mut metadata, "a", 1, &[]);
        make_node(&mut metadata, "b", 3, &[]);
        make_node(&mut metadata, "c", 2, &[]);

        let mut pool = NodeCandidatePool::new(&metadata);
        let options = BundleOptions::default();
        let none = BTreeSet::new();

        let picks: Vec<_> = (0..6)
            .map(|_| pool.try_allocate(&options, &none))
            .collect();
        assert_eq!(picks[0].as_deref(), Some("b"));
        assert_eq!(picks[1].as_deref(), Some("b"));
        assert_eq!(picks[2].as_deref(), Some("c"));
        assert_eq!(picks[3].as_deref(), Some("a"));
        assert_eq!(picks[4].as_deref(), Some("b"));
        assert_eq!(picks[5].as_deref(), Some("c"));
        assert_eq!(pool.try_allocate(&options, &none), None);
    }

    #[test]
    fn test_forbidden_and_tag_filter() {
        let mut metadata = ClusterMetadata::new("test".to_string(), Utc::now());
        make_node(&mut metadata, "a", 5, &["ssd"]);
        make_node(&mut metadata, "b", 5, &[]);

        let mut pool = NodeCandidatePool::new(&metadata);
        let options = BundleOptions {
            node_tag_filter: Some("ssd".to_string()),
            ..Default::default()
        };

        let forbidden: BTreeSet<_> = ["a".to_string()].into_iter().collect();
        assert_eq!(pool.try_allocate(&options, &forbidden), None);
        assert_eq!(
            pool.try_allocate(&options, &BTreeSet::new()).as_deref(),
            Some("a")
        );
    }

    #[test]
    fn test_ineligible_nodes_skipped() {
        let mut metadata = ClusterMetadata::new("test".to_string(), Utc::now());
        make_node(&mut metadata, "banned", 5, &[]);
        make_node(&mut metadata, "ok", 1, &[]);
        metadata.nodes.get_mut("banned").unwrap().banned = true;

        let mut pool = NodeCandidatePool::new(&metadata);
        let options = BundleOptions::default();
        assert_eq!(
            pool.try_allocate(&options, &BTreeSet::new()).as_deref(),
            Some("ok")
        );
        assert_eq!(pool.try_allocate(&options, &BTreeSet::new()), None);
    }
}
