//! Shared fixture for integration tests

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};

use tablet_master::config::{TabletActionConfig, TabletManagerConfig};
use tablet_master::hive::{CellMessage, Envelope};
use tablet_master::manager::{CellNotification, CellSlotReport, NodeHeartbeat};
use tablet_master::metadata::{
    BundleId, BundleOptions, CellId, Chunk, ChunkId, ClusterMetadata, PeerState, TableOptions,
    Tablet, TabletId, TabletState,
};
use tablet_master::tracker::CellCommand;
use tablet_master::TabletManager;

pub const BUNDLE: &str = "default";

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn node_address(index: usize) -> String {
    format!("node-{}:9012", index)
}

/// Manager with one bundle whose cells each run a single leading peer
pub struct Cluster {
    pub manager: TabletManager,
    pub bundle_id: BundleId,
    pub cells: Vec<CellId>,
}

impl Cluster {
    pub fn new(cell_count: usize) -> Self {
        Self::with_config(cell_count, TabletManagerConfig::default(), TabletActionConfig::default())
    }

    pub fn with_config(
        cell_count: usize,
        config: TabletManagerConfig,
        action_config: TabletActionConfig,
    ) -> Self {
        let metadata = ClusterMetadata::new("test".to_string(), start_time());
        let mut manager = TabletManager::new(config, action_config, metadata, start_time());
        let bundle_id = manager
            .create_tablet_cell_bundle(BUNDLE, BundleOptions::default())
            .unwrap();

        let mut cluster = Self {
            manager,
            bundle_id,
            cells: Vec::new(),
        };
        for _ in 0..cell_count {
            cluster.add_good_cell();
        }
        cluster.manager.drain_outbox();
        cluster
    }

    /// Create a cell and bring its only peer to the leading role
    pub fn add_good_cell(&mut self) -> CellId {
        let cell_id = self.manager.create_tablet_cell(self.bundle_id).unwrap();
        let address = node_address(self.cells.len());
        self.heartbeat(&address, Vec::new());
        self.manager.apply_cell_commands(vec![CellCommand::AssignPeers {
            cell_id,
            assignments: vec![(0, address.clone())],
        }]);
        let config_version = self.manager.metadata().cells[&cell_id].config_version;
        self.heartbeat(
            &address,
            vec![CellSlotReport {
                cell_id,
                peer_id: Some(0),
                state: PeerState::Leading,
                config_version,
            }],
        );
        self.cells.push(cell_id);
        cell_id
    }

    pub fn heartbeat(&mut self, address: &str, cells: Vec<CellSlotReport>) {
        self.manager.process_heartbeat(NodeHeartbeat {
            address: address.to_string(),
            total_slots: 4,
            tags: Default::default(),
            cells,
        });
    }

    /// Stop reporting the peer of a cell so it is no longer healthy
    pub fn fail_cell(&mut self, cell_id: CellId) {
        let index = self.cells.iter().position(|c| *c == cell_id).unwrap();
        self.heartbeat(&node_address(index), Vec::new());
    }

    pub fn advance(&mut self, seconds: i64) {
        let now = self.manager.now() + Duration::seconds(seconds);
        self.manager.advance_clock(now);
    }

    // ==================== tables ====================

    pub fn create_sorted_table(&mut self, path: &str, pivot_keys: &[&[u8]]) {
        let options = TableOptions {
            bundle: BUNDLE.to_string(),
            pivot_keys: pivot_keys.iter().map(|k| k.to_vec()).collect(),
            ..Default::default()
        };
        self.manager.create_table(path, options).unwrap();
    }

    pub fn create_ordered_table(&mut self, path: &str, tablet_count: usize) {
        let options = TableOptions {
            bundle: BUNDLE.to_string(),
            sorted: false,
            tablet_count,
            ..Default::default()
        };
        self.manager.create_table(path, options).unwrap();
    }

    pub fn tablet_ids(&self, path: &str) -> Vec<TabletId> {
        let metadata = self.manager.metadata();
        let table_id = metadata.resolve_table(path).unwrap();
        metadata.tables[&table_id].tablets.clone()
    }

    pub fn tablet(&self, tablet_id: TabletId) -> &Tablet {
        &self.manager.metadata().tablets[&tablet_id]
    }

    pub fn state(&self, tablet_id: TabletId) -> TabletState {
        self.tablet(tablet_id).state
    }

    pub fn states(&self, path: &str) -> Vec<TabletState> {
        self.tablet_ids(path).into_iter().map(|id| self.state(id)).collect()
    }

    // ==================== cell side ====================

    /// Deliver a notification stamped with the tablet's current revision
    pub fn notify(&mut self, tablet_id: TabletId, build: impl FnOnce(TabletId, u64) -> CellNotification) -> bool {
        let revision = self.tablet(tablet_id).mount_revision;
        self.manager.on_cell_notification(build(tablet_id, revision))
    }

    pub fn confirm_mounted(&mut self, tablet_id: TabletId) -> bool {
        let frozen = self.state(tablet_id) == TabletState::FrozenMounting;
        self.notify(tablet_id, |tablet_id, mount_revision| CellNotification::TabletMounted {
            tablet_id,
            mount_revision,
            frozen,
        })
    }

    pub fn confirm_unmounted(&mut self, tablet_id: TabletId) -> bool {
        self.notify(tablet_id, |tablet_id, mount_revision| CellNotification::TabletUnmounted {
            tablet_id,
            mount_revision,
        })
    }

    pub fn confirm_frozen(&mut self, tablet_id: TabletId) -> bool {
        self.notify(tablet_id, |tablet_id, mount_revision| CellNotification::TabletFrozen {
            tablet_id,
            mount_revision,
        })
    }

    pub fn confirm_unfrozen(&mut self, tablet_id: TabletId) -> bool {
        self.notify(tablet_id, |tablet_id, mount_revision| CellNotification::TabletUnfrozen {
            tablet_id,
            mount_revision,
        })
    }

    /// Mount a whole table and confirm every tablet
    pub fn mount_and_confirm(&mut self, path: &str) {
        self.manager.mount_table(path, None, None, None, false).unwrap();
        for tablet_id in self.tablet_ids(path) {
            assert!(self.confirm_mounted(tablet_id));
        }
        self.manager.drain_outbox();
    }

    /// Answer pending messages the way healthy cells would, until quiet
    ///
    /// Returns every envelope that was delivered.
    pub fn run_cells(&mut self) -> Vec<Envelope> {
        let mut delivered = Vec::new();
        loop {
            let envelopes = self.manager.drain_outbox();
            if envelopes.is_empty() {
                return delivered;
            }
            for envelope in &envelopes {
                self.answer(&envelope.message);
            }
            delivered.extend(envelopes);
        }
    }

    fn answer(&mut self, message: &CellMessage) {
        let notification = match message {
            CellMessage::MountTablet {
                tablet_id,
                mount_revision,
                freeze,
                ..
            } => CellNotification::TabletMounted {
                tablet_id: *tablet_id,
                mount_revision: *mount_revision,
                frozen: *freeze,
            },
            CellMessage::UnmountTablet {
                tablet_id,
                mount_revision,
                ..
            } => CellNotification::TabletUnmounted {
                tablet_id: *tablet_id,
                mount_revision: *mount_revision,
            },
            CellMessage::FreezeTablet {
                tablet_id,
                mount_revision,
            } => CellNotification::TabletFrozen {
                tablet_id: *tablet_id,
                mount_revision: *mount_revision,
            },
            CellMessage::UnfreezeTablet {
                tablet_id,
                mount_revision,
            } => CellNotification::TabletUnfrozen {
                tablet_id: *tablet_id,
                mount_revision: *mount_revision,
            },
            CellMessage::SetTableReplicaEnabled {
                tablet_id,
                mount_revision,
                replica_id,
                enabled: false,
            } => CellNotification::ReplicaDisabled {
                tablet_id: *tablet_id,
                mount_revision: *mount_revision,
                replica_id: *replica_id,
            },
            _ => return,
        };
        self.manager.on_cell_notification(notification);
    }
}

pub fn chunk(id: u64, min_key: &[u8], max_key: &[u8], size: i64) -> Chunk {
    Chunk {
        id: ChunkId(id),
        min_key: min_key.to_vec(),
        max_key: max_key.to_vec(),
        uncompressed_data_size: size,
        compressed_data_size: size / 2,
        row_count: size / 10,
    }
}
