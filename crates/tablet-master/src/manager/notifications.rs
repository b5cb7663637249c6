//! Notifications reported by tablet cells
//!
//! Every notification carries the mount revision the cell knows the tablet
//! by. Notifications for unknown tablets or with a stale revision are logged
//! and dropped; they never fail.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::TabletManager;
use crate::metadata::{
    Chunk, ChunkId, ReplicaId, ReplicaState, TabletId, TabletState, Timestamp,
};

/// Notification from a tablet cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CellNotification {
    TabletMounted {
        tablet_id: TabletId,
        mount_revision: u64,
        #[serde(default)]
        frozen: bool,
    },
    TabletUnmounted {
        tablet_id: TabletId,
        mount_revision: u64,
    },
    TabletFrozen {
        tablet_id: TabletId,
        mount_revision: u64,
    },
    TabletUnfrozen {
        tablet_id: TabletId,
        mount_revision: u64,
    },
    ReplicaDisabled {
        tablet_id: TabletId,
        mount_revision: u64,
        replica_id: ReplicaId,
    },
    ReplicaStatisticsUpdated {
        tablet_id: TabletId,
        mount_revision: u64,
        replica_id: ReplicaId,
        current_replication_row_index: i64,
        current_replication_timestamp: Timestamp,
    },
    TrimmedRowCountUpdated {
        tablet_id: TabletId,
        mount_revision: u64,
        trimmed_row_count: i64,
    },
    StoresUpdated {
        tablet_id: TabletId,
        mount_revision: u64,
        #[serde(default)]
        stores_to_add: Vec<Chunk>,
        #[serde(default)]
        stores_to_remove: Vec<ChunkId>,
    },
}

impl CellNotification {
    pub fn tablet_id(&self) -> TabletId {
        match self {
            CellNotification::TabletMounted { tablet_id, .. }
            | CellNotification::TabletUnmounted { tablet_id, .. }
            | CellNotification::TabletFrozen { tablet_id, .. }
            | CellNotification::TabletUnfrozen { tablet_id, .. }
            | CellNotification::ReplicaDisabled { tablet_id, .. }
            | CellNotification::ReplicaStatisticsUpdated { tablet_id, .. }
            | CellNotification::TrimmedRowCountUpdated { tablet_id, .. }
            | CellNotification::StoresUpdated { tablet_id, .. } => *tablet_id,
        }
    }

    pub fn mount_revision(&self) -> u64 {
        match self {
            CellNotification::TabletMounted { mount_revision, .. }
            | CellNotification::TabletUnmounted { mount_revision, .. }
            | CellNotification::TabletFrozen { mount_revision, .. }
            | CellNotification::TabletUnfrozen { mount_revision, .. }
            | CellNotification::ReplicaDisabled { mount_revision, .. }
            | CellNotification::ReplicaStatisticsUpdated { mount_revision, .. }
            | CellNotification::TrimmedRowCountUpdated { mount_revision, .. }
            | CellNotification::StoresUpdated { mount_revision, .. } => *mount_revision,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CellNotification::TabletMounted { .. } => "tablet_mounted",
            CellNotification::TabletUnmounted { .. } => "tablet_unmounted",
            CellNotification::TabletFrozen { .. } => "tablet_frozen",
            CellNotification::TabletUnfrozen { .. } => "tablet_unfrozen",
            CellNotification::ReplicaDisabled { .. } => "replica_disabled",
            CellNotification::ReplicaStatisticsUpdated { .. } => "replica_statistics_updated",
            CellNotification::TrimmedRowCountUpdated { .. } => "trimmed_row_count_updated",
            CellNotification::StoresUpdated { .. } => "stores_updated",
        }
    }
}

impl TabletManager {
    /// Apply a cell notification; returns whether it changed anything
    pub fn on_cell_notification(&mut self, notification: CellNotification) -> bool {
        let tablet_id = notification.tablet_id();
        let Some(tablet) = self.metadata.tablets.get(&tablet_id) else {
            debug!(
                "Notification {} for unknown tablet {} ignored",
                notification.kind(),
                tablet_id
            );
            return false;
        };
        if !tablet.is_current_revision(notification.mount_revision()) {
            debug!(
                "Notification {} for tablet {} has stale mount revision {} (current {}), ignored",
                notification.kind(),
                tablet_id,
                notification.mount_revision(),
                tablet.mount_revision
            );
            return false;
        }

        match notification {
            CellNotification::TabletMounted { frozen, .. } => self.on_tablet_mounted(tablet_id, frozen),
            CellNotification::TabletUnmounted { .. } => self.on_tablet_unmounted(tablet_id),
            CellNotification::TabletFrozen { .. } => self.on_tablet_frozen(tablet_id),
            CellNotification::TabletUnfrozen { .. } => self.on_tablet_unfrozen(tablet_id),
            CellNotification::ReplicaDisabled { replica_id, .. } => {
                self.on_replica_disabled(tablet_id, replica_id)
            }
            CellNotification::ReplicaStatisticsUpdated {
                replica_id,
                current_replication_row_index,
                current_replication_timestamp,
                ..
            } => self.on_replica_statistics_updated(
                tablet_id,
                replica_id,
                current_replication_row_index,
                current_replication_timestamp,
            ),
            CellNotification::TrimmedRowCountUpdated {
                trimmed_row_count, ..
            } => {
                if let Some(tablet) = self.metadata.tablets.get_mut(&tablet_id) {
                    tablet.trimmed_row_count = trimmed_row_count;
                }
                true
            }
            CellNotification::StoresUpdated {
                stores_to_add,
                stores_to_remove,
                ..
            } => self.on_stores_updated(tablet_id, stores_to_add, stores_to_remove),
        }
    }

    /// Current state of a tablet if it is one of `expected`
    fn tablet_state_in(&self, tablet_id: TabletId, expected: &[TabletState], event: &str) -> Option<TabletState> {
        let state = self.metadata.tablets.get(&tablet_id)?.state;
        if expected.contains(&state) {
            Some(state)
        } else {
            warn!(
                "{} notification for tablet {} in {} state ignored",
                event, tablet_id, state
            );
            None
        }
    }

    fn on_tablet_mounted(&mut self, tablet_id: TabletId, frozen: bool) -> bool {
        if self
            .tablet_state_in(
                tablet_id,
                &[TabletState::Mounting, TabletState::FrozenMounting],
                "Mounted",
            )
            .is_none()
        {
            return false;
        }

        let Some(tablet) = self.metadata.tablets.get_mut(&tablet_id) else {
            return false;
        };
        tablet.set_state(if frozen {
            TabletState::Frozen
        } else {
            TabletState::Mounted
        });
        let action = tablet.action;
        debug!("Tablet {} mounted (frozen {})", tablet_id, frozen);

        self.on_tablet_action_state_changed(action);
        true
    }

    fn on_tablet_unmounted(&mut self, tablet_id: TabletId) -> bool {
        if self
            .tablet_state_in(tablet_id, &[TabletState::Unmounting], "Unmounted")
            .is_none()
        {
            return false;
        }
        if let Err(e) = self.do_tablet_unmounted(tablet_id) {
            warn!("Failed to finish unmounting tablet {}: {}", tablet_id, e);
            return false;
        }

        let action = self.metadata.tablets.get(&tablet_id).and_then(|t| t.action);
        self.on_tablet_action_state_changed(action);
        true
    }

    fn on_tablet_frozen(&mut self, tablet_id: TabletId) -> bool {
        if self
            .tablet_state_in(tablet_id, &[TabletState::Freezing], "Frozen")
            .is_none()
        {
            return false;
        }
        let Some(tablet) = self.metadata.tablets.get_mut(&tablet_id) else {
            return false;
        };
        tablet.set_state(TabletState::Frozen);
        let action = tablet.action;
        debug!("Tablet {} frozen", tablet_id);

        self.on_tablet_action_state_changed(action);
        true
    }

    fn on_tablet_unfrozen(&mut self, tablet_id: TabletId) -> bool {
        if self
            .tablet_state_in(tablet_id, &[TabletState::Unfreezing], "Unfrozen")
            .is_none()
        {
            return false;
        }
        let Some(tablet) = self.metadata.tablets.get_mut(&tablet_id) else {
            return false;
        };
        tablet.set_state(TabletState::Mounted);
        let action = tablet.action;
        debug!("Tablet {} unfrozen", tablet_id);

        self.on_tablet_action_state_changed(action);
        true
    }

    fn on_replica_disabled(&mut self, tablet_id: TabletId, replica_id: ReplicaId) -> bool {
        if !self.metadata.replicas.contains_key(&replica_id) {
            debug!("Replica disabled notification for unknown replica {} ignored", replica_id);
            return false;
        }
        let Some(info) = self
            .metadata
            .tablets
            .get_mut(&tablet_id)
            .and_then(|t| t.replicas.get_mut(&replica_id))
        else {
            warn!(
                "Tablet {} has no entry for replica {}, notification ignored",
                tablet_id, replica_id
            );
            return false;
        };
        if info.state != ReplicaState::Disabling {
            warn!(
                "Replica {} of tablet {} is in {} state, disabled notification ignored",
                replica_id, tablet_id, info.state
            );
            return false;
        }
        info.state = ReplicaState::Disabled;

        if let Some(replica) = self.metadata.replicas.get_mut(&replica_id) {
            replica.disabling_tablets.remove(&tablet_id);
        }
        debug!("Replica {} disabled at tablet {}", replica_id, tablet_id);
        self.check_for_replica_disabled(replica_id);
        true
    }

    fn on_replica_statistics_updated(
        &mut self,
        tablet_id: TabletId,
        replica_id: ReplicaId,
        row_index: i64,
        timestamp: Timestamp,
    ) -> bool {
        let Some(info) = self
            .metadata
            .tablets
            .get_mut(&tablet_id)
            .and_then(|t| t.replicas.get_mut(&replica_id))
        else {
            debug!(
                "Statistics for unknown replica {} of tablet {} ignored",
                replica_id, tablet_id
            );
            return false;
        };
        info.current_replication_row_index = row_index;
        info.current_replication_timestamp = timestamp;
        true
    }

    /// Swap stores of a mounted tablet and recharge its cell
    fn on_stores_updated(&mut self, tablet_id: TabletId, to_add: Vec<Chunk>, to_remove: Vec<ChunkId>) -> bool {
        let Some(cell_id) = self.metadata.tablets.get(&tablet_id).and_then(|t| t.cell) else {
            warn!("Stores update for tablet {} without a cell ignored", tablet_id);
            return false;
        };
        let Ok(old_statistics) = self.tablet_statistics(tablet_id) else {
            return false;
        };

        let added = to_add.len();
        self.metadata.chunks.detach(tablet_id, &to_remove);
        for chunk in to_add {
            self.metadata.chunks.attach(tablet_id, chunk);
        }
        self.metadata.chunks.collect_garbage();

        let Ok(new_statistics) = self.tablet_statistics(tablet_id) else {
            return false;
        };
        if let Some(cell) = self.metadata.cells.get_mut(&cell_id) {
            cell.total_statistics -= &old_statistics;
            cell.total_statistics += &new_statistics;
        }

        debug!(
            "Tablet {} stores updated: {} added, {} removed",
            tablet_id,
            added,
            to_remove.len()
        );
        true
    }
}
