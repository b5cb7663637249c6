//! Tablet manager
//!
//! Owns the cluster metadata and implements every control plane operation:
//! bundles and cells, table mount lifecycle, resharding, cloning, replicas,
//! tablet actions, cell notifications, peer commands and node heartbeats.
//!
//! The manager is a single-threaded state machine. Callers serialize access
//! (see [`crate::TabletMaster`]); messages to cells are collected in an
//! [`Outbox`] and drained after each operation.

mod actions;
mod bundles;
mod nodes;
mod notifications;
mod peers;
mod replicas;
mod tables;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::{TabletActionConfig, TabletManagerConfig};
use crate::error::{Error, Result};
use crate::hive::{CellMessage, Envelope, Outbox};
use crate::metadata::{
    BundleId, CellHealth, CellId, ClusterMetadata, TableId, TabletId, TabletStatistics,
};
use crate::scheduler::{CellLoad, PlacementStrategy, TabletAssignment, TabletLoad};

pub use actions::TabletActionRequest;
pub use nodes::{CellSlotReport, HeartbeatResponse, NodeHeartbeat, NodeUpdate, SlotAssignment};
pub use notifications::CellNotification;

/// Tablet manager
pub struct TabletManager {
    config: TabletManagerConfig,
    action_config: TabletActionConfig,
    metadata: ClusterMetadata,
    outbox: Outbox,
    placement: PlacementStrategy,
    /// Time of the operation being applied
    now: DateTime<Utc>,
}

impl TabletManager {
    /// Create a manager over existing metadata
    pub fn new(
        config: TabletManagerConfig,
        action_config: TabletActionConfig,
        metadata: ClusterMetadata,
        now: DateTime<Utc>,
    ) -> Self {
        let mut outbox = Outbox::new();
        for cell_id in metadata.cells.keys() {
            outbox.create_mailbox(*cell_id);
        }
        let placement = PlacementStrategy::new(config.tablet_data_size_footprint);
        Self {
            config,
            action_config,
            metadata,
            outbox,
            placement,
            now,
        }
    }

    pub fn config(&self) -> &TabletManagerConfig {
        &self.config
    }

    pub fn metadata(&self) -> &ClusterMetadata {
        &self.metadata
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Move the operation clock forward; it never goes back
    pub fn advance_clock(&mut self, now: DateTime<Utc>) {
        if now > self.now {
            self.now = now;
        }
    }

    /// Stamp the metadata with the operation clock
    pub(crate) fn touch_metadata(&mut self) {
        self.metadata.touch(self.now);
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Take every message posted since the last drain
    pub fn drain_outbox(&mut self) -> Vec<Envelope> {
        self.outbox.drain()
    }

    // ==================== shared helpers ====================

    /// Ids of the tablets `first..=last` of a table
    fn tablet_ids_in_range(&self, table_id: TableId, first: usize, last: usize) -> Result<Vec<TabletId>> {
        let table = self.metadata.table(table_id)?;
        table
            .tablets
            .get(first..=last)
            .map(|ids| ids.to_vec())
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "Invalid tablet index range [{}, {}]: table has {} tablet(s)",
                    first,
                    last,
                    table.tablets.len()
                ))
            })
    }

    fn validate_has_healthy_cells(&self, bundle_id: BundleId) -> Result<()> {
        let bundle = self.metadata.bundle(bundle_id)?;
        let healthy = bundle.cells.iter().any(|id| {
            self.metadata
                .cells
                .get(id)
                .map(|c| c.health() == CellHealth::Good)
                .unwrap_or(false)
        });
        if healthy {
            Ok(())
        } else {
            Err(Error::Unavailable(format!(
                "No healthy tablet cells in bundle {:?}",
                bundle.name
            )))
        }
    }

    /// Statistics of a tablet charged with the given in-memory mode
    fn tablet_statistics(&self, tablet_id: TabletId) -> Result<TabletStatistics> {
        let tablet = self.metadata.tablet(tablet_id)?;
        Ok(self
            .metadata
            .chunks
            .tablet_statistics(tablet_id, tablet.in_memory_mode))
    }

    /// Choose cells for tablets of a table
    ///
    /// With a hint every tablet goes to the hint cell; otherwise the good
    /// cells of the table's bundle are packed by the placement strategy.
    fn compute_tablet_assignment(
        &self,
        table_id: TableId,
        hint: Option<CellId>,
        tablet_ids: &[TabletId],
    ) -> Result<TabletAssignment> {
        let table = self.metadata.table(table_id)?;
        let mode = table.in_memory_mode;
        let tablets: Vec<TabletLoad> = tablet_ids
            .iter()
            .map(|id| TabletLoad {
                tablet_id: *id,
                statistics: self.metadata.chunks.tablet_statistics(*id, mode),
            })
            .collect();

        if hint.is_some() {
            return Ok(self.placement.assign(hint, &[], &tablets, mode));
        }

        let bundle = self.metadata.bundle(table.bundle_id)?;
        let cells: Vec<CellLoad> = bundle
            .cells
            .iter()
            .filter_map(|id| self.metadata.cells.get(id))
            .filter(|c| c.health() == CellHealth::Good)
            .map(|c| CellLoad {
                cell_id: c.id,
                statistics: c.total_statistics.clone(),
            })
            .collect();
        if cells.is_empty() {
            return Err(Error::Unavailable(format!(
                "No healthy tablet cells in bundle {:?}",
                bundle.name
            )));
        }

        Ok(self.placement.assign(None, &cells, &tablets, mode))
    }

    /// Remove an active tablet from its cell, releasing its statistics
    fn detach_tablet_from_cell(&mut self, tablet_id: TabletId) -> Result<()> {
        let Some(cell_id) = self.metadata.tablet(tablet_id)?.cell else {
            return Ok(());
        };
        let statistics = self.tablet_statistics(tablet_id)?;
        if let Some(cell) = self.metadata.cells.get_mut(&cell_id) {
            cell.total_statistics -= &statistics;
            cell.tablets.remove(&tablet_id);
        }
        self.metadata.tablet_mut(tablet_id)?.cell = None;
        debug!("Detached tablet {} from cell {}", tablet_id, cell_id);
        Ok(())
    }

    /// Post a message to the cell hosting a tablet
    fn post_to_tablet_cell(&mut self, tablet_id: TabletId, message: CellMessage) -> Result<()> {
        match self.metadata.tablet(tablet_id)?.cell {
            Some(cell_id) => self.outbox.post(cell_id, message),
            None => debug!("Tablet {} has no cell, message dropped", tablet_id),
        }
        Ok(())
    }
}
