//! Tablet placement strategy
//!
//! Greedy multi-way bin packing: tablets are taken largest first and each goes
//! to the currently least loaded cell.

use std::collections::{BTreeMap, BTreeSet};

use crate::metadata::{CellId, InMemoryMode, TabletId, TabletStatistics};

/// Load snapshot of a candidate cell
#[derive(Debug, Clone)]
pub struct CellLoad {
    pub cell_id: CellId,
    pub statistics: TabletStatistics,
}

/// Size snapshot of a tablet waiting for a cell
#[derive(Debug, Clone)]
pub struct TabletLoad {
    pub tablet_id: TabletId,
    pub statistics: TabletStatistics,
}

/// Result of a placement round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabletAssignment {
    /// Destination of every tablet, in placement order
    pub assignments: Vec<(TabletId, CellId)>,
    /// Load of every candidate cell after placement
    pub cell_loads: BTreeMap<CellId, i64>,
}

impl TabletAssignment {
    /// Cell chosen for a tablet
    pub fn cell_of(&self, tablet_id: TabletId) -> Option<CellId> {
        self.assignments
            .iter()
            .find(|(id, _)| *id == tablet_id)
            .map(|(_, cell)| *cell)
    }
}

/// Placement strategy
#[derive(Debug, Clone)]
pub struct PlacementStrategy {
    /// Fixed cost added per tablet so that many small tablets still spread out
    pub tablet_data_size_footprint: i64,
}

impl Default for PlacementStrategy {
    fn default() -> Self {
        Self {
            tablet_data_size_footprint: 64 * 1024 * 1024,
        }
    }
}

impl PlacementStrategy {
    pub fn new(tablet_data_size_footprint: i64) -> Self {
        Self {
            tablet_data_size_footprint,
        }
    }

    /// Load of a cell as seen by tablets of the given in-memory mode
    pub fn cell_size(&self, statistics: &TabletStatistics, mode: InMemoryMode) -> i64 {
        match mode {
            InMemoryMode::None => {
                statistics.uncompressed_data_size
                    + statistics.tablet_count * self.tablet_data_size_footprint
            }
            InMemoryMode::Compressed | InMemoryMode::Uncompressed => {
                let in_memory_tablets = statistics.tablet_count_in_mode(InMemoryMode::Compressed)
                    + statistics.tablet_count_in_mode(InMemoryMode::Uncompressed);
                statistics.memory_size + in_memory_tablets * self.tablet_data_size_footprint
            }
        }
    }

    /// Estimated size of a tablet
    pub fn tablet_size(&self, statistics: &TabletStatistics, mode: InMemoryMode) -> i64 {
        let data_size = match mode {
            InMemoryMode::None | InMemoryMode::Uncompressed => statistics.uncompressed_data_size,
            InMemoryMode::Compressed => statistics.compressed_data_size,
        };
        data_size + self.tablet_data_size_footprint
    }

    /// Assign tablets to cells
    ///
    /// A hint cell receives every tablet. Otherwise tablets are sorted by
    /// descending size (ties broken by id) and each is given to the least
    /// loaded cell, ties broken by cell id.
    pub fn assign(
        &self,
        hint: Option<CellId>,
        cells: &[CellLoad],
        tablets: &[TabletLoad],
        mode: InMemoryMode,
    ) -> TabletAssignment {
        if let Some(cell_id) = hint {
            return TabletAssignment {
                assignments: tablets.iter().map(|t| (t.tablet_id, cell_id)).collect(),
                cell_loads: BTreeMap::new(),
            };
        }

        let mut queue: BTreeSet<(i64, CellId)> = cells
            .iter()
            .map(|c| (self.cell_size(&c.statistics, mode), c.cell_id))
            .collect();

        let mut sized: Vec<(i64, TabletId)> = tablets
            .iter()
            .map(|t| (self.tablet_size(&t.statistics, mode), t.tablet_id))
            .collect();
        sized.sort_by(|a, b| b.cmp(a));

        let mut assignments = Vec::with_capacity(sized.len());
        for (size, tablet_id) in sized {
            let Some(&(load, cell_id)) = queue.iter().next() else {
                break;
            };
            queue.remove(&(load, cell_id));
            queue.insert((load + size, cell_id));
            assignments.push((tablet_id, cell_id));
        }

        TabletAssignment {
            assignments,
            cell_loads: queue.into_iter().map(|(load, id)| (id, load)).collect(),
        }
    }
}
