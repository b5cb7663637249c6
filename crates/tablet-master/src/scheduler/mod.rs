//! Scheduling algorithms
//!
//! Pure planning code used by the tablet manager: tablet placement onto cells
//! and reshard planning. Nothing here mutates metadata.

pub mod placement;
pub mod reshard;

pub use placement::{CellLoad, PlacementStrategy, TabletAssignment, TabletLoad};
pub use reshard::{
    calculate_pivot_keys, check_sorted_chunk_coverage, distribute_ordered_chunks,
    distribute_sorted_chunks, validate_pivot_keys, RangeTablet,
};
