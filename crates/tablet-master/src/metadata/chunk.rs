//! Chunk catalog
//!
//! Stand-in for the chunk storage layer: owns chunk metadata and the chunk list
//! of every tablet, and computes statistics rollups.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::{ChunkId, InMemoryMode, PivotKey, TabletId, TabletStatistics};

/// Immutable data segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    /// Smallest key stored in the chunk (inclusive)
    pub min_key: PivotKey,
    /// Largest key stored in the chunk (inclusive)
    pub max_key: PivotKey,
    pub uncompressed_data_size: i64,
    pub compressed_data_size: i64,
    pub row_count: i64,
}

impl Chunk {
    /// Whether the chunk intersects `[lower, upper)`; `None` upper is unbounded
    pub fn intersects(&self, lower: &[u8], upper: Option<&[u8]>) -> bool {
        if self.max_key.as_slice() < lower {
            return false;
        }
        match upper {
            Some(upper) => self.min_key.as_slice() < upper,
            None => true,
        }
    }
}

/// Chunk metadata and per-tablet chunk lists
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkCatalog {
    chunks: BTreeMap<ChunkId, Chunk>,
    chunk_lists: BTreeMap<TabletId, Vec<ChunkId>>,
}

impl ChunkCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(&id)
    }

    /// Chunk ids attached to a tablet, in list order
    pub fn chunk_ids(&self, tablet_id: TabletId) -> &[ChunkId] {
        self.chunk_lists
            .get(&tablet_id)
            .map(|list| list.as_slice())
            .unwrap_or(&[])
    }

    /// Chunks attached to a tablet, in list order
    pub fn chunks_of(&self, tablet_id: TabletId) -> impl Iterator<Item = &Chunk> + '_ {
        self.chunk_ids(tablet_id)
            .iter()
            .filter_map(move |id| self.chunks.get(id))
    }

    /// Attach a chunk to the end of a tablet's chunk list
    pub fn attach(&mut self, tablet_id: TabletId, chunk: Chunk) {
        let list = self.chunk_lists.entry(tablet_id).or_default();
        if !list.contains(&chunk.id) {
            list.push(chunk.id);
        }
        self.chunks.insert(chunk.id, chunk);
    }

    /// Detach chunks from a tablet's chunk list
    pub fn detach(&mut self, tablet_id: TabletId, chunk_ids: &[ChunkId]) {
        if let Some(list) = self.chunk_lists.get_mut(&tablet_id) {
            list.retain(|id| !chunk_ids.contains(id));
        }
    }

    /// Replace a tablet's chunk list with already registered chunks
    pub fn set_chunk_list(&mut self, tablet_id: TabletId, chunk_ids: Vec<ChunkId>) {
        self.chunk_lists.insert(tablet_id, chunk_ids);
    }

    /// Drop a tablet's chunk list, returning it
    pub fn remove_chunk_list(&mut self, tablet_id: TabletId) -> Vec<ChunkId> {
        self.chunk_lists.remove(&tablet_id).unwrap_or_default()
    }

    /// Forget chunks no longer referenced by any chunk list
    pub fn collect_garbage(&mut self) -> usize {
        let referenced: BTreeSet<ChunkId> = self
            .chunk_lists
            .values()
            .flat_map(|list| list.iter().copied())
            .collect();
        let before = self.chunks.len();
        self.chunks.retain(|id, _| referenced.contains(id));
        before - self.chunks.len()
    }

    /// Statistics of one tablet
    pub fn tablet_statistics(&self, tablet_id: TabletId, mode: InMemoryMode) -> TabletStatistics {
        let mut statistics = self.rollup(self.chunk_ids(tablet_id).iter().copied());
        statistics.memory_size = match mode {
            InMemoryMode::None => 0,
            InMemoryMode::Compressed => statistics.compressed_data_size,
            InMemoryMode::Uncompressed => statistics.uncompressed_data_size,
        };
        statistics.tablet_count = 1;
        statistics.tablet_count_per_memory_mode.insert(mode, 1);
        statistics
    }

    /// Statistics over a tablet range; chunks shared by neighbours count once
    pub fn range_statistics(&self, tablet_ids: &[TabletId]) -> TabletStatistics {
        let unique: BTreeSet<ChunkId> = tablet_ids
            .iter()
            .flat_map(|id| self.chunk_ids(*id).iter().copied())
            .collect();
        let mut statistics = self.rollup(unique.into_iter());
        statistics.tablet_count = tablet_ids.len() as i64;
        statistics
    }

    /// Total row count of a tablet's chunks
    pub fn row_count(&self, tablet_id: TabletId) -> i64 {
        self.chunks_of(tablet_id).map(|c| c.row_count).sum()
    }

    fn rollup(&self, ids: impl Iterator<Item = ChunkId>) -> TabletStatistics {
        let mut statistics = TabletStatistics::default();
        for chunk in ids.filter_map(|id| self.chunks.get(&id)) {
            statistics.uncompressed_data_size += chunk.uncompressed_data_size;
            statistics.compressed_data_size += chunk.compressed_data_size;
            statistics.row_count += chunk.row_count;
            statistics.chunk_count += 1;
        }
        statistics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_chunk(id: u64, min: &[u8], max: &[u8], size: i64) -> Chunk {
        Chunk {
            id: ChunkId(id),
            min_key: min.to_vec(),
            max_key: max.to_vec(),
            uncompressed_data_size: size,
            compressed_data_size: size / 2,
            row_count: size / 10,
        }
    }

    #[test]
    fn test_intersects() {
        let chunk = make_chunk(1, b"c", b"f", 10);
        assert!(chunk.intersects(b"", None));
        assert!(chunk.intersects(b"f", None));
        assert!(!chunk.intersects(b"g", None));
        assert!(!chunk.intersects(b"a", Some(b"c")));
        assert!(chunk.intersects(b"a", Some(b"d")));
    }

    #[test]
    fn test_tablet_statistics_memory_size() {
        let mut catalog = ChunkCatalog::new();
        catalog.attach(TabletId(1), make_chunk(1, b"a", b"b", 100));
        catalog.attach(TabletId(1), make_chunk(2, b"c", b"d", 100));

        let none = catalog.tablet_statistics(TabletId(1), InMemoryMode::None);
        assert_eq!(none.uncompressed_data_size, 200);
        assert_eq!(none.memory_size, 0);

        let compressed = catalog.tablet_statistics(TabletId(1), InMemoryMode::Compressed);
        assert_eq!(compressed.memory_size, 100);

        let uncompressed = catalog.tablet_statistics(TabletId(1), InMemoryMode::Uncompressed);
        assert_eq!(uncompressed.memory_size, 200);
        assert_eq!(uncompressed.chunk_count, 2);
    }

    #[test]
    fn test_range_statistics_count_shared_chunks_once() {
        let mut catalog = ChunkCatalog::new();
        let shared = make_chunk(1, b"a", b"z", 100);
        catalog.attach(TabletId(1), shared.clone());
        catalog.attach(TabletId(2), shared);

        let statistics = catalog.range_statistics(&[TabletId(1), TabletId(2)]);
        assert_eq!(statistics.uncompressed_data_size, 100);
        assert_eq!(statistics.row_count, 10);
    }

    #[test]
    fn test_collect_garbage() {
        let mut catalog = ChunkCatalog::new();
        catalog.attach(TabletId(1), make_chunk(1, b"a", b"b", 10));
        catalog.attach(TabletId(2), make_chunk(2, b"c", b"d", 10));
        catalog.remove_chunk_list(TabletId(1));

        assert_eq!(catalog.collect_garbage(), 1);
        assert!(catalog.chunk(ChunkId(1)).is_none());
        assert!(catalog.chunk(ChunkId(2)).is_some());
    }
}
