//! Reshard planning
//!
//! Pure helpers used by table resharding: pivot computation, pivot validation,
//! chunk coverage checks and redistribution of chunk lists.

use std::collections::BTreeSet;

use crate::metadata::{Chunk, ChunkCatalog, ChunkId, PivotKey};

/// Tablet of the range being resharded
#[derive(Debug, Clone)]
pub struct RangeTablet {
    pub pivot_key: PivotKey,
    pub chunk_ids: Vec<ChunkId>,
}

/// Compute pivot keys splitting the chunks into `tablet_count` buckets of
/// roughly equal uncompressed size
///
/// The first pivot is always `first_pivot`. Fewer pivots are produced when the
/// chunks do not offer enough non-overlapping boundaries.
pub fn calculate_pivot_keys(
    first_pivot: &PivotKey,
    chunks: &[&Chunk],
    tablet_count: usize,
) -> Vec<PivotKey> {
    let mut pivots = vec![first_pivot.clone()];
    if tablet_count <= 1 {
        return pivots;
    }

    let mut entries: Vec<&Chunk> = chunks.to_vec();
    entries.sort_by(|a, b| a.min_key.cmp(&b.min_key).then(a.id.cmp(&b.id)));

    let total: i64 = entries.iter().map(|c| c.uncompressed_data_size).sum();
    let desired = total / tablet_count as i64;
    if desired == 0 {
        return pivots;
    }

    let mut last_key: Option<&PivotKey> = None;
    let mut current = 0i64;
    for entry in entries {
        let is_gap = last_key.map(|key| *key < entry.min_key).unwrap_or(false);
        let after_last_pivot = pivots.last().map(|p| *p < entry.min_key).unwrap_or(true);
        if is_gap && after_last_pivot && current >= desired && pivots.len() < tablet_count {
            current = 0;
            pivots.push(entry.min_key.clone());
            last_key = Some(&entry.max_key);
        } else if last_key.map(|key| entry.max_key > *key).unwrap_or(true) {
            last_key = Some(&entry.max_key);
        }
        current += entry.uncompressed_data_size;
    }

    pivots
}

/// Validate caller supplied pivot keys for a sorted table
pub fn validate_pivot_keys(
    pivot_keys: &[PivotKey],
    first_tablet_pivot: &PivotKey,
    next_tablet_pivot: Option<&PivotKey>,
    new_tablet_count: usize,
) -> Result<(), String> {
    if pivot_keys.is_empty() {
        return Err("Table is sorted; must provide pivot keys".to_string());
    }
    if pivot_keys.len() != new_tablet_count {
        return Err(format!(
            "Wrong pivot key count: {} instead of {}",
            pivot_keys.len(),
            new_tablet_count
        ));
    }
    if pivot_keys[0] != *first_tablet_pivot {
        return Err(
            "First pivot key must match that of the first tablet in the resharded range"
                .to_string(),
        );
    }
    if let (Some(next), Some(last)) = (next_tablet_pivot, pivot_keys.last()) {
        if last >= next {
            return Err(
                "Last pivot key must be strictly less than that of the tablet which follows the resharded range"
                    .to_string(),
            );
        }
    }
    for window in pivot_keys.windows(2) {
        if window[0] >= window[1] {
            return Err("Pivot keys must be strictly increasing".to_string());
        }
    }
    Ok(())
}

/// Verify that every chunk is attached to every old tablet whose key range it
/// intersects
pub fn check_sorted_chunk_coverage(
    tablets: &[RangeTablet],
    upper: Option<&PivotKey>,
    catalog: &ChunkCatalog,
) -> Result<(), String> {
    for (index, tablet) in tablets.iter().enumerate() {
        for chunk_id in &tablet.chunk_ids {
            let Some(chunk) = catalog.chunk(*chunk_id) else {
                return Err(format!("Chunk {} is missing", chunk_id));
            };
            for (other_index, other) in tablets.iter().enumerate() {
                if other_index == index {
                    continue;
                }
                let other_upper = tablets
                    .get(other_index + 1)
                    .map(|t| t.pivot_key.as_slice())
                    .or(upper.map(|u| u.as_slice()));
                if chunk.intersects(&other.pivot_key, other_upper)
                    && !other.chunk_ids.contains(chunk_id)
                {
                    return Err(format!(
                        "Chunk {} crosses the boundary of tablet #{} but is not attached to it; \
                         please wait until stores are compacted",
                        chunk_id, other_index
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Distribute the chunks of a sorted range over new tablets by key intersection
///
/// Chunks intersecting several new tablets are shared by all of them.
pub fn distribute_sorted_chunks(
    tablets: &[RangeTablet],
    pivot_keys: &[PivotKey],
    upper: Option<&PivotKey>,
    catalog: &ChunkCatalog,
) -> Result<Vec<Vec<ChunkId>>, String> {
    let all: BTreeSet<ChunkId> = tablets
        .iter()
        .flat_map(|t| t.chunk_ids.iter().copied())
        .collect();

    let mut result = vec![Vec::new(); pivot_keys.len()];
    for chunk_id in all {
        let Some(chunk) = catalog.chunk(chunk_id) else {
            return Err(format!("Chunk {} is missing", chunk_id));
        };
        let mut attached = false;
        for (index, pivot) in pivot_keys.iter().enumerate() {
            let next = pivot_keys
                .get(index + 1)
                .map(|p| p.as_slice())
                .or(upper.map(|u| u.as_slice()));
            if chunk.intersects(pivot, next) {
                result[index].push(chunk_id);
                attached = true;
            }
        }
        if !attached {
            return Err(format!(
                "Chunk {} lies outside of the resharded key range",
                chunk_id
            ));
        }
    }
    Ok(result)
}

/// Distribute the chunk lists of an ordered range over new tablets
///
/// Old tablets are carried over one to one; the last new tablet absorbs the
/// remaining old tail; extra new tablets start empty.
pub fn distribute_ordered_chunks(
    old_lists: Vec<Vec<ChunkId>>,
    new_tablet_count: usize,
) -> Vec<Vec<ChunkId>> {
    let mut result = vec![Vec::new(); new_tablet_count];
    if new_tablet_count == 0 {
        return result;
    }
    for (index, list) in old_lists.into_iter().enumerate() {
        let target = index.min(new_tablet_count - 1);
        result[target].extend(list);
    }
    result
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
            compressed_data_size: size,
            row_count: size,
        }
    }

    #[test]
    fn test_calculate_pivot_keys_uniform() {
        let chunks = vec![
            make_chunk(1, b"a", b"b", 10),
            make_chunk(2, b"c", b"d", 10),
            make_chunk(3, b"e", b"f", 10),
            make_chunk(4, b"g", b"h", 10),
        ];
        let refs: Vec<_> = chunks.iter().collect();

        let pivots = calculate_pivot_keys(&Vec::new(), &refs, 2);
        assert_eq!(pivots, vec![Vec::new(), b"e".to_vec()]);

        let pivots = calculate_pivot_keys(&Vec::new(), &refs, 4);
        assert_eq!(
            pivots,
            vec![Vec::new(), b"c".to_vec(), b"e".to_vec(), b"g".to_vec()]
        );
    }

    #[test]
    fn test_calculate_pivot_keys_skips_overlapping_chunks() {
        let chunks = vec![
            make_chunk(1, b"a", b"m", 10),
            make_chunk(2, b"c", b"d", 10),
            make_chunk(3, b"n", b"p", 10),
        ];
        let refs: Vec<_> = chunks.iter().collect();

        let pivots = calculate_pivot_keys(&b"a".to_vec(), &refs, 2);
        assert_eq!(pivots, vec![b"a".to_vec(), b"n".to_vec()]);
    }

    #[test]
    fn test_calculate_pivot_keys_empty_data() {
        let pivots = calculate_pivot_keys(&b"k".to_vec(), &[], 3);
        assert_eq!(pivots, vec![b"k".to_vec()]);
    }

    #[test]
    fn test_validate_pivot_keys() {
        let first = b"b".to_vec();
        let next = b"x".to_vec();
        let good = vec![b"b".to_vec(), b"d".to_vec(), b"k".to_vec()];
        assert!(validate_pivot_keys(&good, &first, Some(&next), 3).is_ok());
        assert!(validate_pivot_keys(&good, &first, None, 3).is_ok());

        assert!(validate_pivot_keys(&[], &first, None, 0).is_err());
        assert!(validate_pivot_keys(&good, &first, Some(&next), 2).is_err());

        let wrong_first = vec![b"c".to_vec(), b"d".to_vec()];
        assert!(validate_pivot_keys(&wrong_first, &first, None, 2).is_err());

        let past_next = vec![b"b".to_vec(), b"x".to_vec()];
        assert!(validate_pivot_keys(&past_next, &first, Some(&next), 2).is_err());

        let not_increasing = vec![b"b".to_vec(), b"k".to_vec(), b"k".to_vec()];
        assert!(validate_pivot_keys(&not_increasing, &first, None, 3).is_err());
    }

    #[test]
    fn test_chunk_coverage() {
        let mut catalog = ChunkCatalog::new();
        let straddling = make_chunk(1, b"c", b"p", 10);
        catalog.attach(crate::metadata::TabletId(1), straddling);

        let missing_in_second = vec![
            RangeTablet {
                pivot_key: Vec::new(),
                chunk_ids: vec![ChunkId(1)],
            },
            RangeTablet {
                pivot_key: b"m".to_vec(),
                chunk_ids: vec![],
            },
        ];
        let error = check_sorted_chunk_coverage(&missing_in_second, None, &catalog).unwrap_err();
        assert!(error.contains("please wait until stores are compacted"));

        let shared = vec![
            RangeTablet {
                pivot_key: Vec::new(),
                chunk_ids: vec![ChunkId(1)],
            },
            RangeTablet {
                pivot_key: b"m".to_vec(),
                chunk_ids: vec![ChunkId(1)],
            },
        ];
        assert!(check_sorted_chunk_coverage(&shared, None, &catalog).is_ok());
    }

    #[test]
    fn test_distribute_sorted_chunks() {
        let mut catalog = ChunkCatalog::new();
        let tablet = crate::metadata::TabletId(1);
        catalog.attach(tablet, make_chunk(1, b"a", b"b", 10));
        catalog.attach(tablet, make_chunk(2, b"c", b"f", 10));
        catalog.attach(tablet, make_chunk(3, b"g", b"h", 10));
        let range = vec![RangeTablet {
            pivot_key: Vec::new(),
            chunk_ids: vec![ChunkId(1), ChunkId(2), ChunkId(3)],
        }];
        let pivots = vec![Vec::new(), b"d".to_vec(), b"g".to_vec()];

        let lists = distribute_sorted_chunks(&range, &pivots, None, &catalog).unwrap();
        assert_eq!(lists[0], vec![ChunkId(1), ChunkId(2)]);
        assert_eq!(lists[1], vec![ChunkId(2)]);
        assert_eq!(lists[2], vec![ChunkId(3)]);
    }

    #[test]
    fn test_distribute_ordered_chunks() {
        let old = vec![
            vec![ChunkId(1)],
            vec![ChunkId(2)],
            vec![ChunkId(3), ChunkId(4)],
        ];

        let shrink = distribute_ordered_chunks(old.clone(), 2);
        assert_eq!(shrink, vec![vec![ChunkId(1)], vec![ChunkId(2), ChunkId(3), ChunkId(4)]]);

        let grow = distribute_ordered_chunks(old, 4);
        assert_eq!(grow[2], vec![ChunkId(3), ChunkId(4)]);
        assert!(grow[3].is_empty());
    }
}
