//! Table definitions
//!
//! Tables are owned by the namespace; the control plane keeps the subset of
//! table state it needs to place and reshard tablets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{BundleId, InMemoryMode, PivotKey, ReplicaId, TableId, TabletId};

/// Options supplied when a table is created in the namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableOptions {
    /// Name of the tablet cell bundle
    pub bundle: String,
    #[serde(default = "default_true")]
    pub dynamic: bool,
    #[serde(default = "default_true")]
    pub sorted: bool,
    #[serde(default)]
    pub replicated: bool,
    #[serde(default)]
    pub in_memory_mode: InMemoryMode,
    /// Initial tablet count of an ordered table
    #[serde(default = "default_tablet_count")]
    pub tablet_count: usize,
    /// Initial pivot keys of a sorted table, first must be empty
    #[serde(default)]
    pub pivot_keys: Vec<PivotKey>,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            bundle: "default".to_string(),
            dynamic: true,
            sorted: true,
            replicated: false,
            in_memory_mode: InMemoryMode::None,
            tablet_count: 1,
            pivot_keys: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tablet_count() -> usize {
    1
}

/// How a table is cloned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloneMode {
    /// Source stays; tablets must be unmounted or frozen
    Copy,
    /// Source is removed; tablets must be unmounted
    Move,
}

impl std::fmt::Display for CloneMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloneMode::Copy => write!(f, "copy"),
            CloneMode::Move => write!(f, "move"),
        }
    }
}

/// Table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub id: TableId,
    pub path: String,
    pub bundle_id: BundleId,
    pub dynamic: bool,
    pub sorted: bool,
    pub replicated: bool,
    pub in_memory_mode: InMemoryMode,
    /// Tablets in index order
    pub tablets: Vec<TabletId>,
    pub replicas: BTreeSet<ReplicaId>,
}

impl Table {
    /// Resolve `(first, last)` into an inclusive index range
    ///
    /// `None` for both indexes selects the whole table.
    pub fn parse_tablet_range(
        &self,
        first: Option<usize>,
        last: Option<usize>,
    ) -> Result<(usize, usize), String> {
        let count = self.tablets.len();
        match (first, last) {
            (None, None) => {
                if count == 0 {
                    return Err(format!("Table {} has no tablets", self.path));
                }
                Ok((0, count - 1))
            }
            (first, last) => {
                let first = first.unwrap_or(0);
                let last = last.unwrap_or_else(|| count.saturating_sub(1));
                if first >= count || last >= count {
                    return Err(format!(
                        "Invalid tablet index range [{}, {}]: table has {} tablet(s)",
                        first, last, count
                    ));
                }
                if first > last {
                    return Err(format!(
                        "Invalid tablet index range [{}, {}]: first index is greater than last",
                        first, last
                    ));
                }
                Ok((first, last))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_table(tablet_count: u64) -> Table {
        Table {
            id: TableId(1),
            path: "//t".to_string(),
            bundle_id: BundleId(2),
            dynamic: true,
            sorted: true,
            replicated: false,
            in_memory_mode: InMemoryMode::None,
            tablets: (0..tablet_count).map(|i| TabletId(10 + i)).collect(),
            replicas: BTreeSet::new(),
        }
    }

    #[test]
    fn test_parse_full_range() {
        let table = make_table(4);
        assert_eq!(table.parse_tablet_range(None, None), Ok((0, 3)));
    }

    #[test]
    fn test_parse_partial_range() {
        let table = make_table(4);
        assert_eq!(table.parse_tablet_range(Some(1), Some(2)), Ok((1, 2)));
        assert_eq!(table.parse_tablet_range(Some(2), None), Ok((2, 3)));
    }

    #[test]
    fn test_parse_invalid_range() {
        let table = make_table(4);
        assert!(table.parse_tablet_range(Some(4), Some(4)).is_err());
        assert!(table.parse_tablet_range(Some(2), Some(1)).is_err());
        assert!(make_table(0).parse_tablet_range(None, None).is_err());
    }
}
