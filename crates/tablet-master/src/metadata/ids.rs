//! Object identifiers and the id registry

use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "-{:x}"), self.0)
            }
        }
    };
}

define_id!(
    /// Table id
    TableId,
    "table"
);
define_id!(
    /// Tablet id
    TabletId,
    "tablet"
);
define_id!(
    /// Tablet cell id
    CellId,
    "cell"
);
define_id!(
    /// Tablet cell bundle id
    BundleId,
    "bundle"
);
define_id!(
    /// Table replica id
    ReplicaId,
    "replica"
);
define_id!(
    /// Tablet action id
    ActionId,
    "action"
);
define_id!(
    /// Chunk (data segment) id
    ChunkId,
    "chunk"
);
define_id!(
    /// Transaction id (prerequisite leases and cell subtree transactions)
    TransactionId,
    "tx"
);

/// Physical node address (host:port)
pub type NodeAddress = String;

/// Index of a peer slot inside a cell
pub type PeerId = usize;

/// Lower bound key of a sorted tablet; the empty key is the minimum key
pub type PivotKey = Vec<u8>;

/// Logical timestamp
pub type Timestamp = u64;

/// Id registry
///
/// Hands out ids from one monotonically increasing counter so that ids of all
/// kinds are unique and allocation is deterministic under replay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdGenerator {
    last: u64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate next id
    pub fn generate<I: From<u64>>(&mut self) -> I {
        self.last += 1;
        I::from(self.last)
    }
}
