//! Control plane metadata definitions
//!
//! Contains the entity model: tablets, tablet cells, bundles, table replicas,
//! tablet actions, plus the namespace and chunk stand-ins they reference

mod ids;
mod tablet;
mod cell;
mod bundle;
mod replica;
mod action;
mod table;
mod chunk;
mod node;
mod cluster;

pub use ids::{
    ActionId, BundleId, CellId, ChunkId, IdGenerator, NodeAddress, PeerId, PivotKey, ReplicaId,
    TableId, TabletId, Timestamp, TransactionId,
};
pub use tablet::{InMemoryMode, TableReplicaInfo, Tablet, TabletState, TabletStatistics};
pub use cell::{CellHealth, CellPeer, PeerState, TabletCell};
pub use bundle::{BundleOptions, TabletCellBundle};
pub use replica::{ReplicaMode, ReplicaState, TableReplica};
pub use action::{ActionKind, ActionState, TabletAction};
pub use table::{CloneMode, Table, TableOptions};
pub use chunk::{Chunk, ChunkCatalog};
pub use node::{NodeInfo, NodeState};
pub use cluster::{ClusterMetadata, ClusterStats, SNAPSHOT_VERSION};
