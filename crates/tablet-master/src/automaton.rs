//! Mutations of the tablet manager state machine
//!
//! Every state change enters the manager as a [`Mutation`]. Applying
//! mutations one at a time, in order, from the same metadata always yields
//! the same metadata and the same outgoing messages.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::manager::{
    CellNotification, HeartbeatResponse, NodeHeartbeat, NodeUpdate, TabletActionRequest,
    TabletManager,
};
use crate::metadata::{
    ActionId, BundleId, BundleOptions, CellId, Chunk, CloneMode, NodeAddress, PivotKey, ReplicaId,
    ReplicaMode, TableId, TableOptions, TabletId, Timestamp, TransactionId,
};
use crate::tracker::CellCommand;

/// Tablet range selector; both bounds absent selects the whole table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletRange {
    #[serde(default)]
    pub first_tablet_index: Option<usize>,
    #[serde(default)]
    pub last_tablet_index: Option<usize>,
}

/// State machine input
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mutation {
    CreateTabletCellBundle {
        name: String,
        #[serde(default)]
        options: BundleOptions,
    },
    RenameTabletCellBundle {
        bundle_id: BundleId,
        name: String,
    },
    RemoveTabletCellBundle {
        bundle_id: BundleId,
    },
    CreateTabletCell {
        bundle_id: BundleId,
    },
    DestroyTabletCell {
        cell_id: CellId,
    },
    StartCellTransaction {
        cell_id: CellId,
    },
    AbortTransaction {
        transaction_id: TransactionId,
    },
    CreateTable {
        path: String,
        #[serde(default)]
        options: TableOptions,
    },
    RemoveTable {
        path: String,
    },
    AttachChunk {
        path: String,
        tablet_index: usize,
        chunk: Chunk,
    },
    MountTable {
        path: String,
        #[serde(default, flatten)]
        range: TabletRange,
        #[serde(default)]
        cell_id: Option<CellId>,
        #[serde(default)]
        freeze: bool,
    },
    UnmountTable {
        path: String,
        #[serde(default, flatten)]
        range: TabletRange,
        #[serde(default)]
        force: bool,
    },
    RemountTable {
        path: String,
        #[serde(default, flatten)]
        range: TabletRange,
    },
    FreezeTable {
        path: String,
        #[serde(default, flatten)]
        range: TabletRange,
    },
    UnfreezeTable {
        path: String,
        #[serde(default, flatten)]
        range: TabletRange,
    },
    ReshardTable {
        path: String,
        #[serde(default, flatten)]
        range: TabletRange,
        #[serde(default)]
        tablet_count: Option<usize>,
        #[serde(default)]
        pivot_keys: Vec<PivotKey>,
    },
    CloneTable {
        source_path: String,
        destination_path: String,
        mode: CloneMode,
    },
    CreateTableReplica {
        path: String,
        cluster_name: String,
        replica_path: String,
        #[serde(default)]
        start_replication_timestamp: Timestamp,
        #[serde(default)]
        mode: ReplicaMode,
    },
    RemoveTableReplica {
        replica_id: ReplicaId,
    },
    SetTableReplicaEnabled {
        replica_id: ReplicaId,
        enabled: bool,
    },
    SetTableReplicaMode {
        replica_id: ReplicaId,
        mode: ReplicaMode,
    },
    CreateTabletAction {
        request: TabletActionRequest,
    },
    RemoveTabletAction {
        action_id: ActionId,
    },
    CleanupTabletActions,
    CellNotification {
        notification: CellNotification,
    },
    ApplyCellCommands {
        commands: Vec<CellCommand>,
    },
    NodeHeartbeat {
        heartbeat: NodeHeartbeat,
    },
    UpdateNode {
        address: NodeAddress,
        update: NodeUpdate,
    },
    CheckNodeLiveness {
        timeout_secs: i64,
    },
}

impl Mutation {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::CreateTabletCellBundle { .. } => "create_tablet_cell_bundle",
            Mutation::RenameTabletCellBundle { .. } => "rename_tablet_cell_bundle",
            Mutation::RemoveTabletCellBundle { .. } => "remove_tablet_cell_bundle",
            Mutation::CreateTabletCell { .. } => "create_tablet_cell",
            Mutation::DestroyTabletCell { .. } => "destroy_tablet_cell",
            Mutation::StartCellTransaction { .. } => "start_cell_transaction",
            Mutation::AbortTransaction { .. } => "abort_transaction",
            Mutation::CreateTable { .. } => "create_table",
            Mutation::RemoveTable { .. } => "remove_table",
            Mutation::AttachChunk { .. } => "attach_chunk",
            Mutation::MountTable { .. } => "mount_table",
            Mutation::UnmountTable { .. } => "unmount_table",
            Mutation::RemountTable { .. } => "remount_table",
            Mutation::FreezeTable { .. } => "freeze_table",
            Mutation::UnfreezeTable { .. } => "unfreeze_table",
            Mutation::ReshardTable { .. } => "reshard_table",
            Mutation::CloneTable { .. } => "clone_table",
            Mutation::CreateTableReplica { .. } => "create_table_replica",
            Mutation::RemoveTableReplica { .. } => "remove_table_replica",
            Mutation::SetTableReplicaEnabled { .. } => "set_table_replica_enabled",
            Mutation::SetTableReplicaMode { .. } => "set_table_replica_mode",
            Mutation::CreateTabletAction { .. } => "create_tablet_action",
            Mutation::RemoveTabletAction { .. } => "remove_tablet_action",
            Mutation::CleanupTabletActions => "cleanup_tablet_actions",
            Mutation::CellNotification { .. } => "cell_notification",
            Mutation::ApplyCellCommands { .. } => "apply_cell_commands",
            Mutation::NodeHeartbeat { .. } => "node_heartbeat",
            Mutation::UpdateNode { .. } => "update_node",
            Mutation::CheckNodeLiveness { .. } => "check_node_liveness",
        }
    }
}

/// Result of an applied mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MutationResponse {
    Done,
    Bundle(BundleId),
    Cell(CellId),
    Transaction(TransactionId),
    Table(TableId),
    Tablets(Vec<TabletId>),
    Replica(ReplicaId),
    Action(ActionId),
    /// Whether a notification or abort changed anything
    Applied(bool),
    Count(usize),
    Heartbeat(HeartbeatResponse),
    Nodes(Vec<NodeAddress>),
}

impl TabletManager {
    /// Apply one mutation
    ///
    /// A rejected mutation leaves the metadata untouched.
    pub fn apply(&mut self, mutation: Mutation) -> Result<MutationResponse> {
        debug!("Applying mutation {}", mutation.name());
        let response = match mutation {
            Mutation::CreateTabletCellBundle { name, options } => {
                MutationResponse::Bundle(self.create_tablet_cell_bundle(&name, options)?)
            }
            Mutation::RenameTabletCellBundle { bundle_id, name } => {
                self.rename_tablet_cell_bundle(bundle_id, &name)?;
                MutationResponse::Done
            }
            Mutation::RemoveTabletCellBundle { bundle_id } => {
                self.remove_tablet_cell_bundle(bundle_id)?;
                MutationResponse::Done
            }
            Mutation::CreateTabletCell { bundle_id } => {
                MutationResponse::Cell(self.create_tablet_cell(bundle_id)?)
            }
            Mutation::DestroyTabletCell { cell_id } => {
                self.destroy_tablet_cell(cell_id)?;
                MutationResponse::Done
            }
            Mutation::StartCellTransaction { cell_id } => {
                MutationResponse::Transaction(self.start_cell_transaction(cell_id)?)
            }
            Mutation::AbortTransaction { transaction_id } => {
                MutationResponse::Applied(self.on_prerequisite_aborted(transaction_id))
            }
            Mutation::CreateTable { path, options } => {
                MutationResponse::Table(self.create_table(&path, options)?)
            }
            Mutation::RemoveTable { path } => {
                self.remove_table(&path)?;
                MutationResponse::Done
            }
            Mutation::AttachChunk {
                path,
                tablet_index,
                chunk,
            } => {
                self.attach_chunk(&path, tablet_index, chunk)?;
                MutationResponse::Done
            }
            Mutation::MountTable {
                path,
                range,
                cell_id,
                freeze,
            } => {
                self.mount_table(
                    &path,
                    range.first_tablet_index,
                    range.last_tablet_index,
                    cell_id,
                    freeze,
                )?;
                MutationResponse::Done
            }
            Mutation::UnmountTable { path, range, force } => {
                self.unmount_table(
                    &path,
                    range.first_tablet_index,
                    range.last_tablet_index,
                    force,
                )?;
                MutationResponse::Done
            }
            Mutation::RemountTable { path, range } => {
                self.remount_table(&path, range.first_tablet_index, range.last_tablet_index)?;
                MutationResponse::Done
            }
            Mutation::FreezeTable { path, range } => {
                self.freeze_table(&path, range.first_tablet_index, range.last_tablet_index)?;
                MutationResponse::Done
            }
            Mutation::UnfreezeTable { path, range } => {
                self.unfreeze_table(&path, range.first_tablet_index, range.last_tablet_index)?;
                MutationResponse::Done
            }
            Mutation::ReshardTable {
                path,
                range,
                tablet_count,
                pivot_keys,
            } => MutationResponse::Tablets(self.reshard_table(
                &path,
                range.first_tablet_index,
                range.last_tablet_index,
                tablet_count,
                pivot_keys,
            )?),
            Mutation::CloneTable {
                source_path,
                destination_path,
                mode,
            } => MutationResponse::Table(self.clone_table(&source_path, &destination_path, mode)?),
            Mutation::CreateTableReplica {
                path,
                cluster_name,
                replica_path,
                start_replication_timestamp,
                mode,
            } => MutationResponse::Replica(self.create_table_replica(
                &path,
                &cluster_name,
                &replica_path,
                start_replication_timestamp,
                mode,
            )?),
            Mutation::RemoveTableReplica { replica_id } => {
                self.remove_table_replica(replica_id)?;
                MutationResponse::Done
            }
            Mutation::SetTableReplicaEnabled {
                replica_id,
                enabled,
            } => {
                self.set_table_replica_enabled(replica_id, enabled)?;
                MutationResponse::Done
            }
            Mutation::SetTableReplicaMode { replica_id, mode } => {
                self.set_table_replica_mode(replica_id, mode)?;
                MutationResponse::Done
            }
            Mutation::CreateTabletAction { request } => {
                MutationResponse::Action(self.create_tablet_action(request)?)
            }
            Mutation::RemoveTabletAction { action_id } => {
                self.remove_tablet_action(action_id)?;
                MutationResponse::Done
            }
            Mutation::CleanupTabletActions => {
                MutationResponse::Count(self.cleanup_expired_tablet_actions())
            }
            Mutation::CellNotification { notification } => {
                MutationResponse::Applied(self.on_cell_notification(notification))
            }
            Mutation::ApplyCellCommands { commands } => {
                MutationResponse::Count(self.apply_cell_commands(commands))
            }
            Mutation::NodeHeartbeat { heartbeat } => {
                MutationResponse::Heartbeat(self.process_heartbeat(heartbeat))
            }
            Mutation::UpdateNode { address, update } => {
                self.update_node(&address, update)?;
                MutationResponse::Done
            }
            Mutation::CheckNodeLiveness { timeout_secs } => {
                MutationResponse::Nodes(self.check_node_liveness(timeout_secs))
            }
        };
        self.touch_metadata();
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_wire_format() {
        let mutation: Mutation = serde_json::from_str(
            r#"{"type":"mount_table","path":"//t","first_tablet_index":1,"freeze":true}"#,
        )
        .unwrap();
        match mutation {
            Mutation::MountTable {
                path,
                range,
                cell_id,
                freeze,
            } => {
                assert_eq!(path, "//t");
                assert_eq!(range.first_tablet_index, Some(1));
                assert_eq!(range.last_tablet_index, None);
                assert_eq!(cell_id, None);
                assert!(freeze);
            }
            other => panic!("unexpected mutation {:?}", other),
        }
    }

    #[test]
    fn test_apply_stamps_metadata() {
        use crate::config::{TabletActionConfig, TabletManagerConfig};
        use crate::metadata::ClusterMetadata;
        use chrono::{Duration, TimeZone, Utc};

        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut manager = TabletManager::new(
            TabletManagerConfig::default(),
            TabletActionConfig::default(),
            ClusterMetadata::new("test".to_string(), start),
            start,
        );
        let later = start + Duration::seconds(30);
        manager.advance_clock(later);

        let response = manager
            .apply(Mutation::CreateTabletCellBundle {
                name: "default".to_string(),
                options: BundleOptions::default(),
            })
            .unwrap();
        assert!(matches!(response, MutationResponse::Bundle(_)));
        assert_eq!(manager.metadata().updated_at, later);

        // A rejected mutation does not stamp the metadata
        manager.advance_clock(later + Duration::seconds(30));
        assert!(manager.apply(Mutation::RemoveTable { path: "//missing".to_string() }).is_err());
        assert_eq!(manager.metadata().updated_at, later);
    }

    #[test]
    fn test_notification_mutation_wire_format() {
        let mutation: Mutation = serde_json::from_str(
            r#"{"type":"cell_notification","notification":{"type":"tablet_mounted","tablet_id":5,"mount_revision":3}}"#,
        )
        .unwrap();
        assert_eq!(mutation.name(), "cell_notification");
    }
}
