//! Table replicas of replicated tables

use tracing::{debug, info};

use super::TabletManager;
use crate::error::{Error, Result};
use crate::hive::{CellMessage, ReplicaDescriptor};
use crate::metadata::{
    ReplicaId, ReplicaMode, ReplicaState, TableReplica, TableReplicaInfo, TabletId, TabletState,
    Timestamp,
};

impl TabletManager {
    /// Register a replica of a replicated table
    pub fn create_table_replica(
        &mut self,
        path: &str,
        cluster_name: &str,
        replica_path: &str,
        start_replication_timestamp: Timestamp,
        mode: ReplicaMode,
    ) -> Result<ReplicaId> {
        let table_id = self.metadata.resolve_table(path)?;
        let table = self.metadata.table(table_id)?;
        if !table.replicated {
            return Err(Error::InvalidState(format!(
                "Table {} is not replicated",
                path
            )));
        }
        let duplicate = table.replicas.iter().any(|id| {
            self.metadata
                .replicas
                .get(id)
                .map(|r| r.cluster_name == cluster_name && r.replica_path == replica_path)
                .unwrap_or(false)
        });
        if duplicate {
            return Err(Error::AlreadyExists(format!(
                "Replica table {} at cluster {:?} already exists",
                replica_path, cluster_name
            )));
        }
        let tablet_ids = table.tablets.clone();

        let replica_id: ReplicaId = self.metadata.id_generator.generate();
        let replica = TableReplica::new(
            replica_id,
            table_id,
            cluster_name.to_string(),
            replica_path.to_string(),
            start_replication_timestamp,
            mode,
        );
        self.metadata.replicas.insert(replica_id, replica);
        self.metadata.table_mut(table_id)?.replicas.insert(replica_id);

        for tablet_id in tablet_ids {
            let tablet = self.metadata.tablet_mut(tablet_id)?;
            let active = tablet.state.is_active();
            let info = TableReplicaInfo {
                state: if active {
                    ReplicaState::Disabled
                } else {
                    ReplicaState::None
                },
                ..Default::default()
            };
            tablet.replicas.insert(replica_id, info.clone());
            if !active {
                continue;
            }

            let mount_revision = tablet.mount_revision;
            let descriptor = Self::replica_descriptor(self.metadata.replica(replica_id)?, &info);
            self.post_to_tablet_cell(
                tablet_id,
                CellMessage::AddTableReplica {
                    tablet_id,
                    mount_revision,
                    replica: descriptor,
                },
            )?;
        }

        info!(
            "Created table replica {} of table {} ({} at cluster {})",
            replica_id, path, replica_path, cluster_name
        );
        Ok(replica_id)
    }

    /// Remove a replica from its table and every tablet
    pub fn remove_table_replica(&mut self, replica_id: ReplicaId) -> Result<()> {
        let table_id = self.metadata.replica(replica_id)?.table_id;
        let tablet_ids = match self.metadata.tables.get_mut(&table_id) {
            Some(table) => {
                table.replicas.remove(&replica_id);
                table.tablets.clone()
            }
            None => Vec::new(),
        };

        for tablet_id in tablet_ids {
            let tablet = self.metadata.tablet_mut(tablet_id)?;
            tablet.replicas.remove(&replica_id);
            if !tablet.state.is_active() {
                continue;
            }
            let mount_revision = tablet.mount_revision;
            self.post_to_tablet_cell(
                tablet_id,
                CellMessage::RemoveTableReplica {
                    tablet_id,
                    mount_revision,
                    replica_id,
                },
            )?;
        }

        self.metadata.replicas.remove(&replica_id);
        info!("Removed table replica {}", replica_id);
        Ok(())
    }

    /// Enable or disable replication to a replica
    ///
    /// Disabling completes once every active tablet confirmed it.
    pub fn set_table_replica_enabled(&mut self, replica_id: ReplicaId, enabled: bool) -> Result<()> {
        let replica = self.metadata.replica(replica_id)?;
        let state = replica.state;
        let table_id = replica.table_id;
        let tablet_ids = self.metadata.table(table_id)?.tablets.clone();

        if enabled {
            match state {
                ReplicaState::Enabled => return Ok(()),
                ReplicaState::Disabled => {}
                _ => {
                    return Err(Error::InvalidState(format!(
                        "Table replica {} is in {:?} state",
                        replica_id,
                        state.to_string()
                    )))
                }
            }

            info!("Enabling table replica {}", replica_id);
            self.metadata.replica_mut(replica_id)?.state = ReplicaState::Enabled;
            for tablet_id in tablet_ids {
                self.set_tablet_replica_enabled(tablet_id, replica_id, true)?;
            }
        } else {
            match state {
                ReplicaState::Disabled | ReplicaState::Disabling => return Ok(()),
                ReplicaState::Enabled => {}
                _ => {
                    return Err(Error::InvalidState(format!(
                        "Table replica {} is in {:?} state",
                        replica_id,
                        state.to_string()
                    )))
                }
            }
            for tablet_id in &tablet_ids {
                let tablet_state = self.metadata.tablet(*tablet_id)?.state;
                if tablet_state == TabletState::Unmounting {
                    return Err(Error::InvalidState(format!(
                        "Cannot disable replica since tablet {} is in {:?} state",
                        tablet_id,
                        tablet_state.to_string()
                    )));
                }
            }

            info!("Disabling table replica {}", replica_id);
            self.metadata.replica_mut(replica_id)?.state = ReplicaState::Disabling;
            for tablet_id in tablet_ids {
                self.set_tablet_replica_enabled(tablet_id, replica_id, false)?;
            }
            self.check_for_replica_disabled(replica_id);
        }
        Ok(())
    }

    /// Switch an active tablet's entry and tell its cell
    fn set_tablet_replica_enabled(&mut self, tablet_id: TabletId, replica_id: ReplicaId, enabled: bool) -> Result<()> {
        let tablet = self.metadata.tablet_mut(tablet_id)?;
        if !tablet.state.is_active() {
            return Ok(());
        }
        let mount_revision = tablet.mount_revision;
        let Some(info) = tablet.replicas.get_mut(&replica_id) else {
            return Ok(());
        };

        if enabled {
            if info.state != ReplicaState::Disabled {
                return Ok(());
            }
            info.state = ReplicaState::Enabled;
        } else {
            if info.state != ReplicaState::Enabled {
                return Ok(());
            }
            info.state = ReplicaState::Disabling;
            self.metadata
                .replica_mut(replica_id)?
                .disabling_tablets
                .insert(tablet_id);
        }

        self.post_to_tablet_cell(
            tablet_id,
            CellMessage::SetTableReplicaEnabled {
                tablet_id,
                mount_revision,
                replica_id,
                enabled,
            },
        )
    }

    /// Change the replication mode and tell every active tablet
    pub fn set_table_replica_mode(&mut self, replica_id: ReplicaId, mode: ReplicaMode) -> Result<()> {
        let replica = self.metadata.replica_mut(replica_id)?;
        if replica.mode == mode {
            return Ok(());
        }
        replica.mode = mode;
        let table_id = replica.table_id;
        let tablet_ids = self.metadata.table(table_id)?.tablets.clone();

        for tablet_id in tablet_ids {
            let tablet = self.metadata.tablet(tablet_id)?;
            if !tablet.state.is_active() {
                continue;
            }
            let mount_revision = tablet.mount_revision;
            self.post_to_tablet_cell(
                tablet_id,
                CellMessage::SetTableReplicaMode {
                    tablet_id,
                    mount_revision,
                    replica_id,
                    mode,
                },
            )?;
        }

        info!("Table replica {} switched to {} mode", replica_id, mode);
        Ok(())
    }

    /// Finish disabling once no tablet is left to confirm
    pub(super) fn check_for_replica_disabled(&mut self, replica_id: ReplicaId) {
        let Some(replica) = self.metadata.replicas.get_mut(&replica_id) else {
            return;
        };
        if replica.state != ReplicaState::Disabling || !replica.disabling_tablets.is_empty() {
            return;
        }
        replica.state = ReplicaState::Disabled;
        debug!("Table replica {} disabled", replica_id);
    }

    pub(super) fn replica_descriptor(replica: &TableReplica, info: &TableReplicaInfo) -> ReplicaDescriptor {
        ReplicaDescriptor {
            replica_id: replica.id,
            cluster_name: replica.cluster_name.clone(),
            replica_path: replica.replica_path.clone(),
            start_replication_timestamp: replica.start_replication_timestamp,
            mode: replica.mode,
            state: info.state,
        }
    }
}
