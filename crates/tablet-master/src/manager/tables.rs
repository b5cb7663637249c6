//! Table operations: creation, mount lifecycle, resharding and cloning

use std::collections::BTreeSet;

use tracing::{debug, info};

use super::TabletManager;
use crate::error::{Error, Result};
use crate::hive::CellMessage;
use crate::metadata::{
    CellId, Chunk, CloneMode, PivotKey, ReplicaState, Table, TableId, TableOptions,
    TableReplicaInfo, Tablet, TabletId, TabletState,
};
use crate::scheduler::{
    calculate_pivot_keys, check_sorted_chunk_coverage, distribute_ordered_chunks,
    distribute_sorted_chunks, validate_pivot_keys, RangeTablet,
};

impl TabletManager {
    // ==================== namespace ====================

    /// Create a table together with its initial tablets
    pub fn create_table(&mut self, path: &str, options: TableOptions) -> Result<TableId> {
        if path.is_empty() {
            return Err(Error::InvalidArgument("Table path cannot be empty".to_string()));
        }
        if self.metadata.find_table_by_path(path).is_some() {
            return Err(Error::AlreadyExists(format!("Table {} already exists", path)));
        }
        let bundle_id = self.metadata.bundle_by_name(&options.bundle)?.id;

        let pivot_keys = if !options.dynamic {
            Vec::new()
        } else if options.sorted {
            if options.pivot_keys.is_empty() {
                vec![PivotKey::new()]
            } else {
                if !options.pivot_keys[0].is_empty() {
                    return Err(Error::InvalidArgument(
                        "First pivot key must be empty".to_string(),
                    ));
                }
                if options.pivot_keys.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(Error::InvalidArgument(
                        "Pivot keys must be strictly increasing".to_string(),
                    ));
                }
                options.pivot_keys.clone()
            }
        } else {
            if !options.pivot_keys.is_empty() {
                return Err(Error::InvalidArgument(
                    "Table is ordered; must provide tablet count".to_string(),
                ));
            }
            if options.tablet_count == 0 {
                return Err(Error::InvalidArgument(
                    "Tablet count must be positive".to_string(),
                ));
            }
            vec![PivotKey::new(); options.tablet_count]
        };

        if pivot_keys.len() > self.config.max_tablet_count {
            return Err(Error::LimitExceeded(format!(
                "Tablet count cannot exceed the limit of {}",
                self.config.max_tablet_count
            )));
        }

        let table_id: TableId = self.metadata.id_generator.generate();
        let mut tablets = Vec::with_capacity(pivot_keys.len());
        for (index, pivot_key) in pivot_keys.into_iter().enumerate() {
            let tablet_id: TabletId = self.metadata.id_generator.generate();
            let mut tablet = Tablet::new(tablet_id, table_id, index);
            tablet.pivot_key = pivot_key;
            self.metadata.tablets.insert(tablet_id, tablet);
            tablets.push(tablet_id);
        }

        let tablet_count = tablets.len();
        let table = Table {
            id: table_id,
            path: path.to_string(),
            bundle_id,
            dynamic: options.dynamic,
            sorted: options.sorted,
            replicated: options.replicated,
            in_memory_mode: options.in_memory_mode,
            tablets,
            replicas: BTreeSet::new(),
        };
        self.metadata.tables.insert(table_id, table);
        self.metadata.index_table(path.to_string(), table_id);

        info!(
            "Created table {} ({}) with {} tablet(s) in bundle {}",
            path, table_id, tablet_count, options.bundle
        );
        Ok(table_id)
    }

    /// Remove a table; every tablet must be unmounted
    pub fn remove_table(&mut self, path: &str) -> Result<()> {
        let table_id = self.metadata.resolve_table(path)?;
        let table = self.metadata.table(table_id)?;
        for tablet_id in &table.tablets {
            let state = self.metadata.tablet(*tablet_id)?.state;
            if state != TabletState::Unmounted {
                return Err(Error::InvalidState(format!(
                    "Cannot remove table {} since tablet {} is in {:?} state",
                    path,
                    tablet_id,
                    state.to_string()
                )));
            }
        }
        let tablet_ids = table.tablets.clone();
        let replica_ids = table.replicas.clone();

        if !tablet_ids.is_empty() {
            self.touch_affected_tablet_actions(table_id, 0, tablet_ids.len() - 1, "remove")?;
        }
        for tablet_id in tablet_ids {
            self.destroy_tablet(tablet_id)?;
        }
        for replica_id in replica_ids {
            self.metadata.replicas.remove(&replica_id);
        }
        self.metadata.tables.remove(&table_id);
        self.metadata.unindex_table(path);
        let collected = self.metadata.chunks.collect_garbage();

        info!("Removed table {} ({}), {} chunk(s) released", path, table_id, collected);
        Ok(())
    }

    /// Attach a data chunk to an unmounted tablet
    pub fn attach_chunk(&mut self, path: &str, tablet_index: usize, chunk: Chunk) -> Result<()> {
        let table_id = self.metadata.resolve_table(path)?;
        let tablet_id = self
            .metadata
            .table(table_id)?
            .tablets
            .get(tablet_index)
            .copied()
            .ok_or_else(|| {
                Error::InvalidArgument(format!("Table {} has no tablet #{}", path, tablet_index))
            })?;
        let state = self.metadata.tablet(tablet_id)?.state;
        if state != TabletState::Unmounted {
            return Err(Error::InvalidState(format!(
                "Tablet {} is in {:?} state",
                tablet_id,
                state.to_string()
            )));
        }
        debug!("Attached chunk {} to tablet {}", chunk.id, tablet_id);
        self.metadata.chunks.attach(tablet_id, chunk);
        Ok(())
    }

    // ==================== mount lifecycle ====================

    /// Resolve a dynamic table and a tablet range of it
    fn resolve_dynamic_range(
        &self,
        path: &str,
        first: Option<usize>,
        last: Option<usize>,
        verb: &str,
    ) -> Result<(TableId, usize, usize)> {
        let table_id = self.metadata.resolve_table(path)?;
        let table = self.metadata.table(table_id)?;
        if !table.dynamic {
            return Err(Error::InvalidState(format!("Cannot {} a static table", verb)));
        }
        let (first, last) = table
            .parse_tablet_range(first, last)
            .map_err(Error::InvalidArgument)?;
        Ok((table_id, first, last))
    }

    /// Mount tablets `first..=last` of a table
    pub fn mount_table(
        &mut self,
        path: &str,
        first: Option<usize>,
        last: Option<usize>,
        hint_cell: Option<CellId>,
        freeze: bool,
    ) -> Result<()> {
        let (table_id, first, last) = self.resolve_dynamic_range(path, first, last, "mount")?;
        let bundle_id = self.metadata.table(table_id)?.bundle_id;

        match hint_cell {
            Some(cell_id) => {
                let cell = self.metadata.cell(cell_id)?;
                if cell.bundle_id != bundle_id {
                    let cell_bundle = self.metadata.bundle(cell.bundle_id)?.name.clone();
                    let table_bundle = self.metadata.bundle(bundle_id)?.name.clone();
                    return Err(Error::InvalidArgument(format!(
                        "Cannot mount tablets into cell {} since it belongs to bundle {:?} while the table is configured to use bundle {:?}",
                        cell_id, cell_bundle, table_bundle
                    )));
                }
            }
            None => self.validate_has_healthy_cells(bundle_id)?,
        }

        let tablet_ids = self.tablet_ids_in_range(table_id, first, last)?;
        for tablet_id in &tablet_ids {
            let state = self.metadata.tablet(*tablet_id)?.state;
            let acceptable = state == TabletState::Unmounted
                || if freeze {
                    matches!(
                        state,
                        TabletState::Frozen | TabletState::Freezing | TabletState::FrozenMounting
                    )
                } else {
                    matches!(
                        state,
                        TabletState::Mounted | TabletState::Mounting | TabletState::Unfreezing
                    )
                };
            if !acceptable {
                return Err(Error::InvalidState(format!(
                    "Cannot mount tablet {} in {:?} state",
                    tablet_id,
                    state.to_string()
                )));
            }
        }

        self.touch_affected_tablet_actions(table_id, first, last, "mount_table")?;

        let mut to_mount = Vec::new();
        for tablet_id in tablet_ids {
            let tablet = self.metadata.tablet(tablet_id)?;
            if tablet.cell.is_none() && tablet.state == TabletState::Unmounted {
                to_mount.push(tablet_id);
            }
        }
        if to_mount.is_empty() {
            return Ok(());
        }

        let assignment = self.compute_tablet_assignment(table_id, hint_cell, &to_mount)?;
        self.do_mount_tablets(&assignment.assignments, freeze)?;

        info!("Mounting {} tablet(s) of table {}", to_mount.len(), path);
        Ok(())
    }

    /// Unmount tablets `first..=last` of a table
    pub fn unmount_table(
        &mut self,
        path: &str,
        first: Option<usize>,
        last: Option<usize>,
        force: bool,
    ) -> Result<()> {
        let (table_id, first, last) = self.resolve_dynamic_range(path, first, last, "unmount")?;
        let tablet_ids = self.tablet_ids_in_range(table_id, first, last)?;

        if !force {
            for tablet_id in &tablet_ids {
                let state = self.metadata.tablet(*tablet_id)?.state;
                if !matches!(
                    state,
                    TabletState::Mounted
                        | TabletState::Frozen
                        | TabletState::Freezing
                        | TabletState::Unmounted
                        | TabletState::Unmounting
                ) {
                    return Err(Error::InvalidState(format!(
                        "Cannot unmount tablet {} in {:?} state",
                        tablet_id,
                        state.to_string()
                    )));
                }
            }
        }

        self.touch_affected_tablet_actions(table_id, first, last, "unmount_table")?;

        for tablet_id in tablet_ids {
            self.do_unmount_tablet(tablet_id, force)?;
        }

        info!(
            "Unmounting tablets [{}, {}] of table {} (force {})",
            first, last, path, force
        );
        Ok(())
    }

    /// Push the current table settings to the mounted tablets of a range
    pub fn remount_table(&mut self, path: &str, first: Option<usize>, last: Option<usize>) -> Result<()> {
        let (table_id, first, last) = self.resolve_dynamic_range(path, first, last, "remount")?;
        self.touch_affected_tablet_actions(table_id, first, last, "remount_table")?;

        let mode = self.metadata.table(table_id)?.in_memory_mode;
        for tablet_id in self.tablet_ids_in_range(table_id, first, last)? {
            let tablet = self.metadata.tablet(tablet_id)?;
            if !matches!(
                tablet.state,
                TabletState::Mounted
                    | TabletState::Mounting
                    | TabletState::FrozenMounting
                    | TabletState::Frozen
                    | TabletState::Freezing
            ) {
                continue;
            }
            let Some(cell_id) = tablet.cell else {
                continue;
            };
            let mount_revision = tablet.mount_revision;

            let old_statistics = self.tablet_statistics(tablet_id)?;
            self.metadata.tablet_mut(tablet_id)?.in_memory_mode = mode;
            let new_statistics = self.tablet_statistics(tablet_id)?;
            let cell = self.metadata.cell_mut(cell_id)?;
            cell.total_statistics -= &old_statistics;
            cell.total_statistics += &new_statistics;

            self.outbox.post(
                cell_id,
                CellMessage::RemountTablet {
                    tablet_id,
                    mount_revision,
                },
            );
        }
        Ok(())
    }

    /// Freeze tablets `first..=last` of a table
    pub fn freeze_table(&mut self, path: &str, first: Option<usize>, last: Option<usize>) -> Result<()> {
        let (table_id, first, last) = self.resolve_dynamic_range(path, first, last, "freeze")?;
        let tablet_ids = self.tablet_ids_in_range(table_id, first, last)?;
        for tablet_id in &tablet_ids {
            let state = self.metadata.tablet(*tablet_id)?.state;
            if !matches!(
                state,
                TabletState::Mounted
                    | TabletState::FrozenMounting
                    | TabletState::Freezing
                    | TabletState::Frozen
            ) {
                return Err(Error::InvalidState(format!(
                    "Cannot freeze tablet {} in {:?} state",
                    tablet_id,
                    state.to_string()
                )));
            }
        }

        self.touch_affected_tablet_actions(table_id, first, last, "freeze_table")?;
        for tablet_id in tablet_ids {
            self.do_freeze_tablet(tablet_id)?;
        }
        Ok(())
    }

    /// Unfreeze tablets `first..=last` of a table
    pub fn unfreeze_table(&mut self, path: &str, first: Option<usize>, last: Option<usize>) -> Result<()> {
        let (table_id, first, last) = self.resolve_dynamic_range(path, first, last, "unfreeze")?;
        let tablet_ids = self.tablet_ids_in_range(table_id, first, last)?;
        for tablet_id in &tablet_ids {
            let state = self.metadata.tablet(*tablet_id)?.state;
            if !matches!(
                state,
                TabletState::Mounted | TabletState::Frozen | TabletState::Unfreezing
            ) {
                return Err(Error::InvalidState(format!(
                    "Cannot unfreeze tablet {} in {:?} state",
                    tablet_id,
                    state.to_string()
                )));
            }
        }

        self.touch_affected_tablet_actions(table_id, first, last, "unfreeze_table")?;
        for tablet_id in tablet_ids {
            self.do_unfreeze_tablet(tablet_id)?;
        }
        Ok(())
    }

    pub(super) fn do_mount_tablets(&mut self, assignments: &[(TabletId, CellId)], freeze: bool) -> Result<()> {
        for (tablet_id, cell_id) in assignments {
            self.do_mount_tablet(*tablet_id, *cell_id, freeze)?;
        }
        Ok(())
    }

    /// Bind an unmounted tablet to a cell and post the mount request
    fn do_mount_tablet(&mut self, tablet_id: TabletId, cell_id: CellId, freeze: bool) -> Result<()> {
        let tablet = self.metadata.tablet(tablet_id)?;
        if tablet.state != TabletState::Unmounted {
            return Err(Error::InvalidState(format!(
                "Tablet {} is in {:?} state",
                tablet_id,
                tablet.state.to_string()
            )));
        }
        self.metadata.cell(cell_id)?;

        let table = self.metadata.table(tablet.table_id)?;
        let table_id = table.id;
        let table_path = table.path.clone();
        let mode = table.in_memory_mode;
        let next_pivot_key = if table.sorted {
            table
                .tablets
                .get(tablet.index + 1)
                .and_then(|id| self.metadata.tablets.get(id))
                .map(|t| t.pivot_key.clone())
        } else {
            None
        };

        let mut replicas = Vec::new();
        let mut enabled_replicas = Vec::new();
        for (replica_id, info) in &tablet.replicas {
            let replica = self.metadata.replica(*replica_id)?;
            replicas.push(Self::replica_descriptor(replica, info));
            if replica.state == ReplicaState::Enabled {
                enabled_replicas.push(*replica_id);
            }
        }

        let pivot_key = tablet.pivot_key.clone();
        let trimmed_row_count = tablet.trimmed_row_count;
        let retained_timestamp = tablet.retained_timestamp;
        let chunk_ids = self.metadata.chunks.chunk_ids(tablet_id).to_vec();
        let mount_revision = self.metadata.next_mount_revision();

        let tablet = self.metadata.tablet_mut(tablet_id)?;
        tablet.cell = Some(cell_id);
        tablet.in_memory_mode = mode;
        tablet.mount_revision = mount_revision;
        tablet.set_state(if freeze {
            TabletState::FrozenMounting
        } else {
            TabletState::Mounting
        });
        for (replica_id, info) in tablet.replicas.iter_mut() {
            info.state = if enabled_replicas.contains(replica_id) {
                ReplicaState::Enabled
            } else {
                ReplicaState::Disabled
            };
        }

        let statistics = self.tablet_statistics(tablet_id)?;
        let cell = self.metadata.cell_mut(cell_id)?;
        cell.tablets.insert(tablet_id);
        cell.total_statistics += &statistics;
        cell.has_hosted_tablets = true;

        self.outbox.post(
            cell_id,
            CellMessage::MountTablet {
                tablet_id,
                mount_revision,
                table_id,
                table_path,
                pivot_key,
                next_pivot_key,
                in_memory_mode: mode,
                freeze,
                chunk_ids,
                replicas,
                trimmed_row_count,
                retained_timestamp,
            },
        );
        for replica_id in enabled_replicas {
            self.outbox.post(
                cell_id,
                CellMessage::SetTableReplicaEnabled {
                    tablet_id,
                    mount_revision,
                    replica_id,
                    enabled: true,
                },
            );
        }

        debug!(
            "Mounting tablet {} on cell {} (revision {}, freeze {})",
            tablet_id, cell_id, mount_revision, freeze
        );
        Ok(())
    }

    /// Start unmounting a tablet; a forced unmount completes immediately
    pub(super) fn do_unmount_tablet(&mut self, tablet_id: TabletId, force: bool) -> Result<()> {
        let tablet = self.metadata.tablet(tablet_id)?;
        let state = tablet.state;
        if state == TabletState::Unmounted {
            return Ok(());
        }
        if state == TabletState::Unmounting && !force {
            return Ok(());
        }
        if !force
            && !matches!(
                state,
                TabletState::Mounted | TabletState::Frozen | TabletState::Freezing
            )
        {
            return Err(Error::InvalidState(format!(
                "Tablet {} is in {:?} state",
                tablet_id,
                state.to_string()
            )));
        }

        let mount_revision = tablet.mount_revision;
        let tablet_cell = tablet.cell;
        if let Some(cell_id) = tablet_cell {
            self.outbox.post(
                cell_id,
                CellMessage::UnmountTablet {
                    tablet_id,
                    mount_revision,
                    force,
                },
            );
            self.detach_tablet_from_cell(tablet_id)?;
        }
        let tablet = self.metadata.tablet_mut(tablet_id)?;
        if tablet.unmounting_cell.is_none() {
            tablet.unmounting_cell = tablet_cell;
        }
        tablet.set_state(TabletState::Unmounting);
        debug!("Unmounting tablet {} (force {})", tablet_id, force);

        if force {
            self.do_tablet_unmounted(tablet_id)?;
        }
        Ok(())
    }

    /// Final step of an unmount
    ///
    /// Replica entries still waiting for disablement are resolved here since
    /// an unmounted tablet no longer replicates.
    pub(super) fn do_tablet_unmounted(&mut self, tablet_id: TabletId) -> Result<()> {
        let tablet = self.metadata.tablet_mut(tablet_id)?;
        tablet.in_memory_mode = Default::default();
        tablet.unmounting_cell = None;
        tablet.set_state(TabletState::Unmounted);

        let mut resolved = Vec::new();
        for (replica_id, info) in tablet.replicas.iter_mut() {
            if info.state == ReplicaState::Disabling {
                info.state = ReplicaState::Disabled;
                resolved.push(*replica_id);
            }
        }
        for replica_id in resolved {
            if let Some(replica) = self.metadata.replicas.get_mut(&replica_id) {
                replica.disabling_tablets.remove(&tablet_id);
            }
            self.check_for_replica_disabled(replica_id);
        }

        debug!("Tablet {} unmounted", tablet_id);
        Ok(())
    }

    pub(super) fn do_freeze_tablet(&mut self, tablet_id: TabletId) -> Result<()> {
        let tablet = self.metadata.tablet(tablet_id)?;
        let state = tablet.state;
        if !matches!(
            state,
            TabletState::Mounted
                | TabletState::FrozenMounting
                | TabletState::Freezing
                | TabletState::Frozen
        ) {
            return Err(Error::InvalidState(format!(
                "Tablet {} is in {:?} state",
                tablet_id,
                state.to_string()
            )));
        }
        if state != TabletState::Mounted {
            return Ok(());
        }

        let mount_revision = tablet.mount_revision;
        self.metadata
            .tablet_mut(tablet_id)?
            .set_state(TabletState::Freezing);
        self.post_to_tablet_cell(
            tablet_id,
            CellMessage::FreezeTablet {
                tablet_id,
                mount_revision,
            },
        )
    }

    pub(super) fn do_unfreeze_tablet(&mut self, tablet_id: TabletId) -> Result<()> {
        let tablet = self.metadata.tablet(tablet_id)?;
        let state = tablet.state;
        if !matches!(
            state,
            TabletState::Mounted | TabletState::Frozen | TabletState::Unfreezing
        ) {
            return Err(Error::InvalidState(format!(
                "Tablet {} is in {:?} state",
                tablet_id,
                state.to_string()
            )));
        }
        if state != TabletState::Frozen {
            return Ok(());
        }

        let mount_revision = tablet.mount_revision;
        self.metadata
            .tablet_mut(tablet_id)?
            .set_state(TabletState::Unfreezing);
        self.post_to_tablet_cell(
            tablet_id,
            CellMessage::UnfreezeTablet {
                tablet_id,
                mount_revision,
            },
        )
    }

    /// Remove a tablet object and everything hanging off it
    fn destroy_tablet(&mut self, tablet_id: TabletId) -> Result<()> {
        if let Some(action_id) = self.metadata.tablet(tablet_id)?.action {
            let touched: BTreeSet<TabletId> = [tablet_id].into_iter().collect();
            self.on_tablet_action_tablets_touched(
                action_id,
                &touched,
                &format!("Tablet {} has been removed", tablet_id),
            );
        }
        for replica in self.metadata.replicas.values_mut() {
            replica.disabling_tablets.remove(&tablet_id);
        }
        self.metadata.chunks.remove_chunk_list(tablet_id);
        self.metadata.tablets.remove(&tablet_id);
        debug!("Tablet {} destroyed", tablet_id);
        Ok(())
    }

    // ==================== resharding ====================

    /// Reshard tablets `first..=last` of a table
    ///
    /// Sorted tables take pivot keys (the count defaults to their number);
    /// ordered tables take a tablet count. Returns the new tablet ids.
    pub fn reshard_table(
        &mut self,
        path: &str,
        first: Option<usize>,
        last: Option<usize>,
        tablet_count: Option<usize>,
        pivot_keys: Vec<PivotKey>,
    ) -> Result<Vec<TabletId>> {
        let table_id = self.metadata.resolve_table(path)?;
        let new_tablet_count = tablet_count.unwrap_or(pivot_keys.len());
        let new_tablets =
            self.do_reshard_table(table_id, first, last, new_tablet_count, pivot_keys)?;
        info!(
            "Resharded table {} into {} new tablet(s)",
            path,
            new_tablets.len()
        );
        Ok(new_tablets)
    }

    pub(super) fn do_reshard_table(
        &mut self,
        table_id: TableId,
        first: Option<usize>,
        last: Option<usize>,
        new_tablet_count: usize,
        pivot_keys: Vec<PivotKey>,
    ) -> Result<Vec<TabletId>> {
        let table = self.metadata.table(table_id)?.clone();
        if !table.dynamic {
            return Err(Error::InvalidState("Cannot reshard a static table".to_string()));
        }
        if table.replicated
            && table
                .tablets
                .iter()
                .any(|id| !self.metadata.chunks.chunk_ids(*id).is_empty())
        {
            return Err(Error::InvalidState(
                "Cannot reshard non-empty replicated table".to_string(),
            ));
        }
        let (first, last) = table
            .parse_tablet_range(first, last)
            .map_err(Error::InvalidArgument)?;
        if new_tablet_count == 0 {
            return Err(Error::InvalidArgument(
                "Tablet count must be positive".to_string(),
            ));
        }

        let old_tablet_count = last - first + 1;
        if table.tablets.len() - old_tablet_count + new_tablet_count > self.config.max_tablet_count {
            return Err(Error::LimitExceeded(format!(
                "Tablet count cannot exceed the limit of {}",
                self.config.max_tablet_count
            )));
        }

        let next_pivot_key = match table.tablets.get(last + 1) {
            Some(id) => Some(self.metadata.tablet(*id)?.pivot_key.clone()),
            None => None,
        };
        if table.sorted {
            let first_pivot_key = &self.metadata.tablet(table.tablets[first])?.pivot_key;
            validate_pivot_keys(
                &pivot_keys,
                first_pivot_key,
                next_pivot_key.as_ref(),
                new_tablet_count,
            )
            .map_err(Error::InvalidArgument)?;
        } else if !pivot_keys.is_empty() {
            return Err(Error::InvalidArgument(
                "Table is ordered; must provide tablet count".to_string(),
            ));
        }

        let old_tablets = table.tablets[first..=last].to_vec();
        let mut retained_timestamp = 0;
        for tablet_id in &old_tablets {
            let tablet = self.metadata.tablet(*tablet_id)?;
            if tablet.state != TabletState::Unmounted {
                return Err(Error::InvalidState(format!(
                    "Cannot reshard table since tablet {} is not unmounted",
                    tablet_id
                )));
            }
            retained_timestamp = retained_timestamp.max(tablet.retained_timestamp);
        }

        if !table.sorted && new_tablet_count < old_tablet_count {
            for tablet_id in &old_tablets[new_tablet_count..] {
                let tablet = self.metadata.tablet(*tablet_id)?;
                if tablet.trimmed_row_count < self.metadata.chunks.row_count(*tablet_id) {
                    return Err(Error::InvalidState(format!(
                        "Some chunks of tablet {} are not fully trimmed; such a tablet cannot participate in resharding",
                        tablet_id
                    )));
                }
            }
        }

        let range: Vec<RangeTablet> = old_tablets
            .iter()
            .map(|id| {
                Ok(RangeTablet {
                    pivot_key: self.metadata.tablet(*id)?.pivot_key.clone(),
                    chunk_ids: self.metadata.chunks.chunk_ids(*id).to_vec(),
                })
            })
            .collect::<Result<_>>()?;

        let new_chunk_lists = if table.sorted {
            check_sorted_chunk_coverage(&range, next_pivot_key.as_ref(), &self.metadata.chunks)
                .map_err(Error::InvalidState)?;
            distribute_sorted_chunks(
                &range,
                &pivot_keys,
                next_pivot_key.as_ref(),
                &self.metadata.chunks,
            )
            .map_err(Error::InvalidState)?
        } else {
            distribute_ordered_chunks(
                range.into_iter().map(|t| t.chunk_ids).collect(),
                new_tablet_count,
            )
        };

        // Validation is over; nothing below may fail half way.
        self.touch_affected_tablet_actions(table_id, first, last, "reshard_table")?;

        let mut new_tablets = Vec::with_capacity(new_tablet_count);
        for index in 0..new_tablet_count {
            let tablet_id: TabletId = self.metadata.id_generator.generate();
            let mut tablet = Tablet::new(tablet_id, table_id, first + index);
            if table.sorted {
                tablet.pivot_key = pivot_keys[index].clone();
            } else if let Some(old_id) = old_tablets.get(index) {
                tablet.trimmed_row_count = self.metadata.tablet(*old_id)?.trimmed_row_count;
            }
            tablet.retained_timestamp = retained_timestamp;
            for replica_id in &table.replicas {
                tablet.replicas.insert(*replica_id, TableReplicaInfo::default());
            }
            self.metadata.tablets.insert(tablet_id, tablet);
            new_tablets.push(tablet_id);
        }

        for tablet_id in &old_tablets {
            self.destroy_tablet(*tablet_id)?;
        }
        for (tablet_id, chunk_ids) in new_tablets.iter().zip(new_chunk_lists) {
            self.metadata.chunks.set_chunk_list(*tablet_id, chunk_ids);
        }

        let table = self.metadata.table_mut(table_id)?;
        table.tablets.splice(first..=last, new_tablets.iter().copied());
        let order = table.tablets.clone();
        for (index, tablet_id) in order.iter().enumerate() {
            self.metadata.tablet_mut(*tablet_id)?.index = index;
        }

        debug!(
            "Replaced tablets [{}, {}] of table {} with {} new tablet(s)",
            first, last, table_id, new_tablet_count
        );
        Ok(new_tablets)
    }

    /// Pivot keys splitting a tablet range into `tablet_count` even parts
    pub(super) fn calculate_range_pivot_keys(
        &self,
        table_id: TableId,
        first: usize,
        last: usize,
        tablet_count: usize,
    ) -> Result<Vec<PivotKey>> {
        let tablet_ids = self.tablet_ids_in_range(table_id, first, last)?;
        let first_pivot_key = self.metadata.tablet(tablet_ids[0])?.pivot_key.clone();

        let chunk_ids: BTreeSet<_> = tablet_ids
            .iter()
            .flat_map(|id| self.metadata.chunks.chunk_ids(*id).iter().copied())
            .collect();
        let chunks: Vec<&Chunk> = chunk_ids
            .iter()
            .filter_map(|id| self.metadata.chunks.chunk(*id))
            .collect();

        Ok(calculate_pivot_keys(&first_pivot_key, &chunks, tablet_count))
    }

    // ==================== cloning ====================

    /// Clone a dynamic table; `Move` removes the source afterwards
    pub fn clone_table(&mut self, source_path: &str, destination_path: &str, mode: CloneMode) -> Result<TableId> {
        let source_id = self.metadata.resolve_table(source_path)?;
        if self.metadata.find_table_by_path(destination_path).is_some() {
            return Err(Error::AlreadyExists(format!(
                "Table {} already exists",
                destination_path
            )));
        }
        let source = self.metadata.table(source_id)?.clone();
        if source.replicated {
            return Err(Error::InvalidState(format!(
                "Error cloning table {}: Cannot clone a replicated table",
                source_path
            )));
        }

        for tablet_id in &source.tablets {
            let state = self.metadata.tablet(*tablet_id)?.state;
            let allowed = match mode {
                CloneMode::Copy => {
                    matches!(state, TabletState::Unmounted | TabletState::Frozen)
                }
                CloneMode::Move => state == TabletState::Unmounted,
            };
            if !allowed {
                let reason = match mode {
                    CloneMode::Copy => "Cannot copy dynamic table since not all of its tablets are in \"unmounted\" or \"frozen\" state",
                    CloneMode::Move => "Cannot move dynamic table since not all of its tablets are in \"unmounted\" state",
                };
                return Err(Error::InvalidState(format!(
                    "Error cloning table {}: {}",
                    source_path, reason
                )));
            }
        }

        let table_id: TableId = self.metadata.id_generator.generate();
        let mut tablets = Vec::with_capacity(source.tablets.len());
        for source_tablet_id in &source.tablets {
            let tablet_id: TabletId = self.metadata.id_generator.generate();
            let source_tablet = self.metadata.tablet(*source_tablet_id)?;
            let mut tablet = Tablet::new(tablet_id, table_id, source_tablet.index);
            tablet.copy_from(source_tablet);
            tablet.in_memory_mode = Default::default();
            let chunk_ids = self.metadata.chunks.chunk_ids(*source_tablet_id).to_vec();
            self.metadata.tablets.insert(tablet_id, tablet);
            self.metadata.chunks.set_chunk_list(tablet_id, chunk_ids);
            tablets.push(tablet_id);
        }

        let table = Table {
            id: table_id,
            path: destination_path.to_string(),
            tablets,
            replicas: BTreeSet::new(),
            ..source
        };
        self.metadata.tables.insert(table_id, table);
        self.metadata.index_table(destination_path.to_string(), table_id);

        if mode == CloneMode::Move {
            self.remove_table(source_path)?;
        }

        info!(
            "Cloned table {} to {} ({} mode)",
            source_path, destination_path, mode
        );
        Ok(table_id)
    }

    /// Detach the tablets `first..=last` from the actions they belong to
    pub(super) fn touch_affected_tablet_actions(
        &mut self,
        table_id: TableId,
        first: usize,
        last: usize,
        request: &str,
    ) -> Result<()> {
        let tablet_ids = self.tablet_ids_in_range(table_id, first, last)?;
        let mut actions = BTreeSet::new();
        for tablet_id in &tablet_ids {
            if let Some(action_id) = self.metadata.tablet(*tablet_id)?.action {
                actions.insert(action_id);
            }
        }
        if actions.is_empty() {
            return Ok(());
        }

        let touched: BTreeSet<TabletId> = tablet_ids.into_iter().collect();
        let error = format!("User request {:?} interfered with the action", request);
        for action_id in actions {
            self.on_tablet_action_tablets_touched(action_id, &touched, &error);
        }
        Ok(())
    }
}
