//! Tablet actions
//!
//! An action moves or reshards a fixed set of tablets by driving them through
//! freeze, unmount, (reshard) and mount. The driver is re-entered whenever a
//! tablet of the action reports progress and advances the action as far as
//! the current tablet states allow.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

use super::TabletManager;
use crate::error::{Error, Result};
use crate::metadata::{
    ActionId, ActionKind, ActionState, CellHealth, CellId, PivotKey, TabletAction, TabletId,
    TabletState,
};

/// Request to create a tablet action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletActionRequest {
    pub kind: ActionKind,
    pub tablet_ids: Vec<TabletId>,
    /// Destination hints, one per tablet (move) or per new tablet (reshard)
    #[serde(default)]
    pub cell_ids: Vec<CellId>,
    #[serde(default)]
    pub pivot_keys: Vec<PivotKey>,
    #[serde(default)]
    pub tablet_count: Option<usize>,
    #[serde(default)]
    pub skip_freezing: bool,
    /// Whether tablets end up frozen; defaults to their current frozenness
    #[serde(default)]
    pub freeze: Option<bool>,
    #[serde(default)]
    pub keep_finished: bool,
}

/// Outcome of one driver step
enum Progress {
    /// State changed, run the next step
    Continue,
    /// Waiting for tablets
    Wait,
}

impl TabletManager {
    /// Create a tablet action and run it as far as possible
    pub fn create_tablet_action(&mut self, request: TabletActionRequest) -> Result<ActionId> {
        if request.tablet_ids.is_empty() {
            return Err(Error::InvalidArgument(
                "Invalid number of tablets: expected more than zero".to_string(),
            ));
        }

        let first_table_id = self.metadata.tablet(request.tablet_ids[0])?.table_id;
        let bundle_id = self.metadata.table(first_table_id)?.bundle_id;

        let mut seen = BTreeSet::new();
        let mut all_frozen = true;
        for tablet_id in &request.tablet_ids {
            if !seen.insert(*tablet_id) {
                return Err(Error::InvalidArgument(format!(
                    "Tablet {} is listed more than once",
                    tablet_id
                )));
            }
            let tablet = self.metadata.tablet(*tablet_id)?;
            if let Some(action_id) = tablet.action {
                return Err(Error::InvalidState(format!(
                    "Tablet {} already participating in action {}",
                    tablet_id, action_id
                )));
            }
            if !matches!(tablet.state, TabletState::Mounted | TabletState::Frozen) {
                return Err(Error::InvalidState(format!(
                    "Tablet {} is in state {:?}",
                    tablet_id,
                    tablet.state.to_string()
                )));
            }
            all_frozen &= tablet.state == TabletState::Frozen;
            if self.metadata.table(tablet.table_id)?.bundle_id != bundle_id {
                return Err(Error::InvalidArgument(format!(
                    "Tablets {} and {} belong to different bundles",
                    request.tablet_ids[0], tablet_id
                )));
            }
        }

        for cell_id in &request.cell_ids {
            let cell = self.metadata.cell(*cell_id)?;
            if cell.bundle_id != bundle_id {
                return Err(Error::InvalidArgument(format!(
                    "Cell {} belongs to bundle {:?} while tablets belong to bundle {:?}",
                    cell_id,
                    self.metadata.bundle(cell.bundle_id)?.name,
                    self.metadata.bundle(bundle_id)?.name
                )));
            }
        }

        match request.kind {
            ActionKind::Move => {
                if !request.pivot_keys.is_empty() || request.tablet_count.is_some() {
                    return Err(Error::InvalidArgument(
                        "Invalid action arguments: move takes no pivot keys or tablet count"
                            .to_string(),
                    ));
                }
                if !request.cell_ids.is_empty() && request.cell_ids.len() != request.tablet_ids.len() {
                    return Err(Error::InvalidArgument(format!(
                        "Number of destination cells and tablets mismatch: {} cells, {} tablets",
                        request.cell_ids.len(),
                        request.tablet_ids.len()
                    )));
                }
            }
            ActionKind::Reshard => {
                if request.pivot_keys.is_empty() && request.tablet_count.is_none() {
                    return Err(Error::InvalidArgument(
                        "Invalid action arguments: reshard needs pivot keys or a tablet count"
                            .to_string(),
                    ));
                }
                if !request.pivot_keys.is_empty() && request.tablet_count.is_some() {
                    return Err(Error::InvalidArgument(
                        "Invalid action arguments: pivot keys and tablet count are exclusive"
                            .to_string(),
                    ));
                }
                if request.tablet_count == Some(0) {
                    return Err(Error::InvalidArgument(
                        "Tablet count must be positive".to_string(),
                    ));
                }
                let new_tablet_count = request
                    .tablet_count
                    .unwrap_or(request.pivot_keys.len());
                if !request.cell_ids.is_empty() && request.cell_ids.len() != new_tablet_count {
                    return Err(Error::InvalidArgument(format!(
                        "Number of destination cells and new tablets mismatch: {} cells, {} new tablets",
                        request.cell_ids.len(),
                        new_tablet_count
                    )));
                }
                self.validate_reshard_action_range(&request.tablet_ids)?;
            }
        }

        let max_active = self.config.max_active_actions_per_bundle;
        let bundle = self.metadata.bundle(bundle_id)?;
        if max_active > 0 && bundle.active_action_count >= max_active {
            return Err(Error::LimitExceeded(format!(
                "Bundle {:?} already runs {} tablet action(s)",
                bundle.name, bundle.active_action_count
            )));
        }

        let mut source_cells = BTreeMap::new();
        for tablet_id in &request.tablet_ids {
            if let Some(cell_id) = self.metadata.tablet(*tablet_id)?.cell {
                source_cells.insert(*tablet_id, cell_id);
            }
        }

        let action_id: ActionId = self.metadata.id_generator.generate();
        let action = TabletAction {
            id: action_id,
            kind: request.kind,
            state: ActionState::Preparing,
            bundle_id,
            tablets: request.tablet_ids.clone(),
            cells: request.cell_ids.clone(),
            pivot_keys: request.pivot_keys,
            tablet_count: request.tablet_count,
            skip_freezing: request.skip_freezing,
            freeze: request.freeze.unwrap_or(all_frozen),
            keep_finished: request.keep_finished,
            error: None,
            created_at: self.now,
            finished_at: None,
            expiration_timeout_secs: self.action_config.expiration_timeout_secs,
            source_cells,
        };
        self.metadata.actions.insert(action_id, action);

        for tablet_id in &request.tablet_ids {
            self.metadata.tablet_mut(*tablet_id)?.action = Some(action_id);
        }
        for cell_id in &request.cell_ids {
            self.metadata.cell_mut(*cell_id)?.actions.insert(action_id);
        }
        let bundle = self.metadata.bundle_mut(bundle_id)?;
        bundle.actions.insert(action_id);
        bundle.active_action_count += 1;

        info!(
            "Created tablet action {} ({}, {} tablet(s))",
            action_id,
            request.kind,
            request.tablet_ids.len()
        );

        self.on_tablet_action_state_changed(Some(action_id));
        Ok(action_id)
    }

    /// Tablets of a reshard action must be a contiguous range of one table
    fn validate_reshard_action_range(&self, tablet_ids: &[TabletId]) -> Result<()> {
        let first = self.metadata.tablet(tablet_ids[0])?;
        for (offset, tablet_id) in tablet_ids.iter().enumerate() {
            let tablet = self.metadata.tablet(*tablet_id)?;
            if tablet.table_id != first.table_id || tablet.index != first.index + offset {
                return Err(Error::InvalidArgument(
                    "Tablets of a reshard action must form a contiguous range of one table"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Remove an action, failing it first if it is still running
    pub fn remove_tablet_action(&mut self, action_id: ActionId) -> Result<()> {
        let action = self.metadata.action(action_id)?;
        if !action.state.is_finished() {
            self.unbind_tablet_action_from_cells(action_id);
            self.on_tablet_action_disturbed(
                action_id,
                &format!("Tablet action {} has been removed", action_id),
            );
        }
        self.destroy_tablet_action(action_id);
        info!("Removed tablet action {}", action_id);
        Ok(())
    }

    /// Destroy finished actions whose retention has passed
    pub fn cleanup_expired_tablet_actions(&mut self) -> usize {
        let now = self.now;
        let expired: Vec<ActionId> = self
            .metadata
            .actions
            .values()
            .filter(|a| a.is_expired(now))
            .map(|a| a.id)
            .collect();
        for action_id in &expired {
            self.destroy_tablet_action(*action_id);
        }
        if !expired.is_empty() {
            info!("Cleaned up {} expired tablet action(s)", expired.len());
        }
        expired.len()
    }

    // ==================== driver ====================

    /// Advance an action as far as tablet states allow
    pub(super) fn on_tablet_action_state_changed(&mut self, action_id: Option<ActionId>) {
        let Some(action_id) = action_id else {
            return;
        };

        loop {
            let Some(state) = self.metadata.actions.get(&action_id).map(|a| a.state) else {
                return;
            };

            match self.do_tablet_action_step(action_id) {
                Ok(Progress::Continue) => continue,
                Ok(Progress::Wait) => return,
                Err(e) => {
                    warn!(
                        "Tablet action {} failed in {} state: {}",
                        action_id, state, e
                    );
                    let Some(action) = self.metadata.actions.get_mut(&action_id) else {
                        return;
                    };
                    action.error = Some(e.to_string());
                    match state {
                        ActionState::Unmounting => return,
                        ActionState::Failing => {
                            self.set_tablet_action_state(action_id, ActionState::Failed)
                        }
                        _ => self.set_tablet_action_state(action_id, ActionState::Failing),
                    }
                }
            }
        }
    }

    fn do_tablet_action_step(&mut self, action_id: ActionId) -> Result<Progress> {
        let action = self.metadata.action(action_id)?.clone();

        match action.state {
            ActionState::Preparing => {
                if !action.skip_freezing {
                    for tablet_id in &action.tablets {
                        self.do_freeze_tablet(*tablet_id)?;
                    }
                    self.set_tablet_action_state(action_id, ActionState::Freezing);
                } else {
                    self.set_tablet_action_state(action_id, ActionState::Frozen);
                }
                Ok(Progress::Continue)
            }

            ActionState::Freezing => {
                if self.count_tablets_in_state(&action.tablets, TabletState::Freezing) > 0 {
                    return Ok(Progress::Wait);
                }
                let next = if action.error.is_none() {
                    ActionState::Frozen
                } else {
                    ActionState::Failing
                };
                self.set_tablet_action_state(action_id, next);
                Ok(Progress::Continue)
            }

            ActionState::Frozen => {
                for tablet_id in &action.tablets {
                    self.do_unmount_tablet(*tablet_id, false)?;
                }
                self.set_tablet_action_state(action_id, ActionState::Unmounting);
                Ok(Progress::Continue)
            }

            ActionState::Unmounting => {
                if self.count_tablets_in_state(&action.tablets, TabletState::Unmounting) > 0 {
                    return Ok(Progress::Wait);
                }
                let next = if action.error.is_none() {
                    ActionState::Unmounted
                } else {
                    ActionState::Failing
                };
                self.set_tablet_action_state(action_id, next);
                Ok(Progress::Continue)
            }

            ActionState::Unmounted => {
                match action.kind {
                    ActionKind::Move => {
                        for (index, tablet_id) in action.tablets.iter().enumerate() {
                            let hint = action.cells.get(index).copied();
                            self.mount_single_tablet(*tablet_id, hint, action.freeze)?;
                        }
                    }
                    ActionKind::Reshard => self.reshard_action_tablets(action_id)?,
                }
                self.set_tablet_action_state(action_id, ActionState::Mounting);
                Ok(Progress::Continue)
            }

            ActionState::Mounting => {
                let mut all_mounted = true;
                for tablet_id in &action.tablets {
                    let state = self.metadata.tablet(*tablet_id)?.state;
                    if !matches!(state, TabletState::Mounted | TabletState::Frozen) {
                        all_mounted = false;
                    }
                }
                if !all_mounted {
                    return Ok(Progress::Wait);
                }
                self.set_tablet_action_state(action_id, ActionState::Mounted);
                Ok(Progress::Continue)
            }

            ActionState::Mounted => {
                self.set_tablet_action_state(action_id, ActionState::Completed);
                Ok(Progress::Continue)
            }

            ActionState::Failing => {
                if let Some(error) = &action.error {
                    warn!("Tablet action {} failed: {}", action_id, error);
                }
                self.mount_missed_in_action_tablets(action_id);
                self.unbind_tablet_action_from_tablets(action_id);
                self.unbind_tablet_action_from_cells(action_id);
                self.set_tablet_action_state(action_id, ActionState::Failed);
                Ok(Progress::Continue)
            }

            ActionState::Completed => {
                if action.error.is_some() {
                    self.set_tablet_action_state(action_id, ActionState::Failed);
                }
                self.finish_tablet_action(action_id);
                Ok(Progress::Wait)
            }

            ActionState::Failed => {
                self.finish_tablet_action(action_id);
                Ok(Progress::Wait)
            }
        }
    }

    fn set_tablet_action_state(&mut self, action_id: ActionId, state: ActionState) {
        if let Some(action) = self.metadata.actions.get_mut(&action_id) {
            debug!(
                "Tablet action {} changed state {} -> {}",
                action_id, action.state, state
            );
            action.state = state;
        }
    }

    fn count_tablets_in_state(&self, tablet_ids: &[TabletId], state: TabletState) -> usize {
        tablet_ids
            .iter()
            .filter_map(|id| self.metadata.tablets.get(id))
            .filter(|t| t.state == state)
            .count()
    }

    /// Mount one unmounted tablet on the hint cell or wherever placement says
    fn mount_single_tablet(&mut self, tablet_id: TabletId, hint: Option<CellId>, freeze: bool) -> Result<()> {
        let table_id = self.metadata.tablet(tablet_id)?.table_id;
        if !self.metadata.tables.contains_key(&table_id) {
            return Err(Error::InvalidState(format!(
                "Table of tablet {} is not alive",
                tablet_id
            )));
        }
        let assignment = self.compute_tablet_assignment(table_id, hint, &[tablet_id])?;
        self.do_mount_tablets(&assignment.assignments, freeze)
    }

    /// Replace the action's tablets with the result of resharding them and
    /// mount the new tablets
    fn reshard_action_tablets(&mut self, action_id: ActionId) -> Result<()> {
        let action = self.metadata.action(action_id)?.clone();
        let (Some(first_id), Some(last_id)) = (action.tablets.first(), action.tablets.last()) else {
            return Err(Error::InvalidState(format!(
                "Tablet action {} has no tablets",
                action_id
            )));
        };
        let first_tablet = self.metadata.tablet(*first_id)?;
        let table_id = first_tablet.table_id;
        let first = first_tablet.index;
        let last = self.metadata.tablet(*last_id)?.index;
        let table = self.metadata.table(table_id).map_err(|_| {
            Error::InvalidState(format!("Table of tablet {} is not alive", first_id))
        })?;

        let (pivot_keys, new_tablet_count) = if table.sorted {
            let pivot_keys = match action.tablet_count {
                Some(count) => self.calculate_range_pivot_keys(table_id, first, last, count)?,
                None => action.pivot_keys.clone(),
            };
            let count = pivot_keys.len();
            (pivot_keys, count)
        } else {
            let count = action.tablet_count.ok_or_else(|| {
                Error::InvalidArgument("Table is ordered; must provide tablet count".to_string())
            })?;
            (Vec::new(), count)
        };

        // The old tablets leave the action before the reshard destroys them.
        for tablet_id in &action.tablets {
            self.metadata.tablet_mut(*tablet_id)?.action = None;
        }
        self.metadata.action_mut(action_id)?.tablets.clear();

        let new_tablets = match self.do_reshard_table(
            table_id,
            Some(first),
            Some(last),
            new_tablet_count,
            pivot_keys,
        ) {
            Ok(new_tablets) => new_tablets,
            Err(e) => {
                for tablet_id in &action.tablets {
                    if let Some(tablet) = self.metadata.tablets.get_mut(tablet_id) {
                        tablet.action = Some(action_id);
                    }
                }
                self.metadata.action_mut(action_id)?.tablets = action.tablets.clone();
                return Err(e);
            }
        };

        for tablet_id in &new_tablets {
            self.metadata.tablet_mut(*tablet_id)?.action = Some(action_id);
        }
        self.metadata.action_mut(action_id)?.tablets = new_tablets.clone();

        let assignments = if action.cells.len() == new_tablets.len() {
            new_tablets
                .iter()
                .copied()
                .zip(action.cells.iter().copied())
                .collect()
        } else {
            self.compute_tablet_assignment(table_id, None, &new_tablets)?
                .assignments
        };
        self.do_mount_tablets(&assignments, action.freeze)
    }

    /// Bring tablets left behind by a failed action back into service
    fn mount_missed_in_action_tablets(&mut self, action_id: ActionId) {
        let Some(action) = self.metadata.actions.get(&action_id).cloned() else {
            return;
        };

        for tablet_id in &action.tablets {
            let Some(state) = self.metadata.tablets.get(tablet_id).map(|t| t.state) else {
                continue;
            };
            let result = match state {
                TabletState::Mounted => Ok(()),
                TabletState::Unmounted => {
                    let hint = action.source_cells.get(tablet_id).copied().filter(|cell_id| {
                        self.metadata
                            .cells
                            .get(cell_id)
                            .map(|c| c.health() == CellHealth::Good)
                            .unwrap_or(false)
                    });
                    self.mount_single_tablet(*tablet_id, hint, action.freeze)
                }
                TabletState::Frozen if !action.freeze => self.do_unfreeze_tablet(*tablet_id),
                TabletState::Frozen => Ok(()),
                state => Err(Error::InvalidState(format!(
                    "Tablet {} is in unrecognized state {:?}",
                    tablet_id,
                    state.to_string()
                ))),
            };
            if let Err(e) = result {
                error!(
                    "Error mounting missed in action tablet {} (action {}): {}",
                    tablet_id, action_id, e
                );
            }
        }
    }

    // ==================== disturbance ====================

    /// Tablets of an action were touched by a user request
    pub(super) fn on_tablet_action_tablets_touched(
        &mut self,
        action_id: ActionId,
        touched: &BTreeSet<TabletId>,
        error: &str,
    ) {
        let Some(action) = self.metadata.actions.get_mut(&action_id) else {
            return;
        };
        let removed: Vec<TabletId> = action
            .tablets
            .iter()
            .filter(|id| touched.contains(*id))
            .copied()
            .collect();
        if removed.is_empty() {
            return;
        }
        action.tablets.retain(|id| !touched.contains(id));

        for tablet_id in &removed {
            if let Some(tablet) = self.metadata.tablets.get_mut(tablet_id) {
                if tablet.action == Some(action_id) {
                    tablet.action = None;
                    let state = tablet.state;
                    tablet.set_state(state);
                }
            }
        }

        self.unbind_tablet_action_from_cells(action_id);
        self.on_tablet_action_disturbed(action_id, error);
    }

    /// Something outside the action invalidated its plan
    pub(super) fn on_tablet_action_disturbed(&mut self, action_id: ActionId, error: &str) {
        let Some(action) = self.metadata.actions.get_mut(&action_id) else {
            return;
        };
        if action.state.is_finished() {
            return;
        }
        debug!("Tablet action {} disturbed: {}", action_id, error);

        if action.tablets.is_empty() {
            action.error = Some(error.to_string());
            self.set_tablet_action_state(action_id, ActionState::Failed);
            self.on_tablet_action_state_changed(Some(action_id));
            return;
        }

        let state = action.state;
        match state {
            ActionState::Freezing | ActionState::Unmounting => {
                action.error = Some(error.to_string());
            }
            ActionState::Mounting => {
                action.error = Some(error.to_string());
                self.set_tablet_action_state(action_id, ActionState::Failed);
                self.on_tablet_action_state_changed(Some(action_id));
            }
            _ => {
                warn!(
                    "Tablet action {} disturbed in transient {} state",
                    action_id, state
                );
                action.error = Some(error.to_string());
            }
        }
    }

    // ==================== bindings ====================

    fn unbind_tablet_action_from_tablets(&mut self, action_id: ActionId) {
        let Some(action) = self.metadata.actions.get_mut(&action_id) else {
            return;
        };
        for tablet_id in std::mem::take(&mut action.tablets) {
            if let Some(tablet) = self.metadata.tablets.get_mut(&tablet_id) {
                if tablet.action == Some(action_id) {
                    tablet.action = None;
                    let state = tablet.state;
                    tablet.set_state(state);
                }
            }
        }
    }

    pub(super) fn unbind_tablet_action_from_cells(&mut self, action_id: ActionId) {
        let Some(action) = self.metadata.actions.get_mut(&action_id) else {
            return;
        };
        for cell_id in std::mem::take(&mut action.cells) {
            if let Some(cell) = self.metadata.cells.get_mut(&cell_id) {
                cell.actions.remove(&action_id);
            }
        }
    }

    /// Terminal bookkeeping, run once when an action reaches a final state
    fn finish_tablet_action(&mut self, action_id: ActionId) {
        let now = self.now;
        let Some(action) = self.metadata.actions.get_mut(&action_id) else {
            return;
        };
        if action.finished_at.is_some() {
            return;
        }
        action.finished_at = Some(now);
        let bundle_id = action.bundle_id;
        let keep_finished = action.keep_finished;
        let state = action.state;

        self.unbind_tablet_action_from_tablets(action_id);
        self.unbind_tablet_action_from_cells(action_id);
        if let Some(bundle) = self.metadata.bundles.get_mut(&bundle_id) {
            bundle.active_action_count = bundle.active_action_count.saturating_sub(1);
        }

        info!("Tablet action {} finished in {} state", action_id, state);
        if !keep_finished {
            self.destroy_tablet_action(action_id);
        }
    }

    pub(super) fn destroy_tablet_action(&mut self, action_id: ActionId) {
        self.unbind_tablet_action_from_tablets(action_id);
        self.unbind_tablet_action_from_cells(action_id);
        let Some(action) = self.metadata.actions.remove(&action_id) else {
            return;
        };
        if let Some(bundle) = self.metadata.bundles.get_mut(&action.bundle_id) {
            bundle.actions.remove(&action_id);
            if action.finished_at.is_none() {
                bundle.active_action_count = bundle.active_action_count.saturating_sub(1);
            }
        }
        debug!("Tablet action {} destroyed", action_id);
    }
}
