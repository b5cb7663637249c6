//! Tablet cell bundles and tablet cells

use tracing::{debug, info, warn};

use super::TabletManager;
use crate::error::{Error, Result};
use crate::metadata::{BundleId, BundleOptions, CellId, TabletCell, TabletCellBundle, TransactionId};

impl TabletManager {
    fn validate_bundle_name(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidArgument(
                "Tablet cell bundle name cannot be empty".to_string(),
            ));
        }
        if self.metadata.find_bundle_by_name(name).is_some() {
            return Err(Error::AlreadyExists(format!(
                "Tablet cell bundle {:?} already exists",
                name
            )));
        }
        Ok(())
    }

    pub fn create_tablet_cell_bundle(&mut self, name: &str, options: BundleOptions) -> Result<BundleId> {
        self.validate_bundle_name(name)?;
        if options.peer_count == 0 {
            return Err(Error::InvalidArgument(
                "Peer count must be positive".to_string(),
            ));
        }

        let bundle_id: BundleId = self.metadata.id_generator.generate();
        let bundle = TabletCellBundle::new(bundle_id, name.to_string(), options);
        self.metadata.bundles.insert(bundle_id, bundle);
        self.metadata.index_bundle(name.to_string(), bundle_id);

        info!("Created tablet cell bundle {:?} ({})", name, bundle_id);
        Ok(bundle_id)
    }

    pub fn rename_tablet_cell_bundle(&mut self, bundle_id: BundleId, name: &str) -> Result<()> {
        let old_name = self.metadata.bundle(bundle_id)?.name.clone();
        if old_name == name {
            return Ok(());
        }
        self.validate_bundle_name(name)?;

        self.metadata.unindex_bundle(&old_name);
        self.metadata.bundle_mut(bundle_id)?.name = name.to_string();
        self.metadata.index_bundle(name.to_string(), bundle_id);

        info!("Renamed tablet cell bundle {:?} to {:?}", old_name, name);
        Ok(())
    }

    /// Remove a bundle that has no cells and serves no table
    pub fn remove_tablet_cell_bundle(&mut self, bundle_id: BundleId) -> Result<()> {
        let bundle = self.metadata.bundle(bundle_id)?;
        if !bundle.cells.is_empty() {
            return Err(Error::InvalidState(format!(
                "Cannot remove tablet cell bundle {:?} since it has {} cell(s)",
                bundle.name,
                bundle.cells.len()
            )));
        }
        if let Some(table) = self.metadata.tables.values().find(|t| t.bundle_id == bundle_id) {
            return Err(Error::InvalidState(format!(
                "Cannot remove tablet cell bundle {:?} since table {} uses it",
                bundle.name, table.path
            )));
        }
        let name = bundle.name.clone();
        let actions: Vec<_> = bundle.actions.iter().copied().collect();

        for action_id in actions {
            self.destroy_tablet_action(action_id);
        }
        self.metadata.bundles.remove(&bundle_id);
        self.metadata.unindex_bundle(&name);

        info!("Removed tablet cell bundle {:?} ({})", name, bundle_id);
        Ok(())
    }

    pub fn create_tablet_cell(&mut self, bundle_id: BundleId) -> Result<CellId> {
        let peer_count = self.metadata.bundle(bundle_id)?.options.peer_count;

        let cell_id: CellId = self.metadata.id_generator.generate();
        let mut cell = TabletCell::new(cell_id, bundle_id, peer_count);
        cell.reconfigure();
        self.metadata.cells.insert(cell_id, cell);
        self.metadata.bundle_mut(bundle_id)?.cells.insert(cell_id);
        self.outbox.create_mailbox(cell_id);

        info!(
            "Created tablet cell {} in bundle {} with {} peer(s)",
            cell_id, bundle_id, peer_count
        );
        Ok(cell_id)
    }

    /// Destroy a cell that hosts no tablets and has no unmount in flight
    pub fn destroy_tablet_cell(&mut self, cell_id: CellId) -> Result<()> {
        let cell = self.metadata.cell(cell_id)?;
        if !cell.tablets.is_empty() {
            return Err(Error::InvalidState(format!(
                "Cannot remove tablet cell {} since it hosts {} tablet(s)",
                cell_id,
                cell.tablets.len()
            )));
        }
        let unmounting = self
            .metadata
            .tablets
            .values()
            .filter(|t| t.unmounting_cell == Some(cell_id))
            .count();
        if unmounting > 0 {
            return Err(Error::InvalidState(format!(
                "Cannot remove tablet cell {} since {} tablet(s) are still unmounting from it",
                cell_id, unmounting
            )));
        }
        let actions: Vec<_> = cell.actions.iter().copied().collect();

        for action_id in actions {
            self.unbind_tablet_action_from_cells(action_id);
            self.on_tablet_action_disturbed(
                action_id,
                &format!("Tablet cell {} has been removed", cell_id),
            );
        }

        self.outbox.remove_mailbox(cell_id);
        self.abort_prerequisite(cell_id);
        self.abort_cell_subtree_transactions(cell_id);

        let Some(cell) = self.metadata.cells.remove(&cell_id) else {
            return Ok(());
        };
        for (peer_id, peer) in cell.peers.iter().enumerate() {
            if let Some(address) = &peer.address {
                self.metadata.unindex_peer(address, cell_id, peer_id);
            }
        }
        if let Some(bundle) = self.metadata.bundles.get_mut(&cell.bundle_id) {
            bundle.cells.remove(&cell_id);
        }

        info!("Destroyed tablet cell {}", cell_id);
        Ok(())
    }

    /// Start a transaction scoped to a cell; it dies with the cell's lease
    pub fn start_cell_transaction(&mut self, cell_id: CellId) -> Result<TransactionId> {
        self.metadata.cell(cell_id)?;
        let transaction_id: TransactionId = self.metadata.id_generator.generate();
        self.metadata
            .cell_mut(cell_id)?
            .subtree_transactions
            .insert(transaction_id);
        debug!("Started transaction {} at cell {}", transaction_id, cell_id);
        Ok(transaction_id)
    }

    pub(super) fn abort_cell_subtree_transactions(&mut self, cell_id: CellId) {
        let Some(cell) = self.metadata.cells.get_mut(&cell_id) else {
            return;
        };
        let transactions = std::mem::take(&mut cell.subtree_transactions);
        if transactions.is_empty() {
            return;
        }
        for transaction_id in &transactions {
            debug!("Aborted transaction {} of cell {}", transaction_id, cell_id);
        }
        warn!(
            "Aborted {} subtree transaction(s) of cell {}",
            transactions.len(),
            cell_id
        );
    }
}
