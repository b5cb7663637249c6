//! Tablet master - control plane for dynamic tables
//!
//! Responsible for tablets, tablet cells, cell bundles, table replicas and
//! tablet actions
//!
//! # Features
//! - Tablet mount lifecycle (mount, unmount, remount, freeze, unfreeze)
//! - Reshard and clone of dynamic tables
//! - Peer assignment and leader reassignment of tablet cells
//! - Tablet actions (move and reshard) with failure recovery
//! - Replicated table replica state
//!
//! # Usage Example
//! ```ignore
//! use std::sync::Arc;
//! use tablet_master::{MasterConfig, TabletMaster, hive::LoggingSink};
//!
//! let master = Arc::new(TabletMaster::new(MasterConfig::default(), Arc::new(LoggingSink)).await?);
//! master.clone().start_tracker();
//! ```

pub mod api;
pub mod automaton;
pub mod config;
pub mod error;
pub mod hive;
pub mod manager;
pub mod metadata;
pub mod scheduler;
pub mod storage;
pub mod tracker;

// Re-export commonly used types
pub use automaton::{Mutation, MutationResponse, TabletRange};
pub use config::MasterConfig;
pub use error::{Error, Result};
pub use manager::TabletManager;

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use hive::{Envelope, MessageSink};
use metadata::ClusterMetadata;
use storage::{FileStorage, StorageError};
use tracker::TabletTracker;

/// Tablet master service
///
/// Serializes every mutation through one lock on the [`TabletManager`].
/// Produced cell messages are queued while the lock is held and handed to the
/// [`MessageSink`] by a single delivery task, so every cell receives them in
/// the order the mutations were applied.
pub struct TabletMaster {
    config: MasterConfig,
    storage: FileStorage,
    manager: Mutex<TabletManager>,
    tracker: TabletTracker,
    deliveries: mpsc::UnboundedSender<Envelope>,
}

impl TabletMaster {
    /// Create tablet master, loading the last snapshot if present
    pub async fn new(config: MasterConfig, sink: Arc<dyn MessageSink>) -> std::result::Result<Self, StorageError> {
        let storage = FileStorage::new(&config.data_dir);
        let metadata = storage.load_or_create(&config.cluster_name).await?;
        let now = Utc::now();

        let manager = TabletManager::new(
            config.tablet_manager.clone(),
            config.actions.clone(),
            metadata,
            now,
        );
        let tracker = TabletTracker::new(config.tracker.clone(), now);
        let deliveries = Self::start_delivery(sink);

        info!(
            "Tablet master initialized: cluster={}, data_dir={}",
            config.cluster_name, config.data_dir
        );

        Ok(Self {
            config,
            storage,
            manager: Mutex::new(manager),
            tracker,
            deliveries,
        })
    }

    /// Start the task feeding queued envelopes to the sink; it ends with the master
    fn start_delivery(sink: Arc<dyn MessageSink>) -> mpsc::UnboundedSender<Envelope> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Envelope>();
        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                sink.deliver(envelope).await;
            }
            debug!("Cell message delivery stopped");
        });
        sender
    }

    /// Get configuration
    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Apply one mutation and queue the messages it produced
    pub async fn execute(&self, mutation: Mutation) -> Result<MutationResponse> {
        self.apply_and_queue(mutation)
    }

    fn apply_and_queue(&self, mutation: Mutation) -> Result<MutationResponse> {
        let mut manager = self.manager.lock();
        manager.advance_clock(Utc::now());
        let result = manager.apply(mutation);
        for envelope in manager.drain_outbox() {
            if self.deliveries.send(envelope).is_err() {
                error!("Cell message delivery task is gone, message dropped");
            }
        }
        result
    }

    /// Get metadata snapshot (read-only)
    pub fn metadata(&self) -> ClusterMetadata {
        self.manager.lock().metadata().clone()
    }

    /// Read metadata under the lock without cloning it
    pub fn with_metadata<R>(&self, f: impl FnOnce(&ClusterMetadata) -> R) -> R {
        f(self.manager.lock().metadata())
    }

    /// Save metadata
    pub async fn save(&self) -> std::result::Result<(), StorageError> {
        let metadata = self.metadata();
        self.storage.save(&metadata).await
    }

    /// Run one tracker pass: node liveness, then peer commands
    pub async fn scan_cells(&self) -> Result<usize> {
        let timeout_secs = self.config.tracker.node_heartbeat_timeout_secs as i64;
        self.execute(Mutation::CheckNodeLiveness { timeout_secs }).await?;

        let commands = {
            let manager = self.manager.lock();
            self.tracker.scan(manager.metadata(), Utc::now())
        };
        if commands.is_empty() {
            return Ok(0);
        }
        debug!("Tracker produced {} command(s)", commands.len());
        match self.execute(Mutation::ApplyCellCommands { commands }).await? {
            MutationResponse::Count(applied) => Ok(applied),
            _ => Ok(0),
        }
    }

    /// Start tracker scan task
    pub fn start_tracker(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = self.config.tracker.cell_scan_period();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = self.scan_cells().await {
                    error!("Tablet tracker scan failed: {}", e);
                }
            }
        })
    }

    /// Start cleanup task for expired tablet actions
    pub fn start_action_cleanup(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = self.config.actions.cleanup_period();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                match self.execute(Mutation::CleanupTabletActions).await {
                    Ok(MutationResponse::Count(removed)) if removed > 0 => {
                        info!("Removed {} expired tablet action(s)", removed);
                    }
                    Ok(_) => {}
                    Err(e) => error!("Tablet action cleanup failed: {}", e),
                }
            }
        })
    }

    /// Start periodic save task
    pub fn start_periodic_save(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = self.config.save_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = self.save().await {
                    error!("Failed to save metadata: {}", e);
                }
            }
        })
    }
}
