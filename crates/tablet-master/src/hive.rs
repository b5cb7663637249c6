//! Messaging to tablet cells
//!
//! The tablet manager posts messages into per-cell mailboxes of an [`Outbox`].
//! After a mutation is applied the executor drains the outbox and hands the
//! envelopes to a [`MessageSink`], which owns the actual transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::metadata::{
    CellId, ChunkId, InMemoryMode, PivotKey, ReplicaId, ReplicaMode, ReplicaState, TableId,
    TabletId, Timestamp,
};

/// Replica description shipped to a cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub replica_id: ReplicaId,
    pub cluster_name: String,
    pub replica_path: String,
    pub start_replication_timestamp: Timestamp,
    pub mode: ReplicaMode,
    pub state: ReplicaState,
}

/// Message sent to a tablet cell
///
/// Handlers on the cell side are idempotent per `(tablet_id, mount_revision)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CellMessage {
    MountTablet {
        tablet_id: TabletId,
        mount_revision: u64,
        table_id: TableId,
        table_path: String,
        pivot_key: PivotKey,
        next_pivot_key: Option<PivotKey>,
        in_memory_mode: InMemoryMode,
        freeze: bool,
        chunk_ids: Vec<ChunkId>,
        replicas: Vec<ReplicaDescriptor>,
        trimmed_row_count: i64,
        retained_timestamp: Timestamp,
    },
    UnmountTablet {
        tablet_id: TabletId,
        mount_revision: u64,
        force: bool,
    },
    RemountTablet {
        tablet_id: TabletId,
        mount_revision: u64,
    },
    FreezeTablet {
        tablet_id: TabletId,
        mount_revision: u64,
    },
    UnfreezeTablet {
        tablet_id: TabletId,
        mount_revision: u64,
    },
    AddTableReplica {
        tablet_id: TabletId,
        mount_revision: u64,
        replica: ReplicaDescriptor,
    },
    RemoveTableReplica {
        tablet_id: TabletId,
        mount_revision: u64,
        replica_id: ReplicaId,
    },
    SetTableReplicaEnabled {
        tablet_id: TabletId,
        mount_revision: u64,
        replica_id: ReplicaId,
        enabled: bool,
    },
    SetTableReplicaMode {
        tablet_id: TabletId,
        mount_revision: u64,
        replica_id: ReplicaId,
        mode: ReplicaMode,
    },
}

impl CellMessage {
    /// Tablet the message is addressed to
    pub fn tablet_id(&self) -> TabletId {
        match self {
            CellMessage::MountTablet { tablet_id, .. }
            | CellMessage::UnmountTablet { tablet_id, .. }
            | CellMessage::RemountTablet { tablet_id, .. }
            | CellMessage::FreezeTablet { tablet_id, .. }
            | CellMessage::UnfreezeTablet { tablet_id, .. }
            | CellMessage::AddTableReplica { tablet_id, .. }
            | CellMessage::RemoveTableReplica { tablet_id, .. }
            | CellMessage::SetTableReplicaEnabled { tablet_id, .. }
            | CellMessage::SetTableReplicaMode { tablet_id, .. } => *tablet_id,
        }
    }
}

/// Message with its destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub cell_id: CellId,
    pub message: CellMessage,
}

/// Per-cell mailboxes filled during one mutation
#[derive(Debug, Default)]
pub struct Outbox {
    mailboxes: BTreeMap<CellId, Vec<CellMessage>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_mailbox(&mut self, cell_id: CellId) {
        self.mailboxes.entry(cell_id).or_default();
    }

    /// Remove a mailbox, dropping undelivered messages
    pub fn remove_mailbox(&mut self, cell_id: CellId) {
        if let Some(pending) = self.mailboxes.remove(&cell_id) {
            if !pending.is_empty() {
                debug!("Dropped {} pending message(s) for cell {}", pending.len(), cell_id);
            }
        }
    }

    pub fn has_mailbox(&self, cell_id: CellId) -> bool {
        self.mailboxes.contains_key(&cell_id)
    }

    /// Post a message to a cell
    pub fn post(&mut self, cell_id: CellId, message: CellMessage) {
        match self.mailboxes.get_mut(&cell_id) {
            Some(mailbox) => mailbox.push(message),
            None => warn!("No mailbox for cell {}, message dropped", cell_id),
        }
    }

    /// Take every pending message, grouped by destination in cell id order
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        for (cell_id, mailbox) in self.mailboxes.iter_mut() {
            envelopes.extend(mailbox.drain(..).map(|message| Envelope {
                cell_id: *cell_id,
                message,
            }));
        }
        envelopes
    }

    /// Pending messages of one cell
    pub fn pending(&self, cell_id: CellId) -> &[CellMessage] {
        self.mailboxes
            .get(&cell_id)
            .map(|m| m.as_slice())
            .unwrap_or(&[])
    }
}

/// Transport delivering envelopes to cells
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, envelope: Envelope);
}

/// Sink that only logs envelopes
#[derive(Debug, Default)]
pub struct LoggingSink;

#[async_trait]
impl MessageSink for LoggingSink {
    async fn deliver(&self, envelope: Envelope) {
        debug!(
            "Message for cell {} (tablet {}): {:?}",
            envelope.cell_id,
            envelope.message.tablet_id(),
            envelope.message
        );
    }
}

/// Sink forwarding envelopes into a channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<Envelope>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn deliver(&self, envelope: Envelope) {
        if let Err(e) = self.sender.send(envelope) {
            warn!("Message channel closed, dropping message for cell {}", e.0.cell_id);
        }
    }
}
