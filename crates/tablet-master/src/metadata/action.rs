//! Tablet action definitions

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{ActionId, BundleId, CellId, PivotKey, TabletId};

/// Action kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    Move,
    Reshard,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Move => write!(f, "move"),
            ActionKind::Reshard => write!(f, "reshard"),
        }
    }
}

/// Action state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionState {
    Preparing,
    Freezing,
    Frozen,
    Unmounting,
    Unmounted,
    Mounting,
    Mounted,
    Completed,
    Failing,
    Failed,
}

impl ActionState {
    pub fn is_finished(self) -> bool {
        matches!(self, ActionState::Completed | ActionState::Failed)
    }
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionState::Preparing => write!(f, "preparing"),
            ActionState::Freezing => write!(f, "freezing"),
            ActionState::Frozen => write!(f, "frozen"),
            ActionState::Unmounting => write!(f, "unmounting"),
            ActionState::Unmounted => write!(f, "unmounted"),
            ActionState::Mounting => write!(f, "mounting"),
            ActionState::Mounted => write!(f, "mounted"),
            ActionState::Completed => write!(f, "completed"),
            ActionState::Failing => write!(f, "failing"),
            ActionState::Failed => write!(f, "failed"),
        }
    }
}

/// Orchestrated move or reshard over a fixed tablet set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletAction {
    pub id: ActionId,
    pub kind: ActionKind,
    pub state: ActionState,
    pub bundle_id: BundleId,
    pub tablets: Vec<TabletId>,
    /// Destination hints
    pub cells: Vec<CellId>,
    pub pivot_keys: Vec<PivotKey>,
    pub tablet_count: Option<usize>,
    pub skip_freezing: bool,
    /// Whether tablets should end up frozen
    pub freeze: bool,
    pub keep_finished: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Retention of a finished action kept for inspection, in seconds
    #[serde(default)]
    pub expiration_timeout_secs: u64,
    /// Cells the tablets occupied when the action was created
    #[serde(default)]
    pub source_cells: BTreeMap<TabletId, CellId>,
}

impl TabletAction {
    /// Whether a finished action has outlived its retention
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.finished_at {
            Some(finished_at) if self.state.is_finished() => {
                finished_at + Duration::seconds(self.expiration_timeout_secs as i64) <= now
            }
            _ => false,
        }
    }
}
