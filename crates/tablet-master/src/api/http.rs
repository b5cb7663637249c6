//! HTTP admin API
//!
//! Read-only views of the cluster plus a mutation endpoint

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Error;
use crate::manager::{CellNotification, HeartbeatResponse, NodeHeartbeat};
use crate::metadata::{
    ActionId, CellHealth, CellId, ClusterStats, TableId, TableReplica, TabletAction, TabletCell,
    TabletCellBundle,
};
use crate::{Mutation, MutationResponse, TabletMaster};

/// HTTP API service
pub struct HttpApi {
    master: Arc<TabletMaster>,
}

impl HttpApi {
    /// Create HTTP API
    pub fn new(master: Arc<TabletMaster>) -> Self {
        Self { master }
    }

    /// Create router
    pub fn router(self) -> Router {
        let master = self.master;

        Router::new()
            // Cluster
            .route("/api/v1/cluster/stats", get(get_cluster_stats))
            // Bundles and cells
            .route("/api/v1/bundles", get(list_bundles))
            .route("/api/v1/cells", get(list_cells))
            .route("/api/v1/cells/:cell_id", get(get_cell))
            .route("/api/v1/cells/:cell_id/notifications", post(cell_notification))
            // Tables
            .route("/api/v1/tables", get(list_tables))
            .route("/api/v1/replicas", get(list_replicas))
            // Tablet actions
            .route("/api/v1/actions", get(list_actions))
            .route("/api/v1/actions/:action_id", get(get_action))
            // Nodes
            .route("/api/v1/nodes/heartbeat", post(node_heartbeat))
            // Mutations
            .route("/api/v1/mutations", post(execute_mutation))
            .with_state(master)
    }
}

// ==================== Response types ====================

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    fn err(msg: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        })
    }
}

fn error_status(error: &Error) -> StatusCode {
    match error {
        Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        Error::InvalidState(_) | Error::AlreadyExists(_) => StatusCode::CONFLICT,
        Error::NoSuchObject { .. } => StatusCode::NOT_FOUND,
        Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::LimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
    }
}

#[derive(Serialize)]
struct CellView {
    #[serde(flatten)]
    cell: TabletCell,
    health: CellHealth,
}

#[derive(Serialize)]
struct TableView {
    id: TableId,
    path: String,
    dynamic: bool,
    replicated: bool,
    bundle: String,
    tablet_count: usize,
    mounted_tablet_count: usize,
}

// ==================== Handlers ====================

// Cluster
async fn get_cluster_stats(State(master): State<Arc<TabletMaster>>) -> impl IntoResponse {
    let stats: ClusterStats = master.with_metadata(|m| m.stats());
    ApiResponse::ok(stats)
}

// Bundles and cells
async fn list_bundles(State(master): State<Arc<TabletMaster>>) -> impl IntoResponse {
    let bundles: Vec<TabletCellBundle> =
        master.with_metadata(|m| m.bundles.values().cloned().collect());
    ApiResponse::ok(bundles)
}

async fn list_cells(State(master): State<Arc<TabletMaster>>) -> impl IntoResponse {
    let cells: Vec<CellView> = master.with_metadata(|m| {
        m.cells
            .values()
            .map(|c| CellView {
                health: c.health(),
                cell: c.clone(),
            })
            .collect()
    });
    ApiResponse::ok(cells)
}

async fn get_cell(
    State(master): State<Arc<TabletMaster>>,
    Path(cell_id): Path<u64>,
) -> impl IntoResponse {
    let cell_id = CellId(cell_id);
    let view = master.with_metadata(|m| {
        m.cells.get(&cell_id).map(|c| CellView {
            health: c.health(),
            cell: c.clone(),
        })
    });
    match view {
        Some(view) => (StatusCode::OK, ApiResponse::ok(view)),
        None => (
            StatusCode::NOT_FOUND,
            ApiResponse::<CellView>::err(format!("Tablet cell {} not found", cell_id)),
        ),
    }
}

async fn cell_notification(
    State(master): State<Arc<TabletMaster>>,
    Path(cell_id): Path<u64>,
    Json(notification): Json<CellNotification>,
) -> impl IntoResponse {
    let cell_id = CellId(cell_id);
    debug!(
        "Cell {} reported {} for tablet {}",
        cell_id,
        notification.kind(),
        notification.tablet_id()
    );
    match master
        .execute(Mutation::CellNotification { notification })
        .await
    {
        Ok(MutationResponse::Applied(applied)) => (StatusCode::OK, ApiResponse::ok(applied)),
        Ok(_) => (StatusCode::OK, ApiResponse::ok(false)),
        Err(e) => (error_status(&e), ApiResponse::<bool>::err(e.to_string())),
    }
}

// Tables
async fn list_tables(State(master): State<Arc<TabletMaster>>) -> impl IntoResponse {
    let tables: Vec<TableView> = master.with_metadata(|m| {
        m.tables
            .values()
            .map(|t| TableView {
                id: t.id,
                path: t.path.clone(),
                dynamic: t.dynamic,
                replicated: t.replicated,
                bundle: m
                    .bundles
                    .get(&t.bundle_id)
                    .map(|b| b.name.clone())
                    .unwrap_or_default(),
                tablet_count: t.tablets.len(),
                mounted_tablet_count: t
                    .tablets
                    .iter()
                    .filter_map(|id| m.tablets.get(id))
                    .filter(|tablet| tablet.state.is_active())
                    .count(),
            })
            .collect()
    });
    ApiResponse::ok(tables)
}

async fn list_replicas(State(master): State<Arc<TabletMaster>>) -> impl IntoResponse {
    let replicas: Vec<TableReplica> =
        master.with_metadata(|m| m.replicas.values().cloned().collect());
    ApiResponse::ok(replicas)
}

// Tablet actions
async fn list_actions(State(master): State<Arc<TabletMaster>>) -> impl IntoResponse {
    let actions: Vec<TabletAction> =
        master.with_metadata(|m| m.actions.values().cloned().collect());
    ApiResponse::ok(actions)
}

async fn get_action(
    State(master): State<Arc<TabletMaster>>,
    Path(action_id): Path<u64>,
) -> impl IntoResponse {
    let action_id = ActionId(action_id);
    match master.with_metadata(|m| m.actions.get(&action_id).cloned()) {
        Some(action) => (StatusCode::OK, ApiResponse::ok(action)),
        None => (
            StatusCode::NOT_FOUND,
            ApiResponse::<TabletAction>::err(format!("Tablet action {} not found", action_id)),
        ),
    }
}

// Nodes
async fn node_heartbeat(
    State(master): State<Arc<TabletMaster>>,
    Json(heartbeat): Json<NodeHeartbeat>,
) -> impl IntoResponse {
    match master.execute(Mutation::NodeHeartbeat { heartbeat }).await {
        Ok(MutationResponse::Heartbeat(response)) => (StatusCode::OK, ApiResponse::ok(response)),
        Ok(_) => (StatusCode::OK, ApiResponse::ok(HeartbeatResponse::default())),
        Err(e) => (
            error_status(&e),
            ApiResponse::<HeartbeatResponse>::err(e.to_string()),
        ),
    }
}

// Mutations
async fn execute_mutation(
    State(master): State<Arc<TabletMaster>>,
    Json(mutation): Json<Mutation>,
) -> impl IntoResponse {
    let name = mutation.name();
    match master.execute(mutation).await {
        Ok(response) => {
            info!("Mutation {} applied via HTTP API", name);
            (StatusCode::OK, ApiResponse::ok(response))
        }
        Err(e) => (
            error_status(&e),
            ApiResponse::<MutationResponse>::err(e.to_string()),
        ),
    }
}
