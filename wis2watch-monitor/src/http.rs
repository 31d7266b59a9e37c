/**
 * API HTTP WIS2WATCH - Serveur axum du moniteur
 *
 * RÔLE :
 * Expose la liste des nœuds (chargée une fois par le dashboard), le snapshot
 * des statuts, la santé du service et le canal WebSocket temps réel.
 *
 * ROUTES :
 * - GET /health                 -> "ok"
 * - GET /system/health          -> SystemHealth
 * - GET /api/nodes              -> nœuds triés par pays puis nom
 * - GET /api/status             -> statut de tous les nœuds
 * - GET /api/status/{node_id}   -> statut d'un nœud (404 si inconnu)
 * - GET /ws/mqtt-status/        -> upgrade WebSocket (voir session.rs)
 */

use crate::aggregator::StatusAggregator;
use crate::bus::EventBus;
use crate::events::Event;
use crate::health::{HealthTracker, SystemHealth};
use crate::manager::ConnectionManager;
use crate::models::{Node, NodeId, NodeStatus, StatusMap};
use crate::registry::NodeRegistry;
use crate::session::ws_handler;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<NodeRegistry>,
    pub aggregator: Arc<StatusAggregator>,
    pub manager: Arc<ConnectionManager>,
    pub events: EventBus<Event>,
    pub health_tracker: HealthTracker,
    pub shutdown: CancellationToken,
}

/// Nœud tel que le dashboard le consomme (sans identifiants broker)
#[derive(Debug, Serialize)]
pub struct NodeView {
    pub id: NodeId,
    pub name: String,
    pub country: String,
    pub country_code: String,
    pub center_point: Option<[f64; 2]>,
    pub centre_id: String,
    pub base_url: String,
}

fn to_view(n: &Node) -> NodeView {
    NodeView {
        id: n.id,
        name: n.name.clone(),
        country: n.country.clone(),
        country_code: n.country_code.clone(),
        center_point: n.center_point,
        centre_id: n.centre_id.clone(),
        base_url: n.base_url.clone(),
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/api/nodes", get(list_nodes))
        .route("/api/status", get(get_status))
        .route("/api/status/{node_id}", get(get_node_status))
        .route("/ws/mqtt-status/", get(ws_handler))
        .route("/ws/mqtt-status", get(ws_handler))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
}

// GET /api/nodes
async fn list_nodes(State(app): State<AppState>) -> Json<Vec<NodeView>> {
    Json(app.registry.list_nodes().iter().map(|n| to_view(n)).collect())
}

// GET /api/status
async fn get_status(State(app): State<AppState>) -> Json<StatusMap> {
    Json(app.aggregator.snapshot())
}

// GET /api/status/{node_id}
async fn get_node_status(
    State(app): State<AppState>,
    Path(node_id): Path<NodeId>,
) -> Result<Json<NodeStatus>, StatusCode> {
    app.aggregator
        .get(node_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<SystemHealth> {
    Json(app.health_tracker.get_health(&app.aggregator, &app.events))
}
