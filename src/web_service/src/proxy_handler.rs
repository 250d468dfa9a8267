use crate::http_server::RouterRestState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

/// `GET /routes/{name}/status`
#[derive(Debug, Serialize)]
pub struct RouteStatus {
    #[serde(rename = "activeConnections")]
    pub active_connections: u64,
}

/// `GET /connection_pool/main/status`
#[derive(Debug, Serialize)]
pub struct PoolStatus {
    #[serde(rename = "idleServerConnections")]
    pub idle_server_connections: usize,
    #[serde(rename = "stashedServerConnections")]
    pub stashed_server_connections: usize,
}

pub async fn route_status(
    State(state): State<RouterRestState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let Some(server) = state.route(&name) else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("no route {name:?}")})),
        )
            .into_response();
    };
    Json(RouteStatus {
        active_connections: server.active_connections(),
    })
    .into_response()
}

pub async fn pool_status(State(state): State<RouterRestState>) -> impl IntoResponse {
    let pool = state.pool();
    Json(PoolStatus {
        idle_server_connections: pool.current_pooled_connections(),
        stashed_server_connections: pool.current_stashed_connections(),
    })
}
