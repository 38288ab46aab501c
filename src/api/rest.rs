use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::domain::model::{DaemonHealth, Device, RouteAdvertisement, Snapshot};
use crate::domain::service::StatusService;
use crate::error::StatusError;

/// Shared application state for all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: StatusService,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/api/v1/status", get(status))
        .route("/api/v1/self", get(self_device))
        .route("/api/v1/peers", get(peers))
        .route("/api/v1/peers/{id}", get(peer))
        .route("/api/v1/routes", get(routes))
        .route("/api/v1/exit-nodes", get(exit_nodes))
        .route("/api/v1/refresh", post(refresh))
        .route("/api/v1/invalidate", post(invalidate))
        .with_state(state)
}

/// A cold cache that cannot be filled is an availability condition, not a
/// server bug.
fn error_response(err: StatusError) -> (StatusCode, String) {
    let code = match err {
        StatusError::ColdStart { .. } | StatusError::AgentNotFound => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, err.to_string())
}

async fn health(State(state): State<AppState>) -> Json<DaemonHealth> {
    Json(state.service.health().await)
}

async fn ready(State(state): State<AppState>) -> Result<Json<DaemonHealth>, StatusCode> {
    if state.service.ready().await {
        Ok(Json(state.service.health().await))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// Serve the cached snapshot, refreshing when stale. While the agent is
/// failing, the last good snapshot is served with `stale: true`.
async fn status(State(state): State<AppState>) -> Result<Json<Snapshot>, (StatusCode, String)> {
    state
        .service
        .get_snapshot()
        .await
        .map(|s| Json(s.as_ref().clone()))
        .map_err(error_response)
}

async fn self_device(
    State(state): State<AppState>,
) -> Result<Json<Device>, (StatusCode, String)> {
    state
        .service
        .get_snapshot()
        .await
        .map(|s| Json(s.self_device.clone()))
        .map_err(error_response)
}

async fn peers(
    State(state): State<AppState>,
) -> Result<Json<Vec<Device>>, (StatusCode, String)> {
    state
        .service
        .get_snapshot()
        .await
        .map(|s| Json(s.peers.values().cloned().collect()))
        .map_err(error_response)
}

async fn peer(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Device>, (StatusCode, String)> {
    let snapshot = state.service.get_snapshot().await.map_err(error_response)?;
    snapshot
        .peers
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("no peer with id {id}")))
}

async fn routes(
    State(state): State<AppState>,
) -> Result<Json<Vec<RouteAdvertisement>>, (StatusCode, String)> {
    state
        .service
        .get_snapshot()
        .await
        .map(|s| Json(s.route_summary()))
        .map_err(error_response)
}

async fn exit_nodes(
    State(state): State<AppState>,
) -> Result<Json<Vec<Device>>, (StatusCode, String)> {
    state
        .service
        .get_snapshot()
        .await
        .map(|s| Json(s.exit_nodes().into_iter().cloned().collect()))
        .map_err(error_response)
}

/// Force a refresh through the single-flight path and return the result.
async fn refresh(State(state): State<AppState>) -> Result<Json<Snapshot>, (StatusCode, String)> {
    state
        .service
        .refresh()
        .await
        .map(|s| Json(s.as_ref().clone()))
        .map_err(error_response)
}

/// Drop cache freshness after an out-of-band change (e.g. `tailscale up`
/// flags edited). The next read re-collects.
async fn invalidate(State(state): State<AppState>) -> StatusCode {
    state.service.invalidate().await;
    StatusCode::NO_CONTENT
}
