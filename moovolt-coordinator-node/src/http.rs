//! HTTP query surface for the front-end
//!
//! ```text
//! GET  /health                   liveness
//! GET  /sessions                 latest status per station of this shard
//! GET  /sessions/{station}       latest status of one station
//! POST /stations/{station}/stop  operator remote stop
//! ```

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use moovolt_core::{ChargePointId, CoordinatorHandle, SessionStatus};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// JSON body of error responses
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    NoSession(ChargePointId),
    Bus(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NoSession(station) => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    error: "no_session",
                    message: format!("no session known for {}", station),
                },
            ),
            ApiError::Bus(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody {
                    error: "bus_unavailable",
                    message,
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Default, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub requested_by: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StopAccepted {
    pub charge_point_id: ChargePointId,
    pub topic: String,
    pub sequence: u64,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn list_sessions(State(handle): State<CoordinatorHandle>) -> Json<Vec<SessionStatus>> {
    Json(handle.sessions())
}

async fn get_session(
    State(handle): State<CoordinatorHandle>,
    Path(station): Path<String>,
) -> Result<Json<SessionStatus>, ApiError> {
    let station = ChargePointId::new(station);
    handle.status(&station).map(Json).ok_or(ApiError::NoSession(station))
}

async fn stop_station(
    State(handle): State<CoordinatorHandle>,
    Path(station): Path<String>,
    body: Option<Json<StopRequest>>,
) -> Result<(StatusCode, Json<StopAccepted>), ApiError> {
    let station = ChargePointId::new(station);
    let requested_by = body
        .and_then(|Json(req)| req.requested_by)
        .unwrap_or_else(|| "http".to_string());

    info!("HTTP: remote stop for {} requested by {}", station, requested_by);
    let receipt = handle.remote_stop(&station, requested_by).await.map_err(|e| {
        warn!("HTTP: remote stop for {} not published: {}", station, e);
        ApiError::Bus(e.to_string())
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(StopAccepted {
            charge_point_id: station,
            topic: receipt.topic,
            sequence: receipt.sequence,
        }),
    ))
}

pub fn router(handle: CoordinatorHandle) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{station}", get(get_session))
        .route("/stations/{station}/stop", post(stop_station))
        .with_state(handle)
}
