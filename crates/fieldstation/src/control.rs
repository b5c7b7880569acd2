//! HTTP control channel.
//!
//! Receives out-of-band position updates and band changes from the
//! operator's companion app and answers health queries. Accepted updates are
//! forwarded to the orchestrator as typed [`ControlEvent`]s over a channel;
//! the handlers never touch shared state beyond the last-external-position
//! mirror used by the health endpoint.

use std::sync::{Arc, PoisonError, RwLock};

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::band::{Band, BandState};
use crate::error::Result;
use crate::hub::BroadcastHub;
use crate::position::{Position, PositionOrigin};

/// Maximum accepted `/gps` payload in bytes.
const GPS_MAX_PAYLOAD: usize = 10_000;

/// Maximum accepted `/band` payload in bytes.
const BAND_MAX_PAYLOAD: usize = 1_000;

/// A validated update received on the control channel.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// An externally pushed position.
    PositionUpdate(Position),
    /// An accepted band change.
    BandChange {
        /// The new operating band.
        band: Band,
        /// Who signaled the change.
        source: String,
    },
}

/// Shared state for the control handlers.
#[derive(Debug, Clone)]
pub struct ControlState {
    events: mpsc::Sender<ControlEvent>,
    band: Arc<BandState>,
    hub: Arc<BroadcastHub>,
    last_external: Arc<RwLock<Option<Position>>>,
}

impl ControlState {
    /// Create control state over the orchestrator's event channel.
    #[must_use]
    pub fn new(
        events: mpsc::Sender<ControlEvent>,
        band: Arc<BandState>,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        Self {
            events,
            band,
            hub,
            last_external: Arc::new(RwLock::new(None)),
        }
    }

    /// The last position received over the control channel.
    #[must_use]
    pub fn last_external(&self) -> Option<Position> {
        self.last_external
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn remember_external(&self, position: &Position) {
        *self
            .last_external
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(position.clone());
    }
}

/// Structured error response with HTTP status semantics.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: "not found".to_string(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "status": "error",
            "message": self.message,
        }));
        (self.status, body).into_response()
    }
}

impl From<crate::error::Error> for ApiError {
    fn from(err: crate::error::Error) -> Self {
        // Rejected input is the caller's fault; everything else is ours
        if err.is_validation() {
            Self::bad_request(err.to_string())
        } else {
            Self::internal(err.to_string())
        }
    }
}

/// Body of a `/gps` update. Latitude and longitude are required; the rest
/// defaults.
#[derive(Debug, Deserialize)]
struct GpsUpdate {
    latitude: Option<f64>,
    longitude: Option<f64>,
    #[serde(default)]
    altitude: Option<f64>,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    heading: Option<f64>,
    #[serde(default)]
    timestamp: Option<i64>,
}

/// Body of a `/band` change.
#[derive(Debug, Deserialize)]
struct BandUpdate {
    band: Option<String>,
}

/// Build the control router.
#[must_use]
pub fn router(state: ControlState) -> Router {
    Router::new()
        .route(
            "/gps",
            post(handle_gps).layer(DefaultBodyLimit::max(GPS_MAX_PAYLOAD)),
        )
        .route(
            "/band",
            post(handle_band).layer(DefaultBodyLimit::max(BAND_MAX_PAYLOAD)),
        )
        .route("/health", get(handle_health))
        .fallback(handle_not_found)
        .with_state(state)
}

/// Serve the control channel until shutdown.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn serve(
    addr: &str,
    state: ControlState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Control channel listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    info!("Control channel stopped");
    Ok(())
}

async fn handle_gps(
    State(state): State<ControlState>,
    body: Bytes,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    let update: GpsUpdate =
        serde_json::from_slice(&body).map_err(|_| ApiError::bad_request("invalid JSON"))?;

    let (Some(latitude), Some(longitude)) = (update.latitude, update.longitude) else {
        return Err(crate::error::Error::validation("missing latitude or longitude").into());
    };

    let timestamp = update
        .timestamp
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    let position = Position {
        timestamp,
        latitude,
        longitude,
        altitude: update.altitude.unwrap_or_default(),
        speed: update.speed.unwrap_or_default(),
        heading: update.heading.unwrap_or_default(),
        origin: PositionOrigin::External,
    };

    state.remember_external(&position);

    state
        .events
        .send(ControlEvent::PositionUpdate(position))
        .await
        .map_err(|e| {
            error!("Failed to forward position update: {}", e);
            ApiError::internal("event channel closed")
        })?;

    info!("Received external position: {latitude:.4}, {longitude:.4}");
    Ok(Json(json!({
        "status": "ok",
        "message": "position received",
    })))
}

async fn handle_band(
    State(state): State<ControlState>,
    body: Bytes,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    let update: BandUpdate =
        serde_json::from_slice(&body).map_err(|_| ApiError::bad_request("invalid JSON"))?;

    let Some(label) = update.band else {
        return Err(ApiError::bad_request("missing band field"));
    };

    let band = Band::from_control_label(&label).map_err(ApiError::from)?;

    state
        .events
        .send(ControlEvent::BandChange {
            band,
            source: "control".to_string(),
        })
        .await
        .map_err(|e| {
            error!("Failed to forward band change: {}", e);
            ApiError::internal("event channel closed")
        })?;

    info!("Band change accepted: {band}");
    Ok(Json(json!({
        "status": "ok",
        "message": format!("band set to {band}"),
    })))
}

async fn handle_health(State(state): State<ControlState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "current_band": state.band.current().label(),
        "last_gps": state.last_external(),
        "clients": state.hub.subscriber_count(),
    }))
}

async fn handle_not_found() -> ApiError {
    ApiError::not_found()
}
