use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, put},
    Json, Router,
};
use futures::{future, Stream, StreamExt};
use serde_json::Value;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{MultigrainError, Result};
use crate::worker::{DeviceSettings, DeviceStatus, Worker};

pub const STATUS_PATH: &str = "/v1/status";
pub const SETTINGS_PATH: &str = "/v1/settings";
pub const START_PATH: &str = "/v1/state/start";
pub const STOP_PATH: &str = "/v1/state/stop";
pub const EVENTS_PATH: &str = "/v1/events";

#[derive(Clone)]
struct ApiState {
    worker: Worker,
    /// Ends open event streams so graceful shutdown can drain connections
    shutdown: CancellationToken,
}

pub fn router(worker: Worker, shutdown: CancellationToken) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(STATUS_PATH, get(status_handler))
        .route(SETTINGS_PATH, put(settings_handler))
        .route(START_PATH, put(start_handler))
        .route(STOP_PATH, put(stop_handler))
        .route(EVENTS_PATH, get(events_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ApiState { worker, shutdown })
}

async fn status_handler(State(state): State<ApiState>) -> Json<DeviceStatus> {
    Json(state.worker.status().await)
}

async fn settings_handler(
    State(state): State<ApiState>,
    Json(body): Json<Value>,
) -> Result<Json<DeviceStatus>> {
    let settings: DeviceSettings = serde_json::from_value(body)
        .map_err(|e| MultigrainError::Settings(e.to_string()))?;
    Ok(Json(state.worker.apply_settings(settings).await))
}

async fn start_handler(State(state): State<ApiState>) -> Result<Json<DeviceStatus>> {
    Ok(Json(state.worker.start().await?))
}

async fn stop_handler(State(state): State<ApiState>) -> Json<DeviceStatus> {
    Json(state.worker.stop().await)
}

async fn events_handler(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let name = state.worker.name().to_string();
    let stream = BroadcastStream::new(state.worker.events())
        .filter_map(move |item| {
            future::ready(match item {
                Ok(envelope) => match serde_json::to_string(&envelope) {
                    Ok(data) => Some(Ok(Event::default().event(envelope.name()).data(data))),
                    Err(e) => {
                        tracing::error!(worker = %name, error = %e, "Failed to encode event");
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!(worker = %name, error = %e, "Event subscriber lagged");
                    None
                }
            })
        })
        .take_until(state.shutdown.clone().cancelled_owned());

    Sse::new(stream).keep_alive(KeepAlive::default())
}
