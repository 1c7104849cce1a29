use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::directory::ServiceInstance;
use crate::dispatcher::{Dispatcher, JobResult};
use crate::error::Result;

pub const SERVICES_PATH: &str = "/v1/services";
pub const JOBS_PATH: &str = "/v1/jobs";
pub const RESULTS_PATH: &str = "/v1/jobs/results";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub namespace: String,
    pub host: String,
    pub port: u16,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub instance_id: String,
    #[serde(flatten)]
    pub instance: ServiceInstance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeregisterResponse {
    pub removed: Vec<ServiceInstance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing<T> {
    pub count: usize,
    pub entries: Vec<T>,
}

impl<T> From<Vec<T>> for Listing<T> {
    fn from(entries: Vec<T>) -> Self {
        Self {
            count: entries.len(),
            entries,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(health_handler))
        .route(SERVICES_PATH, post(register_handler))
        .route(
            "/v1/services/:key",
            get(list_services_handler).delete(deregister_handler),
        )
        .route(JOBS_PATH, post(submit_job_handler))
        .route(RESULTS_PATH, get(list_results_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK".to_string(),
        timestamp: Utc::now(),
    })
}

async fn register_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>> {
    let instance = dispatcher
        .directory()
        .register(&request.namespace, &request.host, request.port, &request.name)
        .await?;

    Ok(Json(RegisterResponse {
        instance_id: instance.instance_id(),
        instance,
    }))
}

async fn deregister_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(urn): Path<String>,
) -> Result<Json<DeregisterResponse>> {
    let removed = dispatcher.directory().deregister(&urn).await?;
    Ok(Json(DeregisterResponse { removed }))
}

async fn list_services_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(namespace): Path<String>,
) -> Json<Listing<ServiceInstance>> {
    Json(dispatcher.directory().list(&namespace).await.into())
}

async fn submit_job_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(preferences): Json<Value>,
) -> Result<Json<Value>> {
    Ok(Json(dispatcher.submit_job(preferences).await?))
}

async fn list_results_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
) -> Json<Listing<JobResult>> {
    Json(dispatcher.results().list().await.into())
}
