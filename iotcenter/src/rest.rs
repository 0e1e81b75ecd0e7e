use crate::authorizations::{AuthorizationIssuer, Registration};
use crate::config::Config;
use crate::devices::DeviceDirectory;
use crate::errors::{self, Error};
use crate::measurements::{TelemetryStore, WriteOutcome};
use crate::metrics;
use crate::model::{Bucket, Device, TelemetryPoint};
use crate::store::TimeSeriesStore;
use crate::telemetry::VirtualSensor;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

const DEFAULT_RANGE_START: &str = "-1h";

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn TimeSeriesStore>,
    devices: DeviceDirectory,
    issuer: AuthorizationIssuer,
    telemetry: TelemetryStore,
    allow_raw_query: bool,
}

impl AppState {
    pub fn new(config: &Config, store: Arc<dyn TimeSeriesStore>) -> errors::Result<Self> {
        let sensor = Arc::new(VirtualSensor::new(config.geo_url.clone())?);
        let devices = DeviceDirectory::new(store.clone(), config.auth_bucket.as_str());
        let issuer =
            AuthorizationIssuer::new(store.clone(), devices.clone(), config.bucket.as_str());
        let telemetry = TelemetryStore::new(store.clone(), sensor, config.bucket.as_str());

        Ok(Self {
            store,
            devices,
            issuer,
            telemetry,
            allow_raw_query: config.allow_raw_query,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDeviceRequest {
    device_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDeviceResponse {
    device_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    device_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct MeasurementsRequest {
    query: Option<String>,
    start: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestMeasurementsParams {
    device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    device_id: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/help", get(help))
        .route("/metrics", get(metrics_handler))
        .route("/api/devices", get(list_devices).post(create_device))
        .route("/api/devices/generate", post(generate_measurements))
        .route("/api/devices/:id", get(get_device))
        .route("/api/devices/:id/measurements", post(device_measurements))
        .route("/api/measurements", get(latest_measurements))
        .route("/api/buckets", get(list_buckets))
        .route("/api/authorizations/create", post(create_authorization))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

async fn index() -> Html<String> {
    Html(format!(
        "<!doctype html>\n<html><head><title>IoT Center</title></head><body>\n\
         <h1>IoT Center</h1>\n\
         <p>Server time: {}</p>\n\
         <ul>\n\
         <li><a href=\"/api/devices\">Devices</a></li>\n\
         <li><a href=\"/api/buckets\">Buckets</a></li>\n\
         <li><a href=\"/help\">Help</a></li>\n\
         </ul>\n</body></html>\n",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    ))
}

async fn help() -> Html<&'static str> {
    Html(
        "<!doctype html>\n<html><head><title>IoT Center - Help</title></head><body>\n\
         <h1>API</h1>\n<dl>\n\
         <dt>GET /api/devices</dt><dd>All devices, tokens omitted.</dd>\n\
         <dt>GET /api/devices/{id}</dt><dd>One device including its token.</dd>\n\
         <dt>POST /api/devices</dt><dd>Create a device. Body: {\"deviceId\"?: string}.</dd>\n\
         <dt>POST /api/devices/generate</dt><dd>Write synthetic telemetry. Body: {\"deviceIds\": [string]}.</dd>\n\
         <dt>POST /api/devices/{id}/measurements</dt><dd>Readings as CSV. Body: {\"start\"?: \"-1h\", \"query\"?: flux}.</dd>\n\
         <dt>GET /api/measurements?deviceId=</dt><dd>Latest reading of a device.</dd>\n\
         <dt>GET /api/buckets</dt><dd>Storage buckets.</dd>\n\
         <dt>POST /api/authorizations/create</dt><dd>Register a device. Body: {\"deviceId\": string}.</dd>\n\
         </dl>\n</body></html>\n",
    )
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

async fn list_devices(State(state): State<AppState>) -> Result<Json<Vec<Device>>, AppError> {
    Ok(Json(state.devices.get_device(None).await?))
}

async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Device>>, AppError> {
    Ok(Json(state.devices.get_device(Some(&id)).await?))
}

async fn create_device(
    State(state): State<AppState>,
    Json(request): Json<CreateDeviceRequest>,
) -> Result<Json<CreateDeviceResponse>, AppError> {
    let device_id = state.devices.create_device(request.device_id).await?;
    Ok(Json(CreateDeviceResponse { device_id }))
}

async fn generate_measurements(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Json<Vec<WriteOutcome>> {
    Json(state.telemetry.write_measurements(&request.device_ids).await)
}

async fn device_measurements(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<MeasurementsRequest>,
) -> Result<Response, AppError> {
    let csv = match request.query {
        Some(_) if !state.allow_raw_query => {
            warn!("Rejected raw query for device {}", id);
            return Err(AppError::new(
                StatusCode::FORBIDDEN,
                "raw queries are disabled on this server",
            ));
        }
        Some(query) => state.telemetry.get_measurements_raw(&id, &query).await?,
        None => {
            let start = request.start.as_deref().unwrap_or(DEFAULT_RANGE_START);
            state.telemetry.get_measurements_csv(&id, start).await?
        }
    };

    Ok(([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], csv).into_response())
}

async fn latest_measurements(
    State(state): State<AppState>,
    Query(params): Query<LatestMeasurementsParams>,
) -> Result<Json<Vec<TelemetryPoint>>, AppError> {
    let Some(device_id) = params.device_id.filter(|id| !id.is_empty()) else {
        return Err(AppError::new(
            StatusCode::NOT_FOUND,
            "deviceId query parameter is required",
        ));
    };
    Ok(Json(state.telemetry.get_measurements(&device_id).await?))
}

async fn list_buckets(State(state): State<AppState>) -> Result<Json<Vec<Bucket>>, AppError> {
    Ok(Json(state.store.list_buckets().await?))
}

async fn create_authorization(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<Registration>, AppError> {
    Ok(Json(state.issuer.register_device(&request.device_id).await?))
}

pub struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl AppError {
    pub fn new(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            error: anyhow::anyhow!(message.to_string()),
        }
    }
}

fn status_for(error: &anyhow::Error) -> StatusCode {
    match error.downcast_ref::<Error>() {
        Some(Error::Validation(_)) => StatusCode::BAD_REQUEST,
        Some(Error::BucketNotFound(_)) => StatusCode::NOT_FOUND,
        Some(Error::Store { status, .. }) => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        Some(Error::Transport(_)) | Some(Error::Parse(_)) => StatusCode::BAD_GATEWAY,
        Some(Error::Unsupported(_)) => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("API error: {}", self.error);
        } else {
            warn!("API error: {}", self.error);
        }
        (
            self.status,
            Json(json!({ "error": self.error.to_string() })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let error = err.into();
        Self {
            status: status_for(&error),
            error,
        }
    }
}
