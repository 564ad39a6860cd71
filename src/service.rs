use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{error, info};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::error::Error;
use crate::extractor::Extractor;
use crate::serialize::serialize;

pub struct AppState
{
    pub extractor: Arc<Extractor>,
}

#[derive(Debug, Deserialize)]
pub struct ExtractRequest
{
    pub image_path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractResponse
{
    pub success: bool,
    pub feature_values: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse
{
    pub status: &'static str,
    pub message: String,
}

pub fn create_routes(state: Arc<AppState>) -> Router
{
    Router::new()
        .route("/extract", post(extract))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(state: Arc<AppState>, host: &str, port: u16) -> anyhow::Result<()>
{
    let app = create_routes(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Feature extraction service listening on http://{addr}");

    axum::serve(listener, app).await?;

    Ok(())
}

/// POST /extract - features for the image at `image_path`
pub async fn extract(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ExtractRequest>, JsonRejection>,
) -> Result<Json<ExtractResponse>, AppError>
{
    info!("Received feature extraction request");

    let Json(request) = payload.map_err(|rejection| {
        error!("Invalid request: {}", rejection.body_text());
        AppError::BadRequest(format!("Request must be JSON: {}", rejection.body_text()))
    })?;

    let image_path = match request.image_path {
        Some(path) if !path.trim().is_empty() => path,
        _ => {
            error!("Invalid request: Missing image_path");
            return Err(AppError::BadRequest("No image_path provided".to_string()));
        }
    };
    info!("Extracting features for image: {}", image_path);

    // Decode and inference block; keep them off the async workers.
    let extractor = state.extractor.clone();
    let path = PathBuf::from(image_path);
    let extraction = tokio::task::spawn_blocking(move || extractor.extract(&path))
        .await
        .map_err(|e| AppError::Internal(format!("Extraction task failed: {}", e)))??;

    let serialized = serialize(&extraction.features);

    Ok(Json(ExtractResponse {
        success: true,
        feature_values: serialized.values,
    }))
}

/// GET /health - does not load the model
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse>
{
    Json(HealthResponse {
        status: "ok",
        message: format!("Service is running (model: {})", state.extractor.provider().status()),
    })
}

impl Error
{
    pub fn status_code(&self) -> StatusCode
    {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Decode(_) | Error::Inference(_) | Error::ModelLoad(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug)]
pub enum AppError
{
    BadRequest(String),
    Extraction(Error),
    Internal(String),
}

impl From<Error> for AppError
{
    fn from(error: Error) -> Self
    {
        AppError::Extraction(error)
    }
}

impl IntoResponse for AppError
{
    fn into_response(self) -> Response
    {
        let (status, message) = match self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            AppError::Extraction(e) => (e.status_code(), e.to_string()),
            AppError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        error!("Responding {} - {}", status, message);

        // 400s keep the bare {"error"} shape existing clients expect.
        let body = if status == StatusCode::BAD_REQUEST {
            serde_json::json!({ "error": message })
        } else {
            serde_json::json!({ "success": false, "error": message })
        };

        (status, Json(body)).into_response()
    }
}
