//! Thin HTTP front end over a shared [`Predictor`].
//!
//! Artifacts are loaded before the listener is bound, so a running server always
//! has a model to answer with.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::CorsLayer;

use crate::predict::Predictor;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Largest accepted GPX upload in bytes.
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".to_string(),
            max_upload_bytes: 20 * 1024 * 1024,
        }
    }
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("Server error: {0}")]
    Serve(std::io::Error),
}

/// Build the API router around a loaded predictor.
pub fn router(predictor: Arc<Predictor>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/process-gpx", post(process_gpx))
        .with_state(predictor)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
}

pub async fn serve(predictor: Arc<Predictor>, config: &ServerConfig) -> Result<(), ServerError> {
    let app = router(predictor, config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: config.bind.clone(),
            source,
        })?;
    log::info!("Listening on http://{}", config.bind);

    axum::serve(listener, app).await.map_err(ServerError::Serve)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

/// Takes the GPX either as the `file` field of a `multipart/form-data` form (what
/// the browser upload sends) or as the raw request body.
async fn process_gpx(State(predictor): State<Arc<Predictor>>, request: Request) -> Response {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    let upload = if is_multipart {
        read_file_field(request).await
    } else {
        Bytes::from_request(request, &())
            .await
            .map(Some)
            .map_err(|e| e.body_text())
    };
    let body = match upload {
        Ok(Some(body)) if !body.is_empty() => body,
        Ok(_) => return error_response(StatusCode::BAD_REQUEST, "No file uploaded".to_string()),
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };

    // Prediction scans the whole corpus; keep it off the async workers
    let result = tokio::task::spawn_blocking(move || predictor.predict_gpx(body.as_ref())).await;

    match result {
        Ok(Ok(prediction)) => (StatusCode::OK, Json(prediction)).into_response(),
        Ok(Err(e)) => {
            log::info!("Rejected upload: {}", e);
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => {
            log::error!("Prediction task failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Prediction failed".to_string())
        }
    }
}

/// Contents of the form's `file` field, `None` if the form has no such field.
async fn read_file_field(request: Request) -> Result<Option<Bytes>, String> {
    let mut form = Multipart::from_request(request, &())
        .await
        .map_err(|e| e.body_text())?;
    while let Some(field) = form.next_field().await.map_err(|e| e.body_text())? {
        if field.name() == Some("file") {
            return field.bytes().await.map(Some).map_err(|e| e.body_text());
        }
    }
    Ok(None)
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
