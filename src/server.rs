//! HTTP routes: `POST /scan` and `GET /health`.

use crate::clamd::ClamdError;
use crate::config::Config;
use crate::orchestrator::{ScanError, ScanOrchestrator, ScanVerdict};
use crate::scanner::ScannerConnector;
use crate::upload::{validate, UploadRequest, ValidationError};
use axum::extract::multipart::{Field, MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Multipart field carrying the upload.
const FILE_FIELD: &str = "file";

/// State shared by all handlers. Read-only after startup.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: ScanOrchestrator,
}

impl AppState {
    pub fn new(config: Arc<Config>, connector: ScannerConnector) -> Self {
        Self {
            orchestrator: ScanOrchestrator::new(config, connector),
        }
    }

    pub fn from_config(config: Config) -> Self {
        let connector = ScannerConnector::from_config(&config);
        Self::new(Arc::new(config), connector)
    }
}

/// Build the gateway router.
pub fn create_router(state: AppState) -> Router {
    let cors = state.orchestrator.config().server.cors;

    let router = Router::new()
        .route("/scan", post(scan_file))
        .route("/health", get(health_check))
        // Size is enforced while reading the field so oversized uploads get
        // the 400 size message instead of a 413.
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum HealthResponse {
    Healthy { engine_version: String },
    Unhealthy { error: String },
}

/// Error surfaced by the `/scan` route.
#[derive(Debug)]
pub enum ApiError {
    Validation(ValidationError),
    Scan(ScanError),
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::Validation(e)
    }
}

impl From<ScanError> for ApiError {
    fn from(e: ScanError) -> Self {
        ApiError::Scan(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::Validation(e) => (e.status(), e.to_string()),
            ApiError::Scan(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Scan failed: {}", e),
            ),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

async fn scan_file(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ScanVerdict>, ApiError> {
    let upload_config = &state.orchestrator.config().upload;

    let upload = match multipart {
        Ok(multipart) => read_upload(multipart, upload_config.max_size).await?,
        Err(rejection) => {
            debug!(error = %rejection, "Request is not a multipart upload");
            None
        }
    };

    let upload = validate(upload.as_ref(), upload_config)?;

    match state.orchestrator.scan(upload).await {
        Ok(verdict) => Ok(Json(verdict)),
        Err(e) => {
            warn!(filename = %upload.filename, error = %e, "Scan failed");
            Err(e.into())
        }
    }
}

/// Find the `file` part and buffer it, stopping once it exceeds `max_size`.
///
/// Parts without a filename are form fields, not files, and are skipped.
async fn read_upload(
    mut multipart: Multipart,
    max_size: usize,
) -> Result<Option<UploadRequest>, ValidationError> {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return Ok(None),
            Err(e) => {
                debug!(error = %e, "Malformed multipart body");
                return Ok(None);
            }
        };

        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };

        return match read_capped(field, max_size).await {
            Ok((data, len)) => Ok(Some(UploadRequest {
                filename,
                data,
                len,
            })),
            Err(e) => {
                debug!(error = %e, "Upload stream ended unexpectedly");
                Err(ValidationError::MissingFile)
            }
        };
    }
}

/// Read a field chunk by chunk; the returned length is exact up to
/// `max_size` and merely "greater than" beyond it.
async fn read_capped(
    mut field: Field<'_>,
    max_size: usize,
) -> Result<(Vec<u8>, usize), MultipartError> {
    let mut data = Vec::new();
    let mut len = 0usize;
    while let Some(chunk) = field.chunk().await? {
        len += chunk.len();
        if len > max_size {
            return Ok((Vec::new(), len));
        }
        data.extend_from_slice(&chunk);
    }
    Ok((data, len))
}

async fn health_check(State(state): State<AppState>) -> Response {
    match engine_version(state.orchestrator.connector()).await {
        Ok(engine_version) => {
            (StatusCode::OK, Json(HealthResponse::Healthy { engine_version })).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Health check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(HealthResponse::Unhealthy {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn engine_version(connector: &ScannerConnector) -> Result<String, ClamdError> {
    let handle = connector.connect().await?;
    handle.version().await
}
