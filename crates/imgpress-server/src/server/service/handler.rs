//! HTTP front end for single and batch compression.
//!
//! [`CompressService`] owns the shared [`BatchOrchestrator`] (whose compressor
//! runs on the process-wide worker pool) and builds the axum [`Router`]:
//!
//! - `POST /api/compress`: one `image` file in, one compressed file out.
//! - `POST /api/compress-batch`: up to `MAX_BATCH_ITEMS` `images` files in, a
//!   streamed ZIP archive of the successes out.
//! - `GET /api/health`: liveness and endpoint listing.
//!
//! Every route answers `OPTIONS` with an empty 200 and any other method with a
//! JSON 405. Errors are always `{"error": "<message>"}`.

use super::{
    error::ApiError,
    multipart::{FieldLimits, read_upload},
};
use crate::server::{
    config::ServerConfig,
    pool::manager::WorkerPool,
    streaming::coordinator::stream_archive,
    telemetry::{
        increment_item_failures, increment_items_compressed, increment_requests,
        record_items_per_batch,
    },
};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, State},
    http::{
        HeaderValue, Method, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{SecondsFormat, Utc};
use imgpress_core::{BatchOrchestrator, Compressor, Error, TargetFormat};
use serde::Serialize;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub const COMPRESS_PATH: &str = "/api/compress";
pub const COMPRESS_BATCH_PATH: &str = "/api/compress-batch";
pub const HEALTH_PATH: &str = "/api/health";

const IMAGE_FIELD: &str = "image";
const IMAGES_FIELD: &str = "images";
const ARCHIVE_FILE_NAME: &str = "compressed-images.zip";
const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

/// Shared state behind every route. Cheap to clone.
#[derive(Clone)]
pub struct CompressService {
    config: Arc<ServerConfig>,
    orchestrator: BatchOrchestrator<dyn Compressor>,
    worker_pool: Arc<WorkerPool>,
}

impl CompressService {
    /// `compressor` must dispatch through `worker_pool` so that HTTP traffic
    /// shares the pool's concurrency cap.
    pub fn new(
        config: ServerConfig,
        worker_pool: Arc<WorkerPool>,
        compressor: Arc<dyn Compressor>,
    ) -> Self {
        let orchestrator = BatchOrchestrator::new(compressor)
            .with_concurrency(config.batch_concurrency)
            .with_item_timeout(config.item_timeout);

        Self {
            config: Arc::new(config),
            orchestrator,
            worker_pool,
        }
    }

    pub fn orchestrator(&self) -> &BatchOrchestrator<dyn Compressor> {
        &self.orchestrator
    }

    /// Initiates a graceful shutdown of the worker pool. New requests are
    /// refused with 503 from this point on.
    pub async fn shutdown(&self) -> imgpress_core::Result<()> {
        self.worker_pool.shutdown().await
    }

    pub fn router(self) -> Router {
        let cors = cors_layer(self.config.allow_origin.as_deref());

        Router::new()
            .route(
                COMPRESS_PATH,
                post(compress)
                    .options(preflight)
                    .fallback(method_not_allowed),
            )
            .route(
                COMPRESS_BATCH_PATH,
                post(compress_batch)
                    .options(preflight)
                    .fallback(method_not_allowed),
            )
            .route(
                HEALTH_PATH,
                get(health).options(preflight).fallback(method_not_allowed),
            )
            .fallback(not_found)
            .with_state(self)
            .layer(DefaultBodyLimit::disable())
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    fn resolve_format(&self, raw: Option<&str>) -> imgpress_core::Result<TargetFormat> {
        Ok(TargetFormat::parse_optional(raw)?.unwrap_or(self.config.default_format))
    }

    fn single_limits(&self) -> FieldLimits {
        FieldLimits {
            max_files: 1,
            max_file_bytes: self.config.limits.max_upload_bytes,
            max_total_bytes: self.config.limits.max_upload_bytes + FORMAT_OVERHEAD,
        }
    }

    fn batch_limits(&self) -> FieldLimits {
        FieldLimits {
            max_files: self.config.limits.max_batch_items,
            max_file_bytes: self.config.limits.max_upload_bytes,
            max_total_bytes: self.config.limits.max_batch_bytes + FORMAT_OVERHEAD,
        }
    }
}

/// Room for the `format` field on top of the file limits.
const FORMAT_OVERHEAD: usize = 1024;

fn cors_layer(allow_origin: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION]);

    match allow_origin.map(HeaderValue::from_str) {
        Some(Ok(origin)) => cors.allow_origin(origin),
        Some(Err(_)) | None => cors.allow_origin(Any),
    }
}

/// Builds an `attachment` disposition, keeping the file name to printable
/// ASCII without quotes or backslashes.
fn attachment(file_name: &str) -> HeaderValue {
    let safe: String = file_name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();

    HeaderValue::from_str(&format!("attachment; filename=\"{safe}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

#[tracing::instrument(skip_all)]
async fn compress(
    State(service): State<CompressService>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    increment_requests("compress");
    let _guard = service.worker_pool.begin_batch()?;

    let upload = read_upload(&mut multipart, IMAGE_FIELD, service.single_limits()).await?;
    let format = service.resolve_format(upload.format.as_deref())?;
    let item = upload
        .items
        .into_iter()
        .next()
        .ok_or_else(|| Error::invalid_input("No image file provided."))?;

    tracing::info!(file = %item.name, bytes = item.len(), %format, "Compressing image");

    let image = match service.orchestrator.compress_single(item, format).await {
        Ok(image) => {
            increment_items_compressed(1);
            image
        }
        Err(e) => {
            increment_item_failures(1);
            return Err(e.into());
        }
    };

    let content_type = HeaderValue::from_str(&image.mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static(FALLBACK_MIME_TYPE));

    Ok((
        [
            (CONTENT_TYPE, content_type),
            (CONTENT_DISPOSITION, attachment(&image.output_name)),
        ],
        image.bytes,
    )
        .into_response())
}

#[tracing::instrument(skip_all)]
async fn compress_batch(
    State(service): State<CompressService>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    increment_requests("compress-batch");
    let guard = service.worker_pool.begin_batch()?;

    let upload = read_upload(&mut multipart, IMAGES_FIELD, service.batch_limits()).await?;
    let format = service.resolve_format(upload.format.as_deref())?;
    if upload.items.is_empty() {
        return Err(Error::invalid_input("No image files provided.").into());
    }

    // Fail while an error status can still be sent.
    service.orchestrator.compressor().check_ready()?;

    tracing::info!(files = upload.items.len(), %format, "Compressing batch");
    record_items_per_batch(upload.items.len() as f64);

    let body = stream_archive(
        service.orchestrator.clone(),
        upload.items,
        format,
        service.config.stream_buffer_bytes,
        guard,
    );

    Ok((
        [
            (CONTENT_TYPE, HeaderValue::from_static("application/zip")),
            (CONTENT_DISPOSITION, attachment(ARCHIVE_FILE_NAME)),
        ],
        body,
    )
        .into_response())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Endpoints {
    compress: &'static str,
    compress_batch: &'static str,
    health: &'static str,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    message: &'static str,
    timestamp: String,
    endpoints: Endpoints,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        message: "Image Compressor API is running",
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        endpoints: Endpoints {
            compress: COMPRESS_PATH,
            compress_batch: COMPRESS_BATCH_PATH,
            health: HEALTH_PATH,
        },
    })
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

async fn method_not_allowed() -> ApiError {
    ApiError::method_not_allowed()
}

async fn not_found() -> ApiError {
    ApiError::not_found()
}
