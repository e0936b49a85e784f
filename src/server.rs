//! HTTP surface over [`ImageService`].
//!
//! | Method | Path | Body | Response |
//! |---|---|---|---|
//! | POST | `/api/image/convert` | multipart: file, `format`, `quality`, `ops` (JSON) | converted bytes |
//! | POST | `/api/image/convert-batch` | multipart: files, `format`, `quality` | JSON with data URLs |
//! | POST | `/api/image/compress` | multipart: file, `quality` or `target_size_kb` | compressed bytes |
//! | POST | `/api/image/sessions` | multipart: file, `ops` (JSON), `quality` | JSON session + preview |
//! | POST | `/api/image/sessions/:id/ops` | JSON `TransformOps` | JSON preview |
//! | GET | `/api/image/sessions/:id/download` | – | result bytes (ends the session) |
//! | GET | `/health` | – | JSON health |
//! | GET | `/formats` | – | JSON format list |
//!
//! Errors are JSON `{ "error": "...", "kind": "..." }` with status 400
//! (input), 404 (session), 413 (too large), 422 (codec) or 500.
//!
//! Multipart file fields are streamed into [`UploadStaging`] chunk by chunk;
//! the per-file limit is enforced while writing.

use crate::clock::SystemClock;
use crate::config::{PixshiftConfig, ServerConfig};
use crate::governor::{MemoryGovernor, ProcessSampler};
use crate::imaging::codec::ImageCodec;
use crate::imaging::{RustCodec, TransformOps};
use crate::service::{
    BatchReport, ErrorKind, ImageService, MAX_BATCH_ITEMS, ServiceError, data_url,
};
use crate::session::SessionStore;
use crate::uploads::{ImageBuffer, UploadError, UploadStaging};
use axum::Router;
use axum::body::Bytes;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, error, info, warn};

/// Shared handler state.
type AppState<C> = Arc<ImageService<C>>;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: ErrorKind,
}

/// A [`ServiceError`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(ServiceError);

impl<E: Into<ServiceError>> From<E> for ApiError {
    fn from(e: E) -> Self {
        ApiError(e.into())
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Input => StatusCode::BAD_REQUEST,
        ErrorKind::SessionNotFound => StatusCode::NOT_FOUND,
        ErrorKind::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::Codec => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        match kind {
            ErrorKind::Internal => error!(error = %self.0, "request failed"),
            ErrorKind::Codec => warn!(error = %self.0, "image could not be processed"),
            _ => debug!(error = %self.0, ?kind, "request rejected"),
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            kind,
        };
        (status_for(kind), Json(body)).into_response()
    }
}

// =========================================================================
// Multipart handling
// =========================================================================

/// Files and text fields of one multipart request.
#[derive(Debug, Default)]
struct UploadForm {
    files: Vec<ImageBuffer>,
    fields: HashMap<String, String>,
}

impl UploadForm {
    fn single_file(&mut self) -> Result<ImageBuffer, ServiceError> {
        if self.files.is_empty() {
            return Err(UploadError::MissingFile.into());
        }
        Ok(self.files.swap_remove(0))
    }

    fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn number(&self, name: &str) -> Result<Option<u64>, ServiceError> {
        self.text(name)
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|_| ServiceError::Input(format!("{name} must be a whole number")))
            })
            .transpose()
    }

    fn quality(&self) -> Result<Option<u32>, ServiceError> {
        Ok(self.number("quality")?.map(|q| q.min(100) as u32))
    }

    fn ops(&self) -> Result<TransformOps, ServiceError> {
        match self.text("ops") {
            Some(json) => parse_ops(json.as_bytes()),
            None => Ok(TransformOps::default()),
        }
    }
}

fn parse_ops(json: &[u8]) -> Result<TransformOps, ServiceError> {
    serde_json::from_slice(json).map_err(|e| ServiceError::Input(format!("invalid ops: {e}")))
}

fn multipart_error(e: MultipartError, limit: u64) -> ServiceError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        UploadError::TooLarge { limit }.into()
    } else {
        UploadError::Malformed(e.body_text()).into()
    }
}

/// Stream every file field to staging and collect the text fields.
async fn read_form(
    staging: &UploadStaging,
    mut multipart: Multipart,
) -> Result<UploadForm, ServiceError> {
    let limit = staging.max_bytes();
    let mut form = UploadForm::default();
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, limit))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(filename) => {
                if form.files.len() >= MAX_BATCH_ITEMS {
                    return Err(ServiceError::Input(format!(
                        "at most {MAX_BATCH_ITEMS} files per request"
                    )));
                }
                let mime = field.content_type().map(str::to_string);
                let mut writer = staging.create(filename, mime).await?;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| multipart_error(e, limit))?
                {
                    writer.write_chunk(&chunk).await?;
                }
                form.files.push(writer.finish().await?);
            }
            None => {
                let value = field.text().await.map_err(|e| multipart_error(e, limit))?;
                form.fields.insert(name, value);
            }
        }
    }
    Ok(form)
}

// =========================================================================
// Responses
// =========================================================================

fn header(headers: &mut HeaderMap, name: &'static str, value: impl ToString) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Binary body served as a download.
fn attachment(bytes: impl Into<Bytes>, mime: &str, filename: &str, mut headers: HeaderMap) -> Response {
    if let Ok(value) = HeaderValue::from_str(mime) {
        headers.insert(CONTENT_TYPE, value);
    }
    let disposition = format!("attachment; filename=\"{}\"", filename.replace('"', ""));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(CONTENT_DISPOSITION, value);
    }
    (headers, bytes.into()).into_response()
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum BatchItemBody {
    Converted {
        index: usize,
        source: String,
        filename: String,
        size: usize,
        width: u32,
        height: u32,
        data_url: String,
    },
    Failed {
        index: usize,
        source: String,
        error: String,
    },
}

#[derive(Debug, Serialize)]
struct BatchBody {
    format: String,
    succeeded: usize,
    failed: usize,
    elapsed_ms: u64,
    items: Vec<BatchItemBody>,
}

impl From<BatchReport> for BatchBody {
    fn from(report: BatchReport) -> Self {
        let items = report
            .entries
            .into_iter()
            .map(|entry| match entry.result {
                Ok(item) => BatchItemBody::Converted {
                    index: entry.index,
                    source: entry.source_name,
                    size: item.bytes.len(),
                    data_url: data_url(item.mime, &item.bytes),
                    filename: item.filename,
                    width: item.width,
                    height: item.height,
                },
                Err(error) => BatchItemBody::Failed {
                    index: entry.index,
                    source: entry.source_name,
                    error,
                },
            })
            .collect();
        Self {
            format: report.format.to_string(),
            succeeded: report.succeeded,
            failed: report.failed,
            elapsed_ms: report.elapsed_ms,
            items,
        }
    }
}

// =========================================================================
// Handlers
// =========================================================================

const DEFAULT_FORMAT: &str = "png";

async fn convert<C: ImageCodec>(
    State(service): State<AppState<C>>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut form = read_form(service.staging(), multipart).await?;
    let image = form.single_file()?;
    let format = form.text("format").unwrap_or(DEFAULT_FORMAT).to_string();
    let report = service
        .transform(image, &format, form.quality()?, form.ops()?)
        .await?;

    let mut headers = HeaderMap::new();
    header(&mut headers, "x-original-size", report.stats.original_size);
    header(&mut headers, "x-converted-size", report.stats.converted_size);
    header(&mut headers, "x-compression-ratio", format!("{:.4}", report.stats.compression_ratio));
    header(&mut headers, "x-elapsed-ms", report.stats.elapsed_ms);
    header(&mut headers, "x-output-dimensions", format!("{}x{}", report.output.width, report.output.height));
    Ok(attachment(report.output.bytes, report.output.mime, &report.filename, headers))
}

async fn convert_batch<C: ImageCodec>(
    State(service): State<AppState<C>>,
    multipart: Multipart,
) -> Result<Json<BatchBody>, ApiError> {
    let form = read_form(service.staging(), multipart).await?;
    let format = form.text("format").unwrap_or(DEFAULT_FORMAT).to_string();
    let quality = form.quality()?;
    let report = service.transform_batch(form.files, &format, quality).await?;
    Ok(Json(report.into()))
}

async fn compress<C: ImageCodec>(
    State(service): State<AppState<C>>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut form = read_form(service.staging(), multipart).await?;
    let image = form.single_file()?;
    let mut headers = HeaderMap::new();

    match form.number("target_size_kb")? {
        Some(kb) => {
            let report = service
                .transform_to_budget(image, kb.saturating_mul(1024))
                .await?;
            let outcome = &report.outcome;
            header(&mut headers, "x-original-size", report.stats.original_size);
            header(&mut headers, "x-compressed-size", report.stats.converted_size);
            header(&mut headers, "x-quality", outcome.quality);
            header(&mut headers, "x-budget-met", outcome.met_budget);
            header(&mut headers, "x-elapsed-ms", report.stats.elapsed_ms);
            let mime = outcome.format.mime();
            Ok(attachment(report.outcome.bytes, mime, &report.filename, headers))
        }
        None => {
            let report = service.compress(image, form.quality()?).await?;
            header(&mut headers, "x-original-size", report.stats.original_size);
            header(&mut headers, "x-compressed-size", report.stats.converted_size);
            header(&mut headers, "x-elapsed-ms", report.stats.elapsed_ms);
            Ok(attachment(report.output.bytes, report.output.mime, &report.filename, headers))
        }
    }
}

async fn create_session<C: ImageCodec>(
    State(service): State<AppState<C>>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut form = read_form(service.staging(), multipart).await?;
    let image = form.single_file()?;
    let report = service
        .create_session_transform(image, form.ops()?, form.quality()?)
        .await?;
    Ok((StatusCode::CREATED, Json(report)).into_response())
}

async fn chain_session<C: ImageCodec>(
    State(service): State<AppState<C>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let ops = parse_ops(&body)?;
    let report = service.chain_session_transform(&id, ops).await?;
    Ok(Json(report).into_response())
}

async fn download_session<C: ImageCodec>(
    State(service): State<AppState<C>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let download = service.download_session(&id)?;
    Ok(attachment(download.bytes, download.mime, &download.filename, HeaderMap::new()))
}

async fn health<C: ImageCodec>(State(service): State<AppState<C>>) -> Response {
    Json(service.health()).into_response()
}

async fn formats<C: ImageCodec>(State(service): State<AppState<C>>) -> Response {
    Json(service.formats()).into_response()
}

// =========================================================================
// Assembly
// =========================================================================

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}

/// Routes, body limit and CORS for one service.
pub fn router<C: ImageCodec>(service: AppState<C>, config: &ServerConfig) -> Router {
    // A batch may carry many files; each one is capped separately while staging.
    let body_limit = config
        .max_upload_bytes
        .saturating_mul(MAX_BATCH_ITEMS as u64);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    Router::new()
        .route("/api/image/convert", post(convert::<C>))
        .route("/api/image/convert-batch", post(convert_batch::<C>))
        .route("/api/image/compress", post(compress::<C>))
        .route("/api/image/sessions", post(create_session::<C>))
        .route("/api/image/sessions/:id/ops", post(chain_session::<C>))
        .route("/api/image/sessions/:id/download", get(download_session::<C>))
        .route("/health", get(health::<C>))
        .route("/formats", get(formats::<C>))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors_layer(&config.cors_origins))
        .with_state(service)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// Wire the production service together and serve until Ctrl-C.
pub async fn run(config: &PixshiftConfig) -> std::io::Result<()> {
    let staging = Arc::new(UploadStaging::with_limit(
        config.uploads.staging_dir(),
        config.server.max_upload_bytes,
    )?);
    let leftovers = staging.purge_all();
    if leftovers.removed > 0 {
        info!(removed = leftovers.removed, "removed staged uploads from a previous run");
    }

    let sessions = Arc::new(SessionStore::new(
        config.service().session_ttl,
        config.sessions.max_sessions,
        Arc::new(SystemClock),
    ));
    let governor = Arc::new(MemoryGovernor::new(
        Arc::new(ProcessSampler),
        config.thresholds(),
        sessions.clone(),
        staging.clone(),
    ));
    let service = Arc::new(
        ImageService::new(
            RustCodec::new(),
            sessions.clone(),
            staging.clone(),
            config.service(),
        )
        .with_governor(governor.clone()),
    );

    let sweeper = sessions.clone().spawn_sweeper(config.sessions.sweep_interval());
    let sampler = governor.spawn(config.memory.sample_interval());

    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        addr = %listener.local_addr()?,
        staging = %staging.dir().display(),
        "pixshift listening"
    );

    let result = axum::serve(listener, router(service, &config.server))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sweeper.stop().await;
    sampler.stop().await;
    staging.purge_all();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionError;

    #[test]
    fn error_kinds_map_to_statuses() {
        assert_eq!(status_for(ErrorKind::Input), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::SessionNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::TooLarge), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(status_for(ErrorKind::Codec), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(ErrorKind::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn session_errors_become_404() {
        let response = ApiError::from(SessionError::NotFound("abc".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn oversize_upload_becomes_413() {
        let response = ApiError::from(UploadError::TooLarge { limit: 10 }).into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn ops_json_uses_defaults_for_missing_keys() {
        let ops = parse_ops(br#"{"rotate_flip": {"rotate": 90}}"#).unwrap();
        assert!(ops.auto_orient);
        assert_eq!(ops.rotate_flip.unwrap().rotate.degrees(), 90);
    }

    #[test]
    fn malformed_ops_are_input_errors() {
        let err = parse_ops(br#"{"rotate_flip": {"rotate": 45}}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
        let err = parse_ops(b"{\"colour\": true}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }

    #[test]
    fn form_numbers_are_validated() {
        let mut form = UploadForm::default();
        form.fields.insert("quality".into(), " 75 ".into());
        assert_eq!(form.quality().unwrap(), Some(75));
        form.fields.insert("quality".into(), "high".into());
        assert!(form.quality().is_err());
        form.fields.insert("quality".into(), "".into());
        assert_eq!(form.quality().unwrap(), None);
    }

    #[test]
    fn empty_form_has_no_file() {
        let mut form = UploadForm::default();
        let err = form.single_file().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }
}
