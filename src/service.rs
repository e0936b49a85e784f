//! Request-level operations: what the HTTP handlers and the CLI call.
//!
//! [`ImageService`] owns the codec, the session store and the upload
//! staging area. Every operation that touches pixels runs inside
//! `tokio::task::spawn_blocking`; session bookkeeping happens on the async
//! side, outside the codec work.
//!
//! | Operation | Core path |
//! |---|---|
//! | [`transform`](ImageService::transform) | resolve → pipeline |
//! | [`compress`](ImageService::compress) | source-derived format → pipeline |
//! | [`transform_to_budget`](ImageService::transform_to_budget) | budget search |
//! | [`transform_batch`](ImageService::transform_batch) | pipeline per item on the rayon pool |
//! | [`create_session_transform`](ImageService::create_session_transform) | pipeline → session create |
//! | [`chain_session_transform`](ImageService::chain_session_transform) | session get → pipeline → session update |
//! | [`download_session`](ImageService::download_session) | session take |

use crate::config::ServiceConfig;
use crate::governor::{MemoryGovernor, MemoryPressureLevel};
use crate::imaging::budget::{BudgetOutcome, compress_to_budget};
use crate::imaging::codec::{CodecError, ImageCodec};
use crate::imaging::formats::{FormatError, OutputFormat, SUPPORTED_FORMATS};
use crate::imaging::pipeline::{PipelineError, Step, TransformOutput, convert, validate_ops};
use crate::imaging::{Quality, TransformOps};
use crate::session::{SessionError, SessionPayload, SessionStore};
use crate::uploads::{ImageBuffer, UploadError, UploadStaging, file_stem};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use rayon::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Most files accepted in one batch request.
pub const MAX_BATCH_ITEMS: usize = 50;

/// Error classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Input,
    TooLarge,
    Codec,
    SessionNotFound,
    Internal,
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    Input(String),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Codec(CodecError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Input(_) | ServiceError::Format(_) => ErrorKind::Input,
            ServiceError::Codec(_) => ErrorKind::Codec,
            ServiceError::Session(_) => ErrorKind::SessionNotFound,
            ServiceError::Upload(UploadError::TooLarge { .. }) => ErrorKind::TooLarge,
            ServiceError::Upload(UploadError::Malformed(_) | UploadError::MissingFile) => {
                ErrorKind::Input
            }
            ServiceError::Upload(UploadError::Io(_)) | ServiceError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<PipelineError> for ServiceError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Input(msg) => ServiceError::Input(msg),
            PipelineError::Codec(e) => ServiceError::Codec(e),
        }
    }
}

impl From<CodecError> for ServiceError {
    fn from(e: CodecError) -> Self {
        PipelineError::from(e).into()
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(e: tokio::task::JoinError) -> Self {
        ServiceError::Internal(format!("codec task failed: {e}"))
    }
}

/// Size accounting for one response.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TransformStats {
    pub original_size: u64,
    pub converted_size: u64,
    /// `converted_size / original_size`; below 1.0 means smaller.
    pub compression_ratio: f64,
    pub elapsed_ms: u64,
}

impl TransformStats {
    fn new(original_size: u64, converted_size: u64, started: Instant) -> Self {
        let compression_ratio = if original_size == 0 {
            0.0
        } else {
            converted_size as f64 / original_size as f64
        };
        Self {
            original_size,
            converted_size,
            compression_ratio,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformReport {
    pub output: TransformOutput,
    /// Suggested download name: source stem plus the output extension.
    pub filename: String,
    pub stats: TransformStats,
}

#[derive(Debug, Clone)]
pub struct BudgetReport {
    pub outcome: BudgetOutcome,
    pub filename: String,
    pub stats: TransformStats,
}

#[derive(Debug, Clone)]
pub struct BatchConverted {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub mime: &'static str,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct BatchEntry {
    /// Position in the request, from 0.
    pub index: usize,
    pub source_name: String,
    /// Converted item, or the error message for a skipped one.
    pub result: Result<BatchConverted, String>,
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub format: OutputFormat,
    pub entries: Vec<BatchEntry>,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

/// Inline rendition of a session's current result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preview {
    /// `data:<mime>;base64,…`
    pub data_url: String,
    pub size: usize,
    pub width: u32,
    pub height: u32,
}

impl Preview {
    fn of(payload: &SessionPayload) -> Self {
        Self {
            data_url: data_url(payload.format.mime(), &payload.bytes),
            size: payload.bytes.len(),
            width: payload.width,
            height: payload.height,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub preview: Preview,
    pub steps: Vec<Step>,
    pub elapsed_ms: u64,
}

/// A consumed session, ready to send.
#[derive(Debug, Clone)]
pub struct Download {
    pub bytes: Bytes,
    pub filename: String,
    pub mime: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub active_sessions: usize,
    pub memory_level: MemoryPressureLevel,
    pub resident_bytes: u64,
    pub uptime_secs: u64,
    pub uploads_in_flight: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatInfo {
    pub name: &'static str,
    pub mime: &'static str,
    pub extension: &'static str,
    pub alpha: bool,
    pub lossy: bool,
}

/// Every accepted format name with what it produces, aliases included.
pub fn formats() -> Vec<FormatInfo> {
    SUPPORTED_FORMATS
        .iter()
        .filter_map(|&name| {
            OutputFormat::parse(name).map(|f| FormatInfo {
                name,
                mime: f.mime(),
                extension: f.extension(),
                alpha: f.supports_alpha(),
                lossy: f.is_lossy(),
            })
        })
        .collect()
}

pub fn data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

fn output_filename(source: &str, extension: &str) -> String {
    format!("{}.{extension}", file_stem(source))
}

/// Session misses are routine (expiry, eviction): debug, never error.
fn session_miss(e: SessionError) -> ServiceError {
    debug!(error = %e, "session lookup missed");
    e.into()
}

pub struct ImageService<C: ImageCodec> {
    codec: Arc<C>,
    sessions: Arc<SessionStore>,
    staging: Arc<UploadStaging>,
    governor: Option<Arc<MemoryGovernor>>,
    config: ServiceConfig,
    started: Instant,
}

impl<C: ImageCodec> ImageService<C> {
    pub fn new(
        codec: C,
        sessions: Arc<SessionStore>,
        staging: Arc<UploadStaging>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            codec: Arc::new(codec),
            sessions,
            staging,
            governor: None,
            config,
            started: Instant::now(),
        }
    }

    /// Report the governor's level and samples from `health()`.
    pub fn with_governor(mut self, governor: Arc<MemoryGovernor>) -> Self {
        self.governor = Some(governor);
        self
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn staging(&self) -> &Arc<UploadStaging> {
        &self.staging
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn quality_or_default(&self, quality: Option<u32>) -> Quality {
        quality.map(Quality::new).unwrap_or(self.config.default_quality)
    }

    /// Run codec work on the blocking pool.
    async fn blocking<T, F>(&self, work: F) -> Result<T, ServiceError>
    where
        F: FnOnce(&C) -> Result<T, ServiceError> + Send + 'static,
        T: Send + 'static,
    {
        let codec = Arc::clone(&self.codec);
        tokio::task::spawn_blocking(move || work(codec.as_ref())).await?
    }

    /// Convert one image to `format`, applying `ops` on the way.
    pub async fn transform(
        &self,
        image: ImageBuffer,
        format: &str,
        quality: Option<u32>,
        ops: TransformOps,
    ) -> Result<TransformReport, ServiceError> {
        let started = Instant::now();
        let target = OutputFormat::from_name(format)?;
        validate_ops(&ops)?;
        let quality = self.quality_or_default(quality);

        let bytes = image.bytes.clone();
        let output = self
            .blocking(move |codec| Ok(convert(codec, &bytes, &ops, Some(target), quality)?))
            .await?;

        let stats = TransformStats::new(image.declared_size, output.bytes.len() as u64, started);
        info!(
            source = %image.filename,
            format = %target,
            original = stats.original_size,
            converted = stats.converted_size,
            elapsed_ms = stats.elapsed_ms,
            "converted image"
        );
        Ok(TransformReport {
            filename: output_filename(&image.filename, output.extension),
            output,
            stats,
        })
    }

    /// Re-encode at a fixed quality without a byte budget. PNG and WebP
    /// sources keep their format; everything else becomes JPEG.
    pub async fn compress(
        &self,
        image: ImageBuffer,
        quality: Option<u32>,
    ) -> Result<TransformReport, ServiceError> {
        let started = Instant::now();
        let quality = quality
            .map(Quality::new)
            .unwrap_or(self.config.compress_quality);

        let bytes = image.bytes.clone();
        let output = self
            .blocking(move |codec| {
                let format = OutputFormat::for_budget(codec.probe(&bytes)?.format);
                Ok(convert(codec, &bytes, &TransformOps::default(), Some(format), quality)?)
            })
            .await?;

        let stats = TransformStats::new(image.declared_size, output.bytes.len() as u64, started);
        info!(
            source = %image.filename,
            quality = quality.value(),
            original = stats.original_size,
            converted = stats.converted_size,
            "compressed image"
        );
        Ok(TransformReport {
            filename: output_filename(&image.filename, output.extension),
            output,
            stats,
        })
    }

    /// Compress to at most `budget` bytes, best effort.
    pub async fn transform_to_budget(
        &self,
        image: ImageBuffer,
        budget: u64,
    ) -> Result<BudgetReport, ServiceError> {
        let started = Instant::now();
        if budget == 0 {
            return Err(ServiceError::Input("target size must be greater than zero".into()));
        }

        let bytes = image.bytes.clone();
        let outcome = self
            .blocking(move |codec| {
                let format = OutputFormat::for_budget(codec.probe(&bytes)?.format);
                Ok(compress_to_budget(codec, &bytes, format, budget)?)
            })
            .await?;

        if !outcome.met_budget {
            warn!(
                source = %image.filename,
                budget,
                smallest = outcome.bytes.len(),
                "budget unreachable; returning smallest result"
            );
        }
        let stats = TransformStats::new(image.declared_size, outcome.bytes.len() as u64, started);
        info!(
            source = %image.filename,
            budget,
            size = stats.converted_size,
            quality = outcome.quality,
            attempts = outcome.attempts,
            "compressed to budget"
        );
        Ok(BudgetReport {
            filename: output_filename(&image.filename, outcome.format.extension()),
            outcome,
            stats,
        })
    }

    /// Convert many images to one format. Items that fail are recorded and
    /// skipped; an unsupported target fails the whole request up front.
    pub async fn transform_batch(
        &self,
        images: Vec<ImageBuffer>,
        format: &str,
        quality: Option<u32>,
    ) -> Result<BatchReport, ServiceError> {
        let started = Instant::now();
        let target = OutputFormat::from_name(format)?;
        if images.is_empty() {
            return Err(ServiceError::Input("no images uploaded".into()));
        }
        if images.len() > MAX_BATCH_ITEMS {
            return Err(ServiceError::Input(format!(
                "at most {MAX_BATCH_ITEMS} images per batch, got {}",
                images.len()
            )));
        }
        let quality = self.quality_or_default(quality);

        let entries = self
            .blocking(move |codec| {
                let ops = TransformOps::default();
                Ok(images
                    .into_par_iter()
                    .enumerate()
                    .map(|(index, image)| {
                        let result = convert(codec, &image.bytes, &ops, Some(target), quality)
                            .map(|out| BatchConverted {
                                filename: format!(
                                    "{}_{}.{}",
                                    image.stem(),
                                    index + 1,
                                    out.extension
                                ),
                                mime: out.mime,
                                width: out.width,
                                height: out.height,
                                bytes: out.bytes,
                            })
                            .map_err(|e| {
                                warn!(index, source = %image.filename, error = %e, "batch item failed");
                                e.to_string()
                            });
                        BatchEntry {
                            index,
                            source_name: image.filename,
                            result,
                        }
                    })
                    .collect::<Vec<_>>())
            })
            .await?;

        let succeeded = entries.iter().filter(|e| e.result.is_ok()).count();
        let failed = entries.len() - succeeded;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(format = %target, succeeded, failed, elapsed_ms, "batch converted");
        Ok(BatchReport {
            format: target,
            entries,
            succeeded,
            failed,
            elapsed_ms,
        })
    }

    /// Start an edit session with a first transform. The source format is
    /// kept (PNG when it can't be written).
    pub async fn create_session_transform(
        &self,
        image: ImageBuffer,
        ops: TransformOps,
        quality: Option<u32>,
    ) -> Result<SessionReport, ServiceError> {
        let started = Instant::now();
        validate_ops(&ops)?;
        let quality = self.quality_or_default(quality);

        let bytes = image.bytes.clone();
        let output = self
            .blocking(move |codec| Ok(convert(codec, &bytes, &ops, None, quality)?))
            .await?;

        let payload = SessionPayload {
            bytes: Bytes::from(output.bytes),
            format: output.format,
            original_filename: image.filename,
            width: output.width,
            height: output.height,
        };
        let preview = Preview::of(&payload);
        let session_id = self.sessions.create(payload);
        debug!(session = %session_id, active = self.sessions.len(), "session created");

        Ok(SessionReport {
            session_id,
            preview,
            steps: output.steps,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Apply more operations to a session's current result and store the
    /// new version under the same id.
    pub async fn chain_session_transform(
        &self,
        session_id: &str,
        ops: TransformOps,
    ) -> Result<SessionReport, ServiceError> {
        let started = Instant::now();
        validate_ops(&ops)?;
        let current = self.sessions.get(session_id).map_err(session_miss)?;
        let format = current.payload.format;
        let quality = self.config.default_quality;

        let bytes = current.payload.bytes.clone();
        let output = self
            .blocking(move |codec| Ok(convert(codec, &bytes, &ops, Some(format), quality)?))
            .await?;

        let payload = SessionPayload {
            bytes: Bytes::from(output.bytes),
            format,
            original_filename: current.payload.original_filename,
            width: output.width,
            height: output.height,
        };
        let preview = Preview::of(&payload);
        self.sessions
            .update(session_id, payload)
            .map_err(session_miss)?;
        debug!(session = %session_id, "session updated");

        Ok(SessionReport {
            session_id: session_id.to_string(),
            preview,
            steps: output.steps,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Hand out a session's result and end the session.
    pub fn download_session(&self, session_id: &str) -> Result<Download, ServiceError> {
        let session = self.sessions.take(session_id).map_err(session_miss)?;
        let payload = session.payload;
        debug!(session = %session_id, size = payload.bytes.len(), "session downloaded");
        Ok(Download {
            filename: output_filename(&payload.original_filename, payload.format.extension()),
            mime: payload.format.mime(),
            bytes: payload.bytes,
        })
    }

    pub fn health(&self) -> Health {
        let (memory_level, resident_bytes) = match &self.governor {
            Some(g) => (g.level(), g.resident_bytes()),
            None => (MemoryPressureLevel::Normal, 0),
        };
        Health {
            status: "ok",
            active_sessions: self.sessions.len(),
            memory_level,
            resident_bytes,
            uptime_secs: self.started.elapsed().as_secs(),
            uploads_in_flight: self.staging.in_flight(),
        }
    }

    pub fn formats(&self) -> Vec<FormatInfo> {
        formats()
    }
}
