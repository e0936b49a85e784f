//! Upload staging: multipart file parts are streamed to disk before the
//! core sees them.
//!
//! Each part becomes a [`StagedWriter`] backed by a file in the staging
//! directory. Finishing the writer reads the file back into an
//! [`ImageBuffer`] and deletes it; if the request dies halfway, the
//! [`TempArtifact`] guard deletes it on drop. Under memory pressure the
//! governor calls [`UploadStaging::purge_all`] to remove whatever is left.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use walkdir::WalkDir;

const ARTIFACT_EXTENSION: &str = "upload";

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Upload exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },
    #[error("Malformed upload: {0}")]
    Malformed(String),
    #[error("No image file in request")]
    MissingFile,
}

/// An uploaded image handed to the core.
#[derive(Debug, Clone)]
pub struct ImageBuffer {
    pub bytes: Bytes,
    /// Size as received on the wire.
    pub declared_size: u64,
    /// Content type the client claimed, if any. Never trusted for decoding.
    pub declared_mime: Option<String>,
    pub filename: String,
}

impl ImageBuffer {
    pub fn new(bytes: impl Into<Bytes>, filename: impl Into<String>) -> Self {
        let bytes = bytes.into();
        Self {
            declared_size: bytes.len() as u64,
            bytes,
            declared_mime: None,
            filename: filename.into(),
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.declared_mime = Some(mime.into());
        self
    }

    /// Filename without its extension, for naming derived outputs.
    pub fn stem(&self) -> &str {
        file_stem(&self.filename)
    }
}

/// Stem of an uploaded filename, or `image` when there is nothing usable.
pub fn file_stem(filename: &str) -> &str {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("image")
}

/// A staged file that is deleted when the guard drops.
#[derive(Debug)]
pub struct TempArtifact {
    path: PathBuf,
}

impl TempArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            // Already purged by the governor.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(path = %self.path.display(), error = %e, "failed to remove staged upload"),
        }
    }
}

/// Outcome of removing every staged artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub removed: usize,
    pub failed: usize,
}

pub struct UploadStaging {
    dir: PathBuf,
    max_bytes: u64,
    in_flight: AtomicUsize,
}

impl UploadStaging {
    /// Use (and create) `dir` as the staging directory, with no size cap.
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        Self::with_limit(dir, u64::MAX)
    }

    pub fn with_limit(dir: impl Into<PathBuf>, max_bytes: u64) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_bytes,
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn default_dir() -> PathBuf {
        std::env::temp_dir().join("pixshift-uploads")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Uploads currently being written.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Open a new staged file for one upload part.
    pub async fn create(
        &self,
        filename: impl Into<String>,
        declared_mime: Option<String>,
    ) -> Result<StagedWriter<'_>, UploadError> {
        let path = self
            .dir
            .join(format!("{}.{ARTIFACT_EXTENSION}", uuid::Uuid::new_v4().simple()));
        let file = tokio::fs::File::create(&path).await?;
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        Ok(StagedWriter {
            staging: self,
            file,
            artifact: TempArtifact { path },
            written: 0,
            filename: filename.into(),
            declared_mime,
        })
    }

    /// Stage a complete in-memory body (CLI and tests).
    pub async fn stage_bytes(
        &self,
        filename: impl Into<String>,
        bytes: &[u8],
    ) -> Result<ImageBuffer, UploadError> {
        let mut writer = self.create(filename, None).await?;
        writer.write_chunk(bytes).await?;
        writer.finish().await
    }

    /// Delete every staged artifact. Individual failures are counted and
    /// logged; the purge always visits every file.
    pub fn purge_all(&self) -> PurgeReport {
        let mut report = PurgeReport::default();
        for entry in WalkDir::new(&self.dir).min_depth(1).into_iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "unreadable entry in staging directory");
                    report.failed += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "failed to purge staged upload");
                    report.failed += 1;
                }
            }
        }
        report
    }
}

/// Streams one upload part to its staged file.
pub struct StagedWriter<'a> {
    staging: &'a UploadStaging,
    // Declared before the guard so the handle closes before the file is removed.
    file: tokio::fs::File,
    artifact: TempArtifact,
    written: u64,
    filename: String,
    declared_mime: Option<String>,
}

impl StagedWriter<'_> {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), UploadError> {
        self.written += chunk.len() as u64;
        if self.written > self.staging.max_bytes {
            return Err(UploadError::TooLarge {
                limit: self.staging.max_bytes,
            });
        }
        self.file.write_all(chunk).await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        self.artifact.path()
    }

    /// Read the staged file back and delete it.
    pub async fn finish(mut self) -> Result<ImageBuffer, UploadError> {
        self.file.flush().await?;
        let bytes = tokio::fs::read(self.artifact.path()).await?;
        if bytes.is_empty() {
            return Err(UploadError::MissingFile);
        }
        Ok(ImageBuffer {
            declared_size: self.written,
            bytes: Bytes::from(bytes),
            declared_mime: self.declared_mime.take(),
            filename: std::mem::take(&mut self.filename),
        })
    }
}

impl Drop for StagedWriter<'_> {
    fn drop(&mut self) {
        self.staging.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staging() -> (UploadStaging, tempfile::TempDir) {
        let tmp = tempfile::TempDir::new().unwrap();
        let staging = UploadStaging::with_limit(tmp.path().join("staged"), 1024).unwrap();
        (staging, tmp)
    }

    fn staged_files(staging: &UploadStaging) -> usize {
        std::fs::read_dir(staging.dir()).unwrap().count()
    }

    #[tokio::test]
    async fn finish_returns_bytes_and_removes_file() {
        let (staging, _tmp) = staging();
        let mut writer = staging
            .create("photo.png", Some("image/png".into()))
            .await
            .unwrap();
        writer.write_chunk(b"hello ").await.unwrap();
        writer.write_chunk(b"world").await.unwrap();
        assert_eq!(staged_files(&staging), 1);
        assert_eq!(staging.in_flight(), 1);

        let buffer = writer.finish().await.unwrap();

        assert_eq!(&buffer.bytes[..], b"hello world");
        assert_eq!(buffer.declared_size, 11);
        assert_eq!(buffer.declared_mime.as_deref(), Some("image/png"));
        assert_eq!(buffer.filename, "photo.png");
        assert_eq!(staged_files(&staging), 0);
        assert_eq!(staging.in_flight(), 0);
    }

    #[tokio::test]
    async fn abandoned_writer_cleans_up() {
        let (staging, _tmp) = staging();
        let mut writer = staging.create("a.jpg", None).await.unwrap();
        writer.write_chunk(b"partial").await.unwrap();
        drop(writer);
        assert_eq!(staged_files(&staging), 0);
    }

    #[tokio::test]
    async fn oversize_upload_is_rejected() {
        let (staging, _tmp) = staging();
        let mut writer = staging.create("big.jpg", None).await.unwrap();
        let chunk = vec![0u8; 600];
        writer.write_chunk(&chunk).await.unwrap();
        let err = writer.write_chunk(&chunk).await.unwrap_err();
        assert!(matches!(err, UploadError::TooLarge { limit: 1024 }));
    }

    #[tokio::test]
    async fn empty_upload_is_missing_file() {
        let (staging, _tmp) = staging();
        let writer = staging.create("empty.png", None).await.unwrap();
        assert!(matches!(writer.finish().await, Err(UploadError::MissingFile)));
    }

    #[tokio::test]
    async fn purge_removes_every_staged_artifact() {
        let (staging, _tmp) = staging();
        let mut a = staging.create("a.png", None).await.unwrap();
        let mut b = staging.create("b.png", None).await.unwrap();
        a.write_chunk(b"a").await.unwrap();
        b.write_chunk(b"b").await.unwrap();

        let report = staging.purge_all();

        assert_eq!(report, PurgeReport { removed: 2, failed: 0 });
        assert_eq!(staged_files(&staging), 0);
        // The writers' guards tolerate the files being gone already.
        drop(a);
        drop(b);
    }

    #[test]
    fn stem_falls_back_for_empty_names() {
        assert_eq!(ImageBuffer::new(vec![1], "holiday.jpeg").stem(), "holiday");
        assert_eq!(ImageBuffer::new(vec![1], "").stem(), "image");
    }
}
