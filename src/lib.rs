//! # Pixshift
//!
//! Image conversion, compression and multi-step edit sessions, served over
//! HTTP or run one-shot from the command line. Callers upload an image, pick
//! a target format and a handful of operations (resize, rotate, flip, crop,
//! tone), and get back encoded bytes plus statistics about what changed.
//!
//! # Architecture: Codec Seam, Service, Transport
//!
//! ```text
//! HTTP (axum)  ─┐
//!               ├─→  ImageService  ─→  pipeline / budget  ─→  ImageCodec
//! CLI (clap)   ─┘         │                                   (RustCodec)
//!                         ├─→  SessionStore   (TTL + capacity, swept)
//!                         ├─→  UploadStaging  (temp files, purged)
//!                         └─→  MemoryGovernor (RSS sampling, eviction)
//! ```
//!
//! Every layer above [`imaging::ImageCodec`] only sequences codec primitives,
//! so the orchestration (format resolution, sharpening after downscale, the
//! size-budget search, session chaining) is unit tested against a
//! deterministic in-memory codec without encoding a single real image.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`imaging`] | Codec trait, format table, transform pipeline, size-budget search |
//! | [`service`] | Transport-agnostic operations: transform, compress, batch, sessions, health |
//! | [`server`] | axum router, multipart intake, error → status mapping, graceful shutdown |
//! | [`session`] | In-memory session store with TTL and capacity eviction |
//! | [`uploads`] | Upload buffers and on-disk staging of multipart bodies |
//! | [`governor`] | Resident-memory sampling and pressure-driven reclamation |
//! | [`tasks`] | Cancellable periodic background tasks |
//! | [`clock`] | Injectable time source for expiry |
//! | [`config`] | `pixshift.toml` loading, stock defaults, merging, validation |
//! | [`output`] | CLI output formatting for the one-shot commands |
//!
//! # Design Decisions
//!
//! ## Blocking Work Off the Runtime
//!
//! Decoding and encoding are CPU-bound. The service runs each transform on
//! tokio's blocking pool, and batches fan out over rayon from inside that
//! blocking task, so request handlers never stall the async workers.
//!
//! ## Sessions Hold Bytes, Not Pixels
//!
//! A session stores the last encoded result, not a decoded bitmap. Chaining a
//! step decodes it again. That costs a decode per step but keeps each session
//! at its compressed size, which is what the memory governor budgets against.
//!
//! ## Pure-Rust Codecs
//!
//! [`imaging::RustCodec`] uses the `image` crate only. No system libraries,
//! no ImageMagick. The trade-offs (lossless-only WebP, AVIF write-only) are
//! listed on the codec itself.

pub mod clock;
pub mod config;
pub mod governor;
pub mod imaging;
pub mod output;
pub mod server;
pub mod service;
pub mod session;
pub mod tasks;
pub mod uploads;

#[cfg(test)]
pub(crate) mod test_helpers;
