//! Image processing: the codec seam and everything sequenced on top of it.
//!
//! | Operation | Where |
//! |---|---|
//! | **Decode / encode** | [`ImageCodec`] trait, [`RustCodec`] on the `image` crate |
//! | **Format table** | [`formats`]: MIME, extension, alpha, lossy, encoder options |
//! | **One-shot transform** | [`pipeline::convert`] / [`pipeline::render`] |
//! | **Size budget** | [`budget::compress_to_budget`]: quality search, then downscale |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for dimension math (unit testable)
//! - **Parameters**: Data structures describing transform requests
//! - **Codec**: [`ImageCodec`] trait + [`RustCodec`]
//! - **Pipeline / Budget**: orchestration that only talks to the trait

pub mod budget;
mod calculations;
pub mod codec;
pub mod formats;
mod params;
pub mod pipeline;
pub mod rust_codec;

pub use budget::{BudgetOutcome, Strategy, compress_to_budget};
pub use calculations::calculate_inside_dimensions;
pub use codec::{CodecError, ImageCodec, SourceInfo};
pub use formats::{FormatError, FormatSpec, OutputFormat, SUPPORTED_FORMATS};
pub use params::{
    Adjustments, CropRect, Fit, MAX_DIMENSION, Quality, ResizeSpec, RotateFlip, Rotation,
    Sharpening, TransformOps,
};
pub use pipeline::{PipelineError, Step, TransformOutput, convert};
pub use rust_codec::RustCodec;
