//! Image codec capability trait and shared types.
//!
//! The [`ImageCodec`] trait is the only place pixels are touched. The rest of
//! the crate sequences its primitives: [`pipeline`](super::pipeline) for
//! one-shot transforms and [`budget`](super::budget) for the size search.
//!
//! Primitives borrow the image and return a new one. The budget search
//! re-scales from the same decoded original several times, so consuming
//! the input would force a clone per candidate anyway.
//!
//! The production implementation is
//! [`RustCodec`](super::rust_codec::RustCodec), built on the `image` crate.

use super::formats::{ColorSpace, FormatSpec, OutputFormat, SourceHints};
use super::params::{Adjustments, CropRect, Rotation, Sharpening};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unrecognized image data")]
    UnknownFormat,
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Encode failed: {0}")]
    Encode(String),
    /// Requested geometry does not fit the image (caller error, not a codec failure).
    #[error("Invalid geometry: {0}")]
    Geometry(String),
}

/// What a decoder reports about a source before any processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInfo {
    /// Stored width, before orientation is applied.
    pub width: u32,
    /// Stored height, before orientation is applied.
    pub height: u32,
    pub has_alpha: bool,
    pub color_space: ColorSpace,
    /// EXIF orientation tag (1–8; 1 is upright).
    pub orientation: u8,
    /// Detected container format, when it is one we can also write.
    pub format: Option<OutputFormat>,
}

impl SourceInfo {
    /// Dimensions as displayed, after applying the orientation tag.
    pub fn oriented_dimensions(&self) -> (u32, u32) {
        if orientation_swaps_axes(self.orientation) {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }

    pub fn hints(&self) -> SourceHints {
        let (width, height) = self.oriented_dimensions();
        SourceHints {
            has_alpha: self.has_alpha,
            color_space: self.color_space,
            width,
            height,
        }
    }
}

/// EXIF orientations 5–8 involve a quarter turn.
pub fn orientation_swaps_axes(orientation: u8) -> bool {
    (5..=8).contains(&orientation)
}

/// Trait for image codecs.
///
/// Every codec must implement probe/decode/encode plus the geometric and
/// tonal primitives, so orchestration code stays codec-agnostic.
pub trait ImageCodec: Send + Sync + 'static {
    /// Decoded in-memory image.
    type Image: Send;

    /// Read header facts without decoding pixels.
    fn probe(&self, bytes: &[u8]) -> Result<SourceInfo, CodecError>;

    /// Decode pixels. Orientation is reported, not applied.
    fn decode(&self, bytes: &[u8]) -> Result<(Self::Image, SourceInfo), CodecError>;

    /// Encode according to a resolved spec.
    fn encode(&self, image: &Self::Image, spec: &FormatSpec) -> Result<Vec<u8>, CodecError>;

    fn dimensions(&self, image: &Self::Image) -> (u32, u32);

    /// Rotate/flip pixels so the EXIF orientation becomes upright.
    fn orient(&self, image: &Self::Image, orientation: u8) -> Self::Image;

    /// Convert to 8-bit sRGB, keeping alpha if present.
    fn to_srgb(&self, image: &Self::Image) -> Self::Image;

    /// Composite over an opaque background, dropping alpha.
    fn flatten(&self, image: &Self::Image, background: [u8; 3]) -> Self::Image;

    fn crop(&self, image: &Self::Image, rect: CropRect) -> Result<Self::Image, CodecError>;

    /// Resample to exact dimensions (Lanczos3).
    fn resize(&self, image: &Self::Image, width: u32, height: u32) -> Self::Image;

    /// Center the image on a transparent canvas of the given size.
    fn pad_to_canvas(&self, image: &Self::Image, width: u32, height: u32) -> Self::Image;

    fn rotate(&self, image: &Self::Image, rotation: Rotation) -> Self::Image;

    fn flip(&self, image: &Self::Image, horizontal: bool) -> Self::Image;

    fn sharpen(&self, image: &Self::Image, sharpening: Sharpening) -> Self::Image;

    fn adjust(&self, image: &Self::Image, adjustments: &Adjustments) -> Self::Image;

    /// Whether the quality setting changes the encoded size for `format`.
    /// The budget search skips its quality bisection when it does not.
    fn quality_sensitive(&self, format: OutputFormat) -> bool {
        format.is_lossy()
    }
}

#[cfg(test)]
pub mod tests {
    //! Deterministic in-memory codec for orchestration tests.
    //!
    //! Mock "encoded" bytes are a one-line text header describing the image,
    //! followed by padding whose length grows with pixel count and quality.
    //! That makes sizes predictable enough to drive the budget search.

    use super::*;
    use crate::imaging::formats::CodecOptions;
    use std::sync::Mutex;

    const MAGIC: &str = "MOCK";

    #[derive(Debug, Clone, PartialEq)]
    pub struct MockImage {
        pub width: u32,
        pub height: u32,
        pub has_alpha: bool,
        pub color_space: ColorSpace,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum RecordedOp {
        Decode,
        Orient(u8),
        ToSrgb,
        Flatten([u8; 3]),
        Crop(CropRect),
        Resize { width: u32, height: u32 },
        Pad { width: u32, height: u32 },
        Rotate(i32),
        Flip { horizontal: bool },
        Sharpen { sigma: f32, threshold: i32 },
        Adjust,
        Encode {
            format: OutputFormat,
            quality: u32,
            width: u32,
            height: u32,
            size: usize,
        },
    }

    /// Mock codec that records operations and fakes pixel work.
    /// Uses Mutex (not RefCell) so it is Sync and works across tasks.
    #[derive(Default)]
    pub struct MockCodec {
        pub operations: Mutex<Vec<RecordedOp>>,
        /// Lossy formats this mock encodes losslessly.
        pub lossless: Vec<OutputFormat>,
    }

    impl MockCodec {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_lossless(format: OutputFormat) -> Self {
            Self {
                lossless: vec![format],
                ..Self::default()
            }
        }

        pub fn get_operations(&self) -> Vec<RecordedOp> {
            self.operations.lock().unwrap().clone()
        }

        pub fn encode_count(&self) -> usize {
            self.get_operations()
                .iter()
                .filter(|op| matches!(op, RecordedOp::Encode { .. }))
                .count()
        }

        pub fn clear(&self) {
            self.operations.lock().unwrap().clear();
        }

        fn record(&self, op: RecordedOp) {
            self.operations.lock().unwrap().push(op);
        }

        /// Header-only source bytes the mock can decode.
        pub fn source(width: u32, height: u32, has_alpha: bool, format: OutputFormat) -> Vec<u8> {
            Self::source_with(width, height, has_alpha, ColorSpace::Srgb, 1, format)
        }

        pub fn source_with(
            width: u32,
            height: u32,
            has_alpha: bool,
            color_space: ColorSpace,
            orientation: u8,
            format: OutputFormat,
        ) -> Vec<u8> {
            format!(
                "{MAGIC};{width};{height};{};{};{orientation};{}\n",
                u8::from(has_alpha),
                color_space.name(),
                format.name()
            )
            .into_bytes()
        }

        /// Deterministic encoded size: lossy formats scale with quality,
        /// lossless ones use a flat byte per pixel.
        pub fn encoded_len(width: u32, height: u32, format: OutputFormat, quality: u32) -> usize {
            let pixels = width as f64 * height as f64;
            let bpp = if format.is_lossy() && quality < 100 {
                0.02 + quality as f64 * 0.005
            } else {
                1.0
            };
            (pixels * bpp).ceil() as usize
        }
    }

    fn parse_header(bytes: &[u8]) -> Result<SourceInfo, CodecError> {
        let line_end = bytes.iter().position(|&b| b == b'\n').unwrap_or(bytes.len());
        let header = std::str::from_utf8(&bytes[..line_end]).map_err(|_| CodecError::UnknownFormat)?;
        let fields: Vec<&str> = header.split(';').collect();
        if fields.len() != 7 || fields[0] != MAGIC {
            return Err(CodecError::UnknownFormat);
        }
        let num = |s: &str| {
            s.parse::<u32>()
                .map_err(|e| CodecError::Decode(format!("bad mock header: {e}")))
        };
        let color_space = match fields[4] {
            "gray" => ColorSpace::Gray,
            "cmyk" => ColorSpace::Cmyk,
            "linear" => ColorSpace::Linear,
            _ => ColorSpace::Srgb,
        };
        Ok(SourceInfo {
            width: num(fields[1])?,
            height: num(fields[2])?,
            has_alpha: fields[3] == "1",
            color_space,
            orientation: num(fields[5])? as u8,
            format: OutputFormat::parse(fields[6]),
        })
    }

    impl ImageCodec for MockCodec {
        type Image = MockImage;

        fn probe(&self, bytes: &[u8]) -> Result<SourceInfo, CodecError> {
            parse_header(bytes)
        }

        fn decode(&self, bytes: &[u8]) -> Result<(MockImage, SourceInfo), CodecError> {
            let info = parse_header(bytes)?;
            self.record(RecordedOp::Decode);
            let image = MockImage {
                width: info.width,
                height: info.height,
                has_alpha: info.has_alpha,
                color_space: info.color_space,
            };
            Ok((image, info))
        }

        fn encode(&self, image: &MockImage, spec: &FormatSpec) -> Result<Vec<u8>, CodecError> {
            let quality = match spec.options {
                CodecOptions::Jpeg { quality, .. }
                | CodecOptions::WebP { quality, .. }
                | CodecOptions::Avif { quality, .. } => quality.value(),
                _ => 100,
            };
            let mut bytes = MockCodec::source_with(
                image.width,
                image.height,
                image.has_alpha && spec.target.supports_alpha(),
                image.color_space,
                1,
                spec.target,
            );
            let sized_at = if self.lossless.contains(&spec.target) { 100 } else { quality };
            let body = MockCodec::encoded_len(image.width, image.height, spec.target, sized_at);
            bytes.resize(bytes.len() + body, 0);
            self.record(RecordedOp::Encode {
                format: spec.target,
                quality,
                width: image.width,
                height: image.height,
                size: bytes.len(),
            });
            Ok(bytes)
        }

        fn dimensions(&self, image: &MockImage) -> (u32, u32) {
            (image.width, image.height)
        }

        fn orient(&self, image: &MockImage, orientation: u8) -> MockImage {
            self.record(RecordedOp::Orient(orientation));
            let mut out = image.clone();
            if orientation_swaps_axes(orientation) {
                std::mem::swap(&mut out.width, &mut out.height);
            }
            out
        }

        fn to_srgb(&self, image: &MockImage) -> MockImage {
            self.record(RecordedOp::ToSrgb);
            MockImage {
                color_space: ColorSpace::Srgb,
                ..image.clone()
            }
        }

        fn flatten(&self, image: &MockImage, background: [u8; 3]) -> MockImage {
            self.record(RecordedOp::Flatten(background));
            MockImage {
                has_alpha: false,
                ..image.clone()
            }
        }

        fn crop(&self, image: &MockImage, rect: CropRect) -> Result<MockImage, CodecError> {
            self.record(RecordedOp::Crop(rect));
            if rect.x + rect.width > image.width || rect.y + rect.height > image.height {
                return Err(CodecError::Geometry("crop outside image".into()));
            }
            Ok(MockImage {
                width: rect.width,
                height: rect.height,
                ..image.clone()
            })
        }

        fn resize(&self, image: &MockImage, width: u32, height: u32) -> MockImage {
            self.record(RecordedOp::Resize { width, height });
            MockImage {
                width,
                height,
                ..image.clone()
            }
        }

        fn pad_to_canvas(&self, image: &MockImage, width: u32, height: u32) -> MockImage {
            self.record(RecordedOp::Pad { width, height });
            MockImage {
                width,
                height,
                has_alpha: true,
                ..image.clone()
            }
        }

        fn rotate(&self, image: &MockImage, rotation: Rotation) -> MockImage {
            self.record(RecordedOp::Rotate(rotation.degrees()));
            let mut out = image.clone();
            if rotation.swaps_axes() {
                std::mem::swap(&mut out.width, &mut out.height);
            }
            out
        }

        fn flip(&self, image: &MockImage, horizontal: bool) -> MockImage {
            self.record(RecordedOp::Flip { horizontal });
            image.clone()
        }

        fn sharpen(&self, image: &MockImage, sharpening: Sharpening) -> MockImage {
            self.record(RecordedOp::Sharpen {
                sigma: sharpening.sigma,
                threshold: sharpening.threshold,
            });
            image.clone()
        }

        fn quality_sensitive(&self, format: OutputFormat) -> bool {
            format.is_lossy() && !self.lossless.contains(&format)
        }

        fn adjust(&self, image: &MockImage, adjustments: &Adjustments) -> MockImage {
            self.record(RecordedOp::Adjust);
            let mut out = image.clone();
            if adjustments.grayscale {
                out.color_space = ColorSpace::Gray;
            }
            out
        }
    }

    #[test]
    fn mock_source_round_trips_through_probe() {
        let codec = MockCodec::new();
        let bytes = MockCodec::source_with(
            40,
            30,
            true,
            ColorSpace::Cmyk,
            6,
            OutputFormat::Jpeg,
        );
        let info = codec.probe(&bytes).unwrap();
        assert_eq!((info.width, info.height), (40, 30));
        assert_eq!(info.oriented_dimensions(), (30, 40));
        assert_eq!(info.color_space, ColorSpace::Cmyk);
        assert_eq!(info.format, Some(OutputFormat::Jpeg));
        assert!(codec.get_operations().is_empty());
    }

    #[test]
    fn mock_rejects_foreign_bytes() {
        let codec = MockCodec::new();
        assert!(matches!(
            codec.decode(b"\x89PNG not really"),
            Err(CodecError::UnknownFormat)
        ));
    }

    #[test]
    fn mock_encoded_size_grows_with_quality() {
        let low = MockCodec::encoded_len(1000, 1000, OutputFormat::Jpeg, 20);
        let high = MockCodec::encoded_len(1000, 1000, OutputFormat::Jpeg, 80);
        assert!(low < high);
        assert_eq!(
            MockCodec::encoded_len(10, 10, OutputFormat::Png, 10),
            MockCodec::encoded_len(10, 10, OutputFormat::Png, 90)
        );
    }

    #[test]
    fn mock_records_resize() {
        let codec = MockCodec::new();
        let (image, _) = codec.decode(&MockCodec::source(800, 600, false, OutputFormat::Png)).unwrap();
        let resized = codec.resize(&image, 400, 300);
        assert_eq!(codec.dimensions(&resized), (400, 300));
        assert_eq!(
            codec.get_operations(),
            vec![
                RecordedOp::Decode,
                RecordedOp::Resize {
                    width: 400,
                    height: 300
                }
            ]
        );
    }
}
