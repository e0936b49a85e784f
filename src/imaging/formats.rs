//! Output format table and resolver.
//!
//! [`resolve`] maps a requested format name, a quality, and a few facts about
//! the source ([`SourceHints`]) to a [`FormatSpec`]: everything the pipeline
//! and the codec need to produce the output. It is a pure function over a
//! fixed table, so single, batch, session and budget paths all agree.
//!
//! | Format | MIME | Ext | Alpha | Gray | Options |
//! |---|---|---|---|---|---|
//! | jpeg (`jpg`,`jpeg`) | image/jpeg | jpg | no | yes | quality, progressive, chroma |
//! | png | image/png | png | yes | yes | best compression, adaptive filter |
//! | webp | image/webp | webp | yes | yes | quality, lossless at 100 |
//! | avif | image/avif | avif | yes | no | quality, speed 6, chroma |
//! | gif | image/gif | gif | yes | yes | – |
//! | tiff (`tiff`,`tif`) | image/tiff | tiff | no | yes | LZW |
//! | bmp | image/bmp | bmp | no | yes | – |
//! | ico | image/x-icon | ico | yes | no | forced 256×256 contain canvas |
//! | svg | image/svg+xml | svg | yes | no | embedded PNG raster |

use super::params::Quality;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Every accepted format name, in the order reported on error.
pub const SUPPORTED_FORMATS: &[&str] = &[
    "jpg", "jpeg", "png", "webp", "avif", "gif", "tiff", "tif", "bmp", "ico", "svg",
];

/// Edge length of the icon canvas.
pub const ICON_SIZE: u32 = 256;

/// Quality above which lossy encoders keep full-resolution chroma.
const FULL_CHROMA_ABOVE: u32 = 90;

/// AVIF encoder speed (0 slowest, 10 fastest).
const AVIF_SPEED: u8 = 6;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("Unsupported format '{requested}'. Supported formats: {}", SUPPORTED_FORMATS.join(", "))]
    Unsupported { requested: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
    WebP,
    Avif,
    Gif,
    Tiff,
    Bmp,
    Ico,
    Svg,
}

impl OutputFormat {
    /// Parse a format name, case-insensitively and ignoring surrounding whitespace.
    pub fn parse(name: &str) -> Option<Self> {
        let format = match name.trim().to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => OutputFormat::Jpeg,
            "png" => OutputFormat::Png,
            "webp" => OutputFormat::WebP,
            "avif" => OutputFormat::Avif,
            "gif" => OutputFormat::Gif,
            "tiff" | "tif" => OutputFormat::Tiff,
            "bmp" => OutputFormat::Bmp,
            "ico" => OutputFormat::Ico,
            "svg" => OutputFormat::Svg,
            _ => return None,
        };
        Some(format)
    }

    /// Like [`parse`](Self::parse), but reports the supported list on failure.
    pub fn from_name(name: &str) -> Result<Self, FormatError> {
        Self::parse(name).ok_or_else(|| FormatError::Unsupported {
            requested: name.trim().to_string(),
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Png => "png",
            OutputFormat::WebP => "webp",
            OutputFormat::Avif => "avif",
            OutputFormat::Gif => "gif",
            OutputFormat::Tiff => "tiff",
            OutputFormat::Bmp => "bmp",
            OutputFormat::Ico => "ico",
            OutputFormat::Svg => "svg",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::WebP => "image/webp",
            OutputFormat::Avif => "image/avif",
            OutputFormat::Gif => "image/gif",
            OutputFormat::Tiff => "image/tiff",
            OutputFormat::Bmp => "image/bmp",
            OutputFormat::Ico => "image/x-icon",
            OutputFormat::Svg => "image/svg+xml",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            other => other.name(),
        }
    }

    pub fn supports_alpha(self) -> bool {
        !matches!(
            self,
            OutputFormat::Jpeg | OutputFormat::Tiff | OutputFormat::Bmp
        )
    }

    pub fn supports_gray(self) -> bool {
        !matches!(
            self,
            OutputFormat::Avif | OutputFormat::Ico | OutputFormat::Svg
        )
    }

    /// Whether encoded size responds to the quality setting.
    pub fn is_lossy(self) -> bool {
        matches!(
            self,
            OutputFormat::Jpeg | OutputFormat::WebP | OutputFormat::Avif
        )
    }

    /// Output format used when compressing a source to a byte budget:
    /// PNG and WebP keep their format, everything else becomes JPEG.
    pub fn for_budget(source: Option<OutputFormat>) -> Self {
        match source {
            Some(OutputFormat::Png) => OutputFormat::Png,
            Some(OutputFormat::WebP) => OutputFormat::WebP,
            _ => OutputFormat::Jpeg,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Source color model as reported by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpace {
    #[default]
    Srgb,
    Gray,
    Cmyk,
    /// Linear light / floating point samples.
    Linear,
}

impl ColorSpace {
    pub fn name(self) -> &'static str {
        match self {
            ColorSpace::Srgb => "srgb",
            ColorSpace::Gray => "gray",
            ColorSpace::Cmyk => "cmyk",
            ColorSpace::Linear => "linear",
        }
    }
}

/// Facts about the source that influence the resolved spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceHints {
    pub has_alpha: bool,
    pub color_space: ColorSpace,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChromaSubsampling {
    #[serde(rename = "4:4:4")]
    Yuv444,
    #[serde(rename = "4:2:0")]
    Yuv420,
}

impl ChromaSubsampling {
    fn for_quality(quality: Quality) -> Self {
        if quality.value() > FULL_CHROMA_ABOVE {
            ChromaSubsampling::Yuv444
        } else {
            ChromaSubsampling::Yuv420
        }
    }
}

/// Encoder settings for one format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "codec", rename_all = "lowercase")]
pub enum CodecOptions {
    Jpeg {
        quality: Quality,
        progressive: bool,
        chroma: ChromaSubsampling,
    },
    Png {
        best_compression: bool,
        adaptive_filter: bool,
    },
    WebP {
        quality: Quality,
        lossless: bool,
    },
    Avif {
        quality: Quality,
        speed: u8,
        chroma: ChromaSubsampling,
    },
    Gif,
    Tiff {
        lzw: bool,
    },
    Bmp,
    Ico,
    /// SVG wrapper around a lossless PNG raster.
    Svg,
}

/// Fixed canvas the output is fitted into (contain, transparent padding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ForcedCanvas {
    pub width: u32,
    pub height: u32,
}

/// Resolved output description. Pure function of [`resolve`]'s inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FormatSpec {
    pub target: OutputFormat,
    pub quality: Quality,
    pub options: CodecOptions,
    pub extension: &'static str,
    pub mime: &'static str,
    /// Composite over white before encoding (target has no alpha channel).
    pub flatten: bool,
    /// Convert to 8-bit sRGB before encoding.
    pub convert_to_srgb: bool,
    pub forced_canvas: Option<ForcedCanvas>,
}

impl FormatSpec {
    /// Same target with a different quality; source-dependent steps are kept.
    pub fn with_quality(&self, quality: Quality) -> Self {
        Self {
            quality,
            options: codec_options(self.target, quality),
            ..*self
        }
    }
}

fn codec_options(target: OutputFormat, quality: Quality) -> CodecOptions {
    match target {
        OutputFormat::Jpeg => CodecOptions::Jpeg {
            quality,
            progressive: true,
            chroma: ChromaSubsampling::for_quality(quality),
        },
        OutputFormat::Png => CodecOptions::Png {
            best_compression: true,
            adaptive_filter: true,
        },
        OutputFormat::WebP => CodecOptions::WebP {
            quality,
            lossless: quality == Quality::MAX,
        },
        OutputFormat::Avif => CodecOptions::Avif {
            quality,
            speed: AVIF_SPEED,
            chroma: ChromaSubsampling::for_quality(quality),
        },
        OutputFormat::Gif => CodecOptions::Gif,
        OutputFormat::Tiff => CodecOptions::Tiff { lzw: true },
        OutputFormat::Bmp => CodecOptions::Bmp,
        OutputFormat::Ico => CodecOptions::Ico,
        OutputFormat::Svg => CodecOptions::Svg,
    }
}

/// Resolve a format name into a [`FormatSpec`].
pub fn resolve(
    target: &str,
    quality: Quality,
    hints: &SourceHints,
) -> Result<FormatSpec, FormatError> {
    let format = OutputFormat::from_name(target)?;
    Ok(resolve_format(format, quality, hints))
}

/// Resolve an already-parsed format. Infallible.
pub fn resolve_format(format: OutputFormat, quality: Quality, hints: &SourceHints) -> FormatSpec {
    let convert_to_srgb = match hints.color_space {
        ColorSpace::Srgb => false,
        ColorSpace::Cmyk | ColorSpace::Linear => true,
        ColorSpace::Gray => !format.supports_gray(),
    };

    let forced_canvas = (format == OutputFormat::Ico).then_some(ForcedCanvas {
        width: ICON_SIZE,
        height: ICON_SIZE,
    });

    FormatSpec {
        target: format,
        quality,
        options: codec_options(format, quality),
        extension: format.extension(),
        mime: format.mime(),
        flatten: hints.has_alpha && !format.supports_alpha(),
        convert_to_srgb,
        forced_canvas,
    }
}
