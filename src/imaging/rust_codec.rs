//! Pure Rust image codec built on the `image` crate.
//!
//! Everything is statically linked into the binary.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Probe / decode | `ImageReader::with_guessed_format` + `ImageDecoder::orientation` |
//! | Auto-orient | `DynamicImage::apply_orientation` |
//! | Resize | `resize_exact` with `Lanczos3` |
//! | Contain padding | `imageops::overlay` onto a transparent canvas |
//! | Sharpening | `DynamicImage::unsharpen` |
//! | Adjust | `brighten`, `adjust_contrast`, `blur`, `grayscale` |
//! | Encode → JPEG | `JpegEncoder::new_with_quality` (baseline) |
//! | Encode → PNG | `PngEncoder` with `CompressionType::Best` + adaptive filter |
//! | Encode → WebP | `WebPEncoder::new_lossless` (the only WebP encoder `image` ships) |
//! | Encode → AVIF | `AvifEncoder::new_with_speed_quality` (rav1e) |
//! | Encode → GIF/TIFF/BMP/ICO | `DynamicImage::write_to` |
//! | Encode → SVG | PNG raster, base64 in an `<image>` element |
//!
//! Options the underlying encoders do not expose (progressive JPEG, chroma
//! subsampling, lossy WebP, TIFF compression) stay in the [`FormatSpec`] and
//! are ignored here.
//!
//! AVIF is write-only: the `"avif"` feature only enables the rav1e encoder.

use super::calculations::center_offset;
use super::codec::{CodecError, ImageCodec, SourceInfo};
use super::formats::{CodecOptions, ColorSpace, FormatSpec, OutputFormat};
use super::params::{Adjustments, CropRect, Rotation, Sharpening};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{self, CompressionType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::imageops::{self, FilterType};
use image::metadata::Orientation;
use image::{
    ColorType, DynamicImage, ImageDecoder, ImageFormat, ImageReader, Rgb, RgbImage, Rgba,
    RgbaImage,
};
use std::io::Cursor;

/// Pure Rust codec using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
pub struct RustCodec;

impl RustCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RustCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_err(e: image::ImageError) -> CodecError {
    CodecError::Decode(e.to_string())
}

fn encode_err(e: image::ImageError) -> CodecError {
    CodecError::Encode(e.to_string())
}

fn output_format(format: ImageFormat) -> Option<OutputFormat> {
    match format {
        ImageFormat::Jpeg => Some(OutputFormat::Jpeg),
        ImageFormat::Png => Some(OutputFormat::Png),
        ImageFormat::WebP => Some(OutputFormat::WebP),
        ImageFormat::Avif => Some(OutputFormat::Avif),
        ImageFormat::Gif => Some(OutputFormat::Gif),
        ImageFormat::Tiff => Some(OutputFormat::Tiff),
        ImageFormat::Bmp => Some(OutputFormat::Bmp),
        ImageFormat::Ico => Some(OutputFormat::Ico),
        _ => None,
    }
}

fn color_space(color: ColorType) -> ColorSpace {
    match color {
        ColorType::L8 | ColorType::La8 | ColorType::L16 | ColorType::La16 => ColorSpace::Gray,
        ColorType::Rgb32F | ColorType::Rgba32F => ColorSpace::Linear,
        _ => ColorSpace::Srgb,
    }
}

/// Open a reader with the format sniffed from the bytes.
fn reader(bytes: &[u8]) -> Result<(ImageReader<Cursor<&[u8]>>, ImageFormat), CodecError> {
    let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    let format = reader.format().ok_or(CodecError::UnknownFormat)?;
    Ok((reader, format))
}

fn source_info(decoder: &mut impl ImageDecoder, format: ImageFormat) -> SourceInfo {
    let (width, height) = decoder.dimensions();
    let color = decoder.color_type();
    // A missing or unreadable orientation tag means upright.
    let orientation = decoder.orientation().map(Orientation::to_exif).unwrap_or(1);
    SourceInfo {
        width,
        height,
        has_alpha: color.has_alpha(),
        color_space: color_space(color),
        orientation,
        format: output_format(format),
    }
}

/// Convert to an 8-bit layout the target encoder accepts.
fn to_encodable(image: &DynamicImage, target: OutputFormat) -> DynamicImage {
    let alpha = image.color().has_alpha() && target.supports_alpha();
    let gray = color_space(image.color()) == ColorSpace::Gray && target.supports_gray();
    match (gray, alpha) {
        (true, false) => DynamicImage::ImageLuma8(image.to_luma8()),
        (true, true) => DynamicImage::ImageLumaA8(image.to_luma_alpha8()),
        (false, false) => DynamicImage::ImageRgb8(image.to_rgb8()),
        (false, true) => DynamicImage::ImageRgba8(image.to_rgba8()),
    }
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    let encoder =
        PngEncoder::new_with_quality(&mut out, CompressionType::Best, png::FilterType::Adaptive);
    image.write_with_encoder(encoder).map_err(encode_err)?;
    Ok(out)
}

/// Wrap a raster in a standalone SVG document.
fn wrap_svg(png_bytes: &[u8], width: u32, height: u32) -> Vec<u8> {
    let data = STANDARD.encode(png_bytes);
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <svg xmlns=\"http://www.w3.org/2000/svg\" xmlns:xlink=\"http://www.w3.org/1999/xlink\" \
         width=\"{width}\" height=\"{height}\" viewBox=\"0 0 {width} {height}\">\n  \
         <image width=\"{width}\" height=\"{height}\" xlink:href=\"data:image/png;base64,{data}\"/>\n\
         </svg>\n"
    )
    .into_bytes()
}

impl ImageCodec for RustCodec {
    type Image = DynamicImage;

    fn probe(&self, bytes: &[u8]) -> Result<SourceInfo, CodecError> {
        let (reader, format) = reader(bytes)?;
        let mut decoder = reader.into_decoder().map_err(decode_err)?;
        Ok(source_info(&mut decoder, format))
    }

    fn decode(&self, bytes: &[u8]) -> Result<(DynamicImage, SourceInfo), CodecError> {
        let (reader, format) = reader(bytes)?;
        let mut decoder = reader.into_decoder().map_err(decode_err)?;
        let info = source_info(&mut decoder, format);
        let image = DynamicImage::from_decoder(decoder).map_err(decode_err)?;
        Ok((image, info))
    }

    fn quality_sensitive(&self, format: OutputFormat) -> bool {
        // WebP goes through the lossless encoder.
        format.is_lossy() && format != OutputFormat::WebP
    }

    fn encode(&self, image: &DynamicImage, spec: &FormatSpec) -> Result<Vec<u8>, CodecError> {
        let image = to_encodable(image, spec.target);
        let mut out = Vec::new();
        match spec.options {
            CodecOptions::Jpeg { quality, .. } => {
                let encoder = JpegEncoder::new_with_quality(&mut out, quality.as_u8());
                image.write_with_encoder(encoder).map_err(encode_err)?;
            }
            CodecOptions::Png { .. } => out = encode_png(&image)?,
            CodecOptions::WebP { .. } => {
                // Lossless encoder only takes RGB(A).
                let image = to_encodable(&image, OutputFormat::Avif);
                image
                    .write_with_encoder(WebPEncoder::new_lossless(&mut out))
                    .map_err(encode_err)?;
            }
            CodecOptions::Avif { quality, speed, .. } => {
                let encoder = AvifEncoder::new_with_speed_quality(&mut out, speed, quality.as_u8());
                image.write_with_encoder(encoder).map_err(encode_err)?;
            }
            CodecOptions::Gif => {
                DynamicImage::ImageRgba8(image.to_rgba8())
                    .write_to(&mut Cursor::new(&mut out), ImageFormat::Gif)
                    .map_err(encode_err)?;
            }
            CodecOptions::Tiff { .. } => {
                image
                    .write_to(&mut Cursor::new(&mut out), ImageFormat::Tiff)
                    .map_err(encode_err)?;
            }
            CodecOptions::Bmp => {
                image
                    .write_to(&mut Cursor::new(&mut out), ImageFormat::Bmp)
                    .map_err(encode_err)?;
            }
            CodecOptions::Ico => {
                DynamicImage::ImageRgba8(image.to_rgba8())
                    .write_to(&mut Cursor::new(&mut out), ImageFormat::Ico)
                    .map_err(encode_err)?;
            }
            CodecOptions::Svg => {
                let raster = encode_png(&image)?;
                out = wrap_svg(&raster, image.width(), image.height());
            }
        }
        Ok(out)
    }

    fn dimensions(&self, image: &DynamicImage) -> (u32, u32) {
        (image.width(), image.height())
    }

    fn orient(&self, image: &DynamicImage, orientation: u8) -> DynamicImage {
        let mut out = image.clone();
        if let Some(orientation) = Orientation::from_exif(orientation) {
            out.apply_orientation(orientation);
        }
        out
    }

    fn to_srgb(&self, image: &DynamicImage) -> DynamicImage {
        if image.color().has_alpha() {
            DynamicImage::ImageRgba8(image.to_rgba8())
        } else {
            DynamicImage::ImageRgb8(image.to_rgb8())
        }
    }

    fn flatten(&self, image: &DynamicImage, background: [u8; 3]) -> DynamicImage {
        if !image.color().has_alpha() {
            return image.clone();
        }
        let rgba = image.to_rgba8();
        let blend = |c: u8, b: u8, a: u32| ((c as u32 * a + b as u32 * (255 - a) + 127) / 255) as u8;
        DynamicImage::ImageRgb8(RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
            let Rgba([r, g, b, a]) = *rgba.get_pixel(x, y);
            let a = a as u32;
            Rgb([
                blend(r, background[0], a),
                blend(g, background[1], a),
                blend(b, background[2], a),
            ])
        }))
    }

    fn crop(&self, image: &DynamicImage, rect: CropRect) -> Result<DynamicImage, CodecError> {
        if rect.width == 0 || rect.height == 0 {
            return Err(CodecError::Geometry("crop area must not be empty".into()));
        }
        let fits_x = rect.x.checked_add(rect.width).is_some_and(|r| r <= image.width());
        let fits_y = rect.y.checked_add(rect.height).is_some_and(|b| b <= image.height());
        if !fits_x || !fits_y {
            return Err(CodecError::Geometry(format!(
                "crop {}x{}+{}+{} outside {}x{} image",
                rect.width,
                rect.height,
                rect.x,
                rect.y,
                image.width(),
                image.height()
            )));
        }
        Ok(image.crop_imm(rect.x, rect.y, rect.width, rect.height))
    }

    fn resize(&self, image: &DynamicImage, width: u32, height: u32) -> DynamicImage {
        image.resize_exact(width, height, FilterType::Lanczos3)
    }

    fn pad_to_canvas(&self, image: &DynamicImage, width: u32, height: u32) -> DynamicImage {
        let mut canvas = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 0]));
        let (x, y) = center_offset((width, height), (image.width(), image.height()));
        imageops::overlay(&mut canvas, &image.to_rgba8(), x as i64, y as i64);
        DynamicImage::ImageRgba8(canvas)
    }

    fn rotate(&self, image: &DynamicImage, rotation: Rotation) -> DynamicImage {
        match rotation {
            Rotation::None => image.clone(),
            Rotation::Cw90 => image.rotate90(),
            Rotation::Cw180 => image.rotate180(),
            Rotation::Cw270 => image.rotate270(),
        }
    }

    fn flip(&self, image: &DynamicImage, horizontal: bool) -> DynamicImage {
        if horizontal {
            image.fliph()
        } else {
            image.flipv()
        }
    }

    fn sharpen(&self, image: &DynamicImage, sharpening: Sharpening) -> DynamicImage {
        image.unsharpen(sharpening.sigma, sharpening.threshold)
    }

    fn adjust(&self, image: &DynamicImage, adjustments: &Adjustments) -> DynamicImage {
        let mut out = image.clone();
        if adjustments.brightness != 0 {
            out = out.brighten(adjustments.brightness.clamp(-255, 255));
        }
        if adjustments.contrast != 0.0 {
            out = out.adjust_contrast(adjustments.contrast);
        }
        if adjustments.blur > 0.0 {
            out = out.blur(adjustments.blur);
        }
        if adjustments.grayscale {
            out = out.grayscale();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::formats::{SourceHints, resolve};
    use crate::imaging::params::Quality;
    use crate::test_helpers::*;

    fn spec_for(name: &str, image: &DynamicImage) -> FormatSpec {
        let hints = SourceHints {
            has_alpha: image.color().has_alpha(),
            color_space: color_space(image.color()),
            width: image.width(),
            height: image.height(),
        };
        resolve(name, Quality::new(80), &hints).unwrap()
    }

    #[test]
    fn probe_reports_dimensions_and_format() {
        let codec = RustCodec::new();
        let info = codec.probe(&gradient_jpeg(200, 150)).unwrap();
        assert_eq!((info.width, info.height), (200, 150));
        assert_eq!(info.format, Some(OutputFormat::Jpeg));
        assert!(!info.has_alpha);
        assert_eq!(info.orientation, 1);
    }

    #[test]
    fn probe_detects_alpha() {
        let info = RustCodec::new().probe(&rgba_png(32, 32)).unwrap();
        assert!(info.has_alpha);
        assert_eq!(info.format, Some(OutputFormat::Png));
    }

    #[test]
    fn garbage_is_unknown_format() {
        let result = RustCodec::new().decode(b"definitely not an image");
        assert!(matches!(result, Err(CodecError::UnknownFormat)));
    }

    #[test]
    fn truncated_png_fails_to_decode() {
        let mut bytes = gradient_png(64, 64);
        bytes.truncate(60);
        assert!(RustCodec::new().decode(&bytes).is_err());
    }

    #[test]
    fn encodes_every_table_format() {
        let codec = RustCodec::new();
        let image = half_transparent(48, 32);
        for name in ["jpeg", "png", "webp", "avif", "gif", "tiff", "bmp", "svg"] {
            let bytes = codec.encode(&image, &spec_for(name, &image)).unwrap();
            assert!(!bytes.is_empty(), "{name} produced no bytes");
        }
    }

    #[test]
    fn jpeg_output_decodes_to_same_size() {
        let codec = RustCodec::new();
        let image = gradient(120, 80);
        let bytes = codec.encode(&image, &spec_for("jpg", &image)).unwrap();
        let decoded = decode(&bytes);
        assert_eq!((decoded.width(), decoded.height()), (120, 80));
    }

    #[test]
    fn jpeg_quality_changes_size() {
        let codec = RustCodec::new();
        let image = gradient(256, 256);
        let spec = spec_for("jpeg", &image);
        let low = codec.encode(&image, &spec.with_quality(Quality::new(10))).unwrap();
        let high = codec.encode(&image, &spec.with_quality(Quality::new(95))).unwrap();
        assert!(low.len() < high.len());
    }

    #[test]
    fn webp_size_ignores_quality() {
        let codec = RustCodec::new();
        let image = gradient(64, 64);
        let spec = spec_for("webp", &image);
        let low = codec.encode(&image, &spec.with_quality(Quality::new(10))).unwrap();
        let high = codec.encode(&image, &spec.with_quality(Quality::new(95))).unwrap();
        assert_eq!(low.len(), high.len());
        assert!(!codec.quality_sensitive(OutputFormat::WebP));
        assert!(codec.quality_sensitive(OutputFormat::Jpeg));
    }

    #[test]
    fn svg_embeds_png_data_url() {
        let codec = RustCodec::new();
        let image = gradient(10, 20);
        let bytes = codec.encode(&image, &spec_for("svg", &image)).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("width=\"10\" height=\"20\""));
        assert!(text.contains("data:image/png;base64,"));
    }

    #[test]
    fn flatten_composites_over_background() {
        let codec = RustCodec::new();
        let flat = codec.flatten(&half_transparent(4, 2), [255, 255, 255]);
        assert!(!flat.color().has_alpha());
        let rgb = flat.to_rgb8();
        assert_eq!(*rgb.get_pixel(0, 0), Rgb([255, 255, 255]));
        assert_eq!(*rgb.get_pixel(3, 0), Rgb([255, 0, 0]));
    }

    #[test]
    fn crop_outside_bounds_is_geometry_error() {
        let codec = RustCodec::new();
        let rect = CropRect {
            x: 50,
            y: 0,
            width: 60,
            height: 10,
        };
        assert!(matches!(
            codec.crop(&gradient(100, 100), rect),
            Err(CodecError::Geometry(_))
        ));
    }

    #[test]
    fn pad_centers_on_transparent_canvas() {
        let codec = RustCodec::new();
        let padded = codec.pad_to_canvas(&gradient(16, 8), 16, 16);
        assert_eq!((padded.width(), padded.height()), (16, 16));
        let rgba = padded.to_rgba8();
        assert_eq!(rgba.get_pixel(0, 0)[3], 0);
        assert_eq!(rgba.get_pixel(0, 8)[3], 255);
    }

    #[test]
    fn rotate_quarter_turn_swaps_axes() {
        let codec = RustCodec::new();
        let rotated = codec.rotate(&gradient(30, 20), Rotation::Cw90);
        assert_eq!(codec.dimensions(&rotated), (20, 30));
    }

    #[test]
    fn orient_six_rotates_clockwise() {
        let codec = RustCodec::new();
        let oriented = codec.orient(&gradient(30, 20), 6);
        assert_eq!(codec.dimensions(&oriented), (20, 30));
        let unchanged = codec.orient(&gradient(30, 20), 1);
        assert_eq!(codec.dimensions(&unchanged), (30, 20));
    }

    #[test]
    fn grayscale_adjustment_drops_color() {
        let codec = RustCodec::new();
        let adjusted = codec.adjust(
            &gradient(8, 8),
            &Adjustments {
                grayscale: true,
                ..Adjustments::default()
            },
        );
        assert_eq!(color_space(adjusted.color()), ColorSpace::Gray);
    }
}
