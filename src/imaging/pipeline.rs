//! Transform pipeline: sequences codec primitives in a fixed order.
//!
//! ```text
//! decode → auto-orient → to sRGB → flatten → crop → resize → sharpen
//!        → rotate/flip → adjust → forced canvas → encode
//! ```
//!
//! Auto-orient always runs before any geometry so crop rectangles and resize
//! boxes refer to the image as displayed. Flatten runs before resize so the
//! resampler never blends against transparent black. Sharpening only runs
//! when the resize actually made the image smaller.
//!
//! Metadata is never written by the encoders. When a caller asks to keep it,
//! the only field that would survive is orientation, and the pipeline forces
//! auto-orient so that the reported orientation (always upright) matches the
//! pixels.

use super::calculations::{center_offset, is_downscale, plan_resize};
use super::codec::{CodecError, ImageCodec, SourceInfo};
use super::formats::{FormatSpec, OutputFormat, resolve_format};
use super::params::{
    CropRect, Fit, MAX_DIMENSION, Quality, ResizeSpec, Rotation, Sharpening, TransformOps,
};
use serde::Serialize;
use thiserror::Error;

/// Background used when dropping alpha for opaque targets.
pub const FLATTEN_BACKGROUND: [u8; 3] = [255, 255, 255];

#[derive(Error, Debug)]
pub enum PipelineError {
    /// The request itself is invalid (bad geometry, out-of-bounds crop).
    #[error("{0}")]
    Input(String),
    #[error(transparent)]
    Codec(CodecError),
}

impl From<CodecError> for PipelineError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Geometry(msg) => PipelineError::Input(msg),
            other => PipelineError::Codec(other),
        }
    }
}

/// One step the pipeline applied, in order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    AutoOrient { orientation: u8 },
    ConvertToSrgb,
    Flatten,
    Crop { x: u32, y: u32, width: u32, height: u32 },
    Resize { width: u32, height: u32 },
    CenterCrop { width: u32, height: u32 },
    Pad { width: u32, height: u32 },
    Sharpen { sigma: f32 },
    Rotate { degrees: i32 },
    Flip { horizontal: bool },
    Adjust,
    ForcedCanvas { width: u32, height: u32 },
    Encode { format: OutputFormat, quality: u32 },
}

#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
    pub mime: &'static str,
    pub extension: &'static str,
    pub steps: Vec<Step>,
    /// Orientation reported as kept when metadata preservation was asked for.
    pub orientation: Option<u8>,
}

/// Check operation parameters before any decoding.
pub fn validate_ops(ops: &TransformOps) -> Result<(), PipelineError> {
    if let Some(resize) = &ops.resize {
        resize.validate().map_err(PipelineError::Input)?;
    }
    if let Some(CropRect { width, height, .. }) = ops.crop {
        if width == 0 || height == 0 {
            return Err(PipelineError::Input("crop area must not be empty".into()));
        }
        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(PipelineError::Input(format!(
                "crop area exceeds {MAX_DIMENSION}px"
            )));
        }
    }
    if let Some(adjust) = &ops.adjust {
        if !(-255..=255).contains(&adjust.brightness) {
            return Err(PipelineError::Input(
                "brightness must be between -255 and 255".into(),
            ));
        }
        if adjust.blur < 0.0 || !adjust.blur.is_finite() {
            return Err(PipelineError::Input("blur must be a non-negative number".into()));
        }
    }
    Ok(())
}

/// Run every pixel step on a decoded image. Encoding is left to the caller.
pub fn render<C: ImageCodec>(
    codec: &C,
    mut image: C::Image,
    info: &SourceInfo,
    ops: &TransformOps,
    spec: &FormatSpec,
) -> Result<(C::Image, Vec<Step>), PipelineError> {
    let mut steps = Vec::new();

    let auto_orient = ops.auto_orient || ops.preserve_metadata;
    if auto_orient && info.orientation > 1 {
        image = codec.orient(&image, info.orientation);
        steps.push(Step::AutoOrient {
            orientation: info.orientation,
        });
    }

    if spec.convert_to_srgb {
        image = codec.to_srgb(&image);
        steps.push(Step::ConvertToSrgb);
    }

    if spec.flatten {
        image = codec.flatten(&image, FLATTEN_BACKGROUND);
        steps.push(Step::Flatten);
    }

    if let Some(rect) = ops.crop {
        image = codec.crop(&image, rect)?;
        steps.push(Step::Crop {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
        });
    }

    if let Some(resize) = &ops.resize {
        let before = codec.dimensions(&image);
        if let Some(resized) = resize_step(codec, &image, resize, &mut steps) {
            image = resized;
        }
        if ops.sharpen && is_downscale(before, codec.dimensions(&image)) {
            let sharpening = Sharpening::light();
            image = codec.sharpen(&image, sharpening);
            steps.push(Step::Sharpen {
                sigma: sharpening.sigma,
            });
        }
    }

    if let Some(rf) = &ops.rotate_flip {
        if rf.flip_horizontal {
            image = codec.flip(&image, true);
            steps.push(Step::Flip { horizontal: true });
        }
        if rf.flip_vertical {
            image = codec.flip(&image, false);
            steps.push(Step::Flip { horizontal: false });
        }
        if rf.rotate != Rotation::None {
            image = codec.rotate(&image, rf.rotate);
            steps.push(Step::Rotate {
                degrees: rf.rotate.degrees(),
            });
        }
    }

    if let Some(adjust) = ops.adjust.filter(|a| !a.is_neutral()) {
        image = codec.adjust(&image, &adjust);
        steps.push(Step::Adjust);
    }

    if let Some(canvas) = spec.forced_canvas {
        let contain = ResizeSpec {
            width: Some(canvas.width),
            height: Some(canvas.height),
            fit: Fit::Contain,
            allow_enlarge: true,
        };
        let plan = plan_resize(codec.dimensions(&image), &contain);
        image = codec.resize(&image, plan.scale_to.0, plan.scale_to.1);
        image = codec.pad_to_canvas(&image, canvas.width, canvas.height);
        steps.push(Step::ForcedCanvas {
            width: canvas.width,
            height: canvas.height,
        });
    }

    // Padding is transparent; an opaque target would encode it as black.
    let padded = steps
        .iter()
        .any(|s| matches!(s, Step::Pad { .. } | Step::ForcedCanvas { .. }));
    if padded && !spec.target.supports_alpha() {
        image = codec.flatten(&image, FLATTEN_BACKGROUND);
        steps.push(Step::Flatten);
    }

    Ok((image, steps))
}

/// Apply one resize spec. Returns `None` when the plan leaves the image as-is.
fn resize_step<C: ImageCodec>(
    codec: &C,
    image: &C::Image,
    spec: &ResizeSpec,
    steps: &mut Vec<Step>,
) -> Option<C::Image> {
    let source = codec.dimensions(image);
    let plan = plan_resize(source, spec);
    if plan.is_noop(source) {
        return None;
    }

    let mut out = codec.resize(image, plan.scale_to.0, plan.scale_to.1);
    steps.push(Step::Resize {
        width: plan.scale_to.0,
        height: plan.scale_to.1,
    });

    if let Some((w, h)) = plan.crop_to {
        let (x, y) = center_offset(plan.scale_to, (w, h));
        let rect = CropRect {
            x,
            y,
            width: w,
            height: h,
        };
        // Plan guarantees the crop lies inside the resized image.
        if let Ok(cropped) = codec.crop(&out, rect) {
            out = cropped;
            steps.push(Step::CenterCrop {
                width: w,
                height: h,
            });
        }
    }

    if let Some((w, h)) = plan.pad_to {
        out = codec.pad_to_canvas(&out, w, h);
        steps.push(Step::Pad {
            width: w,
            height: h,
        });
    }
    Some(out)
}

/// Encode a rendered image and package the result.
pub fn finish<C: ImageCodec>(
    codec: &C,
    image: &C::Image,
    mut steps: Vec<Step>,
    ops: &TransformOps,
    spec: &FormatSpec,
) -> Result<TransformOutput, PipelineError> {
    let bytes = codec.encode(image, spec)?;
    steps.push(Step::Encode {
        format: spec.target,
        quality: spec.quality.value(),
    });
    let (width, height) = codec.dimensions(image);
    Ok(TransformOutput {
        bytes,
        width,
        height,
        format: spec.target,
        mime: spec.mime,
        extension: spec.extension,
        steps,
        orientation: ops.preserve_metadata.then_some(1),
    })
}

/// Decode, transform and encode one buffer.
pub fn apply<C: ImageCodec>(
    codec: &C,
    bytes: &[u8],
    ops: &TransformOps,
    spec: &FormatSpec,
) -> Result<TransformOutput, PipelineError> {
    validate_ops(ops)?;
    let (image, info) = codec.decode(bytes)?;
    let (rendered, steps) = render(codec, image, &info, ops, spec)?;
    finish(codec, &rendered, steps, ops, spec)
}

/// Decode, resolve the output format against what the source turned out to
/// be, then transform and encode.
///
/// With `target` unset the source format is kept when it can be written,
/// and PNG is used otherwise.
pub fn convert<C: ImageCodec>(
    codec: &C,
    bytes: &[u8],
    ops: &TransformOps,
    target: Option<OutputFormat>,
    quality: Quality,
) -> Result<TransformOutput, PipelineError> {
    validate_ops(ops)?;
    let (image, info) = codec.decode(bytes)?;
    let format = target.or(info.format).unwrap_or(OutputFormat::Png);
    let spec = resolve_format(format, quality, &info.hints());
    let (rendered, steps) = render(codec, image, &info, ops, &spec)?;
    finish(codec, &rendered, steps, ops, &spec)
}
