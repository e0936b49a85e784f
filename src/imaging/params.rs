//! Parameter types for transform operations.
//!
//! These structs describe *what* to do to an image, not *how*. They are the
//! interface between callers (HTTP handlers, CLI, sessions) and the
//! [`pipeline`](super::pipeline), which sequences codec primitives. All of them
//! deserialize from JSON so chained session operations can be posted as a body.
//!
//! ## Types
//!
//! - [`Quality`]: Lossy encoding quality (1–100, default 90). Clamped on construction.
//! - [`Sharpening`]: Unsharp-mask parameters applied after a downscale.
//! - [`ResizeSpec`]: Target box, fit mode, and whether enlarging is allowed.
//! - [`RotateFlip`]: Quarter-turn rotation plus horizontal/vertical flips.
//! - [`CropRect`]: Pixel rectangle to extract.
//! - [`Adjustments`]: Brightness, contrast, blur, grayscale.
//! - [`TransformOps`]: Everything above bundled for one pipeline run.

use serde::{Deserialize, Serialize};

/// Largest edge accepted for any requested geometry.
pub const MAX_DIMENSION: u32 = 10_000;

/// Quality setting for lossy image encoding (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "u32")]
pub struct Quality(u32);

impl Quality {
    pub const MAX: Quality = Quality(100);

    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100))
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Quality as the `u8` most encoders take.
    pub fn as_u8(self) -> u8 {
        self.0 as u8
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(90)
    }
}

impl From<u32> for Quality {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

/// Sharpening parameters for unsharp mask.
///
/// - `sigma`: Standard deviation of the Gaussian blur (higher = more sharpening)
/// - `threshold`: Minimum brightness difference to sharpen (0 = sharpen all pixels)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sharpening {
    pub sigma: f32,
    pub threshold: i32,
}

impl Sharpening {
    /// Light sharpening that restores edge contrast lost to Lanczos downscaling.
    pub fn light() -> Self {
        Self {
            sigma: 0.5,
            threshold: 0,
        }
    }
}

/// How a resize maps the source onto the requested box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fit {
    /// Fit entirely inside the box, preserving aspect ratio.
    #[default]
    Inside,
    /// Cover the box, preserving aspect ratio, then center-crop to it.
    Cover,
    /// Stretch to exactly the box.
    Fill,
    /// Fit inside the box and pad with transparency to its exact size.
    Contain,
}

impl std::str::FromStr for Fit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inside" => Ok(Fit::Inside),
            "cover" => Ok(Fit::Cover),
            "fill" => Ok(Fit::Fill),
            "contain" => Ok(Fit::Contain),
            other => Err(format!(
                "unknown fit '{other}' (expected inside, cover, fill, contain)"
            )),
        }
    }
}

/// Requested resize. At least one of `width`/`height` must be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResizeSpec {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fit: Fit,
    /// Allow output larger than the source. Off unless explicitly requested.
    pub allow_enlarge: bool,
}

impl ResizeSpec {
    pub fn exact(width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            fit: Fit::Fill,
            allow_enlarge: false,
        }
    }

    pub fn inside(width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.width.is_none() && self.height.is_none() {
            return Err("resize requires a width or a height".into());
        }
        for (name, value) in [("width", self.width), ("height", self.height)] {
            match value {
                Some(0) => return Err(format!("resize {name} must be at least 1")),
                Some(v) if v > MAX_DIMENSION => {
                    return Err(format!("resize {name} {v} exceeds {MAX_DIMENSION}px"));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Clockwise quarter-turn rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    pub fn degrees(self) -> i32 {
        match self {
            Rotation::None => 0,
            Rotation::Cw90 => 90,
            Rotation::Cw180 => 180,
            Rotation::Cw270 => 270,
        }
    }

    /// Whether this rotation swaps width and height.
    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Cw90 | Rotation::Cw270)
    }
}

impl TryFrom<i32> for Rotation {
    type Error = String;

    /// Accepts any multiple of 90, negative values meaning counter-clockwise.
    fn try_from(degrees: i32) -> Result<Self, Self::Error> {
        if degrees % 90 != 0 {
            return Err(format!(
                "rotation must be a multiple of 90 degrees, got {degrees}"
            ));
        }
        Ok(match degrees.rem_euclid(360) {
            0 => Rotation::None,
            90 => Rotation::Cw90,
            180 => Rotation::Cw180,
            _ => Rotation::Cw270,
        })
    }
}

impl From<Rotation> for i32 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees()
    }
}

/// Rotation plus mirror flips. Flips run before the rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RotateFlip {
    pub rotate: Rotation,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
}

impl RotateFlip {
    pub fn rotate(rotation: Rotation) -> Self {
        Self {
            rotate: rotation,
            ..Self::default()
        }
    }

    pub fn is_identity(&self) -> bool {
        self.rotate == Rotation::None && !self.flip_horizontal && !self.flip_vertical
    }
}

/// Pixel rectangle to extract from the (oriented) source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Tonal adjustments. Neutral values leave the image untouched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Adjustments {
    /// Brightness offset in `[-255, 255]`.
    pub brightness: i32,
    /// Contrast change in percent; positive increases contrast.
    pub contrast: f32,
    /// Gaussian blur sigma; 0 disables.
    pub blur: f32,
    pub grayscale: bool,
}

impl Default for Adjustments {
    fn default() -> Self {
        Self {
            brightness: 0,
            contrast: 0.0,
            blur: 0.0,
            grayscale: false,
        }
    }
}

impl Adjustments {
    pub fn is_neutral(&self) -> bool {
        self.brightness == 0 && self.contrast == 0.0 && self.blur <= 0.0 && !self.grayscale
    }
}

/// Every geometric and tonal operation for one pipeline run.
///
/// The encode target is not part of this struct: it comes from a resolved
/// [`FormatSpec`](super::formats::FormatSpec) so the format table stays the
/// single source of encoder settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransformOps {
    pub auto_orient: bool,
    pub crop: Option<CropRect>,
    pub resize: Option<ResizeSpec>,
    pub rotate_flip: Option<RotateFlip>,
    /// Sharpen after a downscale. Has no effect when output is not smaller.
    pub sharpen: bool,
    pub adjust: Option<Adjustments>,
    /// Keep orientation metadata (always the identity after auto-orient).
    pub preserve_metadata: bool,
}

impl Default for TransformOps {
    fn default() -> Self {
        Self {
            auto_orient: true,
            crop: None,
            resize: None,
            rotate_flip: None,
            sharpen: false,
            adjust: None,
            preserve_metadata: false,
        }
    }
}

impl TransformOps {
    pub fn resize(spec: ResizeSpec) -> Self {
        Self {
            resize: Some(spec),
            sharpen: true,
            ..Self::default()
        }
    }

    pub fn rotate_flip(op: RotateFlip) -> Self {
        Self {
            rotate_flip: Some(op),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_clamps_to_valid_range() {
        assert_eq!(Quality::new(0).value(), 1);
        assert_eq!(Quality::new(50).value(), 50);
        assert_eq!(Quality::new(150).value(), 100);
    }

    #[test]
    fn quality_default_is_90() {
        assert_eq!(Quality::default().value(), 90);
    }

    #[test]
    fn quality_deserializes_with_clamp() {
        let q: Quality = serde_json::from_str("250").unwrap();
        assert_eq!(q, Quality::MAX);
    }

    #[test]
    fn sharpening_light_values() {
        let s = Sharpening::light();
        assert_eq!(s.sigma, 0.5);
        assert_eq!(s.threshold, 0);
    }

    #[test]
    fn rotation_normalizes_negative_angles() {
        assert_eq!(Rotation::try_from(-90).unwrap(), Rotation::Cw270);
        assert_eq!(Rotation::try_from(450).unwrap(), Rotation::Cw90);
        assert_eq!(Rotation::try_from(0).unwrap(), Rotation::None);
    }

    #[test]
    fn rotation_rejects_arbitrary_angles() {
        assert!(Rotation::try_from(45).is_err());
    }

    #[test]
    fn rotate_flip_from_json() {
        let op: RotateFlip = serde_json::from_str(r#"{"rotate": -90, "flip_vertical": true}"#)
            .unwrap();
        assert_eq!(op.rotate, Rotation::Cw270);
        assert!(op.flip_vertical);
        assert!(!op.flip_horizontal);
    }

    #[test]
    fn resize_requires_a_dimension() {
        assert!(ResizeSpec::default().validate().is_err());
        assert!(ResizeSpec::inside(800, 600).validate().is_ok());
    }

    #[test]
    fn resize_rejects_oversize_and_zero() {
        let too_big = ResizeSpec {
            width: Some(MAX_DIMENSION + 1),
            ..ResizeSpec::default()
        };
        assert!(too_big.validate().is_err());
        let zero = ResizeSpec {
            height: Some(0),
            ..ResizeSpec::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn fit_parses_case_insensitively() {
        assert_eq!("COVER".parse::<Fit>().unwrap(), Fit::Cover);
        assert!("stretch".parse::<Fit>().is_err());
    }

    #[test]
    fn default_ops_auto_orient_only() {
        let ops = TransformOps::default();
        assert!(ops.auto_orient);
        assert!(ops.resize.is_none());
        assert!(!ops.preserve_metadata);
    }

    #[test]
    fn ops_deserialize_from_partial_json() {
        let ops: TransformOps =
            serde_json::from_str(r#"{"rotate_flip": {"rotate": 90}}"#).unwrap();
        assert!(ops.auto_orient);
        assert_eq!(ops.rotate_flip.unwrap().rotate, Rotation::Cw90);
    }

    #[test]
    fn adjustments_default_is_neutral() {
        assert!(Adjustments::default().is_neutral());
        let gray = Adjustments {
            grayscale: true,
            ..Adjustments::default()
        };
        assert!(!gray.is_neutral());
    }
}
