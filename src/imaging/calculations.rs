//! Pure calculation functions for image geometry and byte budgets.
//!
//! All functions here are pure and testable without any I/O or images.

use super::params::{Fit, ResizeSpec};

/// Bytes-per-pixel the encoders reach at floor quality. Used to estimate
/// whether a budget is reachable at the source geometry at all.
pub const FLOOR_BYTES_PER_PIXEL: f64 = 0.1;

/// Fraction of the budget a candidate may use.
pub const BUDGET_MARGIN: f64 = 0.98;

/// Calculate dimensions that fit entirely inside a box, preserving aspect ratio.
///
/// Either side of the box may be omitted, in which case it is derived from
/// the other through the source aspect ratio.
///
/// # Examples
/// ```
/// # use pixshift::imaging::calculate_inside_dimensions;
/// assert_eq!(calculate_inside_dimensions((4000, 3000), (Some(800), Some(800))), (800, 600));
/// assert_eq!(calculate_inside_dimensions((4000, 3000), (None, Some(300))), (400, 300));
/// ```
pub fn calculate_inside_dimensions(source: (u32, u32), target: (Option<u32>, Option<u32>)) -> (u32, u32) {
    let (src_w, src_h) = source;
    let scale_w = target.0.map(|w| w as f64 / src_w as f64);
    let scale_h = target.1.map(|h| h as f64 / src_h as f64);

    let scale = match (scale_w, scale_h) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => 1.0,
    };
    scale_dimensions(source, scale)
}

/// Calculate dimensions needed to fill a target area (resize before crop).
///
/// Returns dimensions that completely cover the target area while maintaining
/// the source aspect ratio. One dimension will match exactly, the other may exceed.
pub fn calculate_fill_dimensions(source: (u32, u32), target: (u32, u32)) -> (u32, u32) {
    let (src_w, src_h) = source;
    let (tgt_w, tgt_h) = target;

    let src_aspect = src_w as f64 / src_h as f64;
    let tgt_aspect = tgt_w as f64 / tgt_h as f64;

    if src_aspect > tgt_aspect {
        // Source is wider: height will match, width will exceed
        let h = tgt_h;
        let w = (h as f64 * src_aspect).round() as u32;
        (w.max(tgt_w), h)
    } else {
        // Source is taller: width will match, height will exceed
        let w = tgt_w;
        let h = (w as f64 / src_aspect).round() as u32;
        (w, h.max(tgt_h))
    }
}

/// Top-left offset that centers `inner` within `outer` on both axes.
pub fn center_offset(outer: (u32, u32), inner: (u32, u32)) -> (u32, u32) {
    (
        outer.0.saturating_sub(inner.0) / 2,
        outer.1.saturating_sub(inner.1) / 2,
    )
}

/// Scale dimensions by a factor, rounding and never going below 1px.
pub fn scale_dimensions(dims: (u32, u32), scale: f64) -> (u32, u32) {
    let w = (dims.0 as f64 * scale).round().max(1.0) as u32;
    let h = (dims.1 as f64 * scale).round().max(1.0) as u32;
    (w, h)
}

/// Concrete geometry for one resize step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizePlan {
    /// Dimensions to resample to.
    pub scale_to: (u32, u32),
    /// Center crop applied after resampling (cover).
    pub crop_to: Option<(u32, u32)>,
    /// Transparent canvas the result is centered on (contain).
    pub pad_to: Option<(u32, u32)>,
}

impl ResizePlan {
    /// Final dimensions after crop or pad.
    pub fn output_dimensions(&self) -> (u32, u32) {
        self.pad_to.or(self.crop_to).unwrap_or(self.scale_to)
    }

    /// Whether the plan leaves the source untouched.
    pub fn is_noop(&self, source: (u32, u32)) -> bool {
        self.scale_to == source && self.crop_to.is_none() && self.pad_to.is_none()
    }
}

/// Turn a [`ResizeSpec`] into concrete geometry for a source of the given size.
///
/// Without `allow_enlarge` the resampled image never exceeds the source:
/// `inside` and `contain` cap their scale at 1, while `cover` and `fill`
/// leave the source as-is when the box is larger than it on either axis.
/// When only one side is given every fit behaves like `inside`.
pub fn plan_resize(source: (u32, u32), spec: &ResizeSpec) -> ResizePlan {
    let keep = ResizePlan {
        scale_to: source,
        crop_to: None,
        pad_to: None,
    };

    let inside = |enlarge: bool| {
        let dims = calculate_inside_dimensions(source, (spec.width, spec.height));
        if !enlarge && (dims.0 > source.0 || dims.1 > source.1) {
            source
        } else {
            dims
        }
    };

    let (tgt_w, tgt_h) = match (spec.width, spec.height) {
        (Some(w), Some(h)) => (w, h),
        _ => {
            return ResizePlan {
                scale_to: inside(spec.allow_enlarge),
                ..keep
            };
        }
    };
    let exceeds = tgt_w > source.0 || tgt_h > source.1;

    match spec.fit {
        Fit::Inside => ResizePlan {
            scale_to: inside(spec.allow_enlarge),
            ..keep
        },
        Fit::Contain => ResizePlan {
            scale_to: inside(spec.allow_enlarge),
            crop_to: None,
            pad_to: Some((tgt_w, tgt_h)),
        },
        Fit::Fill | Fit::Cover if exceeds && !spec.allow_enlarge => keep,
        Fit::Fill => ResizePlan {
            scale_to: (tgt_w, tgt_h),
            ..keep
        },
        Fit::Cover => {
            let filled = calculate_fill_dimensions(source, (tgt_w, tgt_h));
            ResizePlan {
                scale_to: filled,
                crop_to: (filled != (tgt_w, tgt_h)).then_some((tgt_w, tgt_h)),
                pad_to: None,
            }
        }
    }
}

/// Whether `output` has fewer pixels along either axis than `source` without
/// growing along the other. Sharpening is only worth running in that case.
pub fn is_downscale(source: (u32, u32), output: (u32, u32)) -> bool {
    output.0 <= source.0 && output.1 <= source.1 && output != source
}

// =========================================================================
// Byte budget math
// =========================================================================

/// Bytes a candidate may occupy for the given budget.
pub fn budget_target(budget: u64) -> u64 {
    (budget as f64 * BUDGET_MARGIN).floor() as u64
}

/// Estimated encoded size at floor quality.
pub fn estimate_floor_bytes(dims: (u32, u32)) -> u64 {
    (dims.0 as f64 * dims.1 as f64 * FLOOR_BYTES_PER_PIXEL).ceil() as u64
}

/// Linear scale factor the geometry pre-pass applies, or `None` when the
/// estimate already fits.
///
/// Pixel count scales with the square of the linear factor, so the factor is
/// `sqrt(target / estimate)`.
pub fn prepass_scale(dims: (u32, u32), budget: u64) -> Option<f64> {
    let estimate = estimate_floor_bytes(dims);
    let target = budget_target(budget);
    if estimate <= target {
        return None;
    }
    Some((target as f64 / estimate as f64).sqrt())
}

/// Scale factors tried, in order, once the quality search has failed.
pub fn fallback_scales() -> impl Iterator<Item = f64> {
    (1..=9).rev().map(|tenths| tenths as f64 / 10.0)
}
