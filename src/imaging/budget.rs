//! Best-effort compression to a byte budget.
//!
//! ```text
//! default encode (q80) ── fits? ──► done
//!        │ no
//! geometry pre-pass: floor estimate over budget → shrink by sqrt(target/estimate)
//!        │
//! binary search quality over [1, 95] against budget × 0.98
//!        │ nothing fits
//! scale fallback 0.9 → 0.1 of the original geometry at q40, first fit wins
//!        │ nothing fits
//! smallest candidate produced
//! ```
//!
//! Candidates are encoded one after another and only the best fitting one
//! (or, failing that, the smallest one) is kept alive. An unreachable budget
//! is not an error.

use super::calculations::{budget_target, fallback_scales, prepass_scale, scale_dimensions};
use super::codec::ImageCodec;
use super::formats::{FormatSpec, OutputFormat, resolve_format};
use super::params::{Quality, TransformOps};
use super::pipeline::{PipelineError, render};
use serde::Serialize;
use tracing::debug;

/// Quality of the first, unsearched encode.
pub const DEFAULT_QUALITY: u32 = 80;

/// Quality used while stepping down the scale fallback.
pub const FALLBACK_QUALITY: u32 = 40;

const SEARCH_MIN: u32 = 1;
const SEARCH_MAX: u32 = 95;

/// Which stage produced the returned candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Default,
    QualitySearch,
    ScaleFallback,
    Smallest,
}

#[derive(Debug, Clone)]
pub struct BudgetOutcome {
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    pub quality: u32,
    pub width: u32,
    pub height: u32,
    pub budget: u64,
    /// Whether `bytes` is within the budget.
    pub met_budget: bool,
    pub strategy: Strategy,
    /// Number of encodes performed.
    pub attempts: u32,
}

struct Candidate {
    bytes: Vec<u8>,
    quality: u32,
    width: u32,
    height: u32,
}

/// Search state: the encode counter plus the one buffer worth keeping.
///
/// At most one candidate is retained. A fitting candidate displaces anything
/// kept before it; a non-fitting one is kept only while nothing fits and it
/// is smaller than what is already held.
struct Search<'a, C: ImageCodec> {
    codec: &'a C,
    spec: FormatSpec,
    attempts: u32,
    kept: Option<Candidate>,
    kept_fits: bool,
}

impl<C: ImageCodec> Search<'_, C> {
    fn encode(&mut self, image: &C::Image, quality: u32) -> Result<Candidate, PipelineError> {
        let spec = self.spec.with_quality(Quality::new(quality));
        let bytes = self.codec.encode(image, &spec)?;
        self.attempts += 1;
        let (width, height) = self.codec.dimensions(image);
        debug!(quality, width, height, size = bytes.len(), "budget candidate");
        Ok(Candidate {
            bytes,
            quality,
            width,
            height,
        })
    }

    /// Offer a candidate that fits the search target. Later fits come from a
    /// higher quality, so they always win.
    fn keep_fitting(&mut self, candidate: Candidate) {
        self.kept = Some(candidate);
        self.kept_fits = true;
    }

    /// Offer a candidate over the target.
    fn keep_if_smaller(&mut self, candidate: Candidate) {
        if self.kept_fits {
            return;
        }
        let smaller = self
            .kept
            .as_ref()
            .is_none_or(|k| candidate.bytes.len() < k.bytes.len());
        if smaller {
            self.kept = Some(candidate);
        }
    }

    fn finish(self, candidate: Candidate, strategy: Strategy, budget: u64) -> BudgetOutcome {
        BudgetOutcome {
            met_budget: candidate.bytes.len() as u64 <= budget,
            bytes: candidate.bytes,
            format: self.spec.target,
            quality: candidate.quality,
            width: candidate.width,
            height: candidate.height,
            budget,
            strategy,
            attempts: self.attempts,
        }
    }
}

/// Compress `bytes` into `format` within `budget` bytes, best effort.
pub fn compress_to_budget<C: ImageCodec>(
    codec: &C,
    bytes: &[u8],
    format: OutputFormat,
    budget: u64,
) -> Result<BudgetOutcome, PipelineError> {
    if budget == 0 {
        return Err(PipelineError::Input("budget must be greater than zero".into()));
    }

    let (image, info) = codec.decode(bytes)?;
    let spec = resolve_format(format, Quality::new(DEFAULT_QUALITY), &info.hints());
    // Orientation, colorspace and flatten once; every candidate starts from here.
    let (base, _) = render(codec, image, &info, &TransformOps::default(), &spec)?;

    let mut search = Search {
        codec,
        spec,
        attempts: 0,
        kept: None,
        kept_fits: false,
    };

    let first = search.encode(&base, DEFAULT_QUALITY)?;
    if first.bytes.len() as u64 <= budget {
        return Ok(search.finish(first, Strategy::Default, budget));
    }
    search.keep_if_smaller(first);

    let target = budget_target(budget);
    let original = codec.dimensions(&base);

    let shrunk = prepass_scale(original, budget).map(|scale| {
        let (w, h) = scale_dimensions(original, scale);
        debug!(scale, width = w, height = h, "budget geometry pre-pass");
        codec.resize(&base, w, h)
    });
    let working = shrunk.as_ref().unwrap_or(&base);

    quality_search(&mut search, working, target)?;
    if search.kept_fits {
        if let Some(best) = search.kept.take() {
            return Ok(search.finish(best, Strategy::QualitySearch, budget));
        }
    }
    drop(shrunk);

    for scale in fallback_scales() {
        let (w, h) = scale_dimensions(original, scale);
        let scaled = codec.resize(&base, w, h);
        let candidate = search.encode(&scaled, FALLBACK_QUALITY)?;
        if candidate.bytes.len() as u64 <= target {
            return Ok(search.finish(candidate, Strategy::ScaleFallback, budget));
        }
        search.keep_if_smaller(candidate);
    }

    match search.kept.take() {
        Some(smallest) => Ok(search.finish(smallest, Strategy::Smallest, budget)),
        // The default encode always produces a candidate.
        None => Err(PipelineError::Input("no candidate produced".into())),
    }
}

/// Largest quality in `[1, 95]` whose encode fits `target`, left in
/// `search.kept` with `kept_fits` set.
///
/// Formats whose size the codec does not tie to quality get a single encode.
fn quality_search<C: ImageCodec>(
    search: &mut Search<'_, C>,
    image: &C::Image,
    target: u64,
) -> Result<(), PipelineError> {
    if !search.codec.quality_sensitive(search.spec.target) {
        let candidate = search.encode(image, SEARCH_MAX)?;
        if candidate.bytes.len() as u64 <= target {
            search.keep_fitting(candidate);
        } else {
            search.keep_if_smaller(candidate);
        }
        return Ok(());
    }

    let (mut lo, mut hi) = (SEARCH_MIN, SEARCH_MAX);
    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        let candidate = search.encode(image, mid)?;
        if candidate.bytes.len() as u64 <= target {
            search.keep_fitting(candidate);
            lo = mid + 1;
        } else {
            search.keep_if_smaller(candidate);
            hi = mid - 1;
        }
    }
    Ok(())
}
