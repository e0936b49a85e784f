//! CLI output formatting for the one-shot commands.
//!
//! # Output Format
//!
//! ## Convert
//!
//! ```text
//! photo.jpg → photo.webp
//!     Output: webp, 3000x2000
//!     Size: 1.2 MB → 340.5 KB (28.4%)
//!     Steps: encode webp q80
//!     Time: 120 ms
//! ```
//!
//! ## Compress to a budget
//!
//! ```text
//! photo.jpg → photo.jpg
//!     Budget: 200.0 KB (met)
//!     Result: 195.3 KB, jpeg q72, 1485x990
//!     Strategy: quality search, 8 encodes
//! ```
//!
//! ## Batch
//!
//! ```text
//! Converted 2 of 3 images to webp
//! 001 a.jpg → a_1.webp (12.0 KB, 40x30)
//! 002 b.jpg failed: Unrecognized image data
//! 003 c.png → c_3.webp (3.1 KB, 20x20)
//! ```
//!
//! Each report has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout.

use crate::imaging::budget::Strategy;
use crate::imaging::pipeline::Step;
use crate::service::{BatchReport, BudgetReport, FormatInfo, TransformReport};
use std::path::Path;

// ============================================================================
// Shared helpers
// ============================================================================

/// Format a 1-based positional index as a zero-padded 3-digit string.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KB {
        format!("{bytes} B")
    } else if b < KB * KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{:.1} MB", b / (KB * KB))
    }
}

fn describe_step(step: &Step) -> String {
    match *step {
        Step::AutoOrient { orientation } => format!("orient ({orientation})"),
        Step::ConvertToSrgb => "srgb".into(),
        Step::Flatten => "flatten".into(),
        Step::Crop {
            x,
            y,
            width,
            height,
        } => format!("crop {width}x{height}+{x}+{y}"),
        Step::Resize { width, height } => format!("resize {width}x{height}"),
        Step::CenterCrop { width, height } => format!("center-crop {width}x{height}"),
        Step::Pad { width, height } => format!("pad {width}x{height}"),
        Step::Sharpen { sigma } => format!("sharpen {sigma}"),
        Step::Rotate { degrees } => format!("rotate {degrees}"),
        Step::Flip { horizontal: true } => "flip-h".into(),
        Step::Flip { horizontal: false } => "flip-v".into(),
        Step::Adjust => "adjust".into(),
        Step::ForcedCanvas { width, height } => format!("canvas {width}x{height}"),
        Step::Encode { format, quality } => format!("encode {format} q{quality}"),
    }
}

fn describe_strategy(strategy: Strategy) -> &'static str {
    match strategy {
        Strategy::Default => "default quality",
        Strategy::QualitySearch => "quality search",
        Strategy::ScaleFallback => "downscale",
        Strategy::Smallest => "smallest result",
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// ============================================================================
// Reports
// ============================================================================

pub fn format_transform_report(source: &str, report: &TransformReport, dest: &Path) -> Vec<String> {
    let out = &report.output;
    let stats = &report.stats;
    let steps: Vec<String> = out.steps.iter().map(describe_step).collect();
    vec![
        format!("{source} → {}", display_name(dest)),
        format!("    Output: {}, {}x{}", out.format, out.width, out.height),
        format!(
            "    Size: {} → {} ({:.1}%)",
            format_size(stats.original_size),
            format_size(stats.converted_size),
            stats.compression_ratio * 100.0
        ),
        format!("    Steps: {}", steps.join(", ")),
        format!("    Time: {} ms", stats.elapsed_ms),
    ]
}

pub fn print_transform_report(source: &str, report: &TransformReport, dest: &Path) {
    for line in format_transform_report(source, report, dest) {
        println!("{line}");
    }
}

pub fn format_budget_report(source: &str, report: &BudgetReport, dest: &Path) -> Vec<String> {
    let outcome = &report.outcome;
    let verdict = if outcome.met_budget { "met" } else { "not met" };
    vec![
        format!("{source} → {}", display_name(dest)),
        format!("    Budget: {} ({verdict})", format_size(outcome.budget)),
        format!(
            "    Result: {}, {} q{}, {}x{}",
            format_size(outcome.bytes.len() as u64),
            outcome.format,
            outcome.quality,
            outcome.width,
            outcome.height
        ),
        format!(
            "    Strategy: {}, {} encodes",
            describe_strategy(outcome.strategy),
            outcome.attempts
        ),
        format!("    Time: {} ms", report.stats.elapsed_ms),
    ]
}

pub fn print_budget_report(source: &str, report: &BudgetReport, dest: &Path) {
    for line in format_budget_report(source, report, dest) {
        println!("{line}");
    }
}

pub fn format_batch_report(report: &BatchReport) -> Vec<String> {
    let mut lines = vec![format!(
        "Converted {} of {} images to {}",
        report.succeeded,
        report.entries.len(),
        report.format
    )];
    for entry in &report.entries {
        let index = format_index(entry.index + 1);
        match &entry.result {
            Ok(item) => lines.push(format!(
                "{index} {} → {} ({}, {}x{})",
                entry.source_name,
                item.filename,
                format_size(item.bytes.len() as u64),
                item.width,
                item.height
            )),
            Err(error) => lines.push(format!("{index} {} failed: {error}", entry.source_name)),
        }
    }
    lines
}

pub fn print_batch_report(report: &BatchReport) {
    for line in format_batch_report(report) {
        println!("{line}");
    }
}

pub fn format_formats(formats: &[FormatInfo]) -> Vec<String> {
    let mut lines = vec!["Supported formats".to_string()];
    for f in formats {
        let mut traits = Vec::new();
        if f.lossy {
            traits.push("lossy");
        }
        if f.alpha {
            traits.push("alpha");
        }
        lines.push(format!(
            "    {:<5} {:<14} .{:<5} {}",
            f.name,
            f.mime,
            f.extension,
            traits.join(", ")
        )
        .trim_end()
        .to_string());
    }
    lines
}

pub fn print_formats(formats: &[FormatInfo]) {
    for line in format_formats(formats) {
        println!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::budget::BudgetOutcome;
    use crate::imaging::formats::OutputFormat;
    use crate::imaging::pipeline::TransformOutput;
    use crate::service::{BatchConverted, BatchEntry, TransformStats};

    fn stats(original: u64, converted: u64) -> TransformStats {
        TransformStats {
            original_size: original,
            converted_size: converted,
            compression_ratio: converted as f64 / original as f64,
            elapsed_ms: 12,
        }
    }

    #[test]
    fn format_index_pads() {
        assert_eq!(format_index(1), "001");
        assert_eq!(format_index(42), "042");
    }

    #[test]
    fn sizes_pick_a_unit() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024 / 2), "1.5 MB");
    }

    #[test]
    fn transform_report_lists_steps_in_order() {
        let report = TransformReport {
            output: TransformOutput {
                bytes: vec![0; 10],
                width: 800,
                height: 600,
                format: OutputFormat::WebP,
                mime: "image/webp",
                extension: "webp",
                steps: vec![
                    Step::Resize {
                        width: 800,
                        height: 600,
                    },
                    Step::Sharpen { sigma: 0.5 },
                    Step::Encode {
                        format: OutputFormat::WebP,
                        quality: 80,
                    },
                ],
                orientation: None,
            },
            filename: "photo.webp".into(),
            stats: stats(4096, 1024),
        };

        let lines = format_transform_report("photo.jpg", &report, Path::new("/out/photo.webp"));

        assert_eq!(lines[0], "photo.jpg → photo.webp");
        assert_eq!(lines[1], "    Output: webp, 800x600");
        assert_eq!(lines[2], "    Size: 4.0 KB → 1.0 KB (25.0%)");
        assert_eq!(lines[3], "    Steps: resize 800x600, sharpen 0.5, encode webp q80");
    }

    #[test]
    fn budget_report_flags_unmet_budget() {
        let report = BudgetReport {
            outcome: BudgetOutcome {
                bytes: vec![0; 300],
                format: OutputFormat::Jpeg,
                quality: 40,
                width: 30,
                height: 20,
                budget: 20,
                met_budget: false,
                strategy: Strategy::Smallest,
                attempts: 16,
            },
            filename: "a.jpg".into(),
            stats: stats(1000, 300),
        };

        let lines = format_budget_report("a.jpg", &report, Path::new("a-small.jpg"));

        assert_eq!(lines[1], "    Budget: 20 B (not met)");
        assert_eq!(lines[2], "    Result: 300 B, jpeg q40, 30x20");
        assert_eq!(lines[3], "    Strategy: smallest result, 16 encodes");
    }

    #[test]
    fn batch_report_shows_failures_inline() {
        let report = BatchReport {
            format: OutputFormat::Png,
            entries: vec![
                BatchEntry {
                    index: 0,
                    source_name: "a.jpg".into(),
                    result: Ok(BatchConverted {
                        filename: "a_1.png".into(),
                        bytes: vec![0; 2048],
                        mime: "image/png",
                        width: 4,
                        height: 3,
                    }),
                },
                BatchEntry {
                    index: 1,
                    source_name: "b.jpg".into(),
                    result: Err("Unrecognized image data".into()),
                },
            ],
            succeeded: 1,
            failed: 1,
            elapsed_ms: 5,
        };

        let lines = format_batch_report(&report);

        assert_eq!(lines[0], "Converted 1 of 2 images to png");
        assert_eq!(lines[1], "001 a.jpg → a_1.png (2.0 KB, 4x3)");
        assert_eq!(lines[2], "002 b.jpg failed: Unrecognized image data");
    }

    #[test]
    fn format_list_marks_traits() {
        let lines = format_formats(&crate::service::formats());
        assert_eq!(lines[0], "Supported formats");
        assert_eq!(lines.len(), 12);
        let webp = lines.iter().find(|l| l.trim_start().starts_with("webp")).unwrap();
        assert!(webp.ends_with("lossy, alpha"));
        let bmp = lines.iter().find(|l| l.trim_start().starts_with("bmp")).unwrap();
        assert!(bmp.ends_with(".bmp"));
    }
}
