//! CLI output formatting.
//!
//! # Asset-First Display
//!
//! Every derived asset is shown as a header line (progress index + source
//! path) followed by indented context lines: the asset id with its cache
//! status, then one line per variant. Failures use the same header with an
//! `Error:` line, so a failed asset reads like any other.
//!
//! ## Derive
//!
//! ```text
//! [001/002] photos/dawn.jpg
//!     Asset: 3f2a9c0d1e2b4a5c (derived)
//!     medium: 1774x1183 image/jpeg, 256.4 KiB → 3f2a9c0d1e2b4a5c/medium/….jpg
//!     preview: 79x53 image/jpeg, 523 B inline
//! [002/002] photos/broken.jpg
//!     Error: Image could not be added to cache: …
//! ```
//!
//! With `--verbose`, pipeline events are shown as they happen:
//!
//! ```text
//! 3f2a9c0d1e2b4a5c: 3000x2000 image/jpeg, normal profile (2 variants)
//! 3f2a9c0d1e2b4a5c/medium: decoding
//! ```
//!
//! ## Inspect
//!
//! ```text
//! photos/dawn.jpg
//!     Format: image/jpeg
//!     Stored: 2000x3000 (orientation 6)
//!     Display: 3000x2000
//!     preview: scale to 79x53, decode 1/32 (≈ 40.0 KiB)
//!     medium: scale to 1774x1183, decode 1/1 (≈ 30.9 MiB)
//! ```
//!
//! # Architecture
//!
//! Each display has a `format_*` function (returns `Vec<String>`) for
//! testability and, where the CLI needs one, a `print_*` wrapper that writes
//! to stdout. Format functions are pure: no I/O, no side effects.

use crate::derive::{AssetStatus, DeriveEvent};
use crate::options::CompressionOptions;
use crate::pipeline::PipelineEvent;
use crate::sizing::{VariantPlan, plan_variant};
use crate::types::{SourceMetadata, VariantResult};

// ============================================================================
// Shared helpers
// ============================================================================

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// Format a 1-based progress counter, zero-padded to three digits.
fn progress(index: usize, total: usize) -> String {
    format!("[{:0>3}/{:0>3}]", index + 1, total)
}

/// Human-readable byte count.
///
/// ```text
/// 523 B
/// 256.4 KiB
/// 30.9 MiB
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    let b = bytes as f64;
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if b < MIB {
        format!("{:.1} KiB", b / KIB)
    } else {
        format!("{:.1} MiB", b / MIB)
    }
}

/// One variant line: tag, size, mime, byte length and where it lives.
fn variant_line(variant: &VariantResult) -> String {
    let location = match &variant.storage {
        Some(handle) => format!("\u{2192} {}", handle.key),
        None => "inline".to_string(),
    };
    format!(
        "{}: {}x{} {}, {} {}",
        variant.tag,
        variant.width,
        variant.height,
        variant.mime,
        format_bytes(variant.byte_length),
        location
    )
}

// ============================================================================
// Derive
// ============================================================================

/// Format one batch event. Forwarded pipeline events produce no lines here;
/// see [`format_pipeline_event`].
pub fn format_derive_event(event: &DeriveEvent) -> Vec<String> {
    match event {
        DeriveEvent::Pipeline(_) => Vec::new(),
        DeriveEvent::AssetFinished {
            index,
            total,
            source,
            status,
            set,
        } => {
            let status = match status {
                AssetStatus::Cached => "cached",
                AssetStatus::Derived => "derived",
            };
            let mut lines = vec![
                format!("{} {}", progress(*index, *total), source),
                format!("{}Asset: {} ({})", indent(1), set.asset_id, status),
            ];
            lines.extend(
                set.variants
                    .iter()
                    .map(|v| format!("{}{}", indent(1), variant_line(v))),
            );
            lines
        }
        DeriveEvent::AssetFailed {
            index,
            total,
            source,
            error,
        } => vec![
            format!("{} {}", progress(*index, *total), source),
            format!("{}Error: {}", indent(1), error),
        ],
    }
}

/// Verbose progress line for a pipeline event.
pub fn format_pipeline_event(event: &PipelineEvent) -> Vec<String> {
    match event {
        PipelineEvent::ProfileStarted {
            asset_id,
            profile,
            metadata,
            variants,
        } => {
            let (w, h) = metadata.display_dimensions();
            vec![format!(
                "{}: {}x{} {}, {} profile ({} variants)",
                asset_id,
                w,
                h,
                metadata.mime,
                profile.as_str(),
                variants
            )]
        }
        PipelineEvent::StageChanged {
            asset_id,
            tag,
            stage,
        } => vec![format!("{}/{}: {}", asset_id, tag, stage)],
        PipelineEvent::VariantStarted { .. } | PipelineEvent::VariantFinished { .. } => Vec::new(),
    }
}

// ============================================================================
// Inspect
// ============================================================================

/// Format what the pipeline would do with a source, without decoding it.
///
/// `native_subsample` is the codec's answer for the source mime; it decides
/// the reservation shown per variant.
pub fn format_inspect(
    source: &str,
    metadata: &SourceMetadata,
    options: &[CompressionOptions],
    native_subsample: bool,
) -> Vec<String> {
    let (dw, dh) = metadata.display_dimensions();
    let mut lines = vec![
        source.to_string(),
        format!("{}Format: {}", indent(1), metadata.mime),
    ];
    if metadata.has_orientation_transform() {
        lines.push(format!(
            "{}Stored: {}x{} (orientation {})",
            indent(1),
            metadata.width,
            metadata.height,
            metadata.orientation.to_exif()
        ));
    }
    lines.push(format!("{}Display: {}x{}", indent(1), dw, dh));

    for opts in options {
        let plan = match plan_variant(metadata, opts, native_subsample) {
            VariantPlan::PassThrough => "pass through".to_string(),
            VariantPlan::Scale(target) => format!(
                "{} to {}x{}, decode 1/{} (\u{2248} {})",
                if opts.crop_to_square { "crop" } else { "scale" },
                target.width,
                target.height,
                target.subsample,
                format_bytes(target.decode_bytes)
            ),
        };
        lines.push(format!("{}{}: {}", indent(1), opts.tag, plan));
    }
    lines
}

pub fn print_inspect(
    source: &str,
    metadata: &SourceMetadata,
    options: &[CompressionOptions],
    native_subsample: bool,
) {
    for line in format_inspect(source, metadata, options, native_subsample) {
        println!("{}", line);
    }
}
