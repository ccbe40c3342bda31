//! Native stack capture.
//!
//! Walks `std::backtrace::Backtrace` output into structured frames. Frame
//! symbols carry no parameter or local information in Rust, so frames hold
//! location data only; the synthesized fault tree stands in for locals.

use std::backtrace::Backtrace;

use once_cell::sync::Lazy;
use regex::Regex;
use sentinel_types::StackFrame;

/// Symbol fragments that mark backtrace/agent infrastructure frames.
const INFRASTRUCTURE_MARKERS: &[&str] = &[
    "std::backtrace",
    "backtrace::backtrace",
    "sentinel_agent::capture::stack",
    "__rust_begin_short_backtrace",
    "__rust_end_short_backtrace",
];

/// `   0: crate::module::function`
static FRAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\d+:\s+(.+?)\s*$").unwrap());

/// `             at ./src/main.rs:10:3`
static LOCATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*at\s+(.+?):(\d+)(?::(\d+))?\s*$").unwrap());

/// Trailing symbol hash, e.g. `::hb2f7b6f00b1f7e3a`
static HASH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"::h[0-9a-f]{16}$").unwrap());

/// Capture the current call stack as ordered frames, innermost first.
///
/// `skip_prefixes` drops additional frames by symbol prefix so callers can
/// hide their own capture plumbing.
pub fn capture_frames(skip_prefixes: &[&str]) -> Vec<StackFrame> {
    let backtrace = Backtrace::force_capture();
    parse_backtrace(&backtrace.to_string(), skip_prefixes)
}

/// Parse the display form of a backtrace into structured frames.
fn parse_backtrace(rendered: &str, skip_prefixes: &[&str]) -> Vec<StackFrame> {
    let mut frames = Vec::new();

    for line in rendered.lines() {
        if let Some(caps) = FRAME_RE.captures(line) {
            let symbol = caps[1].to_string();
            if is_skipped(&symbol, skip_prefixes) {
                frames.push(None);
                continue;
            }
            frames.push(Some(frame_from_symbol(&symbol)));
        } else if let Some(caps) = LOCATION_RE.captures(line) {
            // Location lines attach to the frame line directly above them.
            if let Some(Some(frame)) = frames.last_mut() {
                let path = caps[1].to_string();
                frame.file_name = path.rsplit('/').next().map(str::to_string);
                frame.line = caps[2].parse().unwrap_or(0);
                frame.column = caps
                    .get(3)
                    .and_then(|c| c.as_str().parse().ok())
                    .unwrap_or(0);
                frame.is_native = path.starts_with("/rustc/");
                frame.file_path = Some(path);
            }
        }
    }

    frames.into_iter().flatten().collect()
}

fn is_skipped(symbol: &str, skip_prefixes: &[&str]) -> bool {
    INFRASTRUCTURE_MARKERS.iter().any(|m| symbol.contains(m))
        || skip_prefixes.iter().any(|p| symbol.starts_with(p))
}

fn frame_from_symbol(symbol: &str) -> StackFrame {
    let demangled = HASH_RE.replace(symbol, "").to_string();
    let (class_name, method_name) = match demangled.rfind("::") {
        Some(idx) => (
            Some(demangled[..idx].to_string()),
            demangled[idx + 2..].to_string(),
        ),
        None => (None, demangled),
    };

    StackFrame {
        class_name,
        method_name: Some(method_name),
        file_path: None,
        file_name: None,
        line: 0,
        column: 0,
        // Overwritten when a location line follows; symbol-only frames stay native.
        is_native: true,
        local_variables: None,
    }
}
