//! Stack capture and frame extraction.
//!
//! A capture surface hands the pipeline a [`RawStack`]: the exception
//! type and message plus bare (function, file, line) frames, usually
//! resolved from a [`backtrace::Backtrace`] taken inside the panic
//! hook. The [`FrameExtractor`] turns that into a [`StackSnapshot`]
//! with source context windows and recorded local variables. Extraction
//! degrades per frame, never failing a capture because one source file
//! is missing or unreadable.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::locals::{self, LocalScope};

/// Context lines shown before the failing line
pub const CONTEXT_BEFORE: usize = 2;

/// Context lines shown after the failing line
pub const CONTEXT_AFTER: usize = 2;

// ============================================================================
// Raw capture
// ============================================================================

/// A bare frame as resolved from the host runtime
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub function: Option<String>,
    pub file: Option<PathBuf>,
    pub line: Option<u32>,
}

/// A captured stack before extraction, oldest call first
#[derive(Debug, Clone)]
pub struct RawStack {
    /// Exception type name (`panic`, or the error's Rust type name)
    pub exception_type: String,
    /// Exception message
    pub message: String,
    /// Frames, oldest call first
    pub frames: Vec<RawFrame>,
    /// Locals scopes live at capture time
    pub scopes: Vec<LocalScope>,
    /// Chained cause, for error sources
    pub cause: Option<Box<RawStack>>,
}

impl RawStack {
    /// Create an empty raw stack (synthetic captures and tests)
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception_type: exception_type.into(),
            message: message.into(),
            frames: Vec::new(),
            scopes: Vec::new(),
            cause: None,
        }
    }

    /// Add a frame at the innermost position
    pub fn push_frame(&mut self, frame: RawFrame) {
        self.frames.push(frame);
    }

    /// Resolve a live backtrace into frames, pruning panic plumbing and
    /// runtime scaffolding.
    pub fn from_backtrace(
        exception_type: impl Into<String>,
        message: impl Into<String>,
        backtrace: &backtrace::Backtrace,
    ) -> Self {
        let mut raw = Self::new(exception_type, message);
        raw.frames = resolve_frames(backtrace);
        raw
    }
}

/// Resolve a backtrace into bare frames, oldest call first, with panic
/// plumbing and runtime scaffolding pruned.
pub fn resolve_frames(backtrace: &backtrace::Backtrace) -> Vec<RawFrame> {
    // backtrace yields innermost first; collect then reverse
    let mut frames = Vec::new();
    for frame in backtrace.frames() {
        for symbol in frame.symbols() {
            let name = symbol.name().map(|n| clean_symbol(&n.to_string()));
            if name.as_deref().map(is_plumbing).unwrap_or(true) {
                continue;
            }
            frames.push(RawFrame {
                function: name,
                file: symbol.filename().map(Path::to_path_buf),
                line: symbol.lineno(),
            });
        }
    }
    frames.reverse();
    frames
}

/// Strip the trailing `::h0123abcd...` disambiguation hash from a
/// demangled symbol name.
fn clean_symbol(name: &str) -> String {
    if let Some(pos) = name.rfind("::h") {
        let hash = &name[pos + 3..];
        if hash.len() == 16 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return name[..pos].to_string();
        }
    }
    name.to_string()
}

/// Panic machinery and runtime scaffolding that never belongs in a report
fn is_plumbing(name: &str) -> bool {
    const PREFIXES: &[&str] = &[
        "oops::",
        "backtrace::",
        "std::panicking",
        "core::panicking",
        "std::panic::",
        "std::rt::",
        "std::sys",
        "core::ops::function",
        "alloc::boxed",
        "test::",
    ];
    const EXACT: &[&str] = &[
        "rust_begin_unwind",
        "__rust_try",
        "__libc_start_main",
        "__libc_start_call_main",
        "_start",
        "main",
    ];

    PREFIXES.iter().any(|p| name.starts_with(p))
        || EXACT.iter().any(|e| name == *e)
        || name.contains("__rust_begin_short_backtrace")
        || name.contains("__rust_end_short_backtrace")
        || name.contains("rust_panic")
}

/// Whether a source path belongs to the application rather than the
/// toolchain or a registry dependency.
pub fn is_app_path(path: &Path) -> bool {
    let text = path.to_string_lossy();
    !(text.contains("/rustc/")
        || text.contains(".cargo/registry")
        || text.contains(".cargo\\registry")
        || text.contains("/toolchains/"))
}

// ============================================================================
// Extracted snapshot
// ============================================================================

/// One frame of an extracted snapshot. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct FrameRecord {
    /// Function name (if resolved)
    pub function: Option<String>,
    /// Source file path (if resolved)
    pub file: Option<PathBuf>,
    /// Failing line within the file (if resolved)
    pub line: Option<u32>,
    /// (line number, text) window around the failing line
    pub context: Vec<(u32, String)>,
    /// Recorded local variables, name -> rendered value
    pub locals: BTreeMap<String, String>,
    /// Whether this frame is application code (vs toolchain/registry)
    pub is_app_code: bool,
}

impl FrameRecord {
    pub fn new() -> Self {
        Self {
            function: None,
            file: None,
            line: None,
            context: Vec::new(),
            locals: BTreeMap::new(),
            is_app_code: true,
        }
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_context(mut self, context: Vec<(u32, String)>) -> Self {
        self.context = context;
        self
    }

    pub fn with_local(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.locals.insert(name.into(), value.into());
        self
    }

    /// Text of the failing line, when the context window contains it
    pub fn failing_line_text(&self) -> Option<&str> {
        let line = self.line?;
        self.context
            .iter()
            .find(|(n, _)| *n == line)
            .map(|(_, text)| text.as_str())
    }
}

impl Default for FrameRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FrameRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{})",
            self.function.as_deref().unwrap_or("<unknown>"),
            self.file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<unknown>".to_string()),
            self.line.map(|l| l.to_string()).unwrap_or_default(),
        )
    }
}

/// An extracted stack, oldest call first. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct StackSnapshot {
    pub exception_type: String,
    pub message: String,
    pub frames: Vec<FrameRecord>,
    /// Chained cause, for `Error::source` chains
    pub cause: Option<Box<StackSnapshot>>,
}

impl StackSnapshot {
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception_type: exception_type.into(),
            message: message.into(),
            frames: Vec::new(),
            cause: None,
        }
    }

    pub fn add_frame(&mut self, frame: FrameRecord) {
        self.frames.push(frame);
    }

    /// The most relevant frame: innermost application frame, or the
    /// innermost frame when none is application code.
    pub fn failing_frame(&self) -> Option<&FrameRecord> {
        self.frames
            .iter()
            .rev()
            .find(|f| f.is_app_code && f.line.is_some())
            .or_else(|| self.frames.last())
    }

    /// Size-bounded textual rendering of frames for provider prompts,
    /// innermost first so the most relevant code survives the cap.
    pub fn frames_text(&self, max_chars: usize) -> String {
        let mut text = String::new();
        for frame in self.frames.iter().rev() {
            if text.len() >= max_chars {
                break;
            }

            let mut block = String::new();
            block.push_str(&format!("--- {} ---\n", frame));
            for (line_no, line_text) in &frame.context {
                let marker = if Some(*line_no) == frame.line { ">" } else { " " };
                block.push_str(&format!("{} {:4} | {}\n", marker, line_no, line_text));
            }
            if !frame.locals.is_empty() {
                block.push_str("locals:\n");
                for (name, value) in &frame.locals {
                    block.push_str(&format!("  {} = {}\n", name, value));
                }
            }
            block.push('\n');

            if text.len() + block.len() > max_chars {
                break;
            }
            text.push_str(&block);
        }
        text
    }
}

// ============================================================================
// Frame extraction
// ============================================================================

/// Builds [`StackSnapshot`]s from raw captures.
///
/// Holds a per-capture source cache so a file appearing in several
/// frames is read once. Construct one extractor per capture.
pub struct FrameExtractor {
    show_locals: bool,
    context_before: usize,
    context_after: usize,
    source_cache: HashMap<PathBuf, Option<Vec<String>>>,
}

impl FrameExtractor {
    pub fn new(show_locals: bool) -> Self {
        Self {
            show_locals,
            context_before: CONTEXT_BEFORE,
            context_after: CONTEXT_AFTER,
            source_cache: HashMap::new(),
        }
    }

    /// Extract a snapshot. Missing or unreadable source files produce
    /// frames with an empty context window; nothing here fails the
    /// capture.
    pub fn extract(&mut self, raw: &RawStack) -> StackSnapshot {
        let mut snapshot = StackSnapshot::new(raw.exception_type.clone(), raw.message.clone());

        for raw_frame in &raw.frames {
            let mut frame = FrameRecord::new();
            frame.function = raw_frame.function.clone();
            frame.file = raw_frame.file.clone();
            frame.line = raw_frame.line;
            frame.is_app_code = raw_frame
                .file
                .as_deref()
                .map(is_app_path)
                .unwrap_or(false);

            if let (Some(file), Some(line)) = (raw_frame.file.as_deref(), raw_frame.line) {
                frame.context = self.context_window(file, line);
            }

            snapshot.add_frame(frame);
        }

        if self.show_locals {
            attach_scopes(&mut snapshot, &raw.scopes);
        }

        if let Some(cause) = &raw.cause {
            snapshot.cause = Some(Box::new(self.extract(cause)));
        }

        snapshot
    }

    /// Slice the context window around a line, clamped at file
    /// boundaries.
    fn context_window(&mut self, file: &Path, line: u32) -> Vec<(u32, String)> {
        let (before, after) = (self.context_before, self.context_after);
        let Some(lines) = self.source_lines(file) else {
            return Vec::new();
        };

        let line_idx = line.saturating_sub(1) as usize;
        if line_idx >= lines.len() {
            return Vec::new();
        }

        let start = line_idx.saturating_sub(before);
        let end = (line_idx + after + 1).min(lines.len());

        lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, text)| ((start + i + 1) as u32, text.clone()))
            .collect()
    }

    /// Read and cache a source file. Non-UTF-8 content decodes lossily;
    /// unreadable files cache as `None` so they are not retried within
    /// this capture.
    fn source_lines(&mut self, file: &Path) -> Option<&Vec<String>> {
        if !self.source_cache.contains_key(file) {
            let lines = std::fs::read(file).ok().map(|bytes| {
                let (text, _, _) = encoding_rs::UTF_8.decode(&bytes);
                text.lines().map(|l| l.trim_end().to_string()).collect()
            });
            self.source_cache.insert(file.to_path_buf(), lines);
        }
        self.source_cache.get(file).and_then(|v| v.as_ref())
    }
}

/// Attach recorded locals scopes to frames. A scope binds to the
/// innermost frame from the same source file; scopes with no matching
/// frame fall back to the failing frame.
fn attach_scopes(snapshot: &mut StackSnapshot, scopes: &[LocalScope]) {
    let fallback = snapshot
        .frames
        .iter()
        .rposition(|f| f.is_app_code && f.line.is_some())
        .or_else(|| snapshot.frames.len().checked_sub(1));

    for scope in scopes {
        let matched = snapshot
            .frames
            .iter()
            .rposition(|f| {
                f.file
                    .as_deref()
                    .map(|p| p.ends_with(Path::new(&scope.file)))
                    .unwrap_or(false)
            })
            .or(fallback);

        if let Some(index) = matched {
            let frame = &mut snapshot.frames[index];
            for (name, value) in &scope.entries {
                frame.locals.insert(name.clone(), value.clone());
            }
        }
    }
}

/// Build a raw stack from a caught error value, walking its source
/// chain into nested causes. The caller supplies the reported type
/// name (generics carry it; trait objects erase it).
pub fn raw_stack_from_error(
    exception_type: &str,
    error: &(dyn std::error::Error + 'static),
) -> RawStack {
    fn cause_chain(error: &(dyn std::error::Error + 'static)) -> Option<Box<RawStack>> {
        error.source().map(|source| {
            let mut cause = RawStack::new("error", source.to_string());
            cause.cause = cause_chain(source);
            Box::new(cause)
        })
    }

    let mut raw = RawStack::new(exception_type, error.to_string());
    raw.scopes = locals::capture_live();
    raw.cause = cause_chain(error);
    raw
}

/// Short type name: last path segment of `std::any::type_name` output,
/// generics preserved.
pub fn short_type_name(full: &str) -> &str {
    let head = full.split('<').next().unwrap_or(full);
    match head.rfind("::") {
        Some(pos) => &full[pos + 2..],
        None => full,
    }
}
