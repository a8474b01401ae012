//! Report rendering and output sinks.
//!
//! Rendering is pure: given the same snapshot, analysis, and
//! configuration it produces the same bytes, and it performs no I/O,
//! fingerprinting, or caching of its own. Every emitted chunk carries
//! a minimum verbosity; the sink decides what to keep, so one render
//! pass serves every tier.

use colored::Colorize;
use std::sync::Mutex;

use crate::analysis::{Analysis, AnalysisResult};
use crate::config::{Config, Verbosity};
use crate::stack_trace::{FrameRecord, StackSnapshot};

const RULE_WIDTH: usize = 80;

/// Capability: accept a chunk of report text at a minimum verbosity.
///
/// Implementable by any output target: console, file, or an in-memory
/// buffer for tests.
pub trait Sink: Send + Sync {
    fn accept(&self, text: &str, min_verbosity: Verbosity);
}

/// Writes to stderr, keeping chunks at or below its verbosity
pub struct ConsoleSink {
    verbosity: Verbosity,
}

impl ConsoleSink {
    pub fn new(verbosity: Verbosity) -> Self {
        Self { verbosity }
    }
}

impl Sink for ConsoleSink {
    fn accept(&self, text: &str, min_verbosity: Verbosity) {
        if self.verbosity >= min_verbosity {
            eprint!("{}", text);
        }
    }
}

/// Collects report text in memory. Used by tests and embedders that
/// forward reports elsewhere.
pub struct BufferSink {
    verbosity: Verbosity,
    buffer: Mutex<String>,
}

impl BufferSink {
    pub fn new(verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            buffer: Mutex::new(String::new()),
        }
    }

    pub fn contents(&self) -> String {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Sink for BufferSink {
    fn accept(&self, text: &str, min_verbosity: Verbosity) {
        if self.verbosity >= min_verbosity {
            self.buffer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_str(text);
        }
    }
}

/// Formats snapshots and analyses into the final report
pub struct Renderer {
    show_locals: bool,
}

impl Renderer {
    pub fn new(config: &Config) -> Self {
        Self {
            show_locals: config.show_locals,
        }
    }

    /// Render one report into the sink.
    ///
    /// Tier contents: minimal shows the header and the failing line;
    /// normal adds the frame list and cause chain; detailed adds local
    /// variables and analysis timing.
    pub fn render(&self, snapshot: &StackSnapshot, analysis: &Analysis, sink: &dyn Sink) {
        self.render_header(snapshot, sink);
        self.render_failing_line(snapshot, sink);
        self.render_frames(snapshot, sink);
        self.render_causes(snapshot, sink);
        self.render_analysis(analysis, sink);
        self.render_footer(sink);
    }

    fn render_header(&self, snapshot: &StackSnapshot, sink: &dyn Sink) {
        let rule = "=".repeat(RULE_WIDTH);
        sink.accept(&format!("{}\n", rule.red().bold()), Verbosity::Minimal);
        sink.accept(
            &format!(
                "{}\n",
                format!(" {}: {}", snapshot.exception_type, snapshot.message)
                    .red()
                    .bold()
            ),
            Verbosity::Minimal,
        );
        sink.accept(&format!("{}\n", rule.red().bold()), Verbosity::Minimal);
    }

    fn render_failing_line(&self, snapshot: &StackSnapshot, sink: &dyn Sink) {
        let Some(frame) = snapshot.failing_frame() else {
            return;
        };

        let location = format!(
            "{}:{}",
            frame
                .file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<unknown>".to_string()),
            frame.line.map(|l| l.to_string()).unwrap_or_default()
        );
        sink.accept(
            &format!(
                "At {} in {}\n",
                location.bold(),
                frame.function.as_deref().unwrap_or("<unknown>").cyan()
            ),
            Verbosity::Minimal,
        );
        if let Some(text) = frame.failing_line_text() {
            sink.accept(
                &format!("  {}\n", text.trim().red()),
                Verbosity::Minimal,
            );
        }
        sink.accept("\n", Verbosity::Minimal);
    }

    fn render_frames(&self, snapshot: &StackSnapshot, sink: &dyn Sink) {
        if snapshot.frames.is_empty() {
            return;
        }

        sink.accept(
            &format!("{}\n", "Stack trace (most recent call last):".bold()),
            Verbosity::Normal,
        );

        let total = snapshot.frames.len();
        for (index, frame) in snapshot.frames.iter().enumerate() {
            self.render_frame(index + 1, total, frame, sink);
        }
    }

    fn render_frame(&self, index: usize, total: usize, frame: &FrameRecord, sink: &dyn Sink) {
        sink.accept(
            &format!(
                "Frame{} {} in {}\n",
                format!("[{}/{}]", index, total).blue().bold(),
                format!(
                    "{}:{}",
                    frame
                        .file
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "<unknown>".to_string()),
                    frame.line.map(|l| l.to_string()).unwrap_or_default()
                )
                .bold(),
                frame.function.as_deref().unwrap_or("<unknown>").cyan().bold()
            ),
            Verbosity::Normal,
        );

        for (line_no, text) in &frame.context {
            let failing = Some(*line_no) == frame.line;
            let marker = if failing { "  > " } else { "    " };
            let rendered = format!("{}{:4} | {}\n", marker, line_no, text);
            if failing {
                sink.accept(&rendered.red().to_string(), Verbosity::Normal);
            } else {
                sink.accept(&rendered, Verbosity::Normal);
            }
        }

        if self.show_locals && !frame.locals.is_empty() {
            sink.accept(
                &format!("    {}\n", "Local variables:".yellow()),
                Verbosity::Detailed,
            );
            for (name, value) in &frame.locals {
                sink.accept(
                    &format!("      {} = {}\n", name.bold(), value),
                    Verbosity::Detailed,
                );
            }
        }

        sink.accept("\n", Verbosity::Normal);
    }

    fn render_causes(&self, snapshot: &StackSnapshot, sink: &dyn Sink) {
        let mut current = snapshot.cause.as_deref();
        while let Some(cause) = current {
            sink.accept(
                &format!(
                    "{} {}: {}\n",
                    "Caused by:".yellow().bold(),
                    cause.exception_type,
                    cause.message
                ),
                Verbosity::Normal,
            );
            current = cause.cause.as_deref();
        }
        if snapshot.cause.is_some() {
            sink.accept("\n", Verbosity::Normal);
        }
    }

    fn render_analysis(&self, analysis: &Analysis, sink: &dyn Sink) {
        match analysis {
            Analysis::Ready(result) => self.render_ready_analysis(result, sink),
            Analysis::Unavailable { reason } => {
                sink.accept(
                    &format!("{}\n", format!("AI analysis unavailable: {}", reason).yellow()),
                    Verbosity::Minimal,
                );
            }
        }
    }

    fn render_ready_analysis(&self, result: &AnalysisResult, sink: &dyn Sink) {
        sink.accept(
            &format!(
                "{}\n{}\n",
                "Analysis:".blue().bold(),
                wrap_body(&result.explanation)
            ),
            Verbosity::Minimal,
        );
        sink.accept(
            &format!(
                "\n{}\n{}\n",
                "Suggested Fix:".green().bold(),
                wrap_body(&result.suggested_fix)
            ),
            Verbosity::Minimal,
        );

        let mut meta = format!("model {}", result.model);
        if result.cache_hit {
            meta.push_str(", cached");
        } else if let Some(elapsed) = result.elapsed {
            meta.push_str(&format!(", completed in {:.2}s", elapsed.as_secs_f64()));
        }
        meta.push_str(&format!(
            ", {}",
            result.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        sink.accept(
            &format!("{}\n", format!("({})", meta).dimmed()),
            Verbosity::Detailed,
        );
    }

    fn render_footer(&self, sink: &dyn Sink) {
        let rule = "=".repeat(RULE_WIDTH);
        sink.accept(
            &format!("{}\n", format!("{}\nEnd of report", rule).red().bold()),
            Verbosity::Normal,
        );
    }
}

/// Wrap analysis body text at the rule width. A fixed width keeps
/// rendering independent of the terminal, so identical inputs produce
/// identical bytes.
fn wrap_body(text: &str) -> String {
    textwrap::wrap(text, RULE_WIDTH - 2)
        .into_iter()
        .map(|line| format!("  {}", line))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn sample_snapshot() -> StackSnapshot {
        let mut snapshot = StackSnapshot::new("panic", "attempt to divide by zero");
        snapshot.add_frame(
            FrameRecord::new()
                .with_function("billing::charge")
                .with_file("src/billing.rs")
                .with_line(42)
                .with_context(vec![
                    (40, "    let x = total;".to_string()),
                    (41, "    let y = count;".to_string()),
                    (42, "    let per_item = x / y;".to_string()),
                    (43, "    per_item".to_string()),
                ])
                .with_local("x", "10")
                .with_local("y", "0"),
        );
        snapshot
    }

    fn sample_analysis() -> Analysis {
        Analysis::Ready(AnalysisResult {
            explanation: "the denominator is zero".to_string(),
            suggested_fix: "guard the division".to_string(),
            model: "gpt-4o-mini".to_string(),
            timestamp: chrono::Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap(),
            cache_hit: false,
            elapsed: Some(Duration::from_millis(1234)),
        })
    }

    fn render_to(verbosity: Verbosity) -> String {
        colored::control::set_override(false);
        let sink = BufferSink::new(verbosity);
        let renderer = Renderer::new(&Config::default());
        renderer.render(&sample_snapshot(), &sample_analysis(), &sink);
        sink.contents()
    }

    #[test]
    fn test_minimal_tier_has_header_and_failing_line_only() {
        let report = render_to(Verbosity::Minimal);
        assert!(report.contains("panic: attempt to divide by zero"));
        assert!(report.contains("let per_item = x / y;"));
        assert!(!report.contains("Stack trace"));
        assert!(!report.contains("Local variables"));
    }

    #[test]
    fn test_normal_tier_adds_frames() {
        let report = render_to(Verbosity::Normal);
        assert!(report.contains("Stack trace (most recent call last):"));
        assert!(report.contains("Frame[1/1]"));
        assert!(report.contains("src/billing.rs:42"));
        assert!(!report.contains("Local variables"));
    }

    #[test]
    fn test_detailed_tier_adds_locals_and_timing() {
        let report = render_to(Verbosity::Detailed);
        assert!(report.contains("Local variables:"));
        assert!(report.contains("x = 10"));
        assert!(report.contains("y = 0"));
        assert!(report.contains("completed in 1.23s"));
        assert!(report.contains("model gpt-4o-mini"));
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let first = render_to(Verbosity::Detailed);
        let second = render_to(Verbosity::Detailed);
        assert_eq!(first, second);
    }

    #[test]
    fn test_unavailable_analysis_renders_reason() {
        colored::control::set_override(false);
        let sink = BufferSink::new(Verbosity::Minimal);
        let renderer = Renderer::new(&Config::default());
        renderer.render(
            &sample_snapshot(),
            &Analysis::Unavailable {
                reason: "provider timed out after 30s".to_string(),
            },
            &sink,
        );

        let report = sink.contents();
        assert!(report.contains("AI analysis unavailable: provider timed out after 30s"));
        assert!(!report.contains("Suggested Fix"));
    }

    #[test]
    fn test_cache_hit_marker() {
        colored::control::set_override(false);
        let sink = BufferSink::new(Verbosity::Detailed);
        let renderer = Renderer::new(&Config::default());
        let Analysis::Ready(base) = sample_analysis() else {
            unreachable!()
        };
        let analysis = Analysis::Ready(AnalysisResult {
            cache_hit: true,
            elapsed: None,
            ..base
        });
        renderer.render(&sample_snapshot(), &analysis, &sink);

        let report = sink.contents();
        assert!(report.contains("cached"));
        assert!(!report.contains("completed in"));
    }

    #[test]
    fn test_show_locals_false_hides_locals_even_when_detailed() {
        colored::control::set_override(false);
        let sink = BufferSink::new(Verbosity::Detailed);
        let mut config = Config::default();
        config.show_locals = false;
        let renderer = Renderer::new(&config);
        renderer.render(&sample_snapshot(), &sample_analysis(), &sink);
        assert!(!sink.contents().contains("Local variables"));
    }

    #[test]
    fn test_cause_chain_renders() {
        colored::control::set_override(false);
        let mut snapshot = sample_snapshot();
        let mut cause = StackSnapshot::new("ParseIntError", "invalid digit found in string");
        cause.cause = Some(Box::new(StackSnapshot::new("inner", "root cause")));
        snapshot.cause = Some(Box::new(cause));

        let sink = BufferSink::new(Verbosity::Normal);
        Renderer::new(&Config::default()).render(&snapshot, &sample_analysis(), &sink);

        let report = sink.contents();
        assert!(report.contains("Caused by: ParseIntError: invalid digit found in string"));
        assert!(report.contains("Caused by: inner: root cause"));
    }

    #[test]
    fn test_empty_snapshot_renders_without_frames() {
        colored::control::set_override(false);
        let sink = BufferSink::new(Verbosity::Detailed);
        let snapshot = StackSnapshot::new("panic", "synthetic");
        Renderer::new(&Config::default()).render(
            &snapshot,
            &Analysis::Unavailable {
                reason: "AI analysis is disabled".to_string(),
            },
            &sink,
        );

        let report = sink.contents();
        assert!(report.contains("panic: synthetic"));
        assert!(!report.contains("Frame["));
    }
}
