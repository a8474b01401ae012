//! Cooperative local-variable capture.
//!
//! Rust exposes no runtime reflection over frame locals, so values are
//! recorded explicitly with the [`locals!`](crate::locals!) macro. Each
//! invocation pushes a scope onto a thread-local stack and pops it when
//! the returned guard drops; the frame extractor reads whatever scopes
//! are live at capture time and attaches them to matching frames.

use std::cell::RefCell;
use std::fmt::{self, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Maximum rendered length of a single value
pub const MAX_VALUE_LEN: usize = 100;

/// Hard byte cap while formatting. Bounds `Debug` impls that never
/// terminate on self-referential structures.
const MAX_DEBUG_BYTES: usize = 4096;

/// Placeholder for values whose `Debug` impl panics
pub const UNREPRESENTABLE: &str = "<unrepresentable>";

thread_local! {
    static SCOPES: RefCell<Vec<LocalScope>> = const { RefCell::new(Vec::new()) };
}

/// One `locals!` invocation: the source position it was recorded at and
/// the named values, already stringified.
#[derive(Debug, Clone)]
pub struct LocalScope {
    pub file: String,
    pub line: u32,
    pub entries: Vec<(String, String)>,
}

/// Guard returned by [`locals!`](crate::locals!). Keeps the recorded
/// scope visible until it drops.
#[must_use = "the recorded locals disappear when this guard drops"]
pub struct LocalsGuard {
    depth: usize,
}

impl LocalsGuard {
    #[doc(hidden)]
    pub fn new(file: &'static str, line: u32, entries: Vec<(String, String)>) -> Self {
        SCOPES.with(|scopes| {
            let mut scopes = scopes.borrow_mut();
            let depth = scopes.len();
            scopes.push(LocalScope {
                file: file.to_string(),
                line,
                entries,
            });
            LocalsGuard { depth }
        })
    }
}

impl Drop for LocalsGuard {
    fn drop(&mut self) {
        SCOPES.with(|scopes| {
            let mut scopes = scopes.borrow_mut();
            if self.depth < scopes.len() {
                scopes.truncate(self.depth);
            }
        });
    }
}

/// Snapshot of the scopes currently live on this thread, outermost
/// first. Called from the panic hook before any unwinding has dropped
/// the guards.
pub fn capture_live() -> Vec<LocalScope> {
    SCOPES.with(|scopes| scopes.borrow().clone())
}

/// Record named local variables for the current scope.
///
/// ```
/// # fn compute(x: i64, y: i64) -> i64 {
/// let _locals = oops::locals!(x, y);
/// # x + y }
/// ```
#[macro_export]
macro_rules! locals {
    ($($name:ident),+ $(,)?) => {
        $crate::locals::LocalsGuard::new(
            file!(),
            line!(),
            vec![$(
                (stringify!($name).to_string(), $crate::locals::format_value(&$name))
            ),+],
        )
    };
}

/// `fmt::Write` adapter that stops accepting bytes past a cap.
struct CappedWriter {
    buf: String,
    cap: usize,
    truncated: bool,
}

impl CappedWriter {
    fn new(cap: usize) -> Self {
        Self {
            buf: String::new(),
            cap,
            truncated: false,
        }
    }
}

impl Write for CappedWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.buf.len() >= self.cap {
            self.truncated = true;
            // Abort the in-progress Debug formatting
            return Err(fmt::Error);
        }
        let remaining = self.cap - self.buf.len();
        if s.len() <= remaining {
            self.buf.push_str(s);
        } else {
            let mut end = remaining;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            self.buf.push_str(&s[..end]);
            self.truncated = true;
        }
        Ok(())
    }
}

/// Render a value for display. Never panics: a panicking `Debug` impl
/// yields [`UNREPRESENTABLE`], and output is capped both while
/// formatting and at the display limit.
pub fn format_value(value: &dyn fmt::Debug) -> String {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let mut writer = CappedWriter::new(MAX_DEBUG_BYTES);
        let _ = write!(writer, "{:?}", value);
        (writer.buf, writer.truncated)
    }));

    match outcome {
        Ok((text, hard_truncated)) => clip_for_display(text, hard_truncated),
        Err(_) => UNREPRESENTABLE.to_string(),
    }
}

fn clip_for_display(mut text: String, force_ellipsis: bool) -> String {
    if text.len() > MAX_VALUE_LEN {
        let mut end = MAX_VALUE_LEN - 3;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        text.push_str("...");
    } else if force_ellipsis {
        text.push_str("...");
    }
    text
}
