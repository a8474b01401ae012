//! Capture surfaces: the entry points through which a failing program
//! hands control to the reporting pipeline.
//!
//! Three surfaces converge on the same pipeline and produce identical
//! output for identical errors:
//!
//! - a process-global panic hook with an explicit install/restore
//!   lifecycle ([`Tracer::install`]),
//! - a decorator that wraps a closure ([`Tracer::traced`]), reporting
//!   and then resuming the unwind,
//! - a scoped block ([`Tracer::catch_errors`]) with the same default.
//!
//! Suppression is always explicit; by default the original panic keeps
//! propagating so host program semantics are preserved. Caught error
//! values go through [`Tracer::report_error`].

use once_cell::sync::Lazy;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::io::IsTerminal;
use std::panic::{self, AssertUnwindSafe, PanicHookInfo};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::analysis::Orchestrator;
use crate::cache::{AnalysisCache, FileCache};
use crate::config::{Config, Verbosity};
use crate::fingerprint::Fingerprinter;
use crate::locals;
use crate::output::{ConsoleSink, Renderer, Sink};
use crate::progress::{NoOpProgress, ProgressIndicator, Spinner};
use crate::providers::{AnalysisProvider, OpenAiProvider};
use crate::stack_trace::{
    raw_stack_from_error, resolve_frames, short_type_name, FrameExtractor, RawFrame, RawStack,
};

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Send + Sync + 'static>;

/// Process-wide hook state. One recording hook serves every surface;
/// the reporting slot is what `install`/`restore` manage.
struct HookState {
    prev: Option<PanicHook>,
    recorder_installed: bool,
    reporting: Option<Arc<Tracer>>,
}

static HOOK_STATE: Lazy<Mutex<HookState>> = Lazy::new(|| {
    Mutex::new(HookState {
        prev: None,
        recorder_installed: false,
        reporting: None,
    })
});

thread_local! {
    /// Raw stack recorded by the hook for the surface that will report
    /// after the unwind is caught
    static LAST_PANIC: RefCell<Option<RawStack>> = const { RefCell::new(None) };

    /// Nesting depth of active `traced`/`catch_errors` surfaces
    static SURFACE_DEPTH: Cell<usize> = const { Cell::new(0) };

    /// Re-entrancy guard: a failure inside the reporting pipeline must
    /// not start another report
    static REPORTING: Cell<bool> = const { Cell::new(false) };
}

/// Errors from hook lifecycle management
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("a reporting hook is already installed; restore it first")]
    AlreadyInstalled,
}

/// Proof of an installed reporting hook. Restoring is explicit: the
/// handle does nothing on drop, so a forgotten handle leaves reporting
/// active for the rest of the process.
#[must_use = "call restore() to uninstall the reporting hook"]
pub struct Handle {
    _private: (),
}

impl Handle {
    /// Uninstall the reporting hook. Uncaught panics go back to the
    /// hook that was active before install: the recording shim stays
    /// in place for the decorator and scoped surfaces and forwards to
    /// the previous hook whenever no surface claims the panic.
    pub fn restore(self) {
        let mut state = HOOK_STATE.lock().unwrap_or_else(|e| e.into_inner());
        state.reporting = None;
        debug!("reporting hook restored");
    }
}

/// The reporting pipeline behind every capture surface.
///
/// Owns the extractor configuration, the orchestrator, the renderer,
/// and the sink. Collaborators are injected through [`TracerBuilder`];
/// the defaults are the file cache, the console sink, and the
/// OpenAI-compatible provider when an API key is configured.
pub struct Tracer {
    config: Config,
    orchestrator: Orchestrator,
    renderer: Renderer,
    sink: Arc<dyn Sink>,
}

impl Tracer {
    /// Tracer with default collaborators
    pub fn new(config: Config) -> Self {
        Self::builder(config).build()
    }

    /// Start building a tracer with injected collaborators
    pub fn builder(config: Config) -> TracerBuilder {
        TracerBuilder {
            config,
            provider: None,
            cache: None,
            sink: None,
            progress: None,
            fingerprinter: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Install this tracer as the process panic hook. The previous
    /// hook is saved and comes back on [`Handle::restore`]. A second
    /// install without a restore fails.
    pub fn install(self: &Arc<Self>) -> Result<Handle, HookError> {
        let mut state = HOOK_STATE.lock().unwrap_or_else(|e| e.into_inner());
        if state.reporting.is_some() {
            return Err(HookError::AlreadyInstalled);
        }
        ensure_recorder_locked(&mut state);
        state.reporting = Some(self.clone());
        debug!("reporting hook installed");
        Ok(Handle { _private: () })
    }

    /// Decorator surface: wrap a closure so a panic inside it is
    /// reported and then re-raised.
    pub fn traced<F, T>(self: &Arc<Self>, f: F) -> impl FnOnce() -> T
    where
        F: FnOnce() -> T,
    {
        let tracer = self.clone();
        move || match tracer.run_guarded(f) {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Decorator surface with explicit suppression: the panic is
    /// reported and swallowed, yielding `None`.
    pub fn traced_suppress<F, T>(self: &Arc<Self>, f: F) -> impl FnOnce() -> Option<T>
    where
        F: FnOnce() -> T,
    {
        let tracer = self.clone();
        move || tracer.run_guarded(f).ok()
    }

    /// Scoped surface: run the block now; a panic inside it is
    /// reported and then re-raised.
    pub fn catch_errors<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        match self.run_guarded(f) {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Scoped surface with explicit suppression
    pub fn catch_errors_suppress<F, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce() -> T,
    {
        self.run_guarded(f).ok()
    }

    /// Explicit surface: report a caught error value, walking its
    /// source chain into the report's cause section.
    pub fn report_error<E>(&self, error: &E)
    where
        E: std::error::Error + 'static,
    {
        let mut raw = raw_stack_from_error(short_type_name(std::any::type_name::<E>()), error);
        raw.frames = resolve_frames(&backtrace::Backtrace::new());
        self.report_raw(raw);
    }

    /// Run the full pipeline for a raw capture. Failures inside the
    /// pipeline are isolated: they never replace the error being
    /// reported and never unwind into the caller.
    pub fn report_raw(&self, raw: RawStack) {
        if REPORTING.with(|flag| flag.replace(true)) {
            return;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut extractor = FrameExtractor::new(self.config.show_locals);
            let snapshot = extractor.extract(&raw);
            let analysis = self.orchestrator.analyze(&snapshot, &self.config);
            self.renderer.render(&snapshot, &analysis, self.sink.as_ref());
        }));

        if outcome.is_err() {
            self.sink.accept(
                "oops: internal reporting failure; original error preserved\n",
                Verbosity::Minimal,
            );
        }

        REPORTING.with(|flag| flag.set(false));
    }

    fn run_guarded<F, T>(&self, f: F) -> Result<T, Box<dyn Any + Send>>
    where
        F: FnOnce() -> T,
    {
        ensure_recorder();
        SURFACE_DEPTH.with(|depth| depth.set(depth.get() + 1));
        let outcome = panic::catch_unwind(AssertUnwindSafe(f));
        SURFACE_DEPTH.with(|depth| depth.set(depth.get() - 1));

        match outcome {
            Ok(value) => Ok(value),
            Err(payload) => {
                let raw = LAST_PANIC
                    .with(|cell| cell.borrow_mut().take())
                    .unwrap_or_else(|| RawStack::new("panic", payload_text(&payload)));
                self.report_raw(raw);
                Err(payload)
            }
        }
    }
}

/// Builds a [`Tracer`] with injected collaborators
pub struct TracerBuilder {
    config: Config,
    provider: Option<Arc<dyn AnalysisProvider>>,
    cache: Option<Arc<dyn AnalysisCache>>,
    sink: Option<Arc<dyn Sink>>,
    progress: Option<Arc<dyn ProgressIndicator>>,
    fingerprinter: Option<Fingerprinter>,
}

impl TracerBuilder {
    pub fn with_provider(mut self, provider: Arc<dyn AnalysisProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn AnalysisCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressIndicator>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_fingerprinter(mut self, fingerprinter: Fingerprinter) -> Self {
        self.fingerprinter = Some(fingerprinter);
        self
    }

    pub fn build(self) -> Tracer {
        let provider = self.provider.or_else(|| {
            OpenAiProvider::from_config(&self.config.ai)
                .ok()
                .map(|p| Arc::new(p) as Arc<dyn AnalysisProvider>)
        });
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(FileCache::new(self.config.cache.dir.clone())));
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(ConsoleSink::new(self.config.verbosity)));
        let progress = self.progress.unwrap_or_else(|| {
            if std::io::stderr().is_terminal() {
                Arc::new(Spinner::new("AI analysis running...")) as Arc<dyn ProgressIndicator>
            } else {
                Arc::new(NoOpProgress)
            }
        });
        let fingerprinter = self.fingerprinter.unwrap_or_default();

        let renderer = Renderer::new(&self.config);
        let orchestrator = Orchestrator::new(provider, cache, progress, fingerprinter);

        Tracer {
            config: self.config,
            orchestrator,
            renderer,
            sink,
        }
    }
}

/// The one process panic hook. Records a raw capture; an active
/// surface on this thread picks it up after the unwind, otherwise the
/// installed reporting tracer (or the previous hook) takes over.
fn panic_hook(info: &PanicHookInfo<'_>) {
    let raw = raw_stack_from_panic(info);

    if SURFACE_DEPTH.with(|depth| depth.get()) > 0 {
        LAST_PANIC.with(|cell| *cell.borrow_mut() = Some(raw));
        return;
    }

    let state = HOOK_STATE.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(tracer) = state.reporting.clone() {
        drop(state);
        tracer.report_raw(raw);
        return;
    }
    if let Some(prev) = state.prev.as_ref() {
        prev(info);
    }
}

fn ensure_recorder() {
    let mut state = HOOK_STATE.lock().unwrap_or_else(|e| e.into_inner());
    ensure_recorder_locked(&mut state);
}

fn ensure_recorder_locked(state: &mut HookState) {
    if !state.recorder_installed {
        state.prev = Some(panic::take_hook());
        panic::set_hook(Box::new(panic_hook));
        state.recorder_installed = true;
    }
}

/// Build a raw capture at panic time: payload message, resolved
/// backtrace, the panic location as the authoritative failing frame,
/// and the locals scopes still live on this thread.
fn raw_stack_from_panic(info: &PanicHookInfo<'_>) -> RawStack {
    let message = payload_text(info.payload());
    let backtrace = backtrace::Backtrace::new();
    let mut raw = RawStack::from_backtrace("panic", message, &backtrace);

    if let Some(location) = info.location() {
        let file = Path::new(location.file());
        let already_innermost = raw
            .frames
            .last()
            .map(|frame| {
                frame.line == Some(location.line())
                    && frame
                        .file
                        .as_deref()
                        .map(|p| p.ends_with(file))
                        .unwrap_or(false)
            })
            .unwrap_or(false);
        if !already_innermost {
            raw.push_frame(RawFrame {
                function: None,
                file: Some(file.to_path_buf()),
                line: Some(location.line()),
            });
        }
    }

    raw.scopes = locals::capture_live();
    raw
}

/// Extract a displayable message from a panic payload
fn payload_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
