//! oops - enhanced panic and error reports with AI-powered explanations
//!
//! Intercepts panics and reported errors, extracts the failing call
//! stack with source context and recorded locals, optionally asks an
//! LLM service to explain the error and suggest a fix, and renders a
//! readable report. Analyses are cached by error fingerprint so the
//! same bug is explained once.
//!
//! ```no_run
//! // Global panic hook
//! let handle = oops::enable().expect("hook installed");
//!
//! // Decorator form
//! # let tracer = std::sync::Arc::new(oops::Tracer::new(oops::Config::default()));
//! let risky = tracer.traced(|| 1 + 1);
//! risky();
//!
//! // Scoped form
//! tracer.catch_errors(|| {
//!     // code that might panic
//! });
//!
//! handle.restore();
//! ```

pub mod analysis;
pub mod cache;
pub mod config;
pub mod fingerprint;
pub mod hooks;
pub mod locals;
pub mod output;
pub mod progress;
pub mod providers;
pub mod stack_trace;

// Re-export commonly used types
pub use analysis::{Analysis, AnalysisResult, Orchestrator};
pub use cache::{AnalysisCache, CacheError, FileCache};
pub use config::{Config, Verbosity};
pub use fingerprint::{Fingerprint, Fingerprinter};
pub use hooks::{Handle, HookError, Tracer, TracerBuilder};
pub use locals::LocalsGuard;
pub use output::{BufferSink, ConsoleSink, Renderer, Sink};
pub use progress::{NoOpProgress, ProgressIndicator, Spinner};
pub use providers::{AnalysisProvider, AnalysisRequest, OpenAiProvider, ProviderError};
pub use stack_trace::{FrameExtractor, FrameRecord, RawStack, StackSnapshot};

use anyhow::Result;
use std::sync::Arc;

/// Install the global reporting hook with configuration loaded from
/// `~/.config/oops/config.toml` and the environment.
pub fn enable() -> Result<Handle> {
    enable_with(Config::load())
}

/// Install the global reporting hook with explicit configuration
pub fn enable_with(config: Config) -> Result<Handle> {
    Ok(Arc::new(Tracer::new(config)).install()?)
}
