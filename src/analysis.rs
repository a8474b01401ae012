//! Analysis orchestration.
//!
//! Coordinates the fingerprinter, the cache, and the provider into one
//! decision: reuse a previous explanation or ask for a new one.
//! Analysis is best-effort by contract: every failure path reduces to
//! [`Analysis::Unavailable`] and nothing here may mask the original
//! error being reported.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::cache::AnalysisCache;
use crate::config::Config;
use crate::fingerprint::{Fingerprint, Fingerprinter};
use crate::progress::ProgressIndicator;
use crate::providers::{AnalysisProvider, AnalysisRequest};
use crate::stack_trace::StackSnapshot;

/// Cap on the frame text sent to providers
pub const MAX_PROMPT_CHARS: usize = 4096;

/// A completed analysis. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// What is happening and why
    pub explanation: String,
    /// Concrete change to fix it
    pub suggested_fix: String,
    /// Model that produced the analysis
    pub model: String,
    /// When the analysis was produced
    pub timestamp: DateTime<Utc>,
    /// Whether this result came from the cache
    #[serde(default)]
    pub cache_hit: bool,
    /// Provider latency for live calls; absent on cache hits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<Duration>,
}

/// Outcome of an analysis attempt
#[derive(Debug, Clone)]
pub enum Analysis {
    Ready(AnalysisResult),
    Unavailable { reason: String },
}

impl Analysis {
    pub fn is_ready(&self) -> bool {
        matches!(self, Analysis::Ready(_))
    }

    fn unavailable(reason: impl Into<String>) -> Self {
        Analysis::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Coordinates fingerprinting, the cache, and the provider.
///
/// Within one process, captures sharing a fingerprint serialize their
/// provider calls through a keyed lock table: the second caller waits
/// for the first result (and then hits the cache) instead of firing a
/// duplicate request. Distinct fingerprints never contend.
pub struct Orchestrator {
    provider: Option<Arc<dyn AnalysisProvider>>,
    cache: Arc<dyn AnalysisCache>,
    progress: Arc<dyn ProgressIndicator>,
    fingerprinter: Fingerprinter,
    inflight: Mutex<HashMap<Fingerprint, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        provider: Option<Arc<dyn AnalysisProvider>>,
        cache: Arc<dyn AnalysisCache>,
        progress: Arc<dyn ProgressIndicator>,
        fingerprinter: Fingerprinter,
    ) -> Self {
        Self {
            provider,
            cache,
            progress,
            fingerprinter,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Produce an analysis for a snapshot, reusing the cache when
    /// possible. Never panics and never returns a provider error as
    /// anything other than `Unavailable`.
    pub fn analyze(&self, snapshot: &StackSnapshot, config: &Config) -> Analysis {
        if !config.ai.enabled {
            return Analysis::unavailable("AI analysis is disabled");
        }
        let Some(provider) = self.provider.clone() else {
            return Analysis::unavailable("no analysis provider configured (missing API key?)");
        };

        let fingerprint = self.fingerprinter.fingerprint(snapshot);
        debug!(fingerprint = %fingerprint, "analyzing capture");

        let gate = self.gate(&fingerprint);
        let analysis = {
            let _inflight = gate.lock().unwrap_or_else(|e| e.into_inner());
            self.analyze_serialized(&provider, snapshot, config, &fingerprint)
        };
        self.release(&fingerprint, gate);
        analysis
    }

    /// The body that runs under the per-fingerprint lock
    fn analyze_serialized(
        &self,
        provider: &Arc<dyn AnalysisProvider>,
        snapshot: &StackSnapshot,
        config: &Config,
        fingerprint: &Fingerprint,
    ) -> Analysis {
        if config.cache.enabled && self.cache.has(fingerprint) {
            match self.cache.get(fingerprint) {
                Ok(Some(mut hit)) => {
                    debug!(fingerprint = %fingerprint, "using cached analysis");
                    hit.cache_hit = true;
                    hit.elapsed = None;
                    return Analysis::Ready(hit);
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(error = %error, "cache read failed; treating as miss");
                }
            }
        }

        let request = AnalysisRequest {
            exception_type: snapshot.exception_type.clone(),
            message: snapshot.message.clone(),
            frames_text: snapshot.frames_text(MAX_PROMPT_CHARS),
            model: config.ai.model.clone(),
        };
        let timeout = Duration::from_secs(config.ai.timeout_secs);

        // One short-lived runtime per live call: captures with distinct
        // fingerprints must not serialize behind a shared driver
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(error) => {
                return Analysis::unavailable(format!(
                    "failed to start analysis runtime: {}",
                    error
                ));
            }
        };

        self.progress.start();
        let started = Instant::now();
        let outcome = runtime
            .block_on(async { tokio::time::timeout(timeout, provider.complete(&request)).await });
        self.progress.stop();
        let elapsed = started.elapsed();

        let provider_analysis = match outcome {
            Err(_) => {
                return Analysis::unavailable(format!(
                    "provider timed out after {}s",
                    config.ai.timeout_secs
                ));
            }
            Ok(Err(error)) => {
                debug!(error = %error, "provider call failed");
                return Analysis::unavailable(error.to_string());
            }
            Ok(Ok(analysis)) => analysis,
        };

        let result = AnalysisResult {
            explanation: provider_analysis.explanation,
            suggested_fix: provider_analysis.suggested_fix,
            model: provider.model_name().to_string(),
            timestamp: Utc::now(),
            cache_hit: false,
            elapsed: Some(elapsed),
        };

        if config.cache.enabled {
            if let Err(error) = self.cache.put(fingerprint, &result) {
                // Non-fatal: the computed result is still returned
                warn!(error = %error, "cache write failed; returning uncached result");
            }
        }

        Analysis::Ready(result)
    }

    fn gate(&self, fingerprint: &Fingerprint) -> Arc<Mutex<()>> {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        inflight
            .entry(fingerprint.clone())
            .or_default()
            .clone()
    }

    /// Drop the table entry once the last holder drains, so the table
    /// does not grow with every fingerprint ever seen.
    fn release(&self, fingerprint: &Fingerprint, gate: Arc<Mutex<()>>) {
        drop(gate);
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inflight.get(fingerprint) {
            if Arc::strong_count(entry) == 1 {
                inflight.remove(fingerprint);
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, FileCache};
    use crate::progress::NoOpProgress;
    use crate::providers::{ProviderAnalysis, ProviderError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum StubBehavior {
        Succeed,
        SucceedSlowly,
        Fail,
        Hang,
    }

    struct StubProvider {
        calls: AtomicUsize,
        behavior: StubBehavior,
    }

    impl StubProvider {
        fn new(behavior: StubBehavior) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                behavior,
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AnalysisProvider for StubProvider {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn model_name(&self) -> &str {
            "stub-model"
        }

        async fn complete(
            &self,
            _request: &AnalysisRequest,
        ) -> Result<ProviderAnalysis, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                StubBehavior::Succeed => Ok(ProviderAnalysis {
                    explanation: "the denominator is zero".to_string(),
                    suggested_fix: "guard the division".to_string(),
                }),
                StubBehavior::SucceedSlowly => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(ProviderAnalysis {
                        explanation: "the denominator is zero".to_string(),
                        suggested_fix: "guard the division".to_string(),
                    })
                }
                StubBehavior::Fail => Err(ProviderError::Network("injected failure".to_string())),
                StubBehavior::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    fn test_config(cache_dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.ai.enabled = true;
        config.ai.timeout_secs = 5;
        config.cache.dir = cache_dir.to_path_buf();
        config
    }

    fn orchestrator(provider: Arc<StubProvider>, cache_dir: &std::path::Path) -> Orchestrator {
        Orchestrator::new(
            Some(provider),
            Arc::new(FileCache::new(cache_dir)),
            Arc::new(NoOpProgress),
            Fingerprinter::with_project_root("/checkout"),
        )
    }

    fn snapshot() -> StackSnapshot {
        StackSnapshot::new("panic", "attempt to divide by zero")
    }

    #[test]
    fn test_disabled_ai_never_calls_provider() {
        let dir = tempfile::tempdir().unwrap();
        let provider = StubProvider::new(StubBehavior::Succeed);
        let orchestrator = orchestrator(provider.clone(), dir.path());

        let mut config = test_config(dir.path());
        config.ai.enabled = false;

        let analysis = orchestrator.analyze(&snapshot(), &config);
        assert!(!analysis.is_ready());
        assert_eq!(provider.call_count(), 0);
    }

    #[test]
    fn test_miss_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let provider = StubProvider::new(StubBehavior::Succeed);
        let orchestrator = orchestrator(provider.clone(), dir.path());
        let config = test_config(dir.path());

        let first = orchestrator.analyze(&snapshot(), &config);
        let Analysis::Ready(first) = first else {
            panic!("expected ready analysis");
        };
        assert!(!first.cache_hit);
        assert_eq!(provider.call_count(), 1);

        let second = orchestrator.analyze(&snapshot(), &config);
        let Analysis::Ready(second) = second else {
            panic!("expected ready analysis");
        };
        assert!(second.cache_hit);
        assert_eq!(second.explanation, first.explanation);
        assert_eq!(provider.call_count(), 1);
    }

    #[test]
    fn test_prepopulated_cache_issues_zero_calls() {
        let dir = tempfile::tempdir().unwrap();
        let provider = StubProvider::new(StubBehavior::Succeed);
        let orchestrator = orchestrator(provider.clone(), dir.path());
        let config = test_config(dir.path());

        let fingerprint = Fingerprinter::with_project_root("/checkout").fingerprint(&snapshot());
        let cache = FileCache::new(dir.path());
        cache
            .put(
                &fingerprint,
                &AnalysisResult {
                    explanation: "seeded".to_string(),
                    suggested_fix: "seeded fix".to_string(),
                    model: "seed-model".to_string(),
                    timestamp: Utc::now(),
                    cache_hit: false,
                    elapsed: None,
                },
            )
            .unwrap();

        let analysis = orchestrator.analyze(&snapshot(), &config);
        let Analysis::Ready(result) = analysis else {
            panic!("expected ready analysis");
        };
        assert!(result.cache_hit);
        assert_eq!(result.explanation, "seeded");
        assert_eq!(provider.call_count(), 0);
    }

    #[test]
    fn test_cache_disabled_always_calls_provider() {
        let dir = tempfile::tempdir().unwrap();
        let provider = StubProvider::new(StubBehavior::Succeed);
        let orchestrator = orchestrator(provider.clone(), dir.path());

        let mut config = test_config(dir.path());
        config.cache.enabled = false;

        orchestrator.analyze(&snapshot(), &config);
        orchestrator.analyze(&snapshot(), &config);
        assert_eq!(provider.call_count(), 2);
    }

    #[test]
    fn test_provider_failure_reduces_to_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let provider = StubProvider::new(StubBehavior::Fail);
        let orchestrator = orchestrator(provider.clone(), dir.path());
        let config = test_config(dir.path());

        let analysis = orchestrator.analyze(&snapshot(), &config);
        let Analysis::Unavailable { reason } = analysis else {
            panic!("expected unavailable");
        };
        assert!(reason.contains("injected failure"));
        // nothing cached on failure
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_provider_timeout_reduces_to_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let provider = StubProvider::new(StubBehavior::Hang);
        let orchestrator = orchestrator(provider.clone(), dir.path());

        let mut config = test_config(dir.path());
        config.ai.timeout_secs = 0;

        let analysis = orchestrator.analyze(&snapshot(), &config);
        let Analysis::Unavailable { reason } = analysis else {
            panic!("expected unavailable");
        };
        assert!(reason.contains("timed out"));
    }

    #[test]
    fn test_no_provider_is_unavailable_without_panic() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            None,
            Arc::new(FileCache::new(dir.path())),
            Arc::new(NoOpProgress),
            Fingerprinter::with_project_root("/checkout"),
        );

        let analysis = orchestrator.analyze(&snapshot(), &test_config(dir.path()));
        assert!(!analysis.is_ready());
    }

    #[test]
    fn test_cache_write_failure_still_returns_result() {
        struct BrokenCache;
        impl AnalysisCache for BrokenCache {
            fn has(&self, _: &Fingerprint) -> bool {
                false
            }
            fn get(&self, _: &Fingerprint) -> Result<Option<AnalysisResult>, CacheError> {
                Ok(None)
            }
            fn put(&self, _: &Fingerprint, _: &AnalysisResult) -> Result<(), CacheError> {
                Err(CacheError::Write {
                    path: "/nope".into(),
                    source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let provider = StubProvider::new(StubBehavior::Succeed);
        let orchestrator = Orchestrator::new(
            Some(provider.clone()),
            Arc::new(BrokenCache),
            Arc::new(NoOpProgress),
            Fingerprinter::with_project_root("/checkout"),
        );

        let analysis = orchestrator.analyze(&snapshot(), &test_config(dir.path()));
        assert!(analysis.is_ready());
        assert_eq!(provider.call_count(), 1);
    }

    #[test]
    fn test_concurrent_captures_share_one_provider_call() {
        let dir = tempfile::tempdir().unwrap();
        let provider = StubProvider::new(StubBehavior::SucceedSlowly);
        let orchestrator = Arc::new(orchestrator(provider.clone(), dir.path()));
        let config = Arc::new(test_config(dir.path()));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let orchestrator = orchestrator.clone();
                let config = config.clone();
                std::thread::spawn(move || orchestrator.analyze(&snapshot(), &config))
            })
            .collect();

        for thread in threads {
            assert!(thread.join().unwrap().is_ready());
        }

        // the first caller did the work; the rest waited and hit the cache
        assert_eq!(provider.call_count(), 1);
    }

    #[test]
    fn test_inflight_table_drains() {
        let dir = tempfile::tempdir().unwrap();
        let provider = StubProvider::new(StubBehavior::Succeed);
        let orchestrator = orchestrator(provider, dir.path());
        let config = test_config(dir.path());

        orchestrator.analyze(&snapshot(), &config);
        let inflight = orchestrator.inflight.lock().unwrap();
        assert!(inflight.is_empty());
    }
}
