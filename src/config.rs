//! Configuration system for the `oops` reporting pipeline.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Default model for AI analysis
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Default base URL for the AI API (OpenAI-compatible)
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default timeout for AI requests in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default cache directory, relative to the project working directory
const DEFAULT_CACHE_DIR: &str = ".oops_cache";

/// How much detail a report contains.
///
/// Ordered: `Minimal < Normal < Detailed`. Sinks keep every line whose
/// minimum verbosity is at or below their own level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// Exception type, message, and the failing line only
    Minimal,
    /// Adds the full frame list with source context
    Normal,
    /// Adds local variables and timing metadata
    #[default]
    Detailed,
}

impl Verbosity {
    /// Map a numeric level (0/1/2) to a tier. Out-of-range values clamp
    /// to `Detailed`, matching the most permissive behavior.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Verbosity::Minimal,
            1 => Verbosity::Normal,
            _ => Verbosity::Detailed,
        }
    }

    /// Numeric level for display and serialization to simple formats
    pub fn level(self) -> u8 {
        match self {
            Verbosity::Minimal => 0,
            Verbosity::Normal => 1,
            Verbosity::Detailed => 2,
        }
    }
}

/// Configuration for AI integration
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AiConfig {
    /// Whether AI analysis is enabled
    pub enabled: bool,
    /// API key for the provider
    pub api_key: Option<String>,
    /// Model identifier
    pub model: String,
    /// Base URL for the provider API
    pub base_url: String,
    /// Timeout for provider requests in seconds
    pub timeout_secs: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// Configuration for the analysis cache
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether cached analyses are reused and new ones stored
    pub enabled: bool,
    /// Directory holding one entry file per fingerprint
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from(DEFAULT_CACHE_DIR),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Report verbosity tier
    pub verbosity: Verbosity,
    /// Whether recorded local variables appear in frames
    pub show_locals: bool,
    pub ai: AiConfig,
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verbosity: Verbosity::Detailed,
            show_locals: true,
            ai: AiConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file, returning default config if file doesn't exist
    pub fn load() -> Self {
        let mut config = Self::load_from_path(Self::config_path());
        config.apply_env_overrides();
        config
    }

    /// Load config from a specific path
    pub fn load_from_path(path: Option<PathBuf>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        if !path.exists() {
            return Self::default();
        }

        std::fs::read_to_string(&path)
            .ok()
            .and_then(|contents| toml::from_str(&contents).ok())
            .unwrap_or_default()
    }

    /// Get the config file path (~/.config/oops/config.toml)
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("oops").join("config.toml"))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = env::var("OOPS_API_KEY") {
            if !key.is_empty() {
                self.ai.api_key = Some(key);
            }
        }
        // Fall back to the conventional provider variable
        if self.ai.api_key.is_none() {
            if let Ok(key) = env::var("OPENAI_API_KEY") {
                if !key.is_empty() {
                    self.ai.api_key = Some(key);
                }
            }
        }
        if let Ok(model) = env::var("OOPS_MODEL") {
            if !model.is_empty() {
                self.ai.model = model;
            }
        }
        if let Ok(url) = env::var("OOPS_BASE_URL") {
            if !url.is_empty() {
                self.ai.base_url = url;
            }
        }
        if env::var("OOPS_AI_DISABLE").map(|v| v == "1").unwrap_or(false) {
            self.ai.enabled = false;
        }
        if env::var("OOPS_NO_CACHE").map(|v| v == "1").unwrap_or(false) {
            self.cache.enabled = false;
        }
        if let Ok(dir) = env::var("OOPS_CACHE_DIR") {
            if !dir.is_empty() {
                self.cache.dir = PathBuf::from(dir);
            }
        }
    }
}

/// Generate default config as TOML string
pub fn generate_default_config() -> String {
    r#"# oops - enhanced panic reports configuration
# Place this file at ~/.config/oops/config.toml

# Report verbosity: "minimal", "normal", or "detailed"
verbosity = "detailed"

# Show recorded local variables in frames (detailed tier only)
show_locals = true

[ai]
# Enable AI-powered analysis of captured errors (default: false)
enabled = false

# API key; OOPS_API_KEY or OPENAI_API_KEY environment variables override
# api_key = "sk-..."

# Model and endpoint (any OpenAI-compatible chat completions API)
model = "gpt-4o-mini"
base_url = "https://api.openai.com/v1"

# Provider request timeout in seconds
timeout_secs = 30

[cache]
# Reuse previously computed analyses keyed by error fingerprint
enabled = true

# One JSON file per fingerprint lives here
dir = ".oops_cache"

# Environment variable overrides:
# OOPS_API_KEY / OPENAI_API_KEY - provider API key
# OOPS_MODEL                    - model identifier
# OOPS_BASE_URL                 - provider endpoint
# OOPS_AI_DISABLE=1             - disable AI analysis
# OOPS_NO_CACHE=1               - disable the analysis cache
# OOPS_CACHE_DIR                - cache directory
"#
    .to_string()
}
