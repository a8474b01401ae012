//! Stable fingerprints for "the same bug at the same site".
//!
//! A fingerprint is a SHA-256 digest over the exception type, the
//! normalized message, and the (file, function, line) triples of the
//! stack. Local variable values never enter the key: one bug hit with
//! different data must land on the same cache entry.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::stack_trace::StackSnapshot;

/// Hex addresses in messages (`0x7f8a2c004010`) are volatile per run
static ADDR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"0x[0-9a-fA-F]+").expect("valid regex"));

/// Long digit runs look like ids, timestamps, or offsets
static NUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{4,}").expect("valid regex"));

/// Collapse whitespace so formatting differences don't split keys
static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Opaque, deterministic identifier for an error site
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// The textual (hex) form, used as the cache entry file name
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes fingerprints with paths folded to a project-relative form,
/// so the same bug reported from two checkouts matches.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    project_root: Option<PathBuf>,
}

impl Fingerprinter {
    /// Fingerprinter rooted at the current working directory
    pub fn new() -> Self {
        Self {
            project_root: std::env::current_dir().ok(),
        }
    }

    /// Fingerprinter rooted at an explicit project directory
    pub fn with_project_root(root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: Some(root.into()),
        }
    }

    /// Pure and deterministic: the same type, normalized message, and
    /// frame triples always produce the same fingerprint.
    pub fn fingerprint(&self, snapshot: &StackSnapshot) -> Fingerprint {
        let mut hasher = Sha256::new();

        hasher.update(snapshot.exception_type.as_bytes());
        hasher.update(b"\n");
        hasher.update(normalize_message(&snapshot.message).as_bytes());
        hasher.update(b"\n");

        for frame in &snapshot.frames {
            let file = frame
                .file
                .as_deref()
                .map(|p| self.canonical_path(p))
                .unwrap_or_default();
            hasher.update(file.as_bytes());
            hasher.update(b":");
            hasher.update(frame.function.as_deref().unwrap_or("?").as_bytes());
            hasher.update(b":");
            hasher.update(
                frame
                    .line
                    .map(|l| l.to_string())
                    .unwrap_or_default()
                    .as_bytes(),
            );
            hasher.update(b"\n");
        }

        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    /// Fold a path to a checkout-independent form: strip the project
    /// root when the path lives under it, otherwise keep the suffix
    /// anchored at the last source-tree component, falling back to the
    /// file name.
    fn canonical_path(&self, path: &Path) -> String {
        let rel = self
            .project_root
            .as_deref()
            .and_then(|root| path.strip_prefix(root).ok())
            .unwrap_or(path);

        let components: Vec<&str> = rel
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .collect();

        if rel.is_absolute() {
            if let Some(pos) = components
                .iter()
                .rposition(|c| matches!(*c, "src" | "tests" | "examples" | "benches"))
            {
                return components[pos..].join("/");
            }
            return components.last().copied().unwrap_or_default().to_string();
        }

        components.join("/")
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip volatile substrings from an exception message
pub fn normalize_message(message: &str) -> String {
    let stripped = ADDR_RE.replace_all(message, "<addr>");
    let stripped = NUM_RE.replace_all(&stripped, "<num>");
    WS_RE.replace_all(&stripped, " ").trim().to_string()
}
