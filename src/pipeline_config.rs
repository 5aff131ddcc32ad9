//! Extraction pipeline configuration.
//!
//! Every tunable the orchestrator needs (model, prompt budgets, batch size,
//! default confidence threshold) is carried in one explicit structure handed
//! to the runner at construction. Nothing in the pipeline reads the
//! environment on its own.

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════
// Defaults
// ═══════════════════════════════════════════════════════════

pub const DEFAULT_MODEL_ID: &str = "models/gemini-2.5-flash";
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MAX_DOCUMENT_CHARS: usize = 20_000;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 8192;
pub const DEFAULT_FIELD_BATCH_SIZE: usize = 12;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.6;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Configuration for a field extraction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Model identifier passed to the backend (e.g. "models/gemini-2.5-flash").
    pub model_id: String,
    /// Document text beyond this is cut to head (75%) + tail (25%).
    pub max_document_chars: usize,
    /// Output token budget per model call.
    pub max_output_tokens: u32,
    /// Fields requested per top-level batch.
    pub field_batch_size: usize,
    /// Threshold used when the caller does not pass one.
    pub confidence_threshold_default: f64,
    /// HTTP timeout per model call.
    pub request_timeout_secs: u64,
    /// Base URL of the generative language API.
    pub api_base: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            max_document_chars: DEFAULT_MAX_DOCUMENT_CHARS,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            field_batch_size: DEFAULT_FIELD_BATCH_SIZE,
            confidence_threshold_default: DEFAULT_CONFIDENCE_THRESHOLD,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }
}

impl ExtractionConfig {
    /// Load from `.env` and process environment, falling back to defaults.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values keep the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            model_id: lookup("GEMINI_MODEL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.model_id),
            max_document_chars: parse_or(
                &lookup,
                "GEMINI_MAX_DOC_CHARS",
                defaults.max_document_chars,
            ),
            max_output_tokens: parse_or(
                &lookup,
                "GEMINI_MAX_OUTPUT_TOKENS",
                defaults.max_output_tokens,
            ),
            field_batch_size: parse_or(
                &lookup,
                "GEMINI_FIELD_BATCH_SIZE",
                defaults.field_batch_size,
            ),
            confidence_threshold_default: parse_or(
                &lookup,
                "MORTGAGE_CONFIDENCE_THRESHOLD",
                defaults.confidence_threshold_default,
            ),
            request_timeout_secs: parse_or(
                &lookup,
                "GEMINI_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            ),
            api_base: lookup("GEMINI_API_BASE")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.api_base),
        }
        .normalized()
    }

    /// Clamp values into their usable ranges.
    pub fn normalized(mut self) -> Self {
        self.field_batch_size = self.field_batch_size.max(1);
        self.max_document_chars = self.max_document_chars.max(1);
        self.max_output_tokens = self.max_output_tokens.max(1);
        self.confidence_threshold_default =
            clamp_threshold(self.confidence_threshold_default, DEFAULT_CONFIDENCE_THRESHOLD);
        self
    }

    /// A caller-supplied threshold clamped into [0, 1]. Non-finite values
    /// fall back to `confidence_threshold_default`.
    pub fn effective_threshold(&self, threshold: f64) -> f64 {
        clamp_threshold(threshold, self.confidence_threshold_default)
    }
}

fn clamp_threshold(threshold: f64, fallback: f64) -> f64 {
    if threshold.is_finite() {
        threshold.clamp(0.0, 1.0)
    } else {
        fallback
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Ignoring unparseable configuration value");
            default
        }),
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
