//! Engine configuration.
//!
//! Every field has a default, so hosts can pass a partial JSON object or rely
//! entirely on [`SyncConfig::default`]. Selected values can be overridden from
//! the environment with [`SyncConfig::from_env`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncResult;

/// Retry behaviour with exponential backoff.
///
/// Used for uploads and for preloading freshly uploaded assets, which may not be
/// fetchable right away because storage and CDN are eventually consistent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied after each failed attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_delay_ms: 200,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with custom values.
    #[must_use]
    pub const fn new(
        max_attempts: u32,
        initial_delay_ms: u64,
        max_delay_ms: u64,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            max_delay_ms,
            backoff_multiplier,
        }
    }

    /// Delay to wait after the given failed attempt (0-indexed).
    ///
    /// `delay = initial * multiplier^attempt`, capped at `max_delay_ms`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64;
        let factor = self.backoff_multiplier.powi(attempt.min(30) as i32);
        let delay_ms = (base * factor).min(self.max_delay_ms as f64).max(0.0) as u64;
        Duration::from_millis(delay_ms)
    }
}

/// How asset references are recognized and made renderable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Path of the view-layer proxy that serves storage keys and remote URLs,
    /// e.g. `/api/assets/proxy`. Matched on relative and absolute forms.
    pub proxy_path: String,
    /// Origins (scheme + host) of the storage CDN. Remote URLs on these origins
    /// normalize to their storage key.
    pub storage_origins: Vec<String>,
    /// Whether remote URLs are routed through the proxy when rendered.
    pub proxy_remote_urls: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            proxy_path: "/api/assets/proxy".to_string(),
            storage_origins: Vec::new(),
            proxy_remote_urls: true,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum undo depth per document.
    pub history_depth: usize,
    /// Pixel offset applied to pasted items.
    pub paste_offset: (f32, f32),
    /// Hit-test tolerance in screen pixels (divided by zoom).
    pub hit_tolerance: f32,
    /// Window after a reconciliation pass during which follow-on change
    /// signals are folded into a single extra pass.
    pub settle_window_ms: u64,
    /// Minimum interval between two recovery-needed signals.
    pub recovery_debounce_ms: u64,
    /// Expected footprint of a newly requested asset.
    pub placeholder_size: (f32, f32),
    /// Gap between a predicted placeholder and its neighbour.
    pub placeholder_gap: f32,
    /// Retry policy for uploads.
    pub upload_retry: RetryPolicy,
    /// Retry policy for remote preloads.
    pub preload_retry: RetryPolicy,
    /// Capacity of the signal broadcast channel.
    pub signal_capacity: usize,
    /// Asset reference handling.
    pub resolver: ResolverConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            history_depth: 50,
            paste_offset: (32.0, 32.0),
            hit_tolerance: 4.0,
            settle_window_ms: 16,
            recovery_debounce_ms: 800,
            placeholder_size: (512.0, 512.0),
            placeholder_gap: 24.0,
            upload_retry: RetryPolicy::new(3, 500, 4000, 2.0),
            preload_retry: RetryPolicy::default(),
            signal_capacity: 256,
            resolver: ResolverConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Parse a (possibly partial) JSON configuration object.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Defaults overridden by environment variables.
    ///
    /// Environment variables:
    /// - `CANVAS_SYNC_HISTORY_DEPTH`: undo depth (default: 50)
    /// - `CANVAS_SYNC_RECOVERY_DEBOUNCE_MS`: recovery signal debounce (default: 800)
    /// - `CANVAS_SYNC_PRELOAD_ATTEMPTS`: preload attempts (default: 6)
    /// - `CANVAS_SYNC_PROXY_PATH`: view-layer proxy path
    /// - `CANVAS_SYNC_STORAGE_ORIGINS`: comma-separated storage origins
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(depth) = env_parse("CANVAS_SYNC_HISTORY_DEPTH") {
            config.history_depth = depth;
        }
        if let Some(ms) = env_parse("CANVAS_SYNC_RECOVERY_DEBOUNCE_MS") {
            config.recovery_debounce_ms = ms;
        }
        if let Some(attempts) = env_parse("CANVAS_SYNC_PRELOAD_ATTEMPTS") {
            config.preload_retry.max_attempts = attempts;
        }
        if let Ok(path) = std::env::var("CANVAS_SYNC_PROXY_PATH") {
            config.resolver.proxy_path = path;
        }
        if let Ok(origins) = std::env::var("CANVAS_SYNC_STORAGE_ORIGINS") {
            config.resolver.storage_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect();
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
