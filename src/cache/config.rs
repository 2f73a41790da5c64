//! Page cache configuration.
//!
//! Controls key derivation defaults, the write-path toggles, and the in-process store via
//! the `[cache]` table of `pagecache.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

use super::keys::{DEFAULT_COOKIE_NAME, KeyNamespace};

// Default values for cache configuration
const DEFAULT_TTL_SECONDS: u64 = 60 * 60 * 24;
const DEFAULT_MEMORY_STORE_LIMIT: usize = 10_000;
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Page cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Name of the cookie carrying the page version.
    pub cookie_name: String,
    /// Expiry applied to every cache write, in seconds.
    pub ttl_seconds: u64,
    /// Strip whitespace between tags of `text/html` bodies before storing.
    pub minify_html: bool,
    /// Register every cached page in the lookup index.
    pub use_lookup_table: bool,
    /// Cache responses to HTTPS requests too.
    pub include_secure_requests: bool,
    /// Namespace prefix of the composite store key.
    pub key_prefix: String,
    /// Maximum entries held by the in-process store.
    pub memory_store_limit: usize,
    /// Largest response body the middleware buffers for caching.
    pub max_body_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            ttl_seconds: DEFAULT_TTL_SECONDS,
            minify_html: false,
            use_lookup_table: false,
            include_secure_requests: true,
            key_prefix: String::new(),
            memory_store_limit: DEFAULT_MEMORY_STORE_LIMIT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            cookie_name: settings.cookie_name.clone(),
            ttl_seconds: settings.ttl.as_secs(),
            minify_html: settings.minify_html,
            use_lookup_table: settings.use_lookup_table,
            include_secure_requests: settings.include_secure_requests,
            key_prefix: settings.key_prefix.clone(),
            memory_store_limit: settings.memory_store_limit,
            max_body_bytes: settings.max_body_bytes,
        }
    }
}

impl CacheConfig {
    /// Default TTL as a `Duration`.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// Namespace used to build composite store keys.
    pub fn namespace(&self) -> KeyNamespace {
        KeyNamespace::new(self.key_prefix.clone())
    }

    /// Returns the memory store limit as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_store_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_store_limit).unwrap_or(NonZeroUsize::MIN)
    }
}
