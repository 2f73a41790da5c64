//! Cache key definitions.
//!
//! A page is addressed by a [`Fingerprint`] computed from the request host, the full path
//! (including the query string) and the page-version cookie. The edge server computes the
//! same fingerprint from the incoming request, so the derivation below must never drift
//! between the write path and the invalidation path.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default name of the cookie that carries the page version.
pub const DEFAULT_COOKIE_NAME: &str = "pv";

/// Version segment of the composite store key. The edge server only ever looks up `1`.
pub const FORMAT_VERSION: u32 = 1;

/// Width in hex characters of every fingerprint.
pub const FINGERPRINT_LEN: usize = 32;

const DIGEST_BYTES: usize = FINGERPRINT_LEN / 2;

/// Fixed-width digest identifying one cached response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already-computed fingerprint, e.g. one loaded from the lookup index.
    pub fn from_hex(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Build the canonical string that gets digested: `{host}{full_path}&{cookie_name}={page_version}`.
pub fn canonical_input(host: &str, full_path: &str, cookie_name: &str, page_version: &str) -> String {
    format!("{host}{full_path}&{cookie_name}={page_version}")
}

/// Derive the fingerprint for a page.
///
/// The digest is the first 16 bytes of SHA-256 over [`canonical_input`], hex encoded.
/// An empty `page_version` is valid and yields its own stable key.
pub fn derive_key(host: &str, full_path: &str, cookie_name: &str, page_version: &str) -> Fingerprint {
    let raw = canonical_input(host, full_path, cookie_name, page_version);
    let digest = Sha256::digest(raw.as_bytes());
    Fingerprint(hex::encode(&digest[..DIGEST_BYTES]))
}

/// Namespace applied to fingerprints before they reach the shared store.
///
/// The external reader sees `{prefix}:{FORMAT_VERSION}:{fingerprint}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyNamespace {
    prefix: String,
}

impl KeyNamespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Composite key under which the store holds the page for `fingerprint`.
    pub fn store_key(&self, fingerprint: &Fingerprint) -> String {
        format!("{}:{}:{}", self.prefix, FORMAT_VERSION, fingerprint)
    }
}
