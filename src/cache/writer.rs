//! Write path: store a rendered page where the edge server can find it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Uri, header, request::Parts};
use bytes::Bytes;
use metrics::counter;
use tracing::{debug, info, instrument, warn};

use super::config::CacheConfig;
use super::keys::{Fingerprint, KeyNamespace, derive_key};
use super::lookup::{LookupIndex, normalize_identifier};
use super::minify::{is_html, minify_html};
use super::store::CacheStore;

pub(crate) const METRIC_STORE_WRITE: &str = "pagecache_store_write_total";
pub(crate) const METRIC_STORE_WRITE_FAILED: &str = "pagecache_store_write_failed_total";
pub(crate) const METRIC_WRITE_SKIPPED_SECURE: &str = "pagecache_write_skipped_secure_total";
pub(crate) const METRIC_INDEX_INSERT_FAILED: &str = "pagecache_index_insert_failed_total";

/// What the cache needs to know about the request that produced a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMeta {
    /// Host as sent by the client, including a non-default port.
    pub host: String,
    /// Path plus query string.
    pub full_path: String,
    /// Whether the request arrived over TLS, directly or via a trusted proxy.
    pub is_secure: bool,
}

impl RequestMeta {
    pub fn new(host: impl Into<String>, full_path: impl Into<String>, is_secure: bool) -> Self {
        Self {
            host: host.into(),
            full_path: full_path.into(),
            is_secure,
        }
    }

    /// Extract request metadata from HTTP request parts.
    ///
    /// A request is secure when its URI scheme is `https`, when `X-Forwarded-Proto` is
    /// `https`, or when `X-Forwarded-SSL` is `on`.
    pub fn from_parts(parts: &Parts) -> Self {
        Self {
            host: request_host(&parts.headers, &parts.uri),
            full_path: full_path(&parts.uri),
            is_secure: is_secure(&parts.headers, &parts.uri),
        }
    }
}

fn request_host(headers: &HeaderMap, uri: &Uri) -> String {
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|authority| authority.to_string()))
        .unwrap_or_default()
}

fn full_path(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string())
}

fn is_secure(headers: &HeaderMap, uri: &Uri) -> bool {
    if uri.scheme_str().is_some_and(|s| s.eq_ignore_ascii_case("https")) {
        return true;
    }

    let header_is = |name: &str, expected: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.trim().eq_ignore_ascii_case(expected))
    };

    header_is("x-forwarded-proto", "https") || header_is("x-forwarded-ssl", "on")
}

/// Response being written to the cache.
pub trait ResponseSink {
    fn content(&self) -> &Bytes;

    fn set_content(&mut self, content: Bytes);

    fn content_type(&self) -> Option<&str>;

    fn set_cookie(&mut self, name: &str, value: &str);
}

/// Fully buffered response body plus the cookies the cache asked to set.
#[derive(Debug, Clone, Default)]
pub struct BufferedResponse {
    pub content: Bytes,
    pub content_type: Option<String>,
    pub cookies: Vec<(String, String)>,
}

impl BufferedResponse {
    pub fn new(content: impl Into<Bytes>, content_type: Option<&str>) -> Self {
        Self {
            content: content.into(),
            content_type: content_type.map(str::to_string),
            cookies: Vec::new(),
        }
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(cookie, _)| cookie == name)
            .map(|(_, value)| value.as_str())
    }
}

impl ResponseSink for BufferedResponse {
    fn content(&self) -> &Bytes {
        &self.content
    }

    fn set_content(&mut self, content: Bytes) {
        self.content = content;
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn set_cookie(&mut self, name: &str, value: &str) {
        self.cookies.retain(|(cookie, _)| cookie != name);
        self.cookies.push((name.to_string(), value.to_string()));
    }
}

/// Resolves the page version token for a request.
pub type PageVersionFn = Arc<dyn Fn(&RequestMeta) -> String + Send + Sync>;

/// Per-call options for [`PageCacheWriter::write_response`].
///
/// Unset `ttl` and `cookie_name` fall back to the writer's [`CacheConfig`].
#[derive(Clone, Default)]
pub struct WriteOptions {
    pub ttl: Option<Duration>,
    pub cookie_name: Option<String>,
    pub page_version_fn: Option<PageVersionFn>,
    pub lookup_identifier: Option<String>,
    pub supplementary_identifier: Option<String>,
}

impl WriteOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_cookie_name(mut self, cookie_name: impl Into<String>) -> Self {
        self.cookie_name = Some(cookie_name.into());
        self
    }

    pub fn with_page_version<F>(mut self, page_version_fn: F) -> Self
    where
        F: Fn(&RequestMeta) -> String + Send + Sync + 'static,
    {
        self.page_version_fn = Some(Arc::new(page_version_fn));
        self
    }

    pub fn with_lookup_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.lookup_identifier = Some(identifier.into());
        self
    }

    pub fn with_supplementary_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.supplementary_identifier = Some(identifier.into());
        self
    }
}

impl fmt::Debug for WriteOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteOptions")
            .field("ttl", &self.ttl)
            .field("cookie_name", &self.cookie_name)
            .field("page_version_fn", &self.page_version_fn.is_some())
            .field("lookup_identifier", &self.lookup_identifier)
            .field("supplementary_identifier", &self.supplementary_identifier)
            .finish()
    }
}

/// Result of a write attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Secure requests are excluded by configuration; nothing was written.
    SkippedSecure,
    /// The page went through the write path. `stored` and `indexed` report which of the
    /// best-effort side effects actually succeeded.
    Cached {
        key: Fingerprint,
        page_version: String,
        stored: bool,
        indexed: bool,
    },
}

/// Orchestrates the write path.
///
/// Store and index failures are logged and counted but never surface to the caller: the
/// response was already produced, only future cache hits are affected.
pub struct PageCacheWriter {
    config: CacheConfig,
    namespace: KeyNamespace,
    store: Arc<dyn CacheStore>,
    index: Arc<dyn LookupIndex>,
}

impl PageCacheWriter {
    pub fn new(config: CacheConfig, store: Arc<dyn CacheStore>, index: Arc<dyn LookupIndex>) -> Self {
        let namespace = config.namespace();
        Self {
            config,
            namespace,
            store,
            index,
        }
    }

    /// Cache a rendered response.
    #[instrument(skip_all, fields(host = %request.host, path = %request.full_path))]
    pub async fn write_response<R>(
        &self,
        request: &RequestMeta,
        response: &mut R,
        options: &WriteOptions,
    ) -> WriteOutcome
    where
        R: ResponseSink + Send,
    {
        if request.is_secure && !self.config.include_secure_requests {
            debug!("Page cache write skipped: secure requests excluded");
            counter!(METRIC_WRITE_SKIPPED_SECURE).increment(1);
            return WriteOutcome::SkippedSecure;
        }

        if self.config.minify_html && is_html(response.content_type()) {
            match minify_html(response.content()) {
                Some(minified) => response.set_content(minified),
                None => debug!("HTML minification skipped: body is not valid UTF-8"),
            }
        }

        let page_version = options
            .page_version_fn
            .as_ref()
            .map(|resolve| resolve(request))
            .unwrap_or_default();
        let cookie_name = options
            .cookie_name
            .as_deref()
            .unwrap_or(&self.config.cookie_name);
        let ttl = options.ttl.unwrap_or_else(|| self.config.ttl());

        let key = derive_key(&request.host, &request.full_path, cookie_name, &page_version);
        let store_key = self.namespace.store_key(&key);

        info!(
            host = %request.host,
            path = %request.full_path,
            page_version = %page_version,
            cookie_name,
            cache_key = %key,
            "Caching page"
        );

        let stored = match self
            .store
            .set(&store_key, response.content().clone(), ttl)
            .await
        {
            Ok(()) => {
                counter!(METRIC_STORE_WRITE).increment(1);
                true
            }
            Err(err) => {
                warn!(error = %err, cache_key = %key, "Page cache store write failed");
                counter!(METRIC_STORE_WRITE_FAILED).increment(1);
                false
            }
        };

        if !page_version.is_empty() {
            response.set_cookie(cookie_name, &page_version);
        }

        let indexed = if self.config.use_lookup_table && stored {
            self.register(&key, request, options).await
        } else {
            false
        };

        WriteOutcome::Cached {
            key,
            page_version,
            stored,
            indexed,
        }
    }

    async fn register(&self, key: &Fingerprint, request: &RequestMeta, options: &WriteOptions) -> bool {
        let parent = normalize_identifier(options.lookup_identifier.as_deref())
            .unwrap_or(&request.host);
        let supplementary = normalize_identifier(options.supplementary_identifier.as_deref());

        match self.index.insert(key, parent, supplementary).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    error = %err,
                    cache_key = %key,
                    parent_identifier = parent,
                    "Lookup index registration failed"
                );
                counter!(METRIC_INDEX_INSERT_FAILED).increment(1);
                false
            }
        }
    }

    /// Get the underlying config.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get the store key namespace.
    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }
}
