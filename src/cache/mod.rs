//! Page cache system.
//!
//! Stores rendered pages in a shared key/value store where an edge server can serve them
//! directly, and removes them again when content changes:
//!
//! - **Write path**: [`PageCacheWriter`] derives a [`Fingerprint`] from the request, stores
//!   the body, sets the page-version cookie and registers the page in the [`LookupIndex`].
//! - **Invalidation path**: [`CacheTrigger`] publishes events on the [`EventBus`];
//!   [`InvalidationService`] deletes single pages by fingerprint or whole groups by
//!   lookup identifier.
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `pagecache.toml`:
//!
//! ```toml
//! [cache]
//! cookie_name = "pv"
//! ttl_seconds = 86400
//! use_lookup_table = true
//! # ... see config.rs for all options
//! ```

mod config;
mod events;
mod invalidation;
mod keys;
mod lock;
mod lookup;
mod middleware;
mod minify;
mod store;
mod trigger;
mod writer;

pub use config::CacheConfig;
pub use events::{
    CacheEvent, Epoch, EventBus, EventKind, EventListener, EventTopic, ListenerError,
    PublishReport,
};
pub use invalidation::{InvalidationError, InvalidationService};
pub use keys::{
    DEFAULT_COOKIE_NAME, FINGERPRINT_LEN, FORMAT_VERSION, Fingerprint, KeyNamespace,
    canonical_input, derive_key,
};
pub use lookup::{IndexError, LookupIndex, LookupRecord, MemoryLookupIndex, normalize_identifier};
pub use middleware::{PageCacheState, page_cache_layer};
pub use minify::{is_html, minify_html, strip_spaces_between_tags};
pub use store::{CacheStore, MemoryStore, StoreError};
pub use trigger::CacheTrigger;
pub use writer::{
    BufferedResponse, PageCacheWriter, PageVersionFn, RequestMeta, ResponseSink, WriteOptions,
    WriteOutcome,
};

pub(crate) use lookup::ensure_parent;

/// Metric names, for recorder setup and dashboards.
pub(crate) mod metric_names {
    pub(crate) use super::events::METRIC_LISTENER_FAILED;
    pub(crate) use super::invalidation::{
        METRIC_INVALIDATE_BULK, METRIC_INVALIDATE_BULK_KEYS, METRIC_INVALIDATE_FAILED,
        METRIC_INVALIDATE_SINGLE,
    };
    pub(crate) use super::writer::{
        METRIC_INDEX_INSERT_FAILED, METRIC_STORE_WRITE, METRIC_STORE_WRITE_FAILED,
        METRIC_WRITE_SKIPPED_SECURE,
    };
}
