//! Invalidation path: drop cached pages when their content changes.
//!
//! Single pages are addressed by recomputing their fingerprint from request state. Whole
//! groups are addressed through the lookup index. Index rows are never removed here:
//! deleting an absent store key is cheap, re-creating rows under write pressure is not.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::config::CacheConfig;
use super::events::{CacheEvent, EventBus, EventKind, EventListener, EventTopic, ListenerError};
use super::keys::{Fingerprint, KeyNamespace, derive_key};
use super::lookup::{IndexError, LookupIndex, normalize_identifier};
use super::store::{CacheStore, StoreError};
use super::writer::RequestMeta;

pub(crate) const METRIC_INVALIDATE_SINGLE: &str = "pagecache_invalidate_single_total";
pub(crate) const METRIC_INVALIDATE_BULK: &str = "pagecache_invalidate_bulk_total";
pub(crate) const METRIC_INVALIDATE_FAILED: &str = "pagecache_invalidate_failed_total";
pub(crate) const METRIC_INVALIDATE_BULK_KEYS: &str = "pagecache_invalidate_bulk_keys";

#[derive(Debug, Error)]
pub enum InvalidationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Executes single-page and bulk invalidation against the store.
pub struct InvalidationService {
    cookie_name: String,
    namespace: KeyNamespace,
    store: Arc<dyn CacheStore>,
    index: Arc<dyn LookupIndex>,
}

impl InvalidationService {
    pub fn new(config: &CacheConfig, store: Arc<dyn CacheStore>, index: Arc<dyn LookupIndex>) -> Self {
        Self {
            cookie_name: config.cookie_name.clone(),
            namespace: config.namespace(),
            store,
            index,
        }
    }

    /// Subscribe this service to both invalidation topics of `bus`.
    pub fn subscribe(self: &Arc<Self>, bus: &EventBus) {
        for topic in EventTopic::ALL {
            bus.subscribe(topic, self.clone());
        }
    }

    /// Drop the cached copy of one page.
    ///
    /// Uses the same derivation as the write path; `cookie_name` of `None` means the
    /// configured cookie. The lookup index is left untouched.
    #[instrument(skip(self))]
    pub async fn invalidate_one(
        &self,
        host: &str,
        path: &str,
        page_version: &str,
        cookie_name: Option<&str>,
    ) -> Result<Fingerprint, InvalidationError> {
        let cookie_name = cookie_name.unwrap_or(&self.cookie_name);
        let key = derive_key(host, path, cookie_name, page_version);

        if let Err(err) = self.store.delete(&self.namespace.store_key(&key)).await {
            warn!(error = %err, cache_key = %key, "Single page invalidation failed");
            counter!(METRIC_INVALIDATE_FAILED).increment(1);
            return Err(err.into());
        }

        counter!(METRIC_INVALIDATE_SINGLE).increment(1);
        info!(cache_key = %key, host, path, page_version, "Page invalidated");
        Ok(key)
    }

    /// Drop the cached copy of the page a request would have produced.
    pub async fn invalidate_request(
        &self,
        request: &RequestMeta,
        page_version: &str,
        cookie_name: Option<&str>,
    ) -> Result<Fingerprint, InvalidationError> {
        self.invalidate_one(&request.host, &request.full_path, page_version, cookie_name)
            .await
    }

    /// Drop every page registered under `parent_identifier`.
    ///
    /// Without `supplementary_identifier` every record under the parent matches, whatever
    /// its own supplementary value; with it, only exact matches do. A blank supplementary
    /// identifier counts as absent. Returns the fingerprints whose store entries were
    /// deleted.
    #[instrument(skip(self))]
    pub async fn invalidate_many(
        &self,
        parent_identifier: &str,
        supplementary_identifier: Option<&str>,
    ) -> Result<Vec<Fingerprint>, InvalidationError> {
        let supplementary_identifier = normalize_identifier(supplementary_identifier);

        let records = match self
            .index
            .query(parent_identifier, supplementary_identifier)
            .await
        {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, parent_identifier, "Lookup index query failed");
                counter!(METRIC_INVALIDATE_FAILED).increment(1);
                return Err(err.into());
            }
        };

        let mut keys: Vec<Fingerprint> =
            records.into_iter().map(|record| record.base_cache_key).collect();
        keys.sort();
        keys.dedup();

        if keys.is_empty() {
            info!(parent_identifier, "Bulk invalidation matched no pages");
            return Ok(keys);
        }

        let store_keys: Vec<String> = keys
            .iter()
            .map(|key| self.namespace.store_key(key))
            .collect();

        if let Err(err) = self.store.delete_many(&store_keys).await {
            warn!(
                error = %err,
                parent_identifier,
                key_count = keys.len(),
                "Bulk invalidation failed"
            );
            counter!(METRIC_INVALIDATE_FAILED).increment(1);
            return Err(err.into());
        }

        counter!(METRIC_INVALIDATE_BULK).increment(1);
        histogram!(METRIC_INVALIDATE_BULK_KEYS).record(keys.len() as f64);
        info!(
            parent_identifier,
            supplementary_identifier,
            key_count = keys.len(),
            "Pages invalidated"
        );
        Ok(keys)
    }
}

#[async_trait]
impl EventListener for InvalidationService {
    fn name(&self) -> &'static str {
        "invalidation_service"
    }

    async fn handle(&self, event: &CacheEvent) -> Result<(), ListenerError> {
        match &event.kind {
            EventKind::SinglePageInvalidation {
                request_host,
                request_path,
                page_version,
                cookie_name,
            } => {
                self.invalidate_one(
                    request_host,
                    request_path,
                    page_version,
                    cookie_name.as_deref(),
                )
                .await?;
            }
            EventKind::ManyPagesInvalidation {
                lookup_identifier,
                supplementary_identifier,
            } => {
                self.invalidate_many(lookup_identifier, supplementary_identifier.as_deref())
                    .await?;
            }
        }
        Ok(())
    }
}
