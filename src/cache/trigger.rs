//! Cache trigger service.
//!
//! Provides a high-level API for publishing invalidation events from content-mutation
//! code without constructing [`EventKind`] values by hand.

use std::sync::Arc;

use tracing::debug;

use super::events::{EventBus, EventKind, PublishReport};

/// Cache trigger for publishing invalidation events.
///
/// # Usage
///
/// ```ignore
/// // After a category page is edited:
/// trigger.many_pages("example1.com", Some("category-1")).await;
/// ```
#[derive(Clone)]
pub struct CacheTrigger {
    bus: Arc<EventBus>,
}

impl CacheTrigger {
    /// Create a new cache trigger.
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    /// Publish an event; every subscribed listener has run when this returns.
    pub async fn trigger(&self, kind: EventKind) -> PublishReport {
        let report = self.bus.publish(kind).await;
        if !report.is_clean() {
            debug!(
                event_id = %report.event_id,
                failed = report.failed,
                "Cache trigger completed with listener failures"
            );
        }
        report
    }

    /// Invalidate one page. `cookie_name` of `None` means the configured cookie.
    pub async fn single_page(
        &self,
        host: &str,
        path: &str,
        page_version: &str,
        cookie_name: Option<&str>,
    ) -> PublishReport {
        self.trigger(EventKind::SinglePageInvalidation {
            request_host: host.to_string(),
            request_path: path.to_string(),
            page_version: page_version.to_string(),
            cookie_name: cookie_name.map(str::to_string),
        })
        .await
    }

    /// Invalidate every page registered under `lookup_identifier`.
    pub async fn many_pages(
        &self,
        lookup_identifier: &str,
        supplementary_identifier: Option<&str>,
    ) -> PublishReport {
        self.trigger(EventKind::ManyPagesInvalidation {
            lookup_identifier: lookup_identifier.to_string(),
            supplementary_identifier: supplementary_identifier.map(str::to_string),
        })
        .await
    }

    /// Get the underlying event bus.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}
