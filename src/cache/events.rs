//! Cache event system.
//!
//! Invalidation triggers publish events on an [`EventBus`]; subscribed listeners run inline
//! before `publish` returns. A failing or panicking listener never affects its siblings or
//! the publisher.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::invalidation::InvalidationError;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::events";

pub(crate) const METRIC_LISTENER_FAILED: &str = "pagecache_listener_failed_total";

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

/// Cache event envelope.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// Unique identifier for log correlation (UUIDv4).
    pub id: Uuid,
    /// Monotonic epoch for ordering within this process.
    pub epoch: Epoch,
    /// The type of cache event.
    pub kind: EventKind,
    /// When the event was created.
    pub timestamp: OffsetDateTime,
}

impl CacheEvent {
    /// Create a new cache event with the given kind and epoch.
    pub fn new(kind: EventKind, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Types of cache events that trigger invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Drop the cached copy of one page.
    ///
    /// `cookie_name` of `None` means the configured default cookie.
    SinglePageInvalidation {
        request_host: String,
        request_path: String,
        page_version: String,
        cookie_name: Option<String>,
    },
    /// Drop every page registered under an identifier in the lookup index.
    ManyPagesInvalidation {
        lookup_identifier: String,
        supplementary_identifier: Option<String>,
    },
}

impl EventKind {
    /// Single-page invalidation with an empty page version and the default cookie.
    pub fn single_page(request_host: impl Into<String>, request_path: impl Into<String>) -> Self {
        Self::SinglePageInvalidation {
            request_host: request_host.into(),
            request_path: request_path.into(),
            page_version: String::new(),
            cookie_name: None,
        }
    }

    /// Bulk invalidation of everything under `lookup_identifier`.
    pub fn many_pages(lookup_identifier: impl Into<String>) -> Self {
        Self::ManyPagesInvalidation {
            lookup_identifier: lookup_identifier.into(),
            supplementary_identifier: None,
        }
    }

    pub fn topic(&self) -> EventTopic {
        match self {
            Self::SinglePageInvalidation { .. } => EventTopic::SinglePage,
            Self::ManyPagesInvalidation { .. } => EventTopic::ManyPages,
        }
    }
}

/// Subscription key: one per [`EventKind`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTopic {
    SinglePage,
    ManyPages,
}

impl EventTopic {
    pub const ALL: [EventTopic; 2] = [EventTopic::SinglePage, EventTopic::ManyPages];
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error(transparent)]
    Invalidation(#[from] InvalidationError),
    #[error("listener panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Other(String),
}

impl ListenerError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

/// Receives events published on an [`EventBus`].
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Name used in logs when the listener fails.
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &CacheEvent) -> Result<(), ListenerError>;
}

/// Outcome of one `publish` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub event_id: Uuid,
    pub delivered: usize,
    pub failed: usize,
}

impl PublishReport {
    /// True when every listener handled the event.
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// In-process publish/subscribe bus.
///
/// Dispatch is synchronous from the publisher's point of view: `publish` awaits every
/// listener of the event's topic, in subscription order, before returning.
pub struct EventBus {
    listeners: RwLock<HashMap<EventTopic, Vec<Arc<dyn EventListener>>>>,
    epoch_counter: AtomicU64,
}

impl EventBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            epoch_counter: AtomicU64::new(0),
        }
    }

    /// Get the next epoch number.
    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Register `listener` for every event of `topic`.
    pub fn subscribe(&self, topic: EventTopic, listener: Arc<dyn EventListener>) {
        debug!(?topic, listener = listener.name(), "Cache event listener subscribed");
        rw_write(&self.listeners, SOURCE, "subscribe")
            .entry(topic)
            .or_default()
            .push(listener);
    }

    /// Number of listeners registered for `topic`.
    pub fn listener_count(&self, topic: EventTopic) -> usize {
        rw_read(&self.listeners, SOURCE, "listener_count")
            .get(&topic)
            .map_or(0, Vec::len)
    }

    /// Publish an event to every listener of its topic.
    ///
    /// Listener errors and panics are logged and counted in the report; they are never
    /// returned to the caller and never stop the remaining listeners.
    pub async fn publish(&self, kind: EventKind) -> PublishReport {
        let topic = kind.topic();
        let event = CacheEvent::new(kind, self.next_epoch());

        // Snapshot so listeners may subscribe further listeners without deadlocking.
        let listeners: Vec<Arc<dyn EventListener>> =
            rw_read(&self.listeners, SOURCE, "publish")
                .get(&topic)
                .cloned()
                .unwrap_or_default();

        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = ?event.kind,
            listeners = listeners.len(),
            "Cache event published"
        );

        let mut report = PublishReport {
            event_id: event.id,
            delivered: 0,
            failed: 0,
        };

        for listener in listeners {
            let outcome = AssertUnwindSafe(listener.handle(&event))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(ListenerError::Panicked(panic_message(&*panic))));

            match outcome {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!(
                        event_id = %event.id,
                        listener = listener.name(),
                        error = %err,
                        "Cache event listener failed"
                    );
                    counter!(METRIC_LISTENER_FAILED).increment(1);
                    report.failed += 1;
                }
            }
        }

        report
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct Recording {
        seen: Mutex<Vec<EventKind>>,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<EventKind> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventListener for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn handle(&self, event: &CacheEvent) -> Result<(), ListenerError> {
            self.seen.lock().unwrap().push(event.kind.clone());
            Ok(())
        }
    }

    struct Failing {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventListener for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn handle(&self, _event: &CacheEvent) -> Result<(), ListenerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ListenerError::other("boom"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl EventListener for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn handle(&self, _event: &CacheEvent) -> Result<(), ListenerError> {
            panic!("listener exploded");
        }
    }

    #[test]
    fn event_creation() {
        let kind = EventKind::many_pages("example1.com");
        let event = CacheEvent::new(kind.clone(), 42);

        assert_eq!(event.epoch, 42);
        assert_eq!(event.kind, kind);
        assert!(!event.id.is_nil());
    }

    #[test]
    fn epoch_monotonicity() {
        let bus = EventBus::new();

        let e1 = bus.next_epoch();
        let e2 = bus.next_epoch();
        let e3 = bus.next_epoch();

        assert!(e1 < e2);
        assert!(e2 < e3);
    }

    #[test]
    fn kinds_map_to_topics() {
        assert_eq!(
            EventKind::single_page("example1.com", "/").topic(),
            EventTopic::SinglePage
        );
        assert_eq!(
            EventKind::many_pages("example1.com").topic(),
            EventTopic::ManyPages
        );
        assert_eq!(
            EventKind::single_page("h", "/p"),
            EventKind::SinglePageInvalidation {
                request_host: "h".to_string(),
                request_path: "/p".to_string(),
                page_version: String::new(),
                cookie_name: None,
            }
        );
    }

    #[tokio::test]
    async fn publish_routes_by_topic() {
        let bus = EventBus::new();
        let single = Recording::new();
        let many = Recording::new();
        bus.subscribe(EventTopic::SinglePage, single.clone());
        bus.subscribe(EventTopic::ManyPages, many.clone());

        let report = bus.publish(EventKind::single_page("example1.com", "/")).await;
        assert_eq!(report.delivered, 1);
        assert!(report.is_clean());

        bus.publish(EventKind::many_pages("example1.com")).await;

        assert_eq!(single.seen(), vec![EventKind::single_page("example1.com", "/")]);
        assert_eq!(many.seen(), vec![EventKind::many_pages("example1.com")]);
    }

    #[tokio::test]
    async fn publish_without_listeners_is_a_no_op() {
        let bus = EventBus::new();
        let report = bus.publish(EventKind::many_pages("nobody")).await;
        assert_eq!(report.delivered, 0);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn failing_listeners_do_not_block_siblings() {
        let bus = EventBus::new();
        let failing = Arc::new(Failing {
            calls: AtomicUsize::new(0),
        });
        let after = Recording::new();

        bus.subscribe(EventTopic::ManyPages, failing.clone());
        bus.subscribe(EventTopic::ManyPages, Arc::new(Panicking));
        bus.subscribe(EventTopic::ManyPages, after.clone());
        assert_eq!(bus.listener_count(EventTopic::ManyPages), 3);
        assert_eq!(bus.listener_count(EventTopic::SinglePage), 0);

        let report = bus.publish(EventKind::many_pages("site")).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 2);
        assert!(!report.is_clean());
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(after.seen().len(), 1);
    }

    #[test]
    fn panic_messages_are_extracted() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static message");
        assert_eq!(panic_message(&*boxed), "static message");

        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(&*owned), "owned message");

        let other: Box<dyn std::any::Any + Send> = Box::new(7_u32);
        assert_eq!(panic_message(&*other), "non-string panic payload");
    }
}
