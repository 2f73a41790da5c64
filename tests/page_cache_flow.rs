//! End-to-end write and invalidation flows over the in-process store and index.

use std::sync::Arc;

use bytes::Bytes;
use pagecache::cache::{
    BufferedResponse, CacheConfig, CacheStore, CacheTrigger, EventBus, Fingerprint,
    InvalidationService, LookupIndex, MemoryLookupIndex, MemoryStore, PageCacheWriter,
    RequestMeta, WriteOptions, WriteOutcome, derive_key,
};

const D1: &str = "95c5896b9ffa5dbacc02d8680ad56956";

struct Harness {
    config: CacheConfig,
    store: Arc<MemoryStore>,
    index: Arc<MemoryLookupIndex>,
    writer: PageCacheWriter,
    trigger: CacheTrigger,
}

impl Harness {
    fn new() -> Self {
        let config = CacheConfig {
            use_lookup_table: true,
            key_prefix: "site".to_string(),
            ..Default::default()
        };
        let store = Arc::new(MemoryStore::new(&config));
        let index = Arc::new(MemoryLookupIndex::new());
        let writer = PageCacheWriter::new(config.clone(), store.clone(), index.clone());

        let bus = Arc::new(EventBus::new());
        let service = Arc::new(InvalidationService::new(
            &config,
            store.clone(),
            index.clone(),
        ));
        service.subscribe(&bus);

        Self {
            config,
            store,
            index,
            writer,
            trigger: CacheTrigger::new(bus),
        }
    }

    async fn write(&self, host: &str, path: &str, options: &WriteOptions) -> Fingerprint {
        let request = RequestMeta::new(host, path, false);
        let mut response = BufferedResponse::new("content", Some("text/html"));
        match self.writer.write_response(&request, &mut response, options).await {
            WriteOutcome::Cached { key, stored, .. } => {
                assert!(stored, "write to memory store should succeed");
                key
            }
            WriteOutcome::SkippedSecure => panic!("plain request was skipped"),
        }
    }

    async fn cached(&self, key: &Fingerprint) -> Option<Bytes> {
        self.store
            .get(&self.config.namespace().store_key(key))
            .await
            .expect("memory store read")
    }
}

fn under(identifier: &str) -> WriteOptions {
    WriteOptions::default().with_lookup_identifier(identifier)
}

#[tokio::test]
async fn host_scoped_write_then_bulk_invalidate() {
    let harness = Harness::new();

    let key = harness
        .write("example1.com", "/foo/", &WriteOptions::default())
        .await;
    assert_eq!(key.as_str(), D1);
    assert_eq!(
        harness.cached(&key).await,
        Some(Bytes::from_static(b"content"))
    );

    let records = harness.index.query("example1.com", None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].base_cache_key.as_str(), D1);
    assert_eq!(records[0].parent_identifier, "example1.com");
    assert_eq!(records[0].supplementary_identifier, None);

    let report = harness.trigger.many_pages("example1.com", None).await;
    assert!(report.is_clean());

    assert!(harness.cached(&key).await.is_none());
    assert_eq!(
        harness.index.query("example1.com", None).await.unwrap().len(),
        1,
        "lookup rows survive invalidation"
    );
}

#[tokio::test]
async fn bulk_invalidation_is_isolated_per_identifier() {
    let harness = Harness::new();

    let foo = harness.write("example1.com", "/foo/", &under("test1")).await;
    let bar = harness.write("example1.com", "/bar/", &under("test1")).await;
    let baz = harness.write("example1.com", "/baz/", &under("test2")).await;

    harness.trigger.many_pages("test1", None).await;

    assert!(harness.cached(&foo).await.is_none());
    assert!(harness.cached(&bar).await.is_none());
    assert!(harness.cached(&baz).await.is_some());
    assert_eq!(harness.index.len(), 3);
}

#[tokio::test]
async fn parent_identifier_is_paramount() {
    let harness = Harness::new();
    let categorised = |category: &str| under("testsite").with_supplementary_identifier(category);

    let first = harness
        .write("example1.com", "/one/", &categorised("category-1"))
        .await;
    let second = harness
        .write("example1.com", "/two/", &categorised("category-2"))
        .await;
    let plain = harness.write("example1.com", "/three/", &under("testsite")).await;

    // Narrowing by supplementary identifier only touches its own pages.
    harness
        .trigger
        .many_pages("testsite", Some("category-1"))
        .await;
    assert!(harness.cached(&first).await.is_none());
    assert!(harness.cached(&second).await.is_some());
    assert!(harness.cached(&plain).await.is_some());

    // Parent alone clears every supplementary scope.
    harness.trigger.many_pages("testsite", None).await;
    assert!(harness.cached(&second).await.is_none());
    assert!(harness.cached(&plain).await.is_none());
}

#[tokio::test]
async fn unknown_identifier_invalidates_nothing() {
    let harness = Harness::new();
    let key = harness.write("example1.com", "/foo/", &under("foobarbaz")).await;

    let report = harness.trigger.many_pages("demosite", None).await;

    assert!(report.is_clean());
    assert!(harness.cached(&key).await.is_some());
}

#[tokio::test]
async fn single_page_invalidation_is_precise() {
    let harness = Harness::new();
    let foo = harness
        .write("example1.com", "/foo/", &WriteOptions::default())
        .await;
    let root = harness
        .write("example1.com", "/", &WriteOptions::default())
        .await;
    let other_host = harness
        .write("example2.com", "/foo/", &WriteOptions::default())
        .await;
    assert_ne!(foo, other_host);

    harness
        .trigger
        .single_page("example1.com", "/foo/", "", None)
        .await;

    assert!(harness.cached(&foo).await.is_none());
    assert!(harness.cached(&root).await.is_some());
    assert!(harness.cached(&other_host).await.is_some());
}

#[tokio::test]
async fn versioned_pages_round_trip_through_the_cookie() {
    let harness = Harness::new();
    let options = WriteOptions::default().with_page_version(|request: &RequestMeta| {
        if request.full_path.starts_with("/members/") {
            "members".to_string()
        } else {
            String::new()
        }
    });

    let request = RequestMeta::new("example1.com", "/members/home/", false);
    let mut response = BufferedResponse::new("content", Some("text/html"));
    harness
        .writer
        .write_response(&request, &mut response, &options)
        .await;

    // A later request carrying the cookie reproduces the key.
    let version = response.cookie("pv").expect("version cookie").to_string();
    let key = derive_key("example1.com", "/members/home/", "pv", &version);
    assert!(harness.cached(&key).await.is_some());

    harness
        .trigger
        .single_page("example1.com", "/members/home/", &version, None)
        .await;
    assert!(harness.cached(&key).await.is_none());
}

#[tokio::test]
async fn identical_paths_on_different_hosts_are_independent() {
    let harness = Harness::new();

    let first = harness
        .write("example1.com", "/", &WriteOptions::default())
        .await;
    let second = harness
        .write("example2.com", "/", &WriteOptions::default())
        .await;
    assert_ne!(first, second);

    harness.trigger.many_pages("example2.com", None).await;

    assert!(harness.cached(&first).await.is_some());
    assert!(harness.cached(&second).await.is_none());
    assert_eq!(harness.index.len(), 2);
}
