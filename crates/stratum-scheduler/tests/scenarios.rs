//! End-to-end scheduling scenarios over the in-memory backends.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use stratum_scheduler::{
    AggregationPolicy, DataDocument, DatabaseMetadata, DocumentStore, Measurement,
    MemoryLockService, MemoryPublisher, MemoryStore, Result, Scheduler, SchedulerSettings,
};

/// Full pipeline over the in-memory backends.
struct Pipeline {
    store: Arc<MemoryStore>,
    locks: Arc<MemoryLockService>,
    publisher: Arc<MemoryPublisher>,
    scheduler: Scheduler,
}

impl Pipeline {
    fn new() -> Self {
        Self::with_settings(SchedulerSettings::default())
    }

    fn with_settings(settings: SchedulerSettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let locks = Arc::new(MemoryLockService::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let scheduler = Scheduler::new(
            store.clone(),
            locks.clone(),
            publisher.clone(),
            settings,
        );
        Self {
            store,
            locks,
            publisher,
            scheduler,
        }
    }

    fn seed_policy(&self, db: &str, name: &str, interval: i64, eval_position: i64) {
        self.store.insert_document(
            db,
            "aggregate",
            name,
            json!({
                "name": name,
                "interval": interval,
                "eval_position": eval_position,
                "last_run": 0
            }),
        );
    }

    fn seed_metadata(&self, db: &str) {
        self.store.insert_document(
            db,
            "metadata",
            "meta",
            json!({
                "meta_fields": { "host": { "required": true } },
                "values": { "temp": {} }
            }),
        );
    }

    fn seed_measurement(&self, db: &str, identifier: &str) {
        self.store.insert_document(
            db,
            "measurements",
            identifier,
            json!({
                "identifier": identifier,
                "start": 95,
                "host": "a",
                "values": { "temp": { "min": 1.0, "max": 2.0 } }
            }),
        );
    }

    fn seed_dirty_doc(&self, db: &str, collection: &str, id: &str, identifier: &str) {
        self.store.insert_document(
            db,
            collection,
            id,
            json!({
                "identifier": identifier,
                "start": 0,
                "end": 86400,
                "updated": 100,
                "updated_start": 90,
                "updated_end": 125
            }),
        );
    }

    fn last_run(&self, db: &str, policy: &str) -> i64 {
        self.store
            .document(db, "aggregate", policy)
            .and_then(|doc| doc["last_run"].as_i64())
            .expect("policy document")
    }

    fn is_dirty(&self, db: &str, collection: &str, id: &str) -> bool {
        self.store
            .document(db, collection, id)
            .expect("data document")
            .get("updated")
            .is_some()
    }
}

#[tokio::test]
async fn empty_system_publishes_nothing_and_sleeps() {
    let mut pipeline = Pipeline::new();

    let next_wake = pipeline.scheduler.pass(1000).await;

    assert_eq!(next_wake, 1060);
    assert!(pipeline.publisher.is_empty());
}

#[tokio::test]
async fn single_dirty_document_produces_one_work_order() {
    let mut pipeline = Pipeline::new();
    pipeline.seed_policy("metrics", "minute", 60, 1);
    pipeline.seed_metadata("metrics");
    pipeline.seed_measurement("metrics", "x");
    pipeline.seed_dirty_doc("metrics", "data", "d1", "x");

    let next_wake = pipeline.scheduler.pass(130).await;

    let orders = pipeline.publisher.orders();
    assert_eq!(orders.len(), 1);
    let order = &orders[0];
    assert_eq!(order.db, "metrics");
    assert_eq!(order.interval_from, 1);
    assert_eq!(order.interval_to, 60);
    assert_eq!(order.start, 60);
    assert_eq!(order.end, 180);
    assert_eq!(order.required_meta, vec!["host"]);
    assert_eq!(order.values.len(), 1);
    assert_eq!(order.values[0].name, "temp");
    assert_eq!(order.values[0].hist_res, None);
    assert_eq!(order.meta.len(), 1);
    assert_eq!(order.meta[0].fields["host"], json!("a"));

    // last_run lands on the interval boundary, never the raw clock.
    assert_eq!(pipeline.last_run("metrics", "minute"), 120);
    assert_eq!(next_wake, 180);

    assert!(!pipeline.is_dirty("metrics", "data", "d1"));
    assert!(pipeline.locks.held_keys().is_empty());
}

#[tokio::test]
async fn second_run_without_writer_activity_is_silent() {
    let mut pipeline = Pipeline::new();
    pipeline.seed_policy("metrics", "minute", 60, 1);
    pipeline.seed_metadata("metrics");
    pipeline.seed_measurement("metrics", "x");
    pipeline.seed_dirty_doc("metrics", "data", "d1", "x");

    pipeline.scheduler.pass(130).await;
    assert_eq!(pipeline.publisher.len(), 1);

    // The policy is due again, but nothing changed since the first run.
    pipeline.scheduler.pass(190).await;

    assert_eq!(pipeline.publisher.len(), 1);
    assert_eq!(pipeline.last_run("metrics", "minute"), 180);
}

#[tokio::test]
async fn same_interval_policies_tie_break_by_weight() {
    let mut pipeline = Pipeline::new();
    pipeline.seed_policy("metrics", "minute-heavy", 60, 5);
    pipeline.seed_policy("metrics", "minute-light", 60, 1);
    pipeline.seed_metadata("metrics");
    pipeline.seed_measurement("metrics", "x");
    pipeline.seed_dirty_doc("metrics", "data", "d1", "x");

    pipeline.scheduler.pass(130).await;

    // Only the heavier policy emitted work for "x".
    let orders = pipeline.publisher.orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].interval_to, 60);

    // Both policies still advanced.
    assert_eq!(pipeline.last_run("metrics", "minute-heavy"), 120);
    assert_eq!(pipeline.last_run("metrics", "minute-light"), 120);
}

#[tokio::test]
async fn coarser_policy_reads_from_finer_output() {
    let mut pipeline = Pipeline::new();
    pipeline.seed_policy("metrics", "minute", 60, 1);
    pipeline.seed_policy("metrics", "five-minute", 300, 1);
    pipeline.seed_metadata("metrics");
    pipeline.seed_measurement("metrics", "x");
    pipeline.seed_dirty_doc("metrics", "data", "d1", "x");
    // The minute worker's output bucket, marked dirty by its writer.
    pipeline.seed_dirty_doc("metrics", "data_60", "d60", "x");

    pipeline.scheduler.pass(601).await;

    let orders = pipeline.publisher.orders();
    assert_eq!(orders.len(), 2);

    // The minute policy ran first over raw data.
    assert_eq!(orders[0].interval_from, 1);
    assert_eq!(orders[0].interval_to, 60);

    // The five-minute policy sourced the minute output, not raw data.
    assert_eq!(orders[1].interval_from, 60);
    assert_eq!(orders[1].interval_to, 300);
    assert_eq!(orders[1].start, 0);
    assert_eq!(orders[1].end, 300);

    assert!(!pipeline.is_dirty("metrics", "data", "d1"));
    assert!(!pipeline.is_dirty("metrics", "data_60", "d60"));
}

#[tokio::test]
async fn uncovered_measurement_reads_raw_data() {
    let mut pipeline = Pipeline::new();
    pipeline.seed_policy("metrics", "five-minute", 300, 1);
    pipeline.seed_metadata("metrics");
    pipeline.seed_measurement("metrics", "y");
    pipeline.seed_dirty_doc("metrics", "data", "d1", "y");

    pipeline.scheduler.pass(601).await;

    let orders = pipeline.publisher.orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].interval_from, 1);
    assert_eq!(orders[0].interval_to, 300);
}

#[tokio::test]
async fn work_orders_cap_meta_entries() {
    let mut pipeline = Pipeline::new();
    pipeline.seed_policy("metrics", "minute", 60, 1);
    pipeline.seed_metadata("metrics");
    for i in 0..60 {
        let identifier = format!("m{i:02}");
        pipeline.seed_measurement("metrics", &identifier);
        pipeline.seed_dirty_doc("metrics", "data", &format!("d{i:02}"), &identifier);
    }

    pipeline.scheduler.pass(130).await;

    let orders = pipeline.publisher.orders();
    let sizes: Vec<usize> = orders.iter().map(|o| o.meta.len()).collect();
    assert_eq!(sizes, vec![50, 10]);
    assert_eq!(orders[0].start, orders[1].start);
    assert_eq!(orders[0].end, orders[1].end);
}

#[tokio::test]
async fn lock_contention_abandons_the_policy_pass() {
    let mut pipeline = Pipeline::new();
    pipeline.seed_policy("metrics", "minute", 60, 1);
    pipeline.seed_metadata("metrics");
    pipeline.seed_measurement("metrics", "x");
    pipeline.seed_dirty_doc("metrics", "data", "d1", "x");
    // A writer is mid-mutation on the document.
    pipeline.locks.hold("lock__metrics__data__x__0__86400");

    pipeline.scheduler.pass(130).await;

    assert!(pipeline.publisher.is_empty());
    assert!(pipeline.is_dirty("metrics", "data", "d1"));
    assert_eq!(pipeline.last_run("metrics", "minute"), 0);
    // Only the writer's own lock remains held.
    assert_eq!(
        pipeline.locks.held_keys(),
        vec!["lock__metrics__data__x__0__86400"]
    );
}

#[tokio::test]
async fn publish_failure_keeps_dirty_flags() {
    let mut pipeline = Pipeline::new();
    pipeline.seed_policy("metrics", "minute", 60, 1);
    pipeline.seed_metadata("metrics");
    pipeline.seed_measurement("metrics", "x");
    pipeline.seed_dirty_doc("metrics", "data", "d1", "x");
    pipeline.publisher.set_failing(true);

    pipeline.scheduler.pass(130).await;

    assert!(pipeline.is_dirty("metrics", "data", "d1"));
    assert_eq!(pipeline.last_run("metrics", "minute"), 0);
    assert!(pipeline.locks.held_keys().is_empty());

    // The broker recovers; the next pass re-emits the same window.
    pipeline.publisher.set_failing(false);
    pipeline.scheduler.pass(140).await;

    let orders = pipeline.publisher.orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].start, 60);
    assert_eq!(orders[0].end, 180);
    assert!(!pipeline.is_dirty("metrics", "data", "d1"));
    assert_eq!(pipeline.last_run("metrics", "minute"), 120);
}

/// Store whose re-read under lock always comes back empty, as if every
/// scanned document had been deleted between scan and lock.
struct VanishingStore {
    inner: MemoryStore,
}

#[async_trait]
impl DocumentStore for VanishingStore {
    async fn list_databases(&self) -> Result<Vec<String>> {
        self.inner.list_databases().await
    }

    async fn list_policies(&self, db: &str) -> Result<Vec<AggregationPolicy>> {
        self.inner.list_policies(db).await
    }

    async fn fetch_metadata(&self, db: &str) -> Result<DatabaseMetadata> {
        self.inner.fetch_metadata(db).await
    }

    async fn fetch_measurements(
        &self,
        db: &str,
        selector: &Value,
        metadata: &DatabaseMetadata,
    ) -> Result<HashMap<String, Measurement>> {
        self.inner.fetch_measurements(db, selector, metadata).await
    }

    async fn fetch_dirty(
        &self,
        db: &str,
        interval: i64,
        since: i64,
        identifiers: &HashSet<String>,
    ) -> Result<Vec<DataDocument>> {
        self.inner.fetch_dirty(db, interval, since, identifiers).await
    }

    async fn refetch_by_ids(
        &self,
        _db: &str,
        _interval: i64,
        _ids: &[String],
    ) -> Result<Vec<DataDocument>> {
        Ok(Vec::new())
    }

    async fn clear_dirty(&self, db: &str, interval: i64, ids: &[String]) -> Result<()> {
        self.inner.clear_dirty(db, interval, ids).await
    }

    async fn set_last_run(&self, db: &str, policy: &str, last_run: i64) -> Result<()> {
        self.inner.set_last_run(db, policy, last_run).await
    }
}

#[tokio::test]
async fn stolen_documents_yield_vacuous_success() {
    let inner = MemoryStore::new();
    inner.insert_document(
        "metrics",
        "aggregate",
        "minute",
        json!({ "name": "minute", "interval": 60, "eval_position": 1, "last_run": 0 }),
    );
    inner.insert_document(
        "metrics",
        "metadata",
        "meta",
        json!({
            "meta_fields": { "host": { "required": true } },
            "values": { "temp": {} }
        }),
    );
    inner.insert_document(
        "metrics",
        "measurements",
        "x",
        json!({
            "identifier": "x", "start": 95, "host": "a",
            "values": { "temp": { "min": 1.0, "max": 2.0 } }
        }),
    );
    inner.insert_document(
        "metrics",
        "data",
        "d1",
        json!({
            "identifier": "x", "start": 0, "end": 86400,
            "updated": 100, "updated_start": 90, "updated_end": 125
        }),
    );

    let store = Arc::new(VanishingStore { inner });
    let locks = Arc::new(MemoryLockService::new());
    let publisher = Arc::new(MemoryPublisher::new());
    let mut scheduler = Scheduler::new(
        store.clone(),
        locks.clone(),
        publisher.clone(),
        SchedulerSettings::default(),
    );

    scheduler.pass(130).await;

    // Nothing to publish and no flags cleared, but the pass succeeded
    // vacuously and the policy still advanced.
    assert!(publisher.is_empty());
    assert!(store
        .inner
        .document("metrics", "data", "d1")
        .expect("data document")
        .get("updated")
        .is_some());
    assert_eq!(
        store
            .inner
            .document("metrics", "aggregate", "minute")
            .expect("policy document")["last_run"],
        120
    );
    assert!(locks.held_keys().is_empty());
}
