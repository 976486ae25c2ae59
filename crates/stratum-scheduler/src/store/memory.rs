//! In-memory document store for testing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::error::{Result, SchedulerError};
use crate::types::{collection_name, AggregationPolicy, DataDocument, DatabaseMetadata, Measurement};

use super::{
    collect_latest_measurements, data_document_from_parts, decode_policy, metadata_from_document,
    selector_matches, DocumentStore,
};

type Collections = HashMap<String, HashMap<String, BTreeMap<String, Value>>>;

/// In-memory document store for testing.
///
/// Documents are held as raw JSON, keyed by database, collection, and id,
/// so tests seed exactly what writer processes would have written. Data is
/// lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<Collections>,
    denied: RwLock<HashSet<String>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document into a collection, replacing any existing one with
    /// the same id.
    pub fn insert_document(&self, db: &str, collection: &str, id: &str, doc: Value) {
        let mut collections = self.collections.write().expect("store lock poisoned");
        collections
            .entry(db.to_owned())
            .or_default()
            .entry(collection.to_owned())
            .or_default()
            .insert(id.to_owned(), doc);
    }

    /// Mark a database as unauthorized; policy listings for it come back
    /// empty without an error, per the store contract.
    pub fn deny_database(&self, db: &str) {
        self.denied
            .write()
            .expect("store lock poisoned")
            .insert(db.to_owned());
    }

    /// Look up a document by id.
    #[must_use]
    pub fn document(&self, db: &str, collection: &str, id: &str) -> Option<Value> {
        let collections = self.collections.read().expect("store lock poisoned");
        collections
            .get(db)
            .and_then(|c| c.get(collection))
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    fn with_collection<T>(
        &self,
        db: &str,
        collection: &str,
        f: impl FnOnce(&BTreeMap<String, Value>) -> T,
    ) -> Result<T> {
        let collections = self
            .collections
            .read()
            .map_err(|_| SchedulerError::store("lock poisoned"))?;
        let empty = BTreeMap::new();
        let docs = collections
            .get(db)
            .and_then(|c| c.get(collection))
            .unwrap_or(&empty);
        Ok(f(docs))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn list_databases(&self) -> Result<Vec<String>> {
        let collections = self
            .collections
            .read()
            .map_err(|_| SchedulerError::store("lock poisoned"))?;
        let mut databases: Vec<String> = collections.keys().cloned().collect();
        databases.sort();
        Ok(databases)
    }

    async fn list_policies(&self, db: &str) -> Result<Vec<AggregationPolicy>> {
        let denied = self
            .denied
            .read()
            .map_err(|_| SchedulerError::store("lock poisoned"))?;
        if denied.contains(db) {
            return Ok(Vec::new());
        }
        drop(denied);

        self.with_collection(db, "aggregate", |docs| {
            let mut policies = Vec::new();
            for (id, doc) in docs {
                match decode_policy(doc) {
                    Ok(policy) => policies.push(policy),
                    Err(e) => {
                        warn!(db = %db, id = %id, error = %e, "skipping malformed policy");
                    }
                }
            }
            policies
        })
    }

    async fn fetch_metadata(&self, db: &str) -> Result<DatabaseMetadata> {
        let doc = self.with_collection(db, "metadata", |docs| {
            docs.values().next().cloned()
        })?;
        let doc = doc.ok_or_else(|| SchedulerError::Metadata {
            db: db.to_owned(),
            reason: "no metadata record".to_owned(),
        })?;
        metadata_from_document(db, &doc)
    }

    async fn fetch_measurements(
        &self,
        db: &str,
        selector: &Value,
        metadata: &DatabaseMetadata,
    ) -> Result<HashMap<String, Measurement>> {
        self.with_collection(db, "measurements", |docs| {
            let matching = docs.values().filter(|doc| selector_matches(doc, selector));
            collect_latest_measurements(db, matching, metadata)
        })
    }

    async fn fetch_dirty(
        &self,
        db: &str,
        interval: i64,
        since: i64,
        identifiers: &HashSet<String>,
    ) -> Result<Vec<DataDocument>> {
        self.with_collection(db, &collection_name(interval), |docs| {
            docs.iter()
                .filter_map(|(id, doc)| data_document_from_parts(id, doc))
                .filter(|doc| {
                    doc.updated.is_some_and(|updated| updated >= since)
                        && identifiers.contains(&doc.identifier)
                })
                .collect()
        })
    }

    async fn refetch_by_ids(
        &self,
        db: &str,
        interval: i64,
        ids: &[String],
    ) -> Result<Vec<DataDocument>> {
        self.with_collection(db, &collection_name(interval), |docs| {
            ids.iter()
                .filter_map(|id| docs.get(id).and_then(|doc| data_document_from_parts(id, doc)))
                .collect()
        })
    }

    async fn clear_dirty(&self, db: &str, interval: i64, ids: &[String]) -> Result<()> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| SchedulerError::store("lock poisoned"))?;
        let Some(docs) = collections
            .get_mut(db)
            .and_then(|c| c.get_mut(&collection_name(interval)))
        else {
            return Ok(());
        };

        for id in ids {
            if let Some(Value::Object(doc)) = docs.get_mut(id) {
                doc.remove("updated");
                doc.remove("updated_start");
                doc.remove("updated_end");
            }
        }
        Ok(())
    }

    async fn set_last_run(&self, db: &str, policy: &str, last_run: i64) -> Result<()> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| SchedulerError::store("lock poisoned"))?;
        let Some(docs) = collections.get_mut(db).and_then(|c| c.get_mut("aggregate")) else {
            return Err(SchedulerError::store(format!(
                "no aggregate collection for database {db}"
            )));
        };

        for doc in docs.values_mut() {
            if doc.get("name").and_then(Value::as_str) == Some(policy) {
                if let Value::Object(fields) = doc {
                    fields.insert("last_run".to_owned(), Value::from(last_run));
                }
                return Ok(());
            }
        }

        Err(SchedulerError::store(format!(
            "policy {policy} not found in database {db}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_document(
            "metrics",
            "aggregate",
            "p1",
            json!({ "name": "minute", "interval": 60, "eval_position": 1 }),
        );
        store.insert_document(
            "metrics",
            "metadata",
            "m1",
            json!({
                "meta_fields": { "host": { "required": true } },
                "values": { "temp": {} }
            }),
        );
        store
    }

    #[tokio::test]
    async fn lists_databases_and_policies() {
        let store = seeded();
        assert_eq!(store.list_databases().await.unwrap(), vec!["metrics"]);

        let policies = store.list_policies("metrics").await.unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].name, "minute");
    }

    #[tokio::test]
    async fn malformed_policy_is_skipped() {
        let store = seeded();
        store.insert_document(
            "metrics",
            "aggregate",
            "p2",
            json!({ "name": "broken", "interval": 300 }),
        );

        let policies = store.list_policies("metrics").await.unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].name, "minute");
    }

    #[tokio::test]
    async fn denied_database_lists_empty_silently() {
        let store = seeded();
        store.deny_database("metrics");
        assert!(store.list_policies("metrics").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dirty_scan_filters_by_since_and_identifier() {
        let store = seeded();
        store.insert_document(
            "metrics",
            "data",
            "d1",
            json!({
                "identifier": "x", "start": 0, "end": 86400,
                "updated": 100, "updated_start": 90, "updated_end": 125
            }),
        );
        store.insert_document(
            "metrics",
            "data",
            "d2",
            json!({
                "identifier": "y", "start": 0, "end": 86400,
                "updated": 10, "updated_start": 5, "updated_end": 8
            }),
        );

        let identifiers: HashSet<String> =
            ["x".to_owned(), "y".to_owned()].into_iter().collect();

        let dirty = store
            .fetch_dirty("metrics", 1, 50, &identifiers)
            .await
            .unwrap();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].identifier, "x");

        let only_y: HashSet<String> = ["y".to_owned()].into_iter().collect();
        let dirty = store.fetch_dirty("metrics", 1, 0, &only_y).await.unwrap();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].identifier, "y");
    }

    #[tokio::test]
    async fn clear_dirty_removes_update_fields() {
        let store = seeded();
        store.insert_document(
            "metrics",
            "data",
            "d1",
            json!({
                "identifier": "x", "start": 0, "end": 86400,
                "updated": 100, "updated_start": 90, "updated_end": 125
            }),
        );

        store
            .clear_dirty("metrics", 1, &["d1".to_owned()])
            .await
            .unwrap();

        let doc = store.document("metrics", "data", "d1").expect("doc");
        assert!(doc.get("updated").is_none());
        assert!(doc.get("updated_start").is_none());
        assert!(doc.get("updated_end").is_none());
        assert_eq!(doc["identifier"], "x");
    }

    #[tokio::test]
    async fn set_last_run_updates_policy_document() {
        let store = seeded();
        store
            .set_last_run("metrics", "minute", 120)
            .await
            .unwrap();

        let doc = store.document("metrics", "aggregate", "p1").expect("doc");
        assert_eq!(doc["last_run"], 120);

        assert!(store.set_last_run("metrics", "missing", 120).await.is_err());
    }

    #[tokio::test]
    async fn refetch_skips_deleted_ids() {
        let store = seeded();
        store.insert_document(
            "metrics",
            "data",
            "d1",
            json!({ "identifier": "x", "start": 0, "end": 86400 }),
        );

        let docs = store
            .refetch_by_ids("metrics", 1, &["d1".to_owned(), "gone".to_owned()])
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "d1");
    }
}
