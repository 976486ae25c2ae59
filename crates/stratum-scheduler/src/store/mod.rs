//! Document store backends.
//!
//! This module provides the trait and implementations for the document
//! store the scheduler reads policies, metadata, measurements, and data
//! buckets from. The primary implementation uses PostgreSQL with JSONB
//! documents; an in-memory implementation is provided for testing.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::error::{Result, SchedulerError};
use crate::types::{AggregationPolicy, DataDocument, DatabaseMetadata, Measurement, ValueRange};

/// Read/update access to the document store.
///
/// Persistent state (policies, metadata, measurements, data buckets) lives
/// entirely behind this trait; the scheduler itself persists nothing beyond
/// the `last_run` marker and the dirty flags it clears.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Enumerate the databases under supervision, in a stable order.
    async fn list_databases(&self) -> Result<Vec<String>>;

    /// List the aggregation policies of a database.
    ///
    /// Malformed policies are skipped with a warning. An authorisation
    /// failure yields an empty list silently; every other failure is
    /// surfaced.
    async fn list_policies(&self, db: &str) -> Result<Vec<AggregationPolicy>>;

    /// Fetch the field lists for a database.
    ///
    /// Fails if either the required-field or the value-field list is empty.
    async fn fetch_metadata(&self, db: &str) -> Result<DatabaseMetadata>;

    /// Fetch the measurements selected by `selector`, one per identifier,
    /// each carrying the greatest `start` seen for that identifier and the
    /// projection given by `metadata`.
    async fn fetch_measurements(
        &self,
        db: &str,
        selector: &Value,
        metadata: &DatabaseMetadata,
    ) -> Result<HashMap<String, Measurement>>;

    /// Scan the data collection of `interval` for documents whose `updated`
    /// timestamp is at least `since` and whose identifier is in
    /// `identifiers`.
    async fn fetch_dirty(
        &self,
        db: &str,
        interval: i64,
        since: i64,
        identifiers: &HashSet<String>,
    ) -> Result<Vec<DataDocument>>;

    /// Re-fetch data documents by internal id. The result may be smaller
    /// than the input set if documents were deleted in the meantime.
    async fn refetch_by_ids(
        &self,
        db: &str,
        interval: i64,
        ids: &[String],
    ) -> Result<Vec<DataDocument>>;

    /// Remove the `updated`, `updated_start`, and `updated_end` fields from
    /// all matched documents.
    async fn clear_dirty(&self, db: &str, interval: i64, ids: &[String]) -> Result<()>;

    /// Persist the `last_run` marker of a policy.
    async fn set_last_run(&self, db: &str, policy: &str, last_run: i64) -> Result<()>;
}

/// Containment check mirroring JSONB `@>`: an object selector matches when
/// every key is present in the document with a recursively matching value;
/// anything else matches by equality. The empty selector matches every
/// document. The selector is never interpreted beyond this.
pub(crate) fn selector_matches(doc: &Value, selector: &Value) -> bool {
    match selector {
        Value::Object(wanted) => match doc {
            Value::Object(present) => wanted
                .iter()
                .all(|(k, v)| present.get(k).is_some_and(|dv| selector_matches(dv, v))),
            _ => false,
        },
        _ => doc == selector,
    }
}

/// Decode a policy document, or report why it is unusable.
pub(crate) fn decode_policy(doc: &Value) -> std::result::Result<AggregationPolicy, serde_json::Error>
{
    serde_json::from_value(doc.clone())
}

/// Derive the field lists from a metadata record.
///
/// The record holds `meta_fields: {name -> {required: bool, ...}}` and
/// `values: {name -> ...}`; required fields are those flagged `required`.
pub(crate) fn metadata_from_document(db: &str, doc: &Value) -> Result<DatabaseMetadata> {
    let mut required_fields: Vec<String> = doc
        .get("meta_fields")
        .and_then(Value::as_object)
        .map(|fields| {
            fields
                .iter()
                .filter(|(_, spec)| {
                    spec.get("required").and_then(Value::as_bool).unwrap_or(false)
                })
                .map(|(name, _)| name.clone())
                .collect()
        })
        .unwrap_or_default();
    required_fields.sort();

    let mut value_fields: Vec<String> = doc
        .get("values")
        .and_then(Value::as_object)
        .map(|values| values.keys().cloned().collect())
        .unwrap_or_default();
    value_fields.sort();

    if required_fields.is_empty() {
        return Err(SchedulerError::Metadata {
            db: db.to_owned(),
            reason: "no required meta fields".to_owned(),
        });
    }
    if value_fields.is_empty() {
        return Err(SchedulerError::Metadata {
            db: db.to_owned(),
            reason: "no value fields".to_owned(),
        });
    }

    Ok(DatabaseMetadata {
        required_fields,
        value_fields,
    })
}

/// Build a measurement from a raw document, projecting the required meta
/// fields and the `values` subdocument.
pub(crate) fn measurement_from_document(
    doc: &Value,
    metadata: &DatabaseMetadata,
) -> Option<Measurement> {
    let identifier = doc.get("identifier")?.as_str()?.to_owned();
    let start = doc.get("start")?.as_i64()?;

    let mut fields = BTreeMap::new();
    for field in &metadata.required_fields {
        fields.insert(
            field.clone(),
            doc.get(field).cloned().unwrap_or(Value::Null),
        );
    }

    let mut values = BTreeMap::new();
    if let Some(ranges) = doc.get("values").and_then(Value::as_object) {
        for (name, range) in ranges {
            let min = range.get("min").and_then(Value::as_f64);
            let max = range.get("max").and_then(Value::as_f64);
            if let (Some(min), Some(max)) = (min, max) {
                values.insert(name.clone(), ValueRange { min, max });
            }
        }
    }

    Some(Measurement {
        identifier,
        start,
        fields,
        values,
    })
}

/// Fold raw measurement documents down to the latest instance per
/// identifier.
pub(crate) fn collect_latest_measurements<'a>(
    db: &str,
    docs: impl IntoIterator<Item = &'a Value>,
    metadata: &DatabaseMetadata,
) -> HashMap<String, Measurement> {
    let mut latest: HashMap<String, Measurement> = HashMap::new();
    for doc in docs {
        let Some(measurement) = measurement_from_document(doc, metadata) else {
            warn!(db = %db, "skipping malformed measurement document");
            continue;
        };
        match latest.get(&measurement.identifier) {
            Some(existing) if existing.start >= measurement.start => {}
            _ => {
                latest.insert(measurement.identifier.clone(), measurement);
            }
        }
    }
    latest
}

/// Build a data document from its store id and raw JSON body.
pub(crate) fn data_document_from_parts(id: &str, doc: &Value) -> Option<DataDocument> {
    Some(DataDocument {
        id: id.to_owned(),
        identifier: doc.get("identifier")?.as_str()?.to_owned(),
        start: doc.get("start")?.as_i64()?,
        end: doc.get("end")?.as_i64()?,
        updated: doc.get("updated").and_then(Value::as_i64),
        updated_start: doc.get("updated_start").and_then(Value::as_i64),
        updated_end: doc.get("updated_end").and_then(Value::as_i64),
    })
}
