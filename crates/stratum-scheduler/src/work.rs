//! Work-order assembly and emission.
//!
//! Dirty documents are grouped by the target-interval window their changed
//! region touches; each group becomes one work order (chunked at
//! [`MAX_META_ENTRIES`] measurements) because a worker can serve a whole
//! window with one query. Dirty flags are cleared only after every chunk of
//! every group was published and no held lock has expired.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, SchedulerError};
use crate::lock::LockHandle;
use crate::publish::WorkPublisher;
use crate::store::DocumentStore;
use crate::types::{
    ceil_to, floor_to, AggregationPolicy, DataDocument, DatabaseMetadata, Measurement, MetaEntry,
    MetaValue, ValueSpec, WorkOrder,
};

/// Cap on `meta` entries per work order.
pub const MAX_META_ENTRIES: usize = 50;

/// Group documents by the `(floor, ceil)` window their changed region
/// covers in the target interval. Identifier sets are ordered, so the
/// grouping does not depend on the order documents were observed in.
fn group_documents(
    docs: &[DataDocument],
    interval_to: i64,
) -> BTreeMap<(i64, i64), BTreeSet<String>> {
    let mut groups: BTreeMap<(i64, i64), BTreeSet<String>> = BTreeMap::new();
    for doc in docs {
        let (Some(updated_start), Some(updated_end)) = (doc.updated_start, doc.updated_end)
        else {
            warn!(id = %doc.id, "dirty document missing update bounds, skipping");
            continue;
        };
        let window = (
            floor_to(updated_start, interval_to),
            ceil_to(updated_end, interval_to),
        );
        groups.entry(window).or_default().insert(doc.identifier.clone());
    }
    groups
}

/// Histogram specs for every value field of the database, tuned by the
/// policy where it says so and null otherwise.
fn envelope_values(policy: &AggregationPolicy, metadata: &DatabaseMetadata) -> Vec<ValueSpec> {
    metadata
        .value_fields
        .iter()
        .map(|name| {
            let tuning = policy.values.get(name);
            ValueSpec {
                name: name.clone(),
                hist_res: tuning.and_then(|t| t.hist_res),
                hist_min_width: tuning.and_then(|t| t.hist_min_width),
            }
        })
        .collect()
}

fn meta_entry(measurement: &Measurement, metadata: &DatabaseMetadata) -> MetaEntry {
    MetaEntry {
        values: measurement
            .values
            .iter()
            .map(|(name, range)| MetaValue {
                name: name.clone(),
                min: range.min,
                max: range.max,
            })
            .collect(),
        fields: metadata
            .required_fields
            .iter()
            .map(|field| {
                (
                    field.clone(),
                    measurement.fields.get(field).cloned().unwrap_or(Value::Null),
                )
            })
            .collect(),
    }
}

/// Publish the work orders for one `(policy, source interval)` bucket.
///
/// Returns the number of messages published.
pub async fn emit_work(
    publisher: &dyn WorkPublisher,
    db: &str,
    policy: &AggregationPolicy,
    metadata: &DatabaseMetadata,
    interval_from: i64,
    interval_to: i64,
    docs: &[DataDocument],
    measurements: &HashMap<String, Measurement>,
) -> Result<usize> {
    let values = envelope_values(policy, metadata);
    let mut published = 0usize;

    for ((start, end), identifiers) in group_documents(docs, interval_to) {
        let make_order = |meta: Vec<MetaEntry>| WorkOrder {
            db: db.to_owned(),
            interval_from,
            interval_to,
            start,
            end,
            required_meta: metadata.required_fields.clone(),
            values: values.clone(),
            meta,
        };

        let mut meta = Vec::new();
        for identifier in &identifiers {
            let Some(measurement) = measurements.get(identifier) else {
                continue;
            };
            meta.push(meta_entry(measurement, metadata));

            if meta.len() == MAX_META_ENTRIES {
                publisher.publish(&make_order(std::mem::take(&mut meta))).await?;
                published += 1;
            }
        }

        if !meta.is_empty() {
            publisher.publish(&make_order(meta)).await?;
            published += 1;
        }
    }

    Ok(published)
}

/// Publish a bucket's work orders and clear its dirty flags.
///
/// Flags are only cleared after all chunks published and while every held
/// lock is still within its TTL; on any failure the flags stay set and the
/// next pass re-discovers the work.
pub async fn emit_and_clear(
    store: &dyn DocumentStore,
    publisher: &dyn WorkPublisher,
    db: &str,
    policy: &AggregationPolicy,
    metadata: &DatabaseMetadata,
    interval_from: i64,
    interval_to: i64,
    docs: &[DataDocument],
    measurements: &HashMap<String, Measurement>,
    held: &[LockHandle],
) -> Result<usize> {
    if docs.is_empty() {
        return Ok(0);
    }

    let published = emit_work(
        publisher,
        db,
        policy,
        metadata,
        interval_from,
        interval_to,
        docs,
        measurements,
    )
    .await?;

    if let Some(handle) = held.iter().find(|h| h.is_expired()) {
        return Err(SchedulerError::LockExpired(handle.key().to_owned()));
    }

    let ids: Vec<String> = docs.iter().map(|doc| doc.id.clone()).collect();
    store.clear_dirty(db, interval_from, &ids).await?;

    debug!(
        db = %db,
        policy = %policy.name,
        interval_from,
        interval_to,
        published,
        cleared = ids.len(),
        "bucket emitted"
    );
    Ok(published)
}
