//! Core types shared across the scheduling pipeline.
//!
//! All times are UNIX seconds. Intervals are positive integers expressing
//! seconds per aggregation bucket, with `1` denoting raw high-resolution
//! data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One aggregation rule attached to a database.
///
/// A policy is well-formed only if `interval` and `eval_position` are both
/// present in the stored document; the store skips malformed policies with
/// a warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationPolicy {
    /// Policy name, unique within its database.
    pub name: String,
    /// Target bucket width in seconds.
    pub interval: i64,
    /// Evaluation weight; higher wins among policies sharing an interval.
    pub eval_position: i64,
    /// Measurement-selection predicate, passed verbatim to the store.
    #[serde(default = "empty_selector")]
    pub meta: serde_json::Value,
    /// Per-value histogram tuning, keyed by value name.
    #[serde(default)]
    pub values: BTreeMap<String, ValuePolicy>,
    /// End of the last successfully scheduled window; 0 if never run.
    #[serde(default)]
    pub last_run: i64,
}

fn empty_selector() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Histogram tuning for a single value within a policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValuePolicy {
    /// Histogram resolution, if configured.
    #[serde(default)]
    pub hist_res: Option<i64>,
    /// Minimum histogram bucket width, if configured.
    #[serde(default)]
    pub hist_min_width: Option<i64>,
}

/// Field lists derived from a database's metadata record.
///
/// Both lists must be non-empty for scheduling to proceed; the store
/// enforces this when the record is fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseMetadata {
    /// Meta fields every work order must carry.
    pub required_fields: Vec<String>,
    /// Value names aggregated for this database.
    pub value_fields: Vec<String>,
}

/// Observed min/max for one value of a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

/// The most recent instance of a measurement stream, keyed by identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Stream identifier.
    pub identifier: String,
    /// Start of the most recent instance (greatest `start` seen).
    pub start: i64,
    /// Projection of the database's required meta fields.
    pub fields: BTreeMap<String, serde_json::Value>,
    /// Per-value observed ranges.
    pub values: BTreeMap<String, ValueRange>,
}

/// One (measurement, interval, time-window) data bucket.
///
/// Created and mutated by writer processes; this system only reads, locks,
/// and clears the dirty flag.
#[derive(Debug, Clone, PartialEq)]
pub struct DataDocument {
    /// Store-internal id.
    pub id: String,
    /// Owning measurement stream.
    pub identifier: String,
    /// Bucket start.
    pub start: i64,
    /// Bucket end.
    pub end: i64,
    /// Dirty timestamp; present only while the document has unaggregated
    /// changes.
    pub updated: Option<i64>,
    /// Lower bound of the changed region.
    pub updated_start: Option<i64>,
    /// Upper bound of the changed region.
    pub updated_end: Option<i64>,
}

/// Histogram spec for one value, carried in every work-order envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueSpec {
    pub name: String,
    pub hist_res: Option<i64>,
    pub hist_min_width: Option<i64>,
}

/// Per-value range inside a work-order meta entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaValue {
    pub name: String,
    pub min: f64,
    pub max: f64,
}

/// One measurement inside a work order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaEntry {
    /// Observed value ranges for the measurement.
    pub values: Vec<MetaValue>,
    /// Required meta fields and their values.
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// A work order instructing a downstream worker to aggregate one window.
///
/// Serialized onto the queue as a one-element JSON array. The envelope
/// (everything except `meta`) is identical across all chunks emitted from
/// a single window group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrder {
    /// Database the work belongs to.
    #[serde(rename = "type")]
    pub db: String,
    /// Source bucket width.
    pub interval_from: i64,
    /// Target bucket width.
    pub interval_to: i64,
    /// Window start, floored to the target interval.
    pub start: i64,
    /// Window end, ceiled to the target interval.
    pub end: i64,
    /// Required meta field names for the database.
    pub required_meta: Vec<String>,
    /// Histogram specs for every value field of the database.
    pub values: Vec<ValueSpec>,
    /// Included measurements, at most [`crate::work::MAX_META_ENTRIES`].
    pub meta: Vec<MetaEntry>,
}

/// Data collection name for an interval: `1` maps to `data`, anything else
/// to `data_<interval>`.
#[must_use]
pub fn collection_name(interval: i64) -> String {
    if interval == 1 {
        "data".to_owned()
    } else {
        format!("data_{interval}")
    }
}

/// Lock key for a data document.
///
/// Writer processes derive the same key while mutating a document; the
/// format is an inter-process contract and must not change.
#[must_use]
pub fn lock_key(db: &str, collection: &str, doc: &DataDocument) -> String {
    format!(
        "lock__{db}__{collection}__{}__{}__{}",
        doc.identifier, doc.start, doc.end
    )
}

/// Floor a timestamp to an interval boundary.
#[must_use]
pub fn floor_to(ts: i64, interval: i64) -> i64 {
    ts.div_euclid(interval) * interval
}

/// Ceil a timestamp to an interval boundary.
#[must_use]
pub fn ceil_to(ts: i64, interval: i64) -> i64 {
    let floored = floor_to(ts, interval);
    if ts == floored {
        floored
    } else {
        floored + interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(identifier: &str, start: i64, end: i64) -> DataDocument {
        DataDocument {
            id: "d1".to_owned(),
            identifier: identifier.to_owned(),
            start,
            end,
            updated: None,
            updated_start: None,
            updated_end: None,
        }
    }

    #[test]
    fn collection_name_rule() {
        assert_eq!(collection_name(1), "data");
        assert_eq!(collection_name(60), "data_60");
        assert_eq!(collection_name(3600), "data_3600");
    }

    #[test]
    fn lock_key_is_byte_exact() {
        let d = doc("cpu.total", 0, 86400);
        assert_eq!(
            lock_key("metrics", "data_60", &d),
            "lock__metrics__data_60__cpu.total__0__86400"
        );
    }

    #[test]
    fn floor_and_ceil() {
        assert_eq!(floor_to(90, 60), 60);
        assert_eq!(floor_to(125, 60), 120);
        assert_eq!(floor_to(120, 60), 120);
        assert_eq!(ceil_to(125, 60), 180);
        assert_eq!(ceil_to(120, 60), 120);
        assert_eq!(ceil_to(1, 300), 300);
    }

    #[test]
    fn policy_requires_interval_and_eval_position() {
        let malformed = serde_json::json!({ "name": "hourly", "interval": 3600 });
        assert!(serde_json::from_value::<AggregationPolicy>(malformed).is_err());

        let minimal = serde_json::json!({
            "name": "hourly",
            "interval": 3600,
            "eval_position": 1
        });
        let policy: AggregationPolicy =
            serde_json::from_value(minimal).expect("minimal policy should decode");
        assert_eq!(policy.last_run, 0);
        assert!(policy.meta.as_object().is_some_and(|m| m.is_empty()));
        assert!(policy.values.is_empty());
    }

    #[test]
    fn work_order_serialises_db_as_type() {
        let order = WorkOrder {
            db: "metrics".to_owned(),
            interval_from: 1,
            interval_to: 60,
            start: 60,
            end: 180,
            required_meta: vec!["host".to_owned()],
            values: vec![ValueSpec {
                name: "temp".to_owned(),
                hist_res: None,
                hist_min_width: None,
            }],
            meta: Vec::new(),
        };

        let json = serde_json::to_value(&order).expect("serialise");
        assert_eq!(json["type"], "metrics");
        assert!(json["values"][0]["hist_res"].is_null());
    }
}
