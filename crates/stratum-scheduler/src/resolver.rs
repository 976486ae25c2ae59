//! Source-interval resolution.
//!
//! For each measurement a policy is about to aggregate, decide which prior
//! policy's output supplies the source data, and which measurements to skip
//! because a heavier-weighted policy at the same interval already covers
//! them.

use std::collections::{BTreeMap, HashMap};

use crate::cache::MetadataCache;
use crate::types::{AggregationPolicy, Measurement};

/// Work buckets for one policy run, keyed by source interval.
#[derive(Debug, Default)]
pub struct SourceBuckets {
    /// `source_interval -> {identifier -> measurement}`.
    pub buckets: BTreeMap<i64, HashMap<String, Measurement>>,
    /// Identifiers dropped because a heavier policy at the same interval
    /// already aggregates them.
    pub already_covered: Vec<String>,
}

/// Sort policies into evaluation order: interval ascending, then
/// eval_position descending. This is both the order policies run in and
/// the order that decides same-interval coverage.
pub fn evaluation_order(policies: &mut [AggregationPolicy]) {
    policies.sort_by(|a, b| {
        a.interval
            .cmp(&b.interval)
            .then(b.eval_position.cmp(&a.eval_position))
    });
}

/// Resolve the source interval for every measurement of `current`.
///
/// Candidates are the other policies of the database whose interval does
/// not exceed the current one, walked from the widest interval (heaviest
/// eval position first within a tie). The first candidate whose cached
/// snapshot contains an identifier supplies its source interval; a
/// same-interval match means the identifier is already covered and is
/// dropped. With no match the source is raw data (interval 1).
#[must_use]
pub fn resolve_source_buckets(
    db: &str,
    current: &AggregationPolicy,
    policies: &[AggregationPolicy],
    measurements: &HashMap<String, Measurement>,
    cache: &MetadataCache,
) -> SourceBuckets {
    let mut candidates: Vec<&AggregationPolicy> = policies
        .iter()
        .filter(|p| p.name != current.name && p.interval <= current.interval)
        .collect();
    candidates.sort_by(|a, b| {
        b.interval
            .cmp(&a.interval)
            .then(b.eval_position.cmp(&a.eval_position))
    });

    let mut resolved = SourceBuckets::default();
    for (identifier, measurement) in measurements {
        let chosen = candidates
            .iter()
            .find(|c| cache.covers(db, &c.name, identifier));

        match chosen {
            Some(c) if c.interval == current.interval => {
                resolved.already_covered.push(identifier.clone());
            }
            chosen => {
                let source = chosen.map_or(1, |c| c.interval);
                resolved
                    .buckets
                    .entry(source)
                    .or_default()
                    .insert(identifier.clone(), measurement.clone());
            }
        }
    }
    resolved.already_covered.sort();

    resolved
}
