//! Per-process cache of database field lists and measurement snapshots.

use std::collections::HashMap;

use crate::types::{DatabaseMetadata, Measurement};

/// Process-local cache feeding source-interval resolution.
///
/// Holds the latest field lists per database and, per `(database, policy)`,
/// the measurement map from that policy's most recent fetch. Entries are
/// overwritten whenever their owning step re-runs; nothing is evicted. The
/// cache is owned by a single scheduler instance and must not be shared
/// across processes.
#[derive(Debug, Default)]
pub struct MetadataCache {
    fields: HashMap<String, DatabaseMetadata>,
    measurements: HashMap<(String, String), HashMap<String, Measurement>>,
}

impl MetadataCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the field lists for a database.
    pub fn set_fields(&mut self, db: &str, metadata: DatabaseMetadata) {
        self.fields.insert(db.to_owned(), metadata);
    }

    /// The last recorded field lists for a database.
    #[must_use]
    pub fn fields(&self, db: &str) -> Option<&DatabaseMetadata> {
        self.fields.get(db)
    }

    /// Record the measurement snapshot of a policy's latest fetch.
    pub fn set_measurements(
        &mut self,
        db: &str,
        policy: &str,
        measurements: HashMap<String, Measurement>,
    ) {
        self.measurements
            .insert((db.to_owned(), policy.to_owned()), measurements);
    }

    /// The snapshot of a policy's latest fetch, if any.
    #[must_use]
    pub fn measurements(&self, db: &str, policy: &str) -> Option<&HashMap<String, Measurement>> {
        self.measurements
            .get(&(db.to_owned(), policy.to_owned()))
    }

    /// Whether a policy's latest snapshot covered an identifier.
    #[must_use]
    pub fn covers(&self, db: &str, policy: &str, identifier: &str) -> bool {
        self.measurements(db, policy)
            .is_some_and(|m| m.contains_key(identifier))
    }
}
