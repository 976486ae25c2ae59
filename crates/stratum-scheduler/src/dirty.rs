//! Two-phase dirty-document discovery.
//!
//! Writers hold the same keyed locks while mutating a document, so the
//! sequence is: scan for dirty documents, lock each one, then re-read by
//! id under lock. The second read is authoritative; the first may have
//! gone stale between scan and lock. Re-reading guarantees the
//! `updated_start`/`updated_end` bounds emitted to workers match the
//! committed state of the document.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::lock::{LockHandle, LockService};
use crate::store::DocumentStore;
use crate::types::{collection_name, lock_key, DataDocument, Measurement};

/// Fetch the dirty documents of one source interval, locked and re-read.
///
/// Acquired handles are pushed onto `held` as they are taken, so the caller
/// can release them even when a later acquisition or the re-read fails.
pub async fn fetch_dirty_batch(
    store: &dyn DocumentStore,
    locks: &dyn LockService,
    db: &str,
    interval: i64,
    since: i64,
    measurements: &HashMap<String, Measurement>,
    ttl: Duration,
    held: &mut Vec<LockHandle>,
) -> Result<Vec<DataDocument>> {
    let identifiers: HashSet<String> = measurements.keys().cloned().collect();
    let scanned = store.fetch_dirty(db, interval, since, &identifiers).await?;
    if scanned.is_empty() {
        return Ok(Vec::new());
    }

    let collection = collection_name(interval);
    for doc in &scanned {
        let key = lock_key(db, &collection, doc);
        let handle = locks.acquire(&key, ttl).await?;
        held.push(handle);
    }

    let ids: Vec<String> = scanned.iter().map(|doc| doc.id.clone()).collect();
    let docs = store.refetch_by_ids(db, interval, &ids).await?;

    debug!(
        db = %db,
        interval,
        scanned = scanned.len(),
        reread = docs.len(),
        "dirty batch fetched"
    );
    Ok(docs)
}
