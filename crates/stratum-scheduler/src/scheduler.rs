//! The outer scheduling loop.
//!
//! One cooperating task drives everything: enumerate databases, evaluate
//! each database's policies in `(interval asc, eval_position desc)` order,
//! emit work for the dirty documents of each due policy, then sleep until
//! the earliest `next_run` across all databases. A database's failure never
//! starves the others; only fatal initialisation errors escape the loop,
//! and those are handled before it starts.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::cache::MetadataCache;
use crate::config::Config;
use crate::dirty;
use crate::error::Result;
use crate::lock::{LockHandle, LockService};
use crate::publish::WorkPublisher;
use crate::resolver::{evaluation_order, resolve_source_buckets};
use crate::store::DocumentStore;
use crate::types::{floor_to, AggregationPolicy, DatabaseMetadata};
use crate::work;

/// Loop tuning handed to the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// TTL for document locks taken during a pass.
    pub lock_ttl: Duration,
    /// Sleep when there is nothing to schedule.
    pub idle_sleep: Duration,
    /// Advance `last_run` even when a pass published no messages.
    pub advance_without_publish: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(60),
            idle_sleep: Duration::from_secs(60),
            advance_without_publish: true,
        }
    }
}

impl SchedulerSettings {
    /// Derive settings from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            lock_ttl: config.lock.ttl(),
            idle_sleep: Duration::from_secs(config.scheduler.idle_sleep_secs),
            advance_without_publish: config.scheduler.advance_without_publish,
        }
    }
}

/// Policy scheduler for all supervised databases.
pub struct Scheduler {
    store: Arc<dyn DocumentStore>,
    locks: Arc<dyn LockService>,
    publisher: Arc<dyn WorkPublisher>,
    settings: SchedulerSettings,
    cache: MetadataCache,
    held: Vec<LockHandle>,
}

impl Scheduler {
    /// Create a new scheduler.
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        locks: Arc<dyn LockService>,
        publisher: Arc<dyn WorkPublisher>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            locks,
            publisher,
            settings,
            cache: MetadataCache::new(),
            held: Vec::new(),
        }
    }

    /// Run the scheduling loop forever.
    pub async fn run(&mut self) {
        info!("scheduler loop started");
        loop {
            let now = unix_now();
            let next_wake = self.pass(now).await;

            let delay = u64::try_from(next_wake - unix_now()).unwrap_or(0);
            debug!(delay_secs = delay, "sleeping until next wake");
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
    }

    /// One pass over every database. Returns the absolute wake time for the
    /// next pass.
    pub async fn pass(&mut self, now: i64) -> i64 {
        let idle = i64::try_from(self.settings.idle_sleep.as_secs()).unwrap_or(60);

        let databases = match self.store.list_databases().await {
            Ok(databases) => databases,
            Err(e) => {
                warn!(error = %e, "failed to enumerate databases");
                return now + idle;
            }
        };

        let mut work_list: Vec<(String, Vec<AggregationPolicy>)> = Vec::new();
        for db in databases {
            match self.store.list_policies(&db).await {
                Ok(policies) if policies.is_empty() => {}
                Ok(policies) => work_list.push((db, policies)),
                Err(e) => warn!(db = %db, error = %e, "failed to list aggregation policies"),
            }
        }

        if work_list.is_empty() {
            info!("no aggregation policies found");
            return now + idle;
        }

        let mut next_wake: Option<i64> = None;
        for (db, policies) in work_list {
            match self.evaluate_database(&db, policies, now).await {
                Ok(Some(db_next)) => {
                    next_wake = Some(next_wake.map_or(db_next, |w| w.min(db_next)));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(db = %db, error = %e, "database evaluation failed");
                    self.release_locks().await;
                }
            }
        }

        // An exception path may have left locks behind.
        self.release_locks().await;

        next_wake.unwrap_or(now + idle)
    }

    /// Evaluate one database. Returns the lowest `next_run` across its
    /// policies, or `None` if every policy failed.
    async fn evaluate_database(
        &mut self,
        db: &str,
        mut policies: Vec<AggregationPolicy>,
        now: i64,
    ) -> Result<Option<i64>> {
        let metadata = self.store.fetch_metadata(db).await?;
        self.cache.set_fields(db, metadata.clone());

        evaluation_order(&mut policies);

        let mut lowest: Option<i64> = None;
        for policy in &policies {
            match self
                .evaluate_policy(db, policy, &policies, &metadata, now)
                .await
            {
                Ok(next_run) => {
                    lowest = Some(lowest.map_or(next_run, |l| l.min(next_run)));
                }
                Err(e) => {
                    warn!(db = %db, policy = %policy.name, error = %e, "policy evaluation failed");
                    self.release_locks().await;
                }
            }
        }

        Ok(lowest)
    }

    /// Evaluate one policy and return its `next_run`.
    async fn evaluate_policy(
        &mut self,
        db: &str,
        policy: &AggregationPolicy,
        policies: &[AggregationPolicy],
        metadata: &DatabaseMetadata,
        now: i64,
    ) -> Result<i64> {
        if policy.last_run + policy.interval > now {
            return Ok(policy.last_run + policy.interval);
        }

        let measurements = self
            .store
            .fetch_measurements(db, &policy.meta, metadata)
            .await?;
        self.cache
            .set_measurements(db, &policy.name, measurements.clone());

        let resolved = resolve_source_buckets(db, policy, policies, &measurements, &self.cache);
        if !resolved.already_covered.is_empty() {
            debug!(
                db = %db,
                policy = %policy.name,
                skipped = resolved.already_covered.len(),
                "measurements already aggregated at this interval"
            );
        }

        let mut published = 0usize;
        for (source_interval, bucket) in &resolved.buckets {
            let docs = dirty::fetch_dirty_batch(
                &*self.store,
                &*self.locks,
                db,
                *source_interval,
                policy.last_run,
                bucket,
                self.settings.lock_ttl,
                &mut self.held,
            )
            .await?;

            published += work::emit_and_clear(
                &*self.store,
                &*self.publisher,
                db,
                policy,
                metadata,
                *source_interval,
                policy.interval,
                &docs,
                bucket,
                &self.held,
            )
            .await?;

            self.release_locks().await;
        }

        if published == 0 && !self.settings.advance_without_publish {
            debug!(db = %db, policy = %policy.name, "nothing published, holding last_run");
            return Ok(floor_to(now, policy.interval) + policy.interval);
        }

        if published > 0 {
            info!(db = %db, policy = %policy.name, published, "work orders published");
        }

        let floored = floor_to(now, policy.interval);
        if let Err(e) = self.store.set_last_run(db, &policy.name, floored).await {
            warn!(db = %db, policy = %policy.name, error = %e, "failed to persist last_run");
        }
        Ok(floored + policy.interval)
    }

    /// Release every held lock, tolerating individual failures.
    async fn release_locks(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let held = std::mem::take(&mut self.held);
        for handle in held {
            if let Err(e) = self.locks.release(&handle).await {
                warn!(key = %handle.key(), error = %e, "failed to release lock");
            }
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(0))
}
