//! Work queue publishers.
//!
//! Work orders are serialised as one-element JSON arrays and pushed onto a
//! single named queue. Delivery is best-effort fire-and-forget; downstream
//! workers are idempotent over a window, so a lost message is re-emitted on
//! the next pass via the still-set dirty flags.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands};
use deadpool_redis::{Config, Pool, Runtime};

use crate::config::QueueConfig;
use crate::error::{Result, SchedulerError};
use crate::types::WorkOrder;

/// Posts work orders onto the queue.
#[async_trait]
pub trait WorkPublisher: Send + Sync {
    /// Publish one work order.
    async fn publish(&self, order: &WorkOrder) -> Result<()>;
}

/// Valkey/Redis list-backed publisher.
#[derive(Clone)]
pub struct ValkeyPublisher {
    pool: Pool,
    queue: String,
}

impl ValkeyPublisher {
    /// Create a new publisher and verify the connection.
    pub async fn new(config: &QueueConfig) -> Result<Self> {
        let cfg = Config::from_url(&config.url);
        let pool = cfg
            .builder()
            .map_err(|e| SchedulerError::config(e.to_string()))?
            .max_size(config.max_connections)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| SchedulerError::config(e.to_string()))?;

        // Test the connection
        let mut conn = pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self {
            pool,
            queue: config.queue.clone(),
        })
    }
}

#[async_trait]
impl WorkPublisher for ValkeyPublisher {
    async fn publish(&self, order: &WorkOrder) -> Result<()> {
        let payload = serde_json::to_vec(&[order])?;

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| SchedulerError::Publish(e.to_string()))?;
        let _: i64 = conn
            .rpush(&self.queue, payload)
            .await
            .map_err(|e| SchedulerError::Publish(e.to_string()))?;

        Ok(())
    }
}

impl std::fmt::Debug for ValkeyPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyPublisher")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

/// In-memory publisher for testing.
///
/// Records the serialised payloads so tests can assert on the exact wire
/// shape, and can be switched into a failing mode to exercise the
/// abandon-on-publish-error path.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    payloads: Mutex<Vec<Vec<u8>>>,
    failing: AtomicBool,
}

impl MemoryPublisher {
    /// Create a new in-memory publisher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of published messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payloads.lock().expect("payload lock poisoned").len()
    }

    /// Returns true if nothing was published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode the published messages back into work orders, in publish
    /// order.
    #[must_use]
    pub fn orders(&self) -> Vec<WorkOrder> {
        let payloads = self.payloads.lock().expect("payload lock poisoned");
        payloads
            .iter()
            .flat_map(|payload| {
                let batch: Vec<WorkOrder> =
                    serde_json::from_slice(payload).expect("payload should be a work-order array");
                assert_eq!(batch.len(), 1, "each payload carries exactly one order");
                batch
            })
            .collect()
    }
}

#[async_trait]
impl WorkPublisher for MemoryPublisher {
    async fn publish(&self, order: &WorkOrder) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SchedulerError::Publish("queue unavailable".to_owned()));
        }

        let payload = serde_json::to_vec(&[order])?;
        self.payloads
            .lock()
            .expect("payload lock poisoned")
            .push(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> WorkOrder {
        WorkOrder {
            db: "metrics".to_owned(),
            interval_from: 1,
            interval_to: 60,
            start: 60,
            end: 180,
            required_meta: vec!["host".to_owned()],
            values: Vec::new(),
            meta: Vec::new(),
        }
    }

    #[tokio::test]
    async fn publishes_one_element_array() {
        let publisher = MemoryPublisher::new();
        publisher.publish(&order()).await.expect("publish");

        let payloads = publisher.payloads.lock().expect("lock");
        let raw: serde_json::Value =
            serde_json::from_slice(&payloads[0]).expect("payload is JSON");
        let array = raw.as_array().expect("payload is an array");
        assert_eq!(array.len(), 1);
        assert_eq!(array[0]["type"], "metrics");
        drop(payloads);

        assert_eq!(publisher.orders(), vec![order()]);
    }

    #[tokio::test]
    async fn failing_mode() {
        let publisher = MemoryPublisher::new();
        publisher.set_failing(true);

        let result = publisher.publish(&order()).await;
        assert!(matches!(result, Err(SchedulerError::Publish(_))));
        assert!(publisher.is_empty());

        publisher.set_failing(false);
        publisher.publish(&order()).await.expect("publish");
        assert_eq!(publisher.len(), 1);
    }
}
