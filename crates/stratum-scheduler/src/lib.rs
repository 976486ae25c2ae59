//! Stratum scheduler - scheduling and dispatch core for a time-series
//! aggregation pipeline.
//!
//! For each supervised database the scheduler periodically decides which
//! aggregation policies are due, finds the smallest set of data documents
//! whose contents changed since the last run, locks those documents in
//! cooperation with the writer process that owns them, and emits work
//! orders for downstream aggregation workers. It never computes aggregates
//! itself; it orchestrates when and on what aggregation must happen.
//!
//! # Architecture
//!
//! - **Store**: policies, metadata, measurements, and data buckets live in
//!   a document store behind [`DocumentStore`]; the scheduler persists
//!   nothing of its own beyond `last_run` markers and dirty-flag clears
//! - **Resolution**: per measurement, the highest prior aggregation level
//!   that can feed the target interval is selected from cached snapshots,
//!   and same-interval double work is skipped
//! - **Two-phase fetch**: dirty documents are scanned, locked through
//!   [`LockService`] with keys shared with the writers, then re-read under
//!   lock so emitted bounds match committed state
//! - **Dispatch**: documents sharing a target window coalesce into one
//!   work order, chunked at 50 measurements, published fire-and-forget
//!
//! A crash between publish and flag clearing is safe: workers are
//! idempotent over a window and the still-set flags re-emit the work on
//! the next pass.

pub mod cache;
pub mod config;
pub mod dirty;
pub mod error;
pub mod lock;
pub mod publish;
pub mod resolver;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod work;

// Re-export main types
pub use cache::MetadataCache;
pub use config::{Config, LockConfig, LoopConfig, QueueConfig, StoreConfig};
pub use error::{Result, SchedulerError};
pub use lock::{LockHandle, LockService, MemoryLockService, ValkeyLockService};
pub use publish::{MemoryPublisher, ValkeyPublisher, WorkPublisher};
pub use resolver::{resolve_source_buckets, SourceBuckets};
pub use scheduler::{Scheduler, SchedulerSettings};
pub use store::{DocumentStore, MemoryStore, PostgresStore};
pub use types::{
    AggregationPolicy, DataDocument, DatabaseMetadata, Measurement, MetaEntry, MetaValue,
    ValuePolicy, ValueRange, ValueSpec, WorkOrder,
};
