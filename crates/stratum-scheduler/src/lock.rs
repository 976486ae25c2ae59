//! Distributed lock service backends.
//!
//! Data documents are shared with writer processes; both sides derive the
//! same key (see [`crate::types::lock_key`]) and serialise access through
//! this service. The production backend is Valkey/Redis with `SET NX EX`
//! acquisition and an owner-guarded release.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_redis::redis;
use deadpool_redis::{Config, Pool, Runtime};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{Result, SchedulerError};

/// Opaque handle for a held lock.
///
/// The handle remembers when it was acquired so a pass can fail fast
/// instead of clearing dirty flags under a lock that already expired.
#[derive(Debug, Clone)]
pub struct LockHandle {
    key: String,
    token: String,
    acquired_at: Instant,
    ttl: Duration,
}

impl LockHandle {
    pub(crate) fn new(key: String, token: String, ttl: Duration) -> Self {
        Self {
            key,
            token,
            acquired_at: Instant::now(),
            ttl,
        }
    }

    /// The lock key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The owner token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Returns true once the handle has outlived its TTL.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.ttl
    }
}

/// Distributed lock service.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Acquire a lock, retrying up to the configured attempt budget.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockHandle>;

    /// Release a held lock. Releasing an already-expired or already-released
    /// handle is not an error.
    async fn release(&self, handle: &LockHandle) -> Result<()>;
}

/// Valkey/Redis lock service.
#[derive(Clone)]
pub struct ValkeyLockService {
    pool: Pool,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl ValkeyLockService {
    /// Create a new Valkey lock service and verify the connection.
    pub async fn new(config: &LockConfig) -> Result<Self> {
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
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        })
    }
}

#[async_trait]
impl LockService for ValkeyLockService {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockHandle> {
        let seconds = ttl.as_secs().max(1);

        for attempt in 0..self.retry_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }

            let mut conn = self.pool.get().await?;
            let token = Uuid::new_v4().to_string();

            // SET key token NX EX seconds
            let result: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(&token)
                .arg("NX")
                .arg("EX")
                .arg(seconds)
                .query_async(&mut conn)
                .await?;

            if result.is_some() {
                return Ok(LockHandle::new(key.to_owned(), token, ttl));
            }
        }

        Err(SchedulerError::Lock(key.to_owned()))
    }

    async fn release(&self, handle: &LockHandle) -> Result<()> {
        let mut conn = self.pool.get().await?;

        // Delete only if we still own the lock
        let script = redis::Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            else
                return 0
            end
            "#,
        );

        let _: i64 = script
            .key(handle.key())
            .arg(handle.token())
            .invoke_async(&mut conn)
            .await?;

        Ok(())
    }
}

impl std::fmt::Debug for ValkeyLockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyLockService")
            .field("retry_attempts", &self.retry_attempts)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

/// In-memory lock service for testing.
#[derive(Debug)]
pub struct MemoryLockService {
    held: Mutex<HashMap<String, String>>,
    retry_attempts: u32,
}

impl MemoryLockService {
    /// Create a new in-memory lock service.
    #[must_use]
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            retry_attempts: 3,
        }
    }

    /// Pre-hold a key on behalf of a foreign owner, as a writer process
    /// would, so acquisition attempts for it fail.
    pub fn hold(&self, key: &str) {
        self.held
            .lock()
            .expect("lock table poisoned")
            .insert(key.to_owned(), "foreign-owner".to_owned());
    }

    /// Keys currently held.
    #[must_use]
    pub fn held_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .held
            .lock()
            .expect("lock table poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

impl Default for MemoryLockService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockHandle> {
        for attempt in 0..self.retry_attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }

            let mut held = self.held.lock().expect("lock table poisoned");
            if !held.contains_key(key) {
                let token = Uuid::new_v4().to_string();
                held.insert(key.to_owned(), token.clone());
                return Ok(LockHandle::new(key.to_owned(), token, ttl));
            }
        }

        Err(SchedulerError::Lock(key.to_owned()))
    }

    async fn release(&self, handle: &LockHandle) -> Result<()> {
        let mut held = self.held.lock().expect("lock table poisoned");
        if held.get(handle.key()).is_some_and(|t| t == handle.token()) {
            held.remove(handle.key());
        }
        Ok(())
    }
}
