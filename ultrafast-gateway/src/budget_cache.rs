//! # Budget Cache
//!
//! Answers "may entity E afford request cost C?" in microseconds under
//! load, backed by the shared Redis store so every replica agrees.  The
//! cache is authoritative for blocking decisions during its TTL; the
//! database (via the Batch Processor) is authoritative across restarts and
//! TTL expiry.
//!
//! Grounded on [`crate::gateway_caching::CacheManager::incr_with_expiry`]'s
//! atomic-increment idiom, generalised to the `budget:{type}:{id}` hash +
//! `budget:{type}:{id}:spent` counter layout.

use crate::gateway_error::GatewayError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;

const DEFAULT_TTL_SECS: i64 = 300;

static LOCAL_ENTRIES: OnceLock<Arc<RwLock<HashMap<String, BudgetCacheEntry>>>> = OnceLock::new();

fn local_entries() -> &'static Arc<RwLock<HashMap<String, BudgetCacheEntry>>> {
    LOCAL_ENTRIES.get_or_init(|| Arc::new(RwLock::new(HashMap::new())))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    Global,
    User,
    Team,
    Key,
}

impl EntityType {
    fn as_str(&self) -> &'static str {
        match self {
            EntityType::Global => "global",
            EntityType::User => "user",
            EntityType::Team => "team",
            EntityType::Key => "key",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetCacheEntry {
    pub available: f64,
    pub spent: f64,
    pub limit: f64,
    pub exceeded: bool,
}

pub struct BudgetCache {
    redis_client: Option<redis::Client>,
}

impl BudgetCache {
    pub fn new(redis_client: Option<redis::Client>) -> Self {
        Self { redis_client }
    }

    fn entry_key(entity_type: EntityType, entity_id: &str) -> String {
        format!("budget:{}:{entity_id}", entity_type.as_str())
    }

    fn spent_counter_key(entity_type: EntityType, entity_id: &str) -> String {
        format!("budget:{}:{entity_id}:spent", entity_type.as_str())
    }

    /// Returns `Ok(true)` if `cost` fits under the cached limit. A cache
    /// miss is reported as an error so the caller can fall back to the
    /// database rather than silently allow or silently deny.
    pub async fn check_budget_available(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        cost: f64,
    ) -> Result<bool, GatewayError> {
        let key = Self::entry_key(entity_type, entity_id);

        let entry = if let Some(client) = &self.redis_client {
            match self.redis_get_entry(client, &key).await {
                Ok(Some(entry)) => Some(entry),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!("Redis error reading budget cache for {key}, falling back to local: {e}");
                    local_entries().read().await.get(&key).cloned()
                }
            }
        } else {
            local_entries().read().await.get(&key).cloned()
        };

        match entry {
            Some(entry) => Ok(!entry.exceeded && entry.available >= cost),
            None => Err(GatewayError::Cache {
                message: format!("budget cache miss for {key}"),
            }),
        }
    }

    /// Written by the Batch Processor after it has reconciled spend against
    /// the database.
    pub async fn update_budget_cache(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        available: f64,
        spent: f64,
        limit: f64,
        exceeded: bool,
    ) -> Result<(), GatewayError> {
        let key = Self::entry_key(entity_type, entity_id);
        let entry = BudgetCacheEntry {
            available,
            spent,
            limit,
            exceeded,
        };

        if let Some(client) = &self.redis_client {
            match self.redis_set_entry(client, &key, &entry).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!("Redis error writing budget cache for {key}, falling back to local: {e}");
                }
            }
        }

        local_entries().write().await.insert(key, entry);
        Ok(())
    }

    /// Atomic increment on the standalone spend counter, used as an
    /// optimistic pre-account between batch processor reconciliations so
    /// a burst of concurrent requests can't all slip through before the
    /// cached `available` figure catches up.
    pub async fn increment_spent(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        delta: f64,
    ) -> Result<f64, GatewayError> {
        let key = Self::spent_counter_key(entity_type, entity_id);

        if let Some(client) = &self.redis_client {
            match self.redis_increment(client, &key, delta).await {
                Ok(total) => return Ok(total),
                Err(e) => {
                    tracing::warn!("Redis error incrementing spend for {key}, falling back to local: {e}");
                }
            }
        }

        let mut entries = local_entries().write().await;
        let entry = entries.entry(key).or_insert(BudgetCacheEntry {
            available: 0.0,
            spent: 0.0,
            limit: 0.0,
            exceeded: false,
        });
        entry.spent += delta;
        entry.available = (entry.limit - entry.spent).max(0.0);
        Ok(entry.spent)
    }

    async fn redis_get_entry(
        &self,
        client: &redis::Client,
        key: &str,
    ) -> Result<Option<BudgetCacheEntry>, redis::RedisError> {
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        let fields: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;

        if fields.is_empty() {
            return Ok(None);
        }

        let parse = |k: &str| -> f64 { fields.get(k).and_then(|v| v.parse().ok()).unwrap_or(0.0) };

        Ok(Some(BudgetCacheEntry {
            available: parse("available"),
            spent: parse("spent"),
            limit: parse("limit"),
            exceeded: fields.get("exceeded").map(|v| v == "1").unwrap_or(false),
        }))
    }

    async fn redis_set_entry(
        &self,
        client: &redis::Client,
        key: &str,
        entry: &BudgetCacheEntry,
    ) -> Result<(), redis::RedisError> {
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        let _: () = redis::cmd("HSET")
            .arg(key)
            .arg("available")
            .arg(entry.available)
            .arg("spent")
            .arg(entry.spent)
            .arg("limit")
            .arg(entry.limit)
            .arg("exceeded")
            .arg(if entry.exceeded { "1" } else { "0" })
            .query_async(&mut conn)
            .await?;
        let _: () = redis::cmd("EXPIRE")
            .arg(key)
            .arg(DEFAULT_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn redis_increment(
        &self,
        client: &redis::Client,
        key: &str,
        delta: f64,
    ) -> Result<f64, redis::RedisError> {
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        let total: f64 = redis::cmd("INCRBYFLOAT")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        let _: () = redis::cmd("EXPIRE")
            .arg(key)
            .arg(DEFAULT_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn miss_is_reported_as_error() {
        let cache = BudgetCache::new(None);
        let result = cache
            .check_budget_available(EntityType::User, "u-unseen", 1.0)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn checks_against_written_entry() {
        let cache = BudgetCache::new(None);
        cache
            .update_budget_cache(EntityType::User, "u-1", 10.0, 90.0, 100.0, false)
            .await
            .unwrap();

        assert!(cache
            .check_budget_available(EntityType::User, "u-1", 5.0)
            .await
            .unwrap());
        assert!(!cache
            .check_budget_available(EntityType::User, "u-1", 50.0)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn exceeded_flag_blocks_even_with_available_balance() {
        let cache = BudgetCache::new(None);
        cache
            .update_budget_cache(EntityType::Team, "t-1", 10.0, 90.0, 100.0, true)
            .await
            .unwrap();

        assert!(!cache
            .check_budget_available(EntityType::Team, "t-1", 1.0)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn increment_spent_accumulates() {
        let cache = BudgetCache::new(None);
        let first = cache
            .increment_spent(EntityType::Key, "k-1", 2.5)
            .await
            .unwrap();
        let second = cache
            .increment_spent(EntityType::Key, "k-1", 1.5)
            .await
            .unwrap();
        assert_eq!(first, 2.5);
        assert_eq!(second, 4.0);
    }
}
