//! # Usage Queue + Batch Processor
//!
//! A three-part logical queue (`main` FIFO, `retry` delayed set, `dead_letter`
//! terminal list) backed by the shared Redis store, drained by a Batch
//! Processor loop that serialises itself across replicas through the
//! [`crate::distributed_lock::DistributedLockManager`] so the same usage
//! record is never persisted twice.
//!
//! Grounded on [`crate::gateway_caching::CacheManager`]'s Redis idiom for
//! the queue storage itself. Persistence is behind a [`UsagePersistence`]
//! trait — schema and migrations are out of scope here, so only the shape
//! of a persisted row is fixed, not its backing store.

use crate::budget_cache::{BudgetCache, EntityType};
use crate::distributed_lock::DistributedLockManager;
use crate::gateway_error::GatewayError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use uuid::Uuid;

const MAIN_QUEUE_KEY: &str = "usage_processing_queue";
const RETRY_QUEUE_KEY: &str = "usage_processing_queue:retry";
const DEAD_LETTER_KEY: &str = "usage_processing_queue:dead_letter";
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_MAX_RETRIES: u32 = 5;
const RETRY_BASE_SECS: u64 = 10;
const BATCH_LOCK_TTL: Duration = Duration::from_secs(120);
const RETRY_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

static LOCAL_MAIN: OnceLock<Arc<RwLock<Vec<UsageRecord>>>> = OnceLock::new();
static LOCAL_RETRY: OnceLock<Arc<RwLock<Vec<(u64, UsageRecord)>>>> = OnceLock::new();
static LOCAL_DEAD_LETTER: OnceLock<Arc<RwLock<Vec<DeadLetterEntry>>>> = OnceLock::new();

fn local_main() -> &'static Arc<RwLock<Vec<UsageRecord>>> {
    LOCAL_MAIN.get_or_init(|| Arc::new(RwLock::new(Vec::new())))
}

fn local_retry() -> &'static Arc<RwLock<Vec<(u64, UsageRecord)>>> {
    LOCAL_RETRY.get_or_init(|| Arc::new(RwLock::new(Vec::new())))
}

fn local_dead_letter() -> &'static Arc<RwLock<Vec<DeadLetterEntry>>> {
    LOCAL_DEAD_LETTER.get_or_init(|| Arc::new(RwLock::new(Vec::new())))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub record_id: String,
    pub request_id: String,
    pub ts: u64,
    pub actual_user_id: Option<String>,
    pub key_id: Option<String>,
    pub key_owner_id: Option<String>,
    pub team_id: Option<String>,
    pub model: String,
    pub provider: String,
    pub status: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub latency_ms: u64,
    pub retries: u32,
    pub processed_at: Option<u64>,
}

impl UsageRecord {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Terminal envelope for a record that exhausted its retries, keeping the
/// failure reason alongside the record instead of discarding it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub record: UsageRecord,
    pub error: String,
    pub failed_at: u64,
    pub final_retry: u32,
}

/// A persisted-row sink for completed usage batches. Schema and migrations
/// are out of scope; this trait fixes only the shape of the call, not the
/// storage engine behind it.
#[async_trait::async_trait]
pub trait UsagePersistence: Send + Sync {
    async fn persist_batch(&self, records: &[UsageRecord]) -> Result<(), GatewayError>;
}

/// In-memory reference implementation, used by tests and as a fallback when
/// no real backend is configured. Not meant for production use — rows live
/// only as long as the process.
#[derive(Default)]
pub struct InMemoryUsagePersistence {
    rows: RwLock<Vec<UsageRecord>>,
}

impl InMemoryUsagePersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self) -> Vec<UsageRecord> {
        self.rows.read().await.clone()
    }
}

#[async_trait::async_trait]
impl UsagePersistence for InMemoryUsagePersistence {
    async fn persist_batch(&self, records: &[UsageRecord]) -> Result<(), GatewayError> {
        self.rows.write().await.extend(records.iter().cloned());
        Ok(())
    }
}

pub struct UsageQueue {
    redis_client: Option<redis::Client>,
    max_retries: u32,
}

impl UsageQueue {
    pub fn new(redis_client: Option<redis::Client>) -> Self {
        Self {
            redis_client,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Left-push onto `main`, generating a record id if the caller left one
    /// empty.
    pub async fn enqueue_usage(&self, mut record: UsageRecord) -> Result<(), GatewayError> {
        if record.record_id.is_empty() {
            record.record_id = Uuid::new_v4().to_string();
        }

        if let Some(client) = &self.redis_client {
            match self.redis_lpush(client, MAIN_QUEUE_KEY, &record).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!("Redis error enqueueing usage record, falling back to local: {e}");
                }
            }
        }

        local_main().write().await.insert(0, record);
        Ok(())
    }

    /// Pop up to `n` records from the right (tail) of `main`.
    pub async fn dequeue_usage_batch(&self, n: usize) -> Result<Vec<UsageRecord>, GatewayError> {
        if let Some(client) = &self.redis_client {
            match self.redis_rpop_many(client, MAIN_QUEUE_KEY, n).await {
                Ok(records) => return Ok(records),
                Err(e) => {
                    tracing::warn!("Redis error dequeueing usage batch, falling back to local: {e}");
                }
            }
        }

        let mut main = local_main().write().await;
        let take = n.min(main.len());
        Ok(main.split_off(main.len() - take))
    }

    /// Increment `record.retries`; push to `retry` with exponential backoff
    /// scoring if under the limit, else drop into `dead_letter`.
    pub async fn enqueue_usage_failed(
        &self,
        mut record: UsageRecord,
        err_msg: &str,
    ) -> Result<(), GatewayError> {
        record.retries += 1;
        tracing::warn!(
            "usage record {} failed (attempt {}): {err_msg}",
            record.record_id,
            record.retries
        );

        if record.retries < self.max_retries {
            let delay_secs = RETRY_BASE_SECS * (record.retries as u64).pow(2);
            let ready_at = now_secs() + delay_secs;

            if let Some(client) = &self.redis_client {
                match self.redis_zadd_retry(client, ready_at, &record).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        tracing::warn!("Redis error enqueueing retry, falling back to local: {e}");
                    }
                }
            }

            local_retry().write().await.push((ready_at, record));
            Ok(())
        } else {
            let entry = DeadLetterEntry {
                final_retry: record.retries,
                error: err_msg.to_string(),
                failed_at: now_secs(),
                record,
            };

            if let Some(client) = &self.redis_client {
                match self.redis_lpush(client, DEAD_LETTER_KEY, &entry).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        tracing::warn!("Redis error enqueueing dead letter, falling back to local: {e}");
                    }
                }
            }
            local_dead_letter().write().await.push(entry);
            Ok(())
        }
    }

    /// Move every retry entry whose `ready_at ≤ now` back onto `main`.
    pub async fn process_retry_queue(&self) -> Result<usize, GatewayError> {
        if let Some(client) = &self.redis_client {
            match self.redis_process_retry_queue(client).await {
                Ok(moved) => return Ok(moved),
                Err(e) => {
                    tracing::warn!("Redis error processing retry queue, falling back to local: {e}");
                }
            }
        }

        let now = now_secs();
        let mut retry = local_retry().write().await;
        let (ready, not_ready): (Vec<_>, Vec<_>) =
            retry.drain(..).partition(|(ready_at, _)| *ready_at <= now);
        *retry = not_ready;
        let moved = ready.len();

        let mut main = local_main().write().await;
        for (_, record) in ready {
            main.insert(0, record);
        }
        Ok(moved)
    }

    async fn redis_lpush<T: Serialize>(
        &self,
        client: &redis::Client,
        key: &str,
        value: &T,
    ) -> Result<(), redis::RedisError> {
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        let payload = serde_json::to_string(value).map_err(to_redis_err)?;
        let _: () = redis::cmd("LPUSH")
            .arg(key)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn redis_rpop_many(
        &self,
        client: &redis::Client,
        key: &str,
        n: usize,
    ) -> Result<Vec<UsageRecord>, redis::RedisError> {
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        let raw: Vec<String> = redis::cmd("RPOP")
            .arg(key)
            .arg(n)
            .query_async(&mut conn)
            .await?;
        Ok(raw
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect())
    }

    async fn redis_zadd_retry(
        &self,
        client: &redis::Client,
        ready_at: u64,
        record: &UsageRecord,
    ) -> Result<(), redis::RedisError> {
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        let payload = serde_json::to_string(record).map_err(to_redis_err)?;
        let _: () = redis::cmd("ZADD")
            .arg(RETRY_QUEUE_KEY)
            .arg(ready_at)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn redis_process_retry_queue(
        &self,
        client: &redis::Client,
    ) -> Result<usize, redis::RedisError> {
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        let now = now_secs();
        let ready: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(RETRY_QUEUE_KEY)
            .arg(0)
            .arg(now)
            .query_async(&mut conn)
            .await?;

        if ready.is_empty() {
            return Ok(0);
        }

        for payload in &ready {
            let _: () = redis::cmd("LPUSH")
                .arg(MAIN_QUEUE_KEY)
                .arg(payload)
                .query_async(&mut conn)
                .await?;
            let _: () = redis::cmd("ZREM")
                .arg(RETRY_QUEUE_KEY)
                .arg(payload)
                .query_async(&mut conn)
                .await?;
        }

        Ok(ready.len())
    }
}

fn to_redis_err(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialize", e.to_string()))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Per-entity spend deltas accumulated while draining one batch, applied to
/// the database with a single `UPDATE ... CASE` per dictionary rather than
/// one round trip per row.
#[derive(Debug, Default)]
pub struct BatchDeltas {
    pub budget: HashMap<String, f64>,
    pub user: HashMap<String, f64>,
    pub team: HashMap<String, f64>,
}

impl BatchDeltas {
    fn accumulate(&mut self, record: &UsageRecord) {
        if let Some(key_id) = &record.key_id {
            *self.budget.entry(key_id.clone()).or_insert(0.0) += record.cost;
        }
        if let Some(user_id) = &record.actual_user_id {
            *self.user.entry(user_id.clone()).or_insert(0.0) += record.cost;
        }
        if let Some(team_id) = &record.team_id {
            *self.team.entry(team_id.clone()).or_insert(0.0) += record.cost;
        }
    }
}

/// Drains the queue into persistent storage on one replica at a time.
pub struct BatchProcessor {
    queue: Arc<UsageQueue>,
    lock_manager: Arc<DistributedLockManager>,
    persistence: Arc<dyn UsagePersistence>,
    budget_cache: Arc<BudgetCache>,
    batch_size: usize,
}

impl BatchProcessor {
    pub fn new(
        queue: Arc<UsageQueue>,
        lock_manager: Arc<DistributedLockManager>,
        persistence: Arc<dyn UsagePersistence>,
        budget_cache: Arc<BudgetCache>,
    ) -> Self {
        Self {
            queue,
            lock_manager,
            persistence,
            budget_cache,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Run one drain pass under the distributed lock. Returns the number of
    /// records committed, or `None` if another replica currently holds the
    /// lock.
    pub async fn run_once(&self) -> Result<Option<usize>, GatewayError> {
        let queue = self.queue.clone();
        let persistence = self.persistence.clone();
        let budget_cache = self.budget_cache.clone();
        let batch_size = self.batch_size;

        let outcome = self
            .lock_manager
            .with_lock("usage_processor_lock", BATCH_LOCK_TTL, move || {
                let queue = queue.clone();
                let persistence = persistence.clone();
                let budget_cache = budget_cache.clone();
                async move {
                    Self::drain_batch(&queue, &persistence, &budget_cache, batch_size).await
                }
            })
            .await?;

        match outcome {
            Some(result) => result.map(Some),
            None => Ok(None),
        }
    }

    async fn drain_batch(
        queue: &UsageQueue,
        persistence: &Arc<dyn UsagePersistence>,
        budget_cache: &BudgetCache,
        batch_size: usize,
    ) -> Result<usize, GatewayError> {
        let batch = queue.dequeue_usage_batch(batch_size).await?;
        if batch.is_empty() {
            return Ok(0);
        }

        let mut persistable = Vec::with_capacity(batch.len());
        let mut deltas = BatchDeltas::default();

        for mut record in batch {
            if record.actual_user_id.is_none() {
                tracing::warn!(
                    "dropping usage record {} with no actual_user_id",
                    record.record_id
                );
                continue;
            }
            record.processed_at = Some(now_secs());
            deltas.accumulate(&record);
            persistable.push(record);
        }

        if persistable.is_empty() {
            return Ok(0);
        }

        match persistence.persist_batch(&persistable).await {
            Ok(()) => {
                for (key_id, delta) in &deltas.budget {
                    if let Err(e) = budget_cache
                        .increment_spent(EntityType::Key, key_id, *delta)
                        .await
                    {
                        tracing::warn!("failed to refresh budget cache for key {key_id}: {e}");
                    }
                }
                for (user_id, delta) in &deltas.user {
                    if let Err(e) = budget_cache
                        .increment_spent(EntityType::User, user_id, *delta)
                        .await
                    {
                        tracing::warn!("failed to refresh budget cache for user {user_id}: {e}");
                    }
                }
                for (team_id, delta) in &deltas.team {
                    if let Err(e) = budget_cache
                        .increment_spent(EntityType::Team, team_id, *delta)
                        .await
                    {
                        tracing::warn!("failed to refresh budget cache for team {team_id}: {e}");
                    }
                }
                Ok(persistable.len())
            }
            Err(e) => {
                for record in persistable {
                    let _ = queue.enqueue_usage_failed(record, &e.to_string()).await;
                }
                Err(e)
            }
        }
    }

    /// Runs `run_once` in a loop until cancelled via `shutdown`.
    pub async fn run_forever(
        self: Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("batch processor received shutdown signal");
                        return;
                    }
                }
                result = self.run_once() => {
                    match result {
                        Ok(Some(count)) if count > 0 => {
                            tracing::info!("batch processor committed {count} usage records");
                        }
                        Ok(_) => {
                            tokio::time::sleep(Duration::from_millis(250)).await;
                        }
                        Err(e) => {
                            tracing::warn!("batch processor iteration failed: {e}");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }
}

/// Wakes every 5 minutes and requeues ready retry entries back onto `main`.
pub async fn run_retry_sweeper(
    queue: Arc<UsageQueue>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(RETRY_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("retry sweeper received shutdown signal");
                    return;
                }
            }
            _ = interval.tick() => {
                match queue.process_retry_queue().await {
                    Ok(moved) if moved > 0 => {
                        tracing::info!("retry sweeper requeued {moved} usage records");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("retry sweeper failed: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The Redis-less fallback path shares process-global state (`local_main`
    // etc.) across every `UsageQueue` instance, so tests that exercise it
    // must not run concurrently with each other.
    static TEST_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

    async fn reset_local_state() {
        local_main().write().await.clear();
        local_retry().write().await.clear();
        local_dead_letter().write().await.clear();
    }

    fn sample_record(id: &str) -> UsageRecord {
        UsageRecord {
            record_id: id.to_string(),
            request_id: format!("req-{id}"),
            ts: now_secs(),
            actual_user_id: Some("user-1".to_string()),
            key_id: Some("key-1".to_string()),
            key_owner_id: None,
            team_id: Some("team-1".to_string()),
            model: "gpt-4o".to_string(),
            provider: "openai".to_string(),
            status: "success".to_string(),
            input_tokens: 10,
            output_tokens: 20,
            cost: 0.01,
            latency_ms: 150,
            retries: 0,
            processed_at: None,
        }
    }

    #[tokio::test]
    async fn enqueue_and_dequeue_fifo() {
        let _guard = TEST_LOCK.lock().await;
        reset_local_state().await;
        let queue = UsageQueue::new(None);
        queue.enqueue_usage(sample_record("")).await.unwrap();
        queue.enqueue_usage(sample_record("")).await.unwrap();

        let batch = queue.dequeue_usage_batch(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        for record in &batch {
            assert!(!record.record_id.is_empty());
        }
    }

    #[tokio::test]
    async fn failed_record_goes_to_retry_then_dead_letter() {
        let _guard = TEST_LOCK.lock().await;
        reset_local_state().await;
        let queue = UsageQueue::new(None).with_max_retries(1);
        let record = sample_record("r-1");

        queue
            .enqueue_usage_failed(record.clone(), "boom")
            .await
            .unwrap();

        // retries (0 -> 1) is not < max_retries(1), so it goes straight to dead letter
        let dead = local_dead_letter().read().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].record.retries, 1);
        assert_eq!(dead[0].final_retry, 1);
        assert_eq!(dead[0].error, "boom");
        assert_eq!(dead[0].record.record_id, "r-1");
    }

    #[tokio::test]
    async fn retry_queue_processes_ready_entries() {
        let _guard = TEST_LOCK.lock().await;
        reset_local_state().await;
        let queue = UsageQueue::new(None).with_max_retries(5);
        let record = sample_record("r-2");
        queue
            .enqueue_usage_failed(record, "transient")
            .await
            .unwrap();

        // force the retry entry to already be ready by rewriting its score
        {
            let mut retry = local_retry().write().await;
            for (ready_at, _) in retry.iter_mut() {
                *ready_at = 0;
            }
        }

        let moved = queue.process_retry_queue().await.unwrap();
        assert_eq!(moved, 1);

        let batch = queue.dequeue_usage_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].record_id, "r-2");
    }

    #[tokio::test]
    async fn batch_processor_persists_and_drops_missing_user() {
        let _guard = TEST_LOCK.lock().await;
        reset_local_state().await;
        let queue = Arc::new(UsageQueue::new(None));
        let lock_manager = Arc::new(DistributedLockManager::new(None));
        let persistence = Arc::new(InMemoryUsagePersistence::new());
        let budget_cache = Arc::new(BudgetCache::new(None));

        let mut missing_user = sample_record("r-3");
        missing_user.actual_user_id = None;
        queue.enqueue_usage(missing_user).await.unwrap();
        queue.enqueue_usage(sample_record("r-4")).await.unwrap();

        let processor = BatchProcessor::new(queue, lock_manager, persistence.clone(), budget_cache.clone());
        let committed = processor.run_once().await.unwrap();
        assert_eq!(committed, Some(1));

        let rows = persistence.rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record_id, "r-4");

        // The committed record's cost was reflected into the budget cache's
        // spend counter for its key entity.
        let total_spent = budget_cache
            .increment_spent(EntityType::Key, "key-1", 0.0)
            .await
            .unwrap();
        assert_eq!(total_spent, sample_record("r-4").cost);
    }
}
