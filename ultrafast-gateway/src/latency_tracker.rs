//! # Latency Tracker & Health Store
//!
//! Aggregates request latency and instance health across gateway replicas
//! through the shared Redis store so that every replica's adaptive routing
//! decisions converge on the same picture of the world, rather than each
//! replica routing off its own local, partial view.
//!
//! Follows [`crate::gateway_caching::CacheManager`]'s shape: an
//! `Option<redis::Client>`, raw `redis::cmd` pipelines over a multiplexed
//! connection, and a `tracing::warn!`-and-fall-back-to-local-state posture
//! on every Redis error. A stale EMA or an empty latency window is an
//! acceptable degradation; a panic or hard error is not.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

const DEFAULT_WINDOW_SECS: u64 = 300;
const DEFAULT_MAX_SAMPLES: isize = 1000;
const EMA_ALPHA: f64 = 0.1;
const HEALTH_SET_TTL_SECS: usize = 120;

static LOCAL_SAMPLES: OnceLock<Arc<RwLock<HashMap<String, Vec<(f64, u64)>>>>> = OnceLock::new();
static LOCAL_EMA: OnceLock<Arc<RwLock<HashMap<String, f64>>>> = OnceLock::new();
static LOCAL_HEALTH: OnceLock<Arc<RwLock<HashMap<String, HealthRecord>>>> = OnceLock::new();

fn local_samples() -> &'static Arc<RwLock<HashMap<String, Vec<(f64, u64)>>>> {
    LOCAL_SAMPLES.get_or_init(|| Arc::new(RwLock::new(HashMap::new())))
}

fn local_ema() -> &'static Arc<RwLock<HashMap<String, f64>>> {
    LOCAL_EMA.get_or_init(|| Arc::new(RwLock::new(HashMap::new())))
}

fn local_health() -> &'static Arc<RwLock<HashMap<String, HealthRecord>>> {
    LOCAL_HEALTH.get_or_init(|| Arc::new(RwLock::new(HashMap::new())))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub instance_id: String,
    pub model: String,
    pub healthy: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub checked_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelHealthSummary {
    pub healthy_count: u64,
    pub total_count: u64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: usize,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

pub struct LatencyTrackerConfig {
    pub window: Duration,
    pub max_samples: isize,
}

impl Default for LatencyTrackerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(DEFAULT_WINDOW_SECS),
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }
}

pub struct LatencyTracker {
    redis_client: Option<redis::Client>,
    config: LatencyTrackerConfig,
}

impl LatencyTracker {
    pub fn new(redis_client: Option<redis::Client>, config: LatencyTrackerConfig) -> Self {
        Self {
            redis_client,
            config,
        }
    }

    fn samples_key(model: &str) -> String {
        format!("pllm:latency:{model}")
    }

    fn avg_key(model: &str) -> String {
        format!("pllm:latency:avg:{model}")
    }

    fn instance_health_key(instance_id: &str) -> String {
        format!("pllm:health:instance:{instance_id}")
    }

    fn model_instances_key(model: &str) -> String {
        format!("pllm:health:model:{model}:instances")
    }

    /// Record one latency sample for `model` and roll the EMA forward.
    pub async fn record_latency(&self, model: &str, duration: Duration) {
        let latency_ms = duration.as_secs_f64() * 1000.0;
        let now = now_secs();

        if let Some(client) = &self.redis_client {
            match self.redis_record_latency(client, model, latency_ms, now).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!("Redis error recording latency for {model}, falling back to local: {e}");
                }
            }
        }

        let mut samples = local_samples().write().await;
        let window_secs = self.config.window.as_secs();
        let entry = samples.entry(model.to_string()).or_default();
        entry.push((latency_ms, now));
        entry.retain(|(_, ts)| now.saturating_sub(*ts) <= window_secs);
        let max_samples = self.config.max_samples.max(0) as usize;
        if entry.len() > max_samples {
            let drop_count = entry.len() - max_samples;
            entry.drain(0..drop_count);
        }
        drop(samples);

        let mut ema = local_ema().write().await;
        let updated = match ema.get(model) {
            Some(old) => EMA_ALPHA * latency_ms + (1.0 - EMA_ALPHA) * old,
            None => latency_ms,
        };
        ema.insert(model.to_string(), updated);
    }

    async fn redis_record_latency(
        &self,
        client: &redis::Client,
        model: &str,
        latency_ms: f64,
        now: u64,
    ) -> Result<(), redis::RedisError> {
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        let samples_key = Self::samples_key(model);
        let window_start = now.saturating_sub(self.config.window.as_secs());

        // nanotime suffix keeps same-millisecond samples distinct as zset members
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let member = format!("{latency_ms}:{nanos}");

        let _: () = redis::cmd("ZADD")
            .arg(&samples_key)
            .arg(now)
            .arg(&member)
            .query_async(&mut conn)
            .await?;
        let _: () = redis::cmd("ZREMRANGEBYSCORE")
            .arg(&samples_key)
            .arg(0)
            .arg(window_start)
            .query_async(&mut conn)
            .await?;
        let _: () = redis::cmd("ZREMRANGEBYRANK")
            .arg(&samples_key)
            .arg(0)
            .arg(-(self.config.max_samples) - 1)
            .query_async(&mut conn)
            .await?;
        let _: () = redis::cmd("EXPIRE")
            .arg(&samples_key)
            .arg(self.config.window.as_secs().max(1) as i64)
            .query_async(&mut conn)
            .await?;

        let avg_key = Self::avg_key(model);
        let previous: Option<f64> = redis::cmd("GET")
            .arg(&avg_key)
            .query_async(&mut conn)
            .await?;
        let updated = match previous {
            Some(old) => EMA_ALPHA * latency_ms + (1.0 - EMA_ALPHA) * old,
            None => latency_ms,
        };
        let _: () = redis::cmd("SET")
            .arg(&avg_key)
            .arg(updated)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    /// Current EMA latency for `model`, or `None` if nothing's been recorded.
    pub async fn get_average_latency(&self, model: &str) -> Option<Duration> {
        if let Some(client) = &self.redis_client {
            match self.redis_get_average(client, model).await {
                Ok(Some(ms)) => return Some(Duration::from_secs_f64(ms / 1000.0)),
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!("Redis error reading average latency for {model}, falling back to local: {e}");
                }
            }
        }

        local_ema()
            .read()
            .await
            .get(model)
            .map(|ms| Duration::from_secs_f64(ms / 1000.0))
    }

    async fn redis_get_average(
        &self,
        client: &redis::Client,
        model: &str,
    ) -> Result<Option<f64>, redis::RedisError> {
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        redis::cmd("GET")
            .arg(Self::avg_key(model))
            .query_async(&mut conn)
            .await
    }

    /// Computed-on-read latency distribution over the current window.
    pub async fn get_latency_stats(&self, model: &str) -> LatencyStats {
        let mut values = if let Some(client) = &self.redis_client {
            match self.redis_get_samples(client, model).await {
                Ok(values) => values,
                Err(e) => {
                    tracing::warn!("Redis error reading latency samples for {model}, falling back to local: {e}");
                    local_samples_for(model).await
                }
            }
        } else {
            local_samples_for(model).await
        };

        if values.is_empty() {
            return LatencyStats::default();
        }

        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let count = values.len();
        let sum: f64 = values.iter().sum();
        let avg = sum / count as f64;

        LatencyStats {
            count,
            avg,
            min: values[0],
            max: values[count - 1],
            p50: percentile(&values, 50.0),
            p95: percentile(&values, 95.0),
            p99: percentile(&values, 99.0),
        }
    }

    async fn redis_get_samples(
        &self,
        client: &redis::Client,
        model: &str,
    ) -> Result<Vec<f64>, redis::RedisError> {
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        let members: Vec<String> = redis::cmd("ZRANGE")
            .arg(Self::samples_key(model))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        Ok(members
            .iter()
            .filter_map(|m| m.split(':').next())
            .filter_map(|ms| ms.parse::<f64>().ok())
            .collect())
    }

    /// A 0..100 health score, piecewise-linear on P95 latency: under 500ms
    /// is fully healthy, over 5s is fully unhealthy, linear between.
    pub async fn get_health_score(&self, model: &str) -> u8 {
        let stats = self.get_latency_stats(model).await;
        if stats.count == 0 {
            return 100;
        }
        let p95 = stats.p95;
        if p95 <= 500.0 {
            100
        } else if p95 >= 5000.0 {
            0
        } else {
            let fraction = (5000.0 - p95) / (5000.0 - 500.0);
            (fraction * 100.0).round().clamp(0.0, 100.0) as u8
        }
    }

    /// Persist a health check result for one instance and register it with
    /// its model's instance set.
    pub async fn store_result(&self, record: HealthRecord) {
        if let Some(client) = &self.redis_client {
            match self.redis_store_result(client, &record).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(
                        "Redis error storing health record for {}, falling back to local: {e}",
                        record.instance_id
                    );
                }
            }
        }

        local_health()
            .write()
            .await
            .insert(record.instance_id.clone(), record);
    }

    async fn redis_store_result(
        &self,
        client: &redis::Client,
        record: &HealthRecord,
    ) -> Result<(), redis::RedisError> {
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        let payload = serde_json::to_string(record).map_err(|e| {
            redis::RedisError::from((redis::ErrorKind::TypeError, "serialize", e.to_string()))
        })?;

        let _: () = redis::cmd("SET")
            .arg(Self::instance_health_key(&record.instance_id))
            .arg(&payload)
            .query_async(&mut conn)
            .await?;

        let members_key = Self::model_instances_key(&record.model);
        let _: () = redis::cmd("SADD")
            .arg(&members_key)
            .arg(&record.instance_id)
            .query_async(&mut conn)
            .await?;
        let _: () = redis::cmd("EXPIRE")
            .arg(&members_key)
            .arg(HEALTH_SET_TTL_SECS as i64)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    /// Aggregate health across every instance registered for `model`.
    pub async fn get_model_health(&self, model: &str) -> ModelHealthSummary {
        let records = if let Some(client) = &self.redis_client {
            match self.redis_get_model_health(client, model).await {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!("Redis error reading model health for {model}, falling back to local: {e}");
                    local_health_for(model).await
                }
            }
        } else {
            local_health_for(model).await
        };

        if records.is_empty() {
            return ModelHealthSummary::default();
        }

        let healthy_count = records.iter().filter(|r| r.healthy).count() as u64;
        let total_count = records.len() as u64;
        let avg_latency_ms =
            records.iter().map(|r| r.latency_ms as f64).sum::<f64>() / records.len() as f64;

        ModelHealthSummary {
            healthy_count,
            total_count,
            avg_latency_ms,
        }
    }

    async fn redis_get_model_health(
        &self,
        client: &redis::Client,
        model: &str,
    ) -> Result<Vec<HealthRecord>, redis::RedisError> {
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        let instance_ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(Self::model_instances_key(model))
            .query_async(&mut conn)
            .await?;

        let mut records = Vec::with_capacity(instance_ids.len());
        for id in instance_ids {
            let raw: Option<String> = redis::cmd("GET")
                .arg(Self::instance_health_key(&id))
                .query_async(&mut conn)
                .await?;
            if let Some(raw) = raw {
                if let Ok(record) = serde_json::from_str::<HealthRecord>(&raw) {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }
}

async fn local_samples_for(model: &str) -> Vec<f64> {
    local_samples()
        .read()
        .await
        .get(model)
        .map(|entries| entries.iter().map(|(v, _)| *v).collect())
        .unwrap_or_default()
}

async fn local_health_for(model: &str) -> Vec<HealthRecord> {
    local_health()
        .read()
        .await
        .values()
        .filter(|r| r.model == model)
        .cloned()
        .collect()
}

fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (pct / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_and_averages_locally() {
        let tracker = LatencyTracker::new(None, LatencyTrackerConfig::default());
        tracker
            .record_latency("gpt-4o-instance-a", Duration::from_millis(100))
            .await;
        tracker
            .record_latency("gpt-4o-instance-a", Duration::from_millis(200))
            .await;

        let avg = tracker.get_average_latency("gpt-4o-instance-a").await;
        assert!(avg.is_some());
    }

    #[tokio::test]
    async fn stats_reflect_recorded_samples() {
        let tracker = LatencyTracker::new(None, LatencyTrackerConfig::default());
        for ms in [50, 100, 150, 200, 250] {
            tracker
                .record_latency("model-x", Duration::from_millis(ms))
                .await;
        }

        let stats = tracker.get_latency_stats("model-x").await;
        assert_eq!(stats.count, 5);
        assert_eq!(stats.min, 50.0);
        assert_eq!(stats.max, 250.0);
    }

    #[tokio::test]
    async fn health_score_is_100_with_no_data() {
        let tracker = LatencyTracker::new(None, LatencyTrackerConfig::default());
        assert_eq!(tracker.get_health_score("unseen-model").await, 100);
    }

    #[tokio::test]
    async fn model_health_aggregates_instance_records() {
        let tracker = LatencyTracker::new(None, LatencyTrackerConfig::default());
        tracker
            .store_result(HealthRecord {
                instance_id: "inst-1".to_string(),
                model: "gpt-4o".to_string(),
                healthy: true,
                latency_ms: 120,
                error: None,
                checked_at: now_secs(),
            })
            .await;
        tracker
            .store_result(HealthRecord {
                instance_id: "inst-2".to_string(),
                model: "gpt-4o".to_string(),
                healthy: false,
                latency_ms: 900,
                error: Some("timeout".to_string()),
                checked_at: now_secs(),
            })
            .await;

        let summary = tracker.get_model_health("gpt-4o").await;
        assert_eq!(summary.total_count, 2);
        assert_eq!(summary.healthy_count, 1);
    }
}
