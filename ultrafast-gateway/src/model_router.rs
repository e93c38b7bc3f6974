//! # Instance Registry & Model Router
//!
//! Owns the mapping `exposed_model -> [ModelInstance]`, each instance's
//! circuit breaker, and the fallback chain between exposed models. Selects
//! one healthy instance per request using an adaptive score that blends
//! latency, success rate, and current load.
//!
//! Grounded on [`ultrafast_models_sdk::routing::Router`]'s
//! `provider_stats`/EMA idiom, generalised from a flat provider-id selector
//! into a registry of [`ModelInstance`]s with fallback chains and
//! per-instance circuit breakers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use ultrafast_models_sdk::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};

const DEFAULT_SELECTION_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no healthy instance available for model {0}")]
    NoInstance(String),
    #[error("fallback chain for {model} would introduce a cycle through {via}")]
    FallbackCycle { model: String, via: String },
    #[error("instance selection timed out after {0:?}")]
    SelectionTimeout(Duration),
    #[error("circuit breaker open for every instance of model {0}")]
    CircuitOpen(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(pub u64);

/// Weights for the adaptive scoring formula. Defaults prioritise success
/// rate over raw latency, per the routing contract.
#[derive(Debug, Clone, Copy)]
pub struct RoutingWeights {
    pub w_latency: f64,
    pub w_success: f64,
    pub w_load: f64,
}

impl Default for RoutingWeights {
    fn default() -> Self {
        Self {
            w_latency: 0.3,
            w_success: 0.5,
            w_load: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelInstanceConfig {
    /// Key into the Provider Adapter registry, e.g. `"openai"`.
    pub provider: String,
    /// The model name passed to the provider, e.g. `"gpt-4"`.
    pub provider_model: String,
    pub exposed_model: String,
    pub weight: u32,
    pub max_concurrent: u32,
    pub circuit_breaker: CircuitBreakerConfig,
}

/// One deployment of one provider model. Owned exclusively by the registry
/// for its whole lifetime; counters are atomics so request-path updates
/// never take the registry-wide lock.
pub struct ModelInstance {
    pub instance_id: InstanceId,
    pub provider: String,
    pub provider_model: String,
    pub exposed_model: String,
    pub weight: u32,
    pub max_concurrent: u32,
    in_flight: AtomicU64,
    total_requests: AtomicU64,
    total_tokens: AtomicU64,
    total_errors: AtomicU64,
    ema_latency_ms: std::sync::Mutex<f64>,
    circuit_breaker: CircuitBreaker,
}

impl ModelInstance {
    fn new(instance_id: InstanceId, config: ModelInstanceConfig) -> Self {
        let breaker_name = format!("{}:{}", config.exposed_model, instance_id.0);
        Self {
            instance_id,
            provider: config.provider,
            provider_model: config.provider_model,
            exposed_model: config.exposed_model,
            weight: config.weight,
            max_concurrent: config.max_concurrent,
            in_flight: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            total_tokens: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            ema_latency_ms: std::sync::Mutex::new(0.0),
            circuit_breaker: CircuitBreaker::new(breaker_name, config.circuit_breaker),
        }
    }

    fn lexical_key(&self) -> String {
        self.instance_id.0.to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct InstanceStats {
    pub in_flight: u64,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub total_errors: u64,
    pub ema_latency_ms: f64,
}

pub struct SelectionTrace {
    pub candidates_considered: Vec<String>,
    pub selected_instance_id: InstanceId,
    pub score: f64,
    pub fallback_depth: usize,
}

/// Maintains `exposed_model -> [InstanceId]`, the fallback chain, and every
/// registered instance.
pub struct ModelRouter {
    instances: DashMap<InstanceId, Arc<ModelInstance>>,
    groups: DashMap<String, Vec<InstanceId>>,
    fallbacks: DashMap<String, Vec<String>>,
    weights: RoutingWeights,
    selection_timeout: Duration,
    next_id: AtomicU64,
}

impl ModelRouter {
    pub fn new(weights: RoutingWeights) -> Self {
        Self {
            instances: DashMap::new(),
            groups: DashMap::new(),
            fallbacks: DashMap::new(),
            weights,
            selection_timeout: DEFAULT_SELECTION_TIMEOUT,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_selection_timeout(mut self, timeout: Duration) -> Self {
        self.selection_timeout = timeout;
        self
    }

    /// Register an instance under its `exposed_model`. Each call allocates
    /// a fresh stable id; callers that need idempotency on a pre-existing
    /// `instance_id` should track the returned id themselves and avoid
    /// calling twice for the same deployment.
    pub fn register_instance(&self, config: ModelInstanceConfig) -> InstanceId {
        let id = InstanceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let exposed_model = config.exposed_model.clone();
        let instance = Arc::new(ModelInstance::new(id, config));
        self.instances.insert(id, instance);
        self.groups.entry(exposed_model).or_default().push(id);
        id
    }

    /// Replace the fallback chain for `exposed_model` atomically. Rejects
    /// cycles (a chain that would eventually route back to `exposed_model`).
    pub fn set_fallbacks(
        &self,
        exposed_model: &str,
        chain: Vec<String>,
    ) -> Result<(), RouterError> {
        let mut visited = HashSet::new();
        visited.insert(exposed_model.to_string());

        let mut candidate_fallbacks: HashMap<String, Vec<String>> = self
            .fallbacks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        candidate_fallbacks.insert(exposed_model.to_string(), chain.clone());

        let mut cursor = chain.clone();
        while let Some(next) = cursor.pop() {
            if !visited.insert(next.clone()) {
                return Err(RouterError::FallbackCycle {
                    model: exposed_model.to_string(),
                    via: next,
                });
            }
            if let Some(more) = candidate_fallbacks.get(&next) {
                cursor.extend(more.clone());
            }
        }

        self.fallbacks.insert(exposed_model.to_string(), chain);
        Ok(())
    }

    fn candidate_models(&self, exposed_model: &str) -> Vec<String> {
        let mut models = vec![exposed_model.to_string()];
        if let Some(chain) = self.fallbacks.get(exposed_model) {
            models.extend(chain.value().clone());
        }
        models
    }

    /// Select the best instance for `exposed_model`, traversing its
    /// fallback chain if the primary has no eligible candidates. Enforces
    /// the selection timeout itself so a slow lookup can never block on
    /// provider I/O.
    pub async fn select_instance(
        &self,
        exposed_model: &str,
    ) -> Result<(Arc<ModelInstance>, SelectionTrace), RouterError> {
        self.select_instance_excluding(exposed_model, &HashSet::new())
            .await
    }

    /// Same as [`Self::select_instance`] but skips any instance id in
    /// `excluded`. Used by the forwarder to advance past instances it has
    /// already tried and failed within one logical request.
    pub async fn select_instance_excluding(
        &self,
        exposed_model: &str,
        excluded: &HashSet<InstanceId>,
    ) -> Result<(Arc<ModelInstance>, SelectionTrace), RouterError> {
        let timeout = self.selection_timeout;
        match tokio::time::timeout(
            timeout,
            self.select_instance_inner(exposed_model, excluded),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RouterError::SelectionTimeout(timeout)),
        }
    }

    async fn select_instance_inner(
        &self,
        exposed_model: &str,
        excluded: &HashSet<InstanceId>,
    ) -> Result<(Arc<ModelInstance>, SelectionTrace), RouterError> {
        let candidates = self.candidate_models(exposed_model);
        let mut considered = Vec::new();
        let mut saw_any_instance = false;
        let mut saw_eligible_instance = false;

        for (depth, model) in candidates.iter().enumerate() {
            let instance_ids = match self.groups.get(model) {
                Some(ids) => ids.value().clone(),
                None => continue,
            };

            let mut eligible: Vec<(Arc<ModelInstance>, f64)> = Vec::new();
            for id in instance_ids {
                if excluded.contains(&id) {
                    continue;
                }
                let Some(instance) = self.instances.get(&id).map(|e| e.value().clone()) else {
                    continue;
                };
                considered.push(instance.lexical_key());
                saw_any_instance = true;

                if !instance.circuit_breaker.can_request().await {
                    continue;
                }
                saw_eligible_instance = true;
                let in_flight = instance.in_flight.load(Ordering::Relaxed);
                if in_flight >= instance.max_concurrent as u64 {
                    continue;
                }

                let score = self.score_instance(&instance, in_flight);
                eligible.push((instance, score));
            }

            if eligible.is_empty() {
                continue;
            }

            // Highest score wins; ties break on lexical instance key for
            // reproducible selection in tests.
            eligible.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.0.lexical_key().cmp(&b.0.lexical_key()))
            });

            let (selected, score) = eligible.into_iter().next().expect("non-empty eligible set");
            return Ok((
                selected.clone(),
                SelectionTrace {
                    candidates_considered: considered,
                    selected_instance_id: selected.instance_id,
                    score,
                    fallback_depth: depth,
                },
            ));
        }

        if saw_any_instance && !saw_eligible_instance {
            return Err(RouterError::CircuitOpen(exposed_model.to_string()));
        }
        Err(RouterError::NoInstance(exposed_model.to_string()))
    }

    fn score_instance(&self, instance: &ModelInstance, in_flight: u64) -> f64 {
        let ema_latency = *instance.ema_latency_ms.lock().unwrap();
        let inverse_latency = if ema_latency > 0.0 { 1.0 / ema_latency } else { 1.0 };
        let normalized_latency = inverse_latency / (inverse_latency + 1.0);

        let total = instance.total_requests.load(Ordering::Relaxed);
        let errors = instance.total_errors.load(Ordering::Relaxed);
        let success_rate = if total == 0 {
            1.0
        } else {
            (total.saturating_sub(errors)) as f64 / total as f64
        };

        let load_fraction = if instance.max_concurrent > 0 {
            in_flight as f64 / instance.max_concurrent as f64
        } else {
            0.0
        };

        self.weights.w_latency * normalized_latency + self.weights.w_success * success_rate
            - self.weights.w_load * load_fraction
    }

    pub fn record_request_start(&self, instance_id: InstanceId) {
        if let Some(instance) = self.instances.get(&instance_id) {
            instance.in_flight.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Feed request outcome back into the instance's counters and its
    /// circuit breaker. `latency` updates the EMA even on failure, since a
    /// slow failing instance should score worse on both axes.
    pub async fn record_request_end(
        &self,
        instance_id: InstanceId,
        latency: Duration,
        ok: bool,
        timed_out: bool,
    ) {
        let Some(instance) = self.instances.get(&instance_id).map(|e| e.value().clone()) else {
            return;
        };

        instance.in_flight.fetch_sub(1, Ordering::Relaxed);
        instance.total_requests.fetch_add(1, Ordering::Relaxed);

        {
            let mut ema = instance.ema_latency_ms.lock().unwrap();
            let sample = latency.as_secs_f64() * 1000.0;
            *ema = if *ema == 0.0 {
                sample
            } else {
                0.9 * *ema + 0.1 * sample
            };
        }

        if timed_out {
            instance.total_errors.fetch_add(1, Ordering::Relaxed);
            instance.circuit_breaker.record_timeout().await;
        } else if ok {
            instance.circuit_breaker.record_success(latency).await;
        } else {
            instance.total_errors.fetch_add(1, Ordering::Relaxed);
            instance.circuit_breaker.record_failure().await;
        }
    }

    pub fn record_tokens(&self, instance_id: InstanceId, tokens: u64) {
        if let Some(instance) = self.instances.get(&instance_id) {
            instance.total_tokens.fetch_add(tokens, Ordering::Relaxed);
        }
    }

    /// Observability snapshot across every registered instance, keyed by
    /// exposed model name.
    pub fn get_stats(&self) -> HashMap<String, Vec<InstanceStats>> {
        let mut out: HashMap<String, Vec<InstanceStats>> = HashMap::new();
        for entry in self.instances.iter() {
            let instance = entry.value();
            out.entry(instance.exposed_model.clone())
                .or_default()
                .push(InstanceStats {
                    in_flight: instance.in_flight.load(Ordering::Relaxed),
                    total_requests: instance.total_requests.load(Ordering::Relaxed),
                    total_tokens: instance.total_tokens.load(Ordering::Relaxed),
                    total_errors: instance.total_errors.load(Ordering::Relaxed),
                    ema_latency_ms: *instance.ema_latency_ms.lock().unwrap(),
                });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance_config(exposed: &str, max_concurrent: u32) -> ModelInstanceConfig {
        ModelInstanceConfig {
            provider: "test-provider".to_string(),
            provider_model: format!("{exposed}-upstream"),
            exposed_model: exposed.to_string(),
            weight: 1,
            max_concurrent,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }

    #[tokio::test]
    async fn selects_the_only_eligible_instance() {
        let router = ModelRouter::new(RoutingWeights::default());
        let id = router.register_instance(instance_config("my-gpt-4", 10));

        let (selected, trace) = router.select_instance("my-gpt-4").await.unwrap();
        assert_eq!(selected.instance_id, id);
        assert_eq!(trace.fallback_depth, 0);
    }

    #[tokio::test]
    async fn falls_back_when_primary_has_no_capacity() {
        let router = ModelRouter::new(RoutingWeights::default());
        let primary = router.register_instance(instance_config("primary", 1));
        let fallback = router.register_instance(instance_config("backup", 1));

        router
            .set_fallbacks("primary", vec!["backup".to_string()])
            .unwrap();

        router.record_request_start(primary);
        // primary is now at its max_concurrent of 1

        let (selected, trace) = router.select_instance("primary").await.unwrap();
        assert_eq!(selected.instance_id, fallback);
        assert_eq!(trace.fallback_depth, 1);
    }

    #[tokio::test]
    async fn returns_no_instance_when_nothing_registered() {
        let router = ModelRouter::new(RoutingWeights::default());
        let result = router.select_instance("nonexistent").await;
        assert!(matches!(result, Err(RouterError::NoInstance(_))));
    }

    #[tokio::test]
    async fn rejects_cyclic_fallback_chains() {
        let router = ModelRouter::new(RoutingWeights::default());
        router
            .set_fallbacks("a", vec!["b".to_string()])
            .unwrap();
        router
            .set_fallbacks("b", vec!["c".to_string()])
            .unwrap();

        let result = router.set_fallbacks("c", vec!["a".to_string()]);
        assert!(matches!(result, Err(RouterError::FallbackCycle { .. })));
    }

    #[tokio::test]
    async fn higher_success_rate_wins_on_score() {
        let router = ModelRouter::new(RoutingWeights::default());
        let weak = router.register_instance(instance_config("model", 10));
        let strong = router.register_instance(instance_config("model", 10));

        for _ in 0..5 {
            router.record_request_start(weak);
            router
                .record_request_end(weak, Duration::from_millis(50), false, false)
                .await;
        }
        for _ in 0..5 {
            router.record_request_start(strong);
            router
                .record_request_end(strong, Duration::from_millis(50), true, false)
                .await;
        }

        let (selected, _) = router.select_instance("model").await.unwrap();
        assert_eq!(selected.instance_id, strong);
    }

    #[tokio::test]
    async fn timeout_opens_circuit_and_excludes_instance() {
        let router = ModelRouter::new(RoutingWeights::default());
        let flaky = router.register_instance(instance_config("model", 10));
        let steady = router.register_instance(instance_config("model", 10));

        router.record_request_start(flaky);
        router
            .record_request_end(flaky, Duration::from_millis(5000), false, true)
            .await;

        let (selected, _) = router.select_instance("model").await.unwrap();
        assert_eq!(selected.instance_id, steady);
    }
}
