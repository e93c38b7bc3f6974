//! # Guardrail Executor
//!
//! Runs a pipeline of content checks at one of four phases — `pre_call`,
//! `post_call`, `during_call`, `logging_only` — threading each guardrail's
//! modifications into the next guardrail's input within a phase. The first
//! `blocked=true` ends the phase with a terminal error.
//!
//! Grounded on [`crate::plugins::PluginManager`]'s hook-pipeline idiom
//! (`before_request`/`after_response`, sequential execution over a
//! registered collection, continue-on-error for non-critical failures).
//! Unlike the plugin manager's priority-sorted execution, guardrails run in
//! strict registration order per the phase contract, so the registry here
//! is a plain `Vec` rather than a `DashMap` keyed by priority.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::gateway_error::GatewayError;

const DEFAULT_GUARDRAIL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailMode {
    PreCall,
    PostCall,
    DuringCall,
    LoggingOnly,
}

#[derive(Debug, Clone)]
pub struct GuardrailConfig {
    pub name: String,
    pub guardrail_type: String,
    pub mode: GuardrailMode,
    pub enabled: bool,
    /// Only meaningful for `mode == PreCall`: a timeout or internal error is
    /// treated as a block rather than allowed through.
    pub fail_closed: bool,
}

/// Result of running one guardrail against one input.
#[derive(Debug, Clone, Default)]
pub struct GuardrailOutcome {
    pub passed: bool,
    pub blocked: bool,
    pub modified: bool,
    pub modified_request: Option<Value>,
    pub modified_response: Option<Value>,
    pub reason: Option<String>,
}

impl GuardrailOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            ..Default::default()
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            blocked: true,
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait Guardrail: Send + Sync {
    fn config(&self) -> &GuardrailConfig;
    async fn execute(&self, input: &Value) -> Result<GuardrailOutcome, GatewayError>;
}

#[derive(Debug, Clone, Default)]
pub struct GuardrailStats {
    pub total_calls: u64,
    pub errors: u64,
    pub blocked: u64,
}

#[derive(Default)]
struct GuardrailCounters {
    total_calls: AtomicU64,
    errors: AtomicU64,
    blocked: AtomicU64,
}

/// A guardrail was blocked, or errored closed, during a phase run.
#[derive(Debug, Clone)]
pub struct GuardrailRejection {
    pub guardrail_name: String,
    pub reason: String,
}

pub struct GuardrailExecutor {
    guardrails: RwLock<Vec<Arc<dyn Guardrail>>>,
    counters: RwLock<HashMap<String, Arc<GuardrailCounters>>>,
    timeout: Duration,
}

impl Default for GuardrailExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl GuardrailExecutor {
    pub fn new() -> Self {
        Self {
            guardrails: RwLock::new(Vec::new()),
            counters: RwLock::new(HashMap::new()),
            timeout: DEFAULT_GUARDRAIL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn register(&self, guardrail: Arc<dyn Guardrail>) {
        let name = guardrail.config().name.clone();
        self.counters
            .write()
            .await
            .insert(name, Arc::new(GuardrailCounters::default()));
        self.guardrails.write().await.push(guardrail);
    }

    /// Runs every enabled guardrail registered for `phase`, in registration
    /// order, threading modifications forward. Returns the final (possibly
    /// modified) input on success, or the rejection that terminated the
    /// phase.
    pub async fn run_phase(
        &self,
        phase: GuardrailMode,
        input: Value,
    ) -> Result<Value, GuardrailRejection> {
        let guardrails = self.guardrails.read().await;
        let mut current = input;

        for guardrail in guardrails.iter().filter(|g| g.config().mode == phase) {
            let cfg = guardrail.config();
            if !cfg.enabled {
                continue;
            }

            let outcome = self.run_one(guardrail.as_ref(), &current).await;

            match outcome {
                Ok(outcome) => {
                    if outcome.blocked {
                        self.record_blocked(&cfg.name).await;
                        return Err(GuardrailRejection {
                            guardrail_name: cfg.name.clone(),
                            reason: outcome
                                .reason
                                .unwrap_or_else(|| "blocked by guardrail".to_string()),
                        });
                    }
                    if outcome.modified {
                        if let Some(modified) = outcome.modified_request.or(outcome.modified_response)
                        {
                            current = modified;
                        }
                    }
                }
                Err(e) => {
                    self.record_error(&cfg.name).await;
                    if phase == GuardrailMode::PreCall && cfg.fail_closed {
                        return Err(GuardrailRejection {
                            guardrail_name: cfg.name.clone(),
                            reason: format!("guardrail errored and is fail_closed: {e}"),
                        });
                    }
                    tracing::warn!(
                        "guardrail {} errored during {:?}, continuing (fail_open): {e}",
                        cfg.name,
                        phase
                    );
                }
            }
        }

        Ok(current)
    }

    /// `during_call` guardrails run fully detached from the request's
    /// lifetime; their outcome is logged only, never blocks or mutates the
    /// response.
    pub async fn spawn_during_call(&self, input: Value) {
        let guardrails = self.guardrails.read().await;
        for guardrail in guardrails
            .iter()
            .filter(|g| g.config().mode == GuardrailMode::DuringCall && g.config().enabled)
        {
            let guardrail = guardrail.clone();
            let input = input.clone();
            let timeout = self.timeout;
            tokio::spawn(async move {
                let name = guardrail.config().name.clone();
                match tokio::time::timeout(timeout, guardrail.execute(&input)).await {
                    Ok(Ok(outcome)) if outcome.blocked => {
                        tracing::warn!("during_call guardrail {name} flagged: {:?}", outcome.reason);
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!("during_call guardrail {name} errored: {e}"),
                    Err(_) => tracing::warn!("during_call guardrail {name} timed out"),
                }
            });
        }
    }

    /// `logging_only` guardrails mask fields before persistence; they never
    /// block, but modifications are still threaded so masking compounds.
    pub async fn run_logging_only(&self, input: Value) -> Value {
        match self.run_phase(GuardrailMode::LoggingOnly, input.clone()).await {
            Ok(masked) => masked,
            Err(_) => input,
        }
    }

    async fn run_one(&self, guardrail: &dyn Guardrail, input: &Value) -> Result<GuardrailOutcome, GatewayError> {
        let name = guardrail.config().name.clone();
        self.record_call(&name).await;

        match tokio::time::timeout(self.timeout, guardrail.execute(input)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Internal {
                message: format!("guardrail {name} timed out after {:?}", self.timeout),
            }),
        }
    }

    async fn record_call(&self, name: &str) {
        if let Some(counters) = self.counters.read().await.get(name) {
            counters.total_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn record_error(&self, name: &str) {
        if let Some(counters) = self.counters.read().await.get(name) {
            counters.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn record_blocked(&self, name: &str) {
        if let Some(counters) = self.counters.read().await.get(name) {
            counters.blocked.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn stats(&self) -> HashMap<String, GuardrailStats> {
        self.counters
            .read()
            .await
            .iter()
            .map(|(name, c)| {
                (
                    name.clone(),
                    GuardrailStats {
                        total_calls: c.total_calls.load(Ordering::Relaxed),
                        errors: c.errors.load(Ordering::Relaxed),
                        blocked: c.blocked.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct BlockingGuardrail(GuardrailConfig);

    #[async_trait]
    impl Guardrail for BlockingGuardrail {
        fn config(&self) -> &GuardrailConfig {
            &self.0
        }
        async fn execute(&self, _input: &Value) -> Result<GuardrailOutcome, GatewayError> {
            Ok(GuardrailOutcome::block("contains forbidden content"))
        }
    }

    struct MaskingGuardrail(GuardrailConfig);

    #[async_trait]
    impl Guardrail for MaskingGuardrail {
        fn config(&self) -> &GuardrailConfig {
            &self.0
        }
        async fn execute(&self, input: &Value) -> Result<GuardrailOutcome, GatewayError> {
            let mut masked = input.clone();
            masked["masked"] = json!(true);
            Ok(GuardrailOutcome {
                passed: true,
                blocked: false,
                modified: true,
                modified_request: Some(masked),
                modified_response: None,
                reason: None,
            })
        }
    }

    struct SlowGuardrail(GuardrailConfig);

    #[async_trait]
    impl Guardrail for SlowGuardrail {
        fn config(&self) -> &GuardrailConfig {
            &self.0
        }
        async fn execute(&self, _input: &Value) -> Result<GuardrailOutcome, GatewayError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(GuardrailOutcome::pass())
        }
    }

    fn cfg(name: &str, mode: GuardrailMode, fail_closed: bool) -> GuardrailConfig {
        GuardrailConfig {
            name: name.to_string(),
            guardrail_type: "test".to_string(),
            mode,
            enabled: true,
            fail_closed,
        }
    }

    #[tokio::test]
    async fn first_block_short_circuits_phase() {
        let executor = GuardrailExecutor::new();
        executor
            .register(Arc::new(BlockingGuardrail(cfg(
                "blocker",
                GuardrailMode::PreCall,
                false,
            ))))
            .await;
        executor
            .register(Arc::new(MaskingGuardrail(cfg(
                "masker",
                GuardrailMode::PreCall,
                false,
            ))))
            .await;

        let result = executor.run_phase(GuardrailMode::PreCall, json!({})).await;
        assert!(result.is_err());
        assert_eq!(executor.stats().await["blocker"].blocked, 1);
    }

    #[tokio::test]
    async fn modifications_thread_into_next_guardrail() {
        let executor = GuardrailExecutor::new();
        executor
            .register(Arc::new(MaskingGuardrail(cfg(
                "masker-1",
                GuardrailMode::LoggingOnly,
                false,
            ))))
            .await;

        let result = executor
            .run_phase(GuardrailMode::LoggingOnly, json!({"content": "hi"}))
            .await
            .unwrap();
        assert_eq!(result["masked"], json!(true));
    }

    #[tokio::test]
    async fn fail_closed_pre_call_timeout_blocks() {
        let executor = GuardrailExecutor::new().with_timeout(Duration::from_millis(10));
        executor
            .register(Arc::new(SlowGuardrail(cfg(
                "slow",
                GuardrailMode::PreCall,
                true,
            ))))
            .await;

        let result = executor.run_phase(GuardrailMode::PreCall, json!({})).await;
        assert!(result.is_err());
        assert_eq!(executor.stats().await["slow"].errors, 1);
    }

    #[tokio::test]
    async fn fail_open_non_pre_call_timeout_continues() {
        let executor = GuardrailExecutor::new().with_timeout(Duration::from_millis(10));
        executor
            .register(Arc::new(SlowGuardrail(cfg(
                "slow",
                GuardrailMode::PostCall,
                true,
            ))))
            .await;

        let result = executor
            .run_phase(GuardrailMode::PostCall, json!({"ok": true}))
            .await;
        assert!(result.is_ok());
    }
}
