//! # Streaming / Non-streaming Forwarder
//!
//! Sits between the Model Router and the Provider Adapter contract. Owns no
//! state of its own beyond the provider registry: it asks the router for an
//! instance, substitutes `exposed_model` with the instance's `provider_model`,
//! calls the provider, records the outcome back on the router, and on error
//! advances the fallback chain by re-selecting with the failed instance
//! excluded.
//!
//! Grounded on the `Provider` trait contract in
//! `ultrafast-models-sdk::providers` and on the SSE-framing idiom in
//! `ultrafast-models-sdk::providers::anthropic` (inverted here: consuming a
//! provider's [`StreamResult`] instead of parsing one), plus the
//! `async_stream`/`Sse` wiring already used in `handlers::stream_chat_completions`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;

use ultrafast_models_sdk::models::{ChatRequest, ChatResponse};
use ultrafast_models_sdk::providers::Provider;

use crate::gateway_error::GatewayError;
use crate::model_router::{InstanceId, ModelRouter, RouterError};
use crate::usage_queue::{UsageQueue, UsageRecord};

/// Registry mapping a provider name (`ModelInstance::provider`) to its
/// adapter implementation, mirroring `UltrafastClient`'s own provider map.
pub type ProviderRegistry = std::collections::HashMap<String, Arc<dyn Provider>>;

/// Tokens charged against the instance and reported in the usage record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Outcome of a completed (possibly streamed) forward, carrying enough to
/// publish a `UsageRecord`.
pub struct ForwardOutcome {
    pub instance_id: InstanceId,
    pub provider: String,
    pub provider_model: String,
    pub usage: TokenUsage,
    pub latency: Duration,
}

fn estimate_tokens(text: &str) -> u32 {
    // Matches the spec's ceil(chars/4) approximation used when a provider's
    // stream doesn't carry a trailing usage block.
    ((text.chars().count() as f64) / 4.0).ceil() as u32
}

/// Caller identity carried into the streaming body's disconnect guard so a
/// mid-stream drop can still be attributed and accounted for.
#[derive(Clone, Default)]
pub struct StreamIdentity {
    pub request_id: String,
    pub user_id: Option<String>,
    pub api_key: Option<String>,
}

/// Detects a mid-stream client disconnect: the SSE body future is dropped by
/// axum/hyper when the peer goes away before a `[DONE]` frame is yielded.
/// Runs `record_request_end` and enqueues a partial `UsageRecord` so the
/// disconnect is still accounted for instead of vanishing silently.
struct DisconnectGuard {
    router: Arc<ModelRouter>,
    usage_queue: Arc<UsageQueue>,
    instance: InstanceId,
    provider: String,
    model: String,
    identity: StreamIdentity,
    started: Instant,
    tokens: Arc<std::sync::atomic::AtomicU64>,
    completed: std::sync::atomic::AtomicBool,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        use std::sync::atomic::Ordering as AtomicOrdering;

        if self.completed.load(AtomicOrdering::Relaxed) {
            return;
        }

        let err = GatewayError::ClientDisconnect;
        tracing::warn!(instance = ?self.instance, "{err}");

        let router = self.router.clone();
        let usage_queue = self.usage_queue.clone();
        let instance = self.instance;
        let elapsed = self.started.elapsed();
        let tokens = self.tokens.load(AtomicOrdering::Relaxed);
        let provider = self.provider.clone();
        let model = self.model.clone();
        let identity = self.identity.clone();

        tokio::spawn(async move {
            router
                .record_request_end(instance, elapsed, false, false)
                .await;

            let ts = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let record = UsageRecord {
                record_id: String::new(),
                request_id: identity.request_id,
                ts,
                actual_user_id: identity.user_id,
                key_id: identity.api_key,
                key_owner_id: None,
                team_id: None,
                model,
                provider,
                status: "client_disconnect".to_string(),
                input_tokens: 0,
                output_tokens: tokens,
                cost: 0.0,
                latency_ms: elapsed.as_millis() as u64,
                retries: 0,
                processed_at: None,
            };
            if let Err(e) = usage_queue.enqueue_usage(record).await {
                tracing::warn!("failed to enqueue client-disconnect usage record: {e}");
            }
        });
    }
}

pub struct Forwarder {
    router: Arc<ModelRouter>,
    providers: ProviderRegistry,
}

impl Forwarder {
    pub fn new(router: Arc<ModelRouter>, providers: ProviderRegistry) -> Self {
        Self { router, providers }
    }

    fn provider_for(&self, provider_name: &str) -> Result<Arc<dyn Provider>, GatewayError> {
        self.providers
            .get(provider_name)
            .cloned()
            .ok_or_else(|| GatewayError::Config {
                message: format!("no provider adapter registered for '{provider_name}'"),
            })
    }

    /// Non-streaming path: select an instance, substitute its
    /// `provider_model`, call the provider, record the outcome, and on
    /// failure advance the fallback chain until one succeeds or the chain is
    /// exhausted.
    pub async fn forward(
        &self,
        exposed_model: &str,
        request: ChatRequest,
    ) -> Result<(ChatResponse, ForwardOutcome), GatewayError> {
        let mut excluded = HashSet::new();

        loop {
            let (instance, _trace) = self
                .router
                .select_instance_excluding(exposed_model, &excluded)
                .await
                .map_err(map_router_error)?;

            let mut provider_request = request.clone();
            provider_request.model = instance.provider_model.clone();

            let provider = self.provider_for(&instance.provider)?;

            self.router.record_request_start(instance.instance_id);
            let start = Instant::now();
            let result = provider.chat_completion(provider_request).await;
            let latency = start.elapsed();

            match result {
                Ok(response) => {
                    self.router
                        .record_request_end(instance.instance_id, latency, true, false)
                        .await;

                    let usage = response
                        .usage
                        .as_ref()
                        .map(|u| TokenUsage {
                            prompt_tokens: u.prompt_tokens,
                            completion_tokens: u.completion_tokens,
                            total_tokens: u.total_tokens,
                        })
                        .unwrap_or_default();
                    self.router
                        .record_tokens(instance.instance_id, usage.total_tokens as u64);

                    return Ok((
                        response,
                        ForwardOutcome {
                            instance_id: instance.instance_id,
                            provider: instance.provider.clone(),
                            provider_model: instance.provider_model.clone(),
                            usage,
                            latency,
                        },
                    ));
                }
                Err(e) => {
                    let timed_out = matches!(
                        e,
                        ultrafast_models_sdk::error::ProviderError::Timeout
                    );
                    self.router
                        .record_request_end(instance.instance_id, latency, false, timed_out)
                        .await;
                    excluded.insert(instance.instance_id);
                    tracing::warn!(
                        "forward attempt failed on instance {:?} ({}): {e}, trying fallback",
                        instance.instance_id,
                        instance.provider_model
                    );
                    continue;
                }
            }
        }
    }

    /// Streaming path. Forces `stream=true`, writes the SSE preamble
    /// headers, and lazily relays provider chunks as `data: <json>\n\n`
    /// frames with O(1) buffering per chunk. A failure before the first
    /// chunk is framed as an SSE error event rather than surfaced as an
    /// HTTP status, per the external streaming contract: once headers are
    /// sent the response is committed to `200 text/event-stream`.
    pub async fn forward_streaming(
        &self,
        exposed_model: &str,
        mut request: ChatRequest,
        usage_queue: Arc<UsageQueue>,
        identity: StreamIdentity,
    ) -> Result<Response, GatewayError> {
        request.stream = Some(true);

        let mut excluded = HashSet::new();
        let (instance, stream, provider_name, provider_model) = loop {
            let (instance, _trace) = self
                .router
                .select_instance_excluding(exposed_model, &excluded)
                .await
                .map_err(map_router_error)?;

            let mut provider_request = request.clone();
            provider_request.model = instance.provider_model.clone();
            let provider = self.provider_for(&instance.provider)?;

            self.router.record_request_start(instance.instance_id);
            match provider.stream_chat_completion(provider_request).await {
                Ok(stream) => {
                    break (
                        instance.instance_id,
                        stream,
                        instance.provider.clone(),
                        instance.provider_model.clone(),
                    )
                }
                Err(e) => {
                    self.router
                        .record_request_end(instance.instance_id, Duration::ZERO, false, false)
                        .await;
                    excluded.insert(instance.instance_id);
                    tracing::warn!(
                        "stream initiation failed on instance {:?}: {e}, trying fallback",
                        instance.instance_id
                    );
                    continue;
                }
            }
        };

        let router = self.router.clone();
        let tokens_seen = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let guard = DisconnectGuard {
            router: router.clone(),
            usage_queue,
            instance,
            provider: provider_name.clone(),
            model: provider_model.clone(),
            identity,
            started: Instant::now(),
            tokens: tokens_seen.clone(),
            completed: std::sync::atomic::AtomicBool::new(false),
        };

        let body = Body::from_stream(async_stream::stream! {
            let mut stream = stream;
            let mut content = String::new();
            let started = guard.started;

            while let Some(chunk_result) = stream.next().await {
                match chunk_result {
                    Ok(chunk) => {
                        if let Some(choice) = chunk.choices.first() {
                            if let Some(text) = &choice.delta.content {
                                content.push_str(text);
                            }
                        }
                        tokens_seen.store(estimate_tokens(&content) as u64, std::sync::atomic::Ordering::Relaxed);
                        let payload = serde_json::to_string(&chunk).unwrap_or_default();
                        yield Ok::<_, std::io::Error>(axum::body::Bytes::from(
                            format!("data: {payload}\n\n"),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!("mid-stream error on instance {:?}: {e}", instance);
                        let err_payload = serde_json::json!({"error": {"message": e.to_string()}});
                        yield Ok(axum::body::Bytes::from(format!("data: {err_payload}\n\n")));
                        router
                            .record_request_end(instance, started.elapsed(), false, false)
                            .await;
                        guard.completed.store(true, std::sync::atomic::Ordering::Relaxed);
                        return;
                    }
                }
            }

            let tokens = estimate_tokens(&content) as u64;
            router.record_tokens(instance, tokens);
            router
                .record_request_end(instance, started.elapsed(), true, false)
                .await;
            guard.completed.store(true, std::sync::atomic::Ordering::Relaxed);

            yield Ok(axum::body::Bytes::from_static(b"data: [DONE]\n\n"));
        });

        tracing::debug!(provider = %provider_name, provider_model = %provider_model, "streaming forward started");

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .header("x-accel-buffering", "no")
            .body(body)
            .unwrap_or_else(|_| {
                GatewayError::Internal {
                    message: "failed to build streaming response".to_string(),
                }
                .into_response()
            }))
    }
}

fn map_router_error(e: RouterError) -> GatewayError {
    match e {
        RouterError::NoInstance(model) => GatewayError::NoInstance { model },
        RouterError::FallbackCycle { model, via } => GatewayError::Config {
            message: format!("fallback chain for {model} cycles through {via}"),
        },
        RouterError::SelectionTimeout(d) => GatewayError::UpstreamTimeout {
            elapsed_ms: d.as_millis() as u64,
        },
        RouterError::CircuitOpen(model) => GatewayError::CircuitOpen {
            instance_id: model,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ultrafast_models_sdk::circuit_breaker::CircuitBreakerConfig;
    use ultrafast_models_sdk::error::ProviderError;
    use ultrafast_models_sdk::models::{Choice, Message, Role, Usage};
    use ultrafast_models_sdk::providers::StreamResult;

    struct StubProvider {
        name: String,
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &str {
            &self.name
        }
        fn supports_streaming(&self) -> bool {
            false
        }
        fn supports_function_calling(&self) -> bool {
            false
        }
        fn supported_models(&self) -> Vec<String> {
            vec![]
        }

        async fn chat_completion(
            &self,
            request: ChatRequest,
        ) -> Result<ChatResponse, ProviderError> {
            let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && attempt == 0 {
                return Err(ProviderError::ServiceUnavailable);
            }
            Ok(ChatResponse {
                id: "resp-1".to_string(),
                object: "chat.completion".to_string(),
                created: 0,
                model: request.model,
                choices: vec![Choice {
                    index: 0,
                    message: Message {
                        role: Role::Assistant,
                        content: "hi".to_string(),
                        name: None,
                        tool_calls: None,
                        tool_call_id: None,
                    },
                    finish_reason: Some("stop".to_string()),
                    logprobs: None,
                }],
                usage: Some(Usage {
                    prompt_tokens: 3,
                    completion_tokens: 2,
                    total_tokens: 5,
                }),
                system_fingerprint: None,
            })
        }

        async fn stream_chat_completion(
            &self,
            _request: ChatRequest,
        ) -> Result<StreamResult, ProviderError> {
            Err(ProviderError::ServiceUnavailable)
        }
    }

    fn test_request() -> ChatRequest {
        ChatRequest {
            model: "my-gpt-4".to_string(),
            messages: vec![Message {
                role: Role::User,
                content: "hi".to_string(),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn forwards_and_records_usage() {
        let router = Arc::new(ModelRouter::new(Default::default()));
        router.register_instance(crate::model_router::ModelInstanceConfig {
            provider: "stub".to_string(),
            provider_model: "gpt-4".to_string(),
            exposed_model: "my-gpt-4".to_string(),
            weight: 1,
            max_concurrent: 10,
            circuit_breaker: CircuitBreakerConfig::default(),
        });

        let mut providers: ProviderRegistry = Default::default();
        providers.insert(
            "stub".to_string(),
            Arc::new(StubProvider {
                name: "stub".to_string(),
                calls: AtomicUsize::new(0),
                fail_first: false,
            }),
        );

        let forwarder = Forwarder::new(router, providers);
        let (response, outcome) = forwarder.forward("my-gpt-4", test_request()).await.unwrap();

        assert_eq!(response.model, "gpt-4");
        assert_eq!(outcome.usage.total_tokens, 5);
        assert_eq!(outcome.provider_model, "gpt-4");
    }

    #[tokio::test]
    async fn falls_back_after_provider_failure() {
        let router = Arc::new(ModelRouter::new(Default::default()));
        router.register_instance(crate::model_router::ModelInstanceConfig {
            provider: "flaky".to_string(),
            provider_model: "flaky-model".to_string(),
            exposed_model: "primary".to_string(),
            weight: 1,
            max_concurrent: 10,
            circuit_breaker: CircuitBreakerConfig::default(),
        });
        router.register_instance(crate::model_router::ModelInstanceConfig {
            provider: "steady".to_string(),
            provider_model: "steady-model".to_string(),
            exposed_model: "backup".to_string(),
            weight: 1,
            max_concurrent: 10,
            circuit_breaker: CircuitBreakerConfig::default(),
        });
        router
            .set_fallbacks("primary", vec!["backup".to_string()])
            .unwrap();

        let mut providers: ProviderRegistry = Default::default();
        providers.insert(
            "flaky".to_string(),
            Arc::new(StubProvider {
                name: "flaky".to_string(),
                calls: AtomicUsize::new(0),
                fail_first: true,
            }),
        );
        providers.insert(
            "steady".to_string(),
            Arc::new(StubProvider {
                name: "steady".to_string(),
                calls: AtomicUsize::new(0),
                fail_first: false,
            }),
        );

        let forwarder = Forwarder::new(router, providers);
        let mut request = test_request();
        request.model = "primary".to_string();
        let (response, outcome) = forwarder.forward("primary", request).await.unwrap();

        assert_eq!(response.model, "steady-model");
        assert_eq!(outcome.provider, "steady");
    }

    #[tokio::test]
    async fn no_instance_maps_to_no_instance_error() {
        let router = Arc::new(ModelRouter::new(Default::default()));
        let providers: ProviderRegistry = Default::default();
        let forwarder = Forwarder::new(router, providers);

        let result = forwarder.forward("nonexistent", test_request()).await;
        assert!(matches!(result, Err(GatewayError::NoInstance { .. })));
    }
}
