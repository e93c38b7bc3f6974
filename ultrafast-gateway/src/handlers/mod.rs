//! # HTTP Request Handlers Module
//!
//! This module contains all HTTP request handlers for the Ultrafast Gateway API.
//! It provides endpoints for chat completions, embeddings, image generation,
//! audio processing, and administrative functions.
//!
//! ## Overview
//!
//! The handlers module provides:
//! - **Core API Endpoints**: Chat completions, embeddings, image generation
//! - **Streaming Support**: Server-sent events for real-time responses
//! - **Caching Integration**: Automatic response caching and retrieval
//! - **Metrics Collection**: Performance tracking and cost calculation
//! - **Admin Endpoints**: Health checks, metrics, and configuration
//!
//! ## API Endpoints
//!
//! ### Core API Endpoints
//!
//! - `POST /v1/chat/completions` - Chat completion API with streaming support
//! - `POST /v1/embeddings` - Text embedding generation
//! - `POST /v1/images/generations` - Image generation from text prompts
//! - `POST /v1/audio/transcriptions` - Audio transcription
//! - `POST /v1/audio/speech` - Text-to-speech conversion
//! - `GET /v1/models` - Models registered with the Model Router (see
//!   `/admin/provider-catalog` for the static per-provider catalog)
//! - `POST /v1/messages` - Anthropic-compatible messages API
//!
//! ### Admin Endpoints
//!
//! - `GET /health` - Service health check
//! - `GET /metrics` - Performance metrics in JSON format
//! - `GET /metrics/prometheus` - Prometheus-compatible metrics
//! - `GET /admin/providers` - Provider status and health
//! - `GET /admin/config` - Current configuration status
//! - `GET /admin/circuit-breaker` - Circuit breaker metrics
//!
//! ## Request Flow
//!
//! Each request follows this general flow:
//!
//! 1. **Authentication**: Validate API key or JWT token
//! 2. **Rate Limiting**: Check user and provider rate limits
//! 3. **Caching**: Check for cached responses
//! 4. **Provider Selection**: Route to appropriate provider
//! 5. **Request Processing**: Execute the request
//! 6. **Response Caching**: Cache successful responses
//! 7. **Metrics Collection**: Track performance and costs
//!
//! ## Streaming Support
//!
//! The gateway supports streaming responses for chat completions:
//!
//! - **Server-Sent Events**: Real-time token streaming
//! - **Chunked Responses**: Progressive response delivery
//! - **Error Handling**: Graceful error propagation
//! - **Backpressure**: Automatic flow control
//!
//! ## Caching Strategy
//!
//! Responses are cached based on:
//!
//! - **Request Hash**: Unique cache keys for each request
//! - **TTL Calculation**: Dynamic TTL based on response time
//! - **Cache Invalidation**: Automatic expiration and cleanup
//! - **Cache Miss Handling**: Fallback to provider requests
//!
//! ## Cost Tracking
//!
//! The gateway tracks costs for each provider:
//!
//! - **Token Counting**: Input and output token tracking
//! - **Provider Pricing**: Per-provider cost calculation
//! - **Cost Aggregation**: Total cost tracking
//! - **Cost Reporting**: Cost metrics in responses
//!
//! ## Error Handling
//!
//! All handlers include comprehensive error handling:
//!
//! - **Validation Errors**: Request validation and sanitization
//! - **Provider Errors**: Graceful provider error handling
//! - **Rate Limit Errors**: Proper rate limit responses
//! - **Cache Errors**: Fallback on cache failures
//! - **Network Errors**: Retry logic and timeouts
//!
//! ## Performance Optimization
//!
//! The handlers include several performance optimizations:
//!
//! - **JSON Optimization**: Request payload optimization
//! - **Response Streaming**: Efficient streaming responses
//! - **Connection Pooling**: Reusable HTTP connections
//! - **Memory Management**: Efficient memory usage
//! - **Concurrent Processing**: Async request handling

use crate::budget_cache::EntityType;
use crate::forwarder::{ForwardOutcome, TokenUsage};
use crate::gateway_error::GatewayError;
use crate::guardrails::GuardrailMode;
use crate::request_context::RequestContext;
use crate::server::AppState;
use crate::usage_queue::UsageRecord;
use axum::response::sse::{Event, Sse};
use axum::{
    body::Body,
    extract::{Extension, State},
    http::{Response, StatusCode},
    response::Json,
};
use futures::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_stream::wrappers::ReceiverStream;
use ultrafast_models_sdk::error::ProviderError;
use ultrafast_models_sdk::models::{
    AudioRequest, AudioResponse, ChatRequest, EmbeddingRequest, EmbeddingResponse, ImageRequest,
    ImageResponse, SpeechRequest, SpeechResponse,
};

/// Rough per-1K/1M-token pricing used to cost a completed [`ForwardOutcome`].
/// Mirrors the per-provider table the gateway already quotes to callers.
fn estimate_cost(provider: &str, usage: &TokenUsage) -> f64 {
    let input = usage.prompt_tokens as f64;
    let output = usage.completion_tokens as f64;
    match provider {
        "anthropic" => (input / 1000.0) * 0.015 + (output / 1000.0) * 0.075,
        "openai" => (input / 1000.0) * 0.03 + (output / 1000.0) * 0.06,
        "google-vertex-ai" => (input / 1000.0) * 0.0005 + (output / 1000.0) * 0.0015,
        "gemini" => (input / 1_000_000.0) * 0.0035 + (output / 1_000_000.0) * 0.0105,
        _ => 0.0,
    }
}

/// Checks the caller's cached budget before forwarding. A cache miss is
/// treated as fail-open: the Budget Cache is only authoritative within its
/// TTL, the database is authoritative across expiry, so an absent entry
/// means "not yet known to be over budget" rather than "blocked".
async fn enforce_budget(state: &AppState, ctx: Option<&RequestContext>) -> Result<(), GatewayError> {
    let Some(user_id) = ctx.and_then(|c| c.user_id.as_ref()) else {
        return Ok(());
    };

    match state
        .budget_cache
        .check_budget_available(EntityType::User, user_id, 0.0)
        .await
    {
        Ok(true) => Ok(()),
        Ok(false) => Err(GatewayError::BudgetExceeded {
            message: format!("budget exceeded for user {user_id}"),
        }),
        Err(_) => Ok(()),
    }
}

/// Runs the registered `pre_call`/`post_call` guardrails, mapping a block or
/// fail-closed error into a `ContentFiltered` response.
async fn run_guardrail_phase(
    state: &AppState,
    phase: GuardrailMode,
    input: Value,
) -> Result<Value, GatewayError> {
    state
        .guardrail_executor
        .run_phase(phase, input)
        .await
        .map_err(|rejection| GatewayError::ContentFiltered {
            message: format!("{}: {}", rejection.guardrail_name, rejection.reason),
        })
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Builds and enqueues the `UsageRecord` for a completed forward, attributing
/// it to the caller's identity when `RequestContext` is available.
async fn record_usage(
    state: &AppState,
    ctx: Option<&RequestContext>,
    model: &str,
    status: &str,
    outcome: &ForwardOutcome,
) {
    let cost = estimate_cost(&outcome.provider, &outcome.usage);
    let record = UsageRecord {
        record_id: String::new(),
        request_id: ctx
            .map(|c| c.request_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        ts: now_unix_secs(),
        actual_user_id: ctx.and_then(|c| c.user_id.clone()),
        key_id: ctx.and_then(|c| c.api_key.clone()),
        key_owner_id: None,
        team_id: None,
        model: model.to_string(),
        provider: outcome.provider.clone(),
        status: status.to_string(),
        input_tokens: outcome.usage.prompt_tokens as u64,
        output_tokens: outcome.usage.completion_tokens as u64,
        cost,
        latency_ms: outcome.latency.as_millis() as u64,
        retries: 0,
        processed_at: None,
    };

    if let Err(e) = state.usage_queue.enqueue_usage(record).await {
        tracing::warn!("failed to enqueue usage record: {e}");
    }
}

/// Handle chat completion requests with caching and streaming support.
///
/// This endpoint processes chat completion requests, supports both streaming
/// and non-streaming responses, and includes automatic caching and cost tracking.
///
/// # Arguments
///
/// * `state` - Application state containing client and cache manager
/// * `request` - Chat completion request with messages and parameters
///
/// # Returns
///
/// Returns a JSON response with the completion or a streaming response.
///
/// # Errors
///
/// Returns a GatewayError if:
/// - Request validation fails
/// - Provider selection fails
/// - Cache operations fail
/// - Provider request fails
///
/// # Example
///
/// ```bash
/// curl -X POST http://localhost:3000/v1/chat/completions \
///   -H "Content-Type: application/json" \
///   -H "Authorization: Bearer sk-..." \
///   -d '{
///     "model": "gpt-4",
///     "messages": [{"role": "user", "content": "Hello!"}],
///     "stream": false
///   }'
/// ```
pub async fn chat_completions(
    State(state): State<AppState>,
    ctx: Option<Extension<RequestContext>>,
    Json(request): Json<ChatRequest>,
) -> Result<Response<Body>, GatewayError> {
    let ctx = ctx.map(|Extension(c)| c);

    // Check if this is a streaming request
    if request.stream.unwrap_or(false) {
        // Handle streaming requests with SSE
        return handle_streaming_chat_completions(State(state), ctx.map(Extension), Json(request))
            .await;
    }

    // Phase 4: Optimize request payload (request-side only); keep responses intact for compatibility
    let request_json = serde_json::to_value(&request)?;
    let optimized_request_json =
        crate::json_optimization::JsonOptimizer::optimize_request_payload(&request_json);
    let optimized_request: ChatRequest = serde_json::from_value(optimized_request_json)?;

    // Check cache first
    let cache_key = if !optimized_request.stream.unwrap_or(false) {
        Some(ultrafast_models_sdk::cache::CacheKeyBuilder::build_chat_key(&optimized_request))
    } else {
        None
    };

    if let Some(cache_key) = &cache_key {
        if let Some(cached_response) = state.cache_manager.get(cache_key).await {
            tracing::debug!("Cache hit for chat completion");
            return Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(&cached_response)?))
                .unwrap());
        }
    }

    enforce_budget(&state, ctx.as_ref()).await?;

    let pre_call_input = serde_json::to_value(&optimized_request)?;
    run_guardrail_phase(&state, GuardrailMode::PreCall, pre_call_input).await?;

    // Route to appropriate provider through the model router / forwarder pipeline
    let (response, outcome) = match state
        .forwarder
        .forward(&optimized_request.model, optimized_request.clone())
        .await
    {
        Ok(pair) => pair,
        Err(e) => {
            crate::metrics::record_request(
                crate::metrics::RequestMetricsBuilder::new(
                    "POST".to_string(),
                    "/v1/chat/completions".to_string(),
                    500,
                    Duration::default(),
                )
                .model(optimized_request.model.clone())
                .user_id(optimized_request.user.clone().unwrap_or_default())
                .build(),
            )
            .await;
            return Err(e);
        }
    };

    let response_value = serde_json::to_value(&response)?;
    let response_value =
        run_guardrail_phase(&state, GuardrailMode::PostCall, response_value).await?;
    let response: ultrafast_models_sdk::models::ChatResponse =
        serde_json::from_value(response_value)?;

    record_usage(&state, ctx.as_ref(), &optimized_request.model, "success", &outcome).await;

    // Update metrics with real data
    crate::metrics::record_request(
        crate::metrics::RequestMetricsBuilder::new(
            "POST".to_string(),
            "/v1/chat/completions".to_string(),
            200,
            outcome.latency,
        )
        .provider(outcome.provider.clone())
        .model(optimized_request.model.clone())
        .input_tokens(outcome.usage.prompt_tokens)
        .output_tokens(outcome.usage.completion_tokens)
        .cost_usd(estimate_cost(&outcome.provider, &outcome.usage))
        .user_id(optimized_request.user.clone().unwrap_or_default())
        .build(),
    )
    .await;

    // Cache successful response
    if let Some(cache_key) = &cache_key {
        let ttl = determine_cache_ttl(&optimized_request, outcome.latency);
        state
            .cache_manager
            .set(cache_key, serde_json::to_value(&response)?, Some(ttl))
            .await;
    }

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&response)?))
        .unwrap())
}

async fn handle_streaming_chat_completions(
    State(state): State<AppState>,
    ctx: Option<Extension<RequestContext>>,
    Json(request): Json<ChatRequest>,
) -> Result<Response<Body>, GatewayError> {
    let ctx = ctx.map(|Extension(c)| c);

    // Phase 4: Optimize request payload
    let request_json = serde_json::to_value(&request)?;
    let optimized_request_json =
        crate::json_optimization::JsonOptimizer::optimize_request_payload(&request_json);
    let optimized_request: ChatRequest = serde_json::from_value(optimized_request_json)?;

    enforce_budget(&state, ctx.as_ref()).await?;

    let pre_call_input = serde_json::to_value(&optimized_request)?;
    run_guardrail_phase(&state, GuardrailMode::PreCall, pre_call_input).await?;

    let identity = crate::forwarder::StreamIdentity {
        request_id: ctx
            .as_ref()
            .map(|c| c.request_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        user_id: ctx.as_ref().and_then(|c| c.user_id.clone()),
        api_key: ctx.as_ref().and_then(|c| c.api_key.clone()),
    };

    // Route through the Model Router / Forwarder pipeline instead of the raw client
    state
        .forwarder
        .forward_streaming(
            &optimized_request.model,
            optimized_request,
            state.usage_queue.clone(),
            identity,
        )
        .await
}

pub async fn stream_chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, GatewayError> {
    // Phase 4: Optimize request payload
    let request_json = serde_json::to_value(&request)?;
    let optimized_request_json =
        crate::json_optimization::JsonOptimizer::optimize_request_payload(&request_json);
    let optimized_request: ChatRequest = serde_json::from_value(optimized_request_json)?;

    // Route to appropriate provider using the client
    let start_time = std::time::Instant::now();
    let stream_result = state
        .client
        .stream_chat_completion(optimized_request.clone())
        .await;
    let latency = start_time.elapsed();

    match stream_result {
        Ok(stream) => {
            // Create a channel for streaming events
            let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(100);

            // Spawn a task to handle the stream
            let mut stream = stream;
            tokio::spawn(async move {
                let mut total_tokens = 0;
                let mut content = String::new();

                while let Some(chunk_result) = stream.next().await {
                    match chunk_result {
                        Ok(chunk) => {
                            // Convert StreamChunk to SSE Event
                            let event_data = serde_json::to_string(&chunk).unwrap_or_default();
                            let event = Event::default().data(event_data);

                            // Track content for metrics
                            if let Some(choice) = chunk.choices.first() {
                                if let Some(text) = &choice.delta.content {
                                    content.push_str(text);
                                }
                            }

                            // Track tokens (StreamChunk doesn't have usage field)
                            // We'll track content length instead
                            total_tokens = content.len() as u32;

                            if (tx.send(Ok(event)).await).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::error!("Stream error: {}", e);
                            let error_event =
                                Event::default().data(format!("{{\"error\": \"{e}\"}}"));
                            let _ = tx.send(Ok(error_event)).await;
                            break;
                        }
                    }
                }

                // Send final event
                let final_event = Event::default().data("[DONE]");
                let _ = tx.send(Ok(final_event)).await;

                // Update metrics
                let provider = state.client.get_last_used_provider().await;
                crate::metrics::record_request(
                    crate::metrics::RequestMetricsBuilder::new(
                        "POST".to_string(),
                        "/v1/chat/completions".to_string(),
                        200,
                        latency,
                    )
                    .provider(provider.unwrap_or_default())
                    .model(optimized_request.model.clone())
                    .input_tokens(total_tokens)
                    .output_tokens(total_tokens)
                    .cost_usd(0.0) // Cost calculation would be done differently for streaming
                    .user_id(optimized_request.user.clone().unwrap_or_default())
                    .build(),
                )
                .await;
            });

            Ok(Sse::new(ReceiverStream::new(rx)))
        }
        Err(e) => {
            tracing::error!("Stream initialization error: {}", e);
            Err(GatewayError::Provider(
                ultrafast_models_sdk::error::ProviderError::ServiceUnavailable,
            ))
        }
    }
}

pub async fn completions(
    State(state): State<AppState>,
    ctx: Option<Extension<RequestContext>>,
    Json(request): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let ctx = ctx.map(|Extension(c)| c);

    // Convert legacy completions format to chat completions format
    let chat_request = convert_legacy_completion_to_chat(request)?;
    let exposed_model = chat_request.model.clone();

    enforce_budget(&state, ctx.as_ref()).await?;

    let pre_call_input = serde_json::to_value(&chat_request)?;
    run_guardrail_phase(&state, GuardrailMode::PreCall, pre_call_input).await?;

    // Route through the Model Router / Forwarder pipeline instead of the raw client
    let (response, outcome) = state.forwarder.forward(&exposed_model, chat_request).await?;

    let response_value = serde_json::to_value(&response)?;
    let response_value =
        run_guardrail_phase(&state, GuardrailMode::PostCall, response_value).await?;
    let response: ultrafast_models_sdk::models::ChatResponse =
        serde_json::from_value(response_value)?;

    record_usage(&state, ctx.as_ref(), &exposed_model, "success", &outcome).await;

    // Convert chat response back to legacy completions format
    let legacy_response = convert_chat_to_legacy_completion(response)?;

    Ok(Json(legacy_response))
}

pub async fn embeddings(
    State(state): State<AppState>,
    Json(request): Json<EmbeddingRequest>,
) -> Result<Json<EmbeddingResponse>, GatewayError> {
    // Route to appropriate provider using the client
    let start_time = std::time::Instant::now();
    let result = state.client.embedding(request).await;
    let latency = start_time.elapsed();

    // Record metrics
    crate::metrics::record_request(
        crate::metrics::RequestMetricsBuilder::new(
            "POST".to_string(),
            "/v1/embeddings".to_string(),
            200,
            latency,
        )
        .provider(
            state
                .client
                .get_last_used_provider()
                .await
                .unwrap_or_default(),
        )
        .build(),
    )
    .await;

    match result {
        Ok(response) => Ok(Json(response)),
        Err(e) => Err(GatewayError::Provider(ProviderError::Configuration {
            message: format!("Embedding request failed: {e}"),
        })),
    }
}

pub async fn image_generations(
    State(state): State<AppState>,
    Json(request): Json<ImageRequest>,
) -> Result<Json<ImageResponse>, GatewayError> {
    // Route to appropriate provider using the client
    let start_time = std::time::Instant::now();
    let result = state.client.image_generation(request).await;
    let latency = start_time.elapsed();

    // Record metrics
    crate::metrics::record_request(
        crate::metrics::RequestMetricsBuilder::new(
            "POST".to_string(),
            "/v1/images/generations".to_string(),
            200,
            latency,
        )
        .provider(
            state
                .client
                .get_last_used_provider()
                .await
                .unwrap_or_default(),
        )
        .build(),
    )
    .await;

    match result {
        Ok(response) => Ok(Json(response)),
        Err(e) => Err(GatewayError::Provider(ProviderError::Configuration {
            message: format!("Image generation request failed: {e}"),
        })),
    }
}

pub async fn audio_transcriptions(
    State(state): State<AppState>,
    Json(request): Json<AudioRequest>,
) -> Result<Json<AudioResponse>, GatewayError> {
    // Route to appropriate provider using the client
    let start_time = std::time::Instant::now();
    let result = state.client.audio_transcription(request).await;
    let latency = start_time.elapsed();

    // Record metrics
    crate::metrics::record_request(
        crate::metrics::RequestMetricsBuilder::new(
            "POST".to_string(),
            "/v1/audio/transcriptions".to_string(),
            200,
            latency,
        )
        .provider(
            state
                .client
                .get_last_used_provider()
                .await
                .unwrap_or_default(),
        )
        .build(),
    )
    .await;

    match result {
        Ok(response) => Ok(Json(response)),
        Err(e) => Err(GatewayError::Provider(ProviderError::Configuration {
            message: format!("Audio transcription request failed: {e}"),
        })),
    }
}

pub async fn text_to_speech(
    State(state): State<AppState>,
    Json(request): Json<SpeechRequest>,
) -> Result<Json<SpeechResponse>, GatewayError> {
    // Route to appropriate provider using the client
    let start_time = std::time::Instant::now();
    let result = state.client.text_to_speech(request).await;
    let latency = start_time.elapsed();

    // Record metrics
    crate::metrics::record_request(
        crate::metrics::RequestMetricsBuilder::new(
            "POST".to_string(),
            "/v1/audio/speech".to_string(),
            200,
            latency,
        )
        .provider(
            state
                .client
                .get_last_used_provider()
                .await
                .unwrap_or_default(),
        )
        .build(),
    )
    .await;

    match result {
        Ok(response) => Ok(Json(response)),
        Err(e) => Err(GatewayError::Provider(ProviderError::Configuration {
            message: format!("Text-to-speech request failed: {e}"),
        })),
    }
}

pub async fn list_models(State(state): State<AppState>) -> Result<Json<Value>, GatewayError> {
    let mut all_models = Vec::new();

    // Get models from all configured providers
    for (provider_name, provider_config) in &state.config.providers {
        if provider_config.enabled {
            // Create a list of supported models for each provider
            let models = match provider_name.as_str() {
                "openai" => vec![
                    "gpt-4",
                    "gpt-4-turbo",
                    "gpt-4-turbo-preview",
                    "gpt-3.5-turbo",
                    "gpt-3.5-turbo-16k",
                    "text-embedding-ada-002",
                    "text-embedding-3-small",
                    "text-embedding-3-large",
                    "dall-e-2",
                    "dall-e-3",
                    "whisper-1",
                    "tts-1",
                    "tts-1-hd",
                ],
                "anthropic" => vec![
                    "claude-opus-4-20250514",
                    "claude-sonnet-4-20250514",
                    "claude-3-7-sonnet-20250219",
                    "claude-3-5-sonnet-20241022",
                    "claude-3-5-haiku-20241022",
                    "claude-3-5-sonnet-20240620",
                    "claude-3-haiku-20240307",
                    "claude-3",
                    "claude",
                ],
                "azure-openai" => vec![
                    "gpt-4",
                    "gpt-4-turbo",
                    "gpt-35-turbo",
                    "text-embedding-ada-002",
                    "dall-e-3",
                ],
                "google-vertex-ai" => vec![
                    "chat-bison",
                    "text-bison",
                    "gemini-pro",
                    "textembedding-gecko",
                ],
                "gemini" => vec![
                    "gemini-1.5-pro",
                    "gemini-1.5-pro-latest",
                    "gemini-1.5-flash",
                    "gemini-1.5-flash-latest",
                    "gemini-1.0-pro",
                    "gemini-1.0-pro-vision",
                    "text-embedding-004",
                ],
                _ => vec![],
            };

            for model in models {
                all_models.push(json!({
                    "id": model,
                    "object": "model",
                    "created": 1677610602,
                    "owned_by": provider_name,
                    "provider": provider_name
                }));
            }
        }
    }

    let response = json!({
        "object": "list",
        "data": all_models
    });

    Ok(Json(response))
}

pub async fn health_check() -> Result<Json<Value>, GatewayError> {
    let response = json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    });

    Ok(Json(response))
}

pub async fn metrics(State(state): State<AppState>) -> Result<Json<Value>, GatewayError> {
    let metrics = crate::metrics::get_aggregated_metrics().await;

    // Convert metrics to JSON for easier manipulation
    let mut provider_stats = serde_json::to_value(&metrics.provider_stats)?;
    let model_stats = serde_json::to_value(&metrics.model_stats)?;

    // If there are no provider stats from metrics (no requests made yet),
    // include configured providers from the config
    if provider_stats.as_object().unwrap().is_empty() {
        let configured_providers: serde_json::Map<String, serde_json::Value> = state
            .config
            .providers
            .iter()
            .map(|(name, config)| {
                (
                    name.clone(),
                    json!({
                        "requests": 0,
                        "successful_requests": 0,
                        "failed_requests": 0,
                        "average_latency_ms": 0.0,
                        "p95_latency_ms": 0.0,
                        "total_cost_usd": 0.0,
                        "uptime_percentage": 100.0,
                        "error_rate": 0.0,
                        "last_request": null,
                        "enabled": config.enabled,
                        "base_url": config.base_url,
                        "timeout": config.timeout.as_secs()
                    }),
                )
            })
            .collect();
        provider_stats = serde_json::Value::Object(configured_providers);
    }

    let metrics_payload = json!({
        "total_requests": metrics.total_requests,
        "average_latency_ms": metrics.average_latency_ms,
        "error_rate": metrics.error_rate,
        "requests_per_minute": metrics.requests_per_minute,
        "active_connections": metrics.active_connections,
        "total_cost_usd": metrics.total_cost_usd,
        "total_tokens": metrics.total_tokens,
        "uptime_seconds": metrics.uptime_seconds,
        "provider_stats": provider_stats,
        "model_stats": model_stats,
        "error_stats": {
            "error_types": metrics.error_stats.error_types,
            "total_errors": metrics.error_stats.total_errors,
            "error_rate": metrics.error_stats.error_rate,
            "most_common_error": metrics.error_stats.most_common_error
        },
        "cache_stats": metrics.cache_stats,
        "p50_latency_ms": metrics.p50_latency_ms,
        "p90_latency_ms": metrics.p90_latency_ms,
        "p95_latency_ms": metrics.p95_latency_ms,
        "p99_latency_ms": metrics.p99_latency_ms,
        "successful_requests": metrics.successful_requests,
        "failed_requests": metrics.failed_requests
    });

    Ok(Json(metrics_payload))
}

pub async fn prometheus_metrics(
    State(_state): State<AppState>,
) -> Result<Response<Body>, GatewayError> {
    let prometheus_metrics = crate::metrics::get_prometheus_metrics().await;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Body::from(prometheus_metrics))
        .unwrap())
}

pub async fn list_providers(State(state): State<AppState>) -> Result<Json<Value>, GatewayError> {
    let providers: Vec<Value> = state
        .config
        .providers
        .iter()
        .map(|(name, config)| {
            json!({
                "name": name,
                "enabled": config.enabled,
                "base_url": config.base_url,
                "timeout": config.timeout.as_secs(),
                "models": Vec::<String>::new() // Could be populated with actual supported models
            })
        })
        .collect();

    Ok(Json(json!({
        "providers": providers
    })))
}

pub async fn get_config(State(state): State<AppState>) -> Result<Json<Value>, GatewayError> {
    // Return a sanitized version of the config (without sensitive data)
    let sanitized_config = json!({
        "server": {
            "host": state.config.server.host,
            "port": state.config.server.port,
            "timeout": state.config.server.timeout.as_secs()
        },
        "providers": state.config.providers.keys().collect::<Vec<_>>(),
        "routing": {
            "strategy": state.config.routing.strategy,
            "health_check_interval": state.config.routing.health_check_interval.as_secs()
        },
        "cache": {
            "enabled": state.config.cache.enabled,
            "backend": state.config.cache.backend
        },
        "metrics": {
            "enabled": state.config.metrics.enabled
        }
    });

    Ok(Json(sanitized_config))
}

pub async fn get_circuit_breaker_metrics(
    State(state): State<AppState>,
) -> Result<Json<Value>, GatewayError> {
    let cb_metrics = state.client.get_circuit_breaker_metrics().await;
    let health_status = state.client.get_provider_health_status().await;

    let mut metrics_data = json!({});

    for (provider_id, metrics) in cb_metrics {
        let health = health_status.get(&provider_id).unwrap_or(&true);
        metrics_data[provider_id] = json!({
            "state": format!("{:?}", metrics.state),
            "failure_count": metrics.failure_count,
            "success_count": metrics.success_count,
            "last_failure_time": metrics.last_failure_time.map(|t| t.elapsed().as_secs()),
            "last_success_time": metrics.last_success_time.map(|t| t.elapsed().as_secs()),
            "is_healthy": health
        });
    }

    Ok(Json(metrics_data))
}

// Helper functions
#[allow(dead_code)]
fn estimate_tokens(request: &ChatRequest) -> u32 {
    let mut total_tokens = 0;

    for message in &request.messages {
        // Rough estimation: 1 token ≈ 4 characters
        total_tokens += message.content.len() as u32 / 4;
    }

    // Add buffer for system messages and formatting
    total_tokens += 50;

    total_tokens
}

fn determine_cache_ttl(request: &ChatRequest, latency: std::time::Duration) -> std::time::Duration {
    // Dynamic TTL based on request characteristics and performance
    let base_ttl = std::time::Duration::from_secs(3600); // 1 hour base

    // Adjust based on latency (faster responses get longer cache)
    let latency_factor = if latency < std::time::Duration::from_millis(100) {
        2.0
    } else if latency < std::time::Duration::from_millis(500) {
        1.5
    } else {
        1.0
    };

    // Adjust based on model (more expensive models get longer cache)
    let model_factor = if request.model.contains("gpt-4") || request.model.contains("claude-3") {
        1.5
    } else {
        1.0
    };

    // Adjust based on temperature (lower temperature = more deterministic = longer cache)
    let temp_factor = if let Some(temp) = request.temperature {
        if temp < 0.3 {
            1.5
        } else if temp < 0.7 {
            1.0
        } else {
            0.5
        }
    } else {
        1.0
    };

    let adjusted_ttl = base_ttl.mul_f64(latency_factor * model_factor * temp_factor);

    // Clamp between 5 minutes and 24 hours
    std::cmp::min(
        std::cmp::max(adjusted_ttl, std::time::Duration::from_secs(300)),
        std::time::Duration::from_secs(86400),
    )
}

// Helper functions for legacy completions conversion
fn convert_legacy_completion_to_chat(request: Value) -> Result<ChatRequest, GatewayError> {
    let model = request
        .get("model")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GatewayError::InvalidRequest {
            message: "Model is required".to_string(),
        })?;

    let prompt = request
        .get("prompt")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GatewayError::InvalidRequest {
            message: "Prompt is required".to_string(),
        })?;

    let max_tokens = request
        .get("max_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(1000) as u32;

    let temperature = request
        .get("temperature")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.7);

    let messages = vec![ultrafast_models_sdk::models::Message::user(prompt)];

    Ok(ChatRequest {
        model: model.to_string(),
        messages,
        max_tokens: Some(max_tokens),
        temperature: Some(temperature as f32),
        top_p: request
            .get("top_p")
            .and_then(|v| v.as_f64())
            .map(|v| v as f32),
        frequency_penalty: request
            .get("frequency_penalty")
            .and_then(|v| v.as_f64())
            .map(|v| v as f32),
        presence_penalty: request
            .get("presence_penalty")
            .and_then(|v| v.as_f64())
            .map(|v| v as f32),
        stop: request.get("stop").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        }),
        user: request
            .get("user")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        stream: Some(false),
        tools: None,
        tool_choice: None,
    })
}

/// Anthropic-compatible `POST /v1/messages`, served by translating to/from
/// the internal OpenAI-style request and routing it through the Model
/// Router / Forwarder pipeline rather than `state.client`.
pub async fn anthropic_messages(
    State(state): State<AppState>,
    ctx: Option<Extension<RequestContext>>,
    Json(request): Json<crate::anthropic_translation::AnthropicMessagesRequest>,
) -> Result<Response<Body>, GatewayError> {
    let ctx = ctx.map(|Extension(c)| c);
    let streaming = request.stream.unwrap_or(false);
    let chat_request = crate::anthropic_translation::anthropic_to_openai(request);
    let exposed_model = chat_request.model.clone();

    enforce_budget(&state, ctx.as_ref()).await?;

    let pre_call_input = serde_json::to_value(&chat_request)?;
    run_guardrail_phase(&state, GuardrailMode::PreCall, pre_call_input).await?;

    if streaming {
        let identity = crate::forwarder::StreamIdentity {
            request_id: ctx
                .as_ref()
                .map(|c| c.request_id.clone())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            user_id: ctx.as_ref().and_then(|c| c.user_id.clone()),
            api_key: ctx.as_ref().and_then(|c| c.api_key.clone()),
        };
        return state
            .forwarder
            .forward_streaming(
                &exposed_model,
                chat_request,
                state.usage_queue.clone(),
                identity,
            )
            .await;
    }

    let (response, outcome) = state.forwarder.forward(&exposed_model, chat_request).await?;

    let response_value = serde_json::to_value(&response)?;
    let response_value =
        run_guardrail_phase(&state, GuardrailMode::PostCall, response_value).await?;
    let response: ultrafast_models_sdk::models::ChatResponse =
        serde_json::from_value(response_value)?;

    record_usage(&state, ctx.as_ref(), &exposed_model, "success", &outcome).await;

    let anthropic_response = crate::anthropic_translation::openai_to_anthropic(response);

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&anthropic_response)?))
        .unwrap())
}

/// Router-backed `GET /v1/models`, listing the exposed models currently
/// registered with the Model Router — distinct from [`list_models`], which
/// enumerates each provider's static model catalog.
pub async fn router_models(State(state): State<AppState>) -> Json<Value> {
    let exposed_models: Vec<String> = state.model_router.get_stats().into_keys().collect();
    let response = crate::anthropic_translation::models_list_response(exposed_models);
    Json(serde_json::to_value(response).unwrap_or_else(|_| json!({"object": "list", "data": []})))
}

fn convert_chat_to_legacy_completion(
    response: ultrafast_models_sdk::models::ChatResponse,
) -> Result<Value, GatewayError> {
    let choice = response.choices.first().ok_or_else(|| {
        GatewayError::Provider(ProviderError::Configuration {
            message: "No choices in response".to_string(),
        })
    })?;

    let text = choice.message.content.clone();

    Ok(json!({
        "id": response.id,
        "object": "text_completion",
        "created": response.created,
        "model": response.model,
        "choices": [{
            "text": text,
            "index": choice.index,
            "logprobs": choice.logprobs,
            "finish_reason": choice.finish_reason
        }],
        "usage": response.usage
    }))
}
