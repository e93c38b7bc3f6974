//! # HTTP Server Module
//!
//! This module provides the HTTP server setup and configuration for the Ultrafast Gateway.
//! It handles server initialization, middleware setup, routing, and application state management.
//!
//! ## Overview
//!
//! The server module is responsible for:
//! - **Server Initialization**: Setting up the HTTP server with Axum
//! - **Middleware Configuration**: Authentication, CORS, logging, metrics, and plugins
//! - **Route Registration**: API endpoints for chat, embeddings, and admin functions
//! - **Application State**: Shared state across all handlers
//! - **Plugin Integration**: Dynamic plugin loading and management
//!
//! ## Architecture
//!
//! The server uses Axum as the web framework with the following layers:
//!
//! 1. **Timeout Layer**: Request timeout handling
//! 2. **CORS Middleware**: Cross-origin resource sharing
//! 3. **Logging Middleware**: Request/response logging
//! 4. **Metrics Middleware**: Performance monitoring
//! 5. **Authentication Middleware**: API key and JWT validation
//! 6. **Input Validation Middleware**: Request validation and sanitization
//! 7. **Plugin Middleware**: Dynamic request/response modification
//!
//! ## API Endpoints
//!
//! ### Core API Endpoints
//!
//! - `POST /v1/chat/completions` - Chat completion API
//! - `POST /v1/embeddings` - Text embedding API
//! - `POST /v1/images/generations` - Image generation API
//! - `POST /v1/messages` - Anthropic-compatible messages API, routed through
//!   the Model Router / Forwarder pipeline
//! - `GET /v1/models` - Models currently registered with the Model Router
//!   (the static per-provider catalog moved to `/admin/provider-catalog`)
//!
//! ### Admin Endpoints
//!
//! - `GET /health` - Health check endpoint
//! - `GET /metrics` - Performance metrics
//! - `GET /admin/providers` - Provider status
//! - `GET /admin/config` - Configuration status
//!
//! ## Usage
//!
//! ```rust
//! use ultrafast_gateway::server::create_server;
//! use ultrafast_gateway::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml")?;
//!     let app = create_server(config).await?;
//!     
//!     // The server is ready to handle requests
//!     Ok(())
//! }
//! ```
//!
//! ## Middleware Stack
//!
//! The server applies middleware in the following order:
//!
//! 1. **Timeout**: Ensures requests don't hang indefinitely
//! 2. **CORS**: Handles cross-origin requests
//! 3. **Logging**: Records request/response details
//! 4. **Metrics**: Tracks performance metrics
//! 5. **Authentication**: Validates API keys and JWT tokens
//! 6. **Input Validation**: Validates and sanitizes requests
//! 7. **Plugin Processing**: Applies dynamic plugins
//!
//! ## Application State
//!
//! The `AppState` struct contains shared state accessible to all handlers:
//!
//! - **Configuration**: Server and provider configuration
//! - **Client**: Ultrafast SDK client for provider communication
//! - **Plugin Manager**: Dynamic plugin management
//! - **Cache Manager**: Redis and in-memory caching
//!
//! ## Error Handling
//!
//! The server includes comprehensive error handling:
//!
//! - **Timeout Errors**: Automatic request cancellation
//! - **Authentication Errors**: Proper HTTP status codes
//! - **Validation Errors**: Detailed error messages
//! - **Provider Errors**: Graceful fallback handling
//! - **Plugin Errors**: Non-blocking plugin failures

use crate::budget_cache::BudgetCache;
use crate::config::Config;
use crate::distributed_lock::DistributedLockManager;
use crate::forwarder::{Forwarder, ProviderRegistry};
use crate::gateway_caching::CacheManager;
use crate::guardrails::GuardrailExecutor;
use crate::handlers;
use crate::latency_tracker::{LatencyTracker, LatencyTrackerConfig};
use crate::middleware::{
    auth_middleware, cors_middleware, logging_middleware, metrics_middleware, plugin_middleware,
};
use crate::model_router::{ModelInstanceConfig, ModelRouter, RoutingWeights};
use crate::plugins::{create_plugin, PluginManager};
use crate::usage_queue::{BatchProcessor, InMemoryUsagePersistence, UsageQueue};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use ultrafast_models_sdk::providers::create_provider_with_circuit_breaker;
use ultrafast_models_sdk::UltrafastClient;

/// Application state shared across all HTTP handlers.
///
/// Contains all the necessary components for handling requests:
/// configuration, client, plugins, caching, routing, and usage accounting.
///
/// # Thread Safety
///
/// All fields are wrapped in `Arc` for thread-safe sharing across
/// multiple request handlers.
///
/// # Example
///
/// ```rust,ignore
/// let app_state = AppState {
///     config: Arc::new(config),
///     client: Arc::new(client),
///     plugin_manager: Arc::new(plugin_manager),
///     cache_manager: Arc::new(cache_manager),
///     model_router: Arc::new(model_router),
///     forwarder: Arc::new(forwarder),
///     guardrail_executor: Arc::new(guardrail_executor),
///     budget_cache: Arc::new(budget_cache),
///     usage_queue: Arc::new(usage_queue),
///     lock_manager: Arc::new(lock_manager),
///     latency_tracker: Arc::new(latency_tracker),
///     background_shutdown: shutdown_tx,
/// };
/// ```
pub struct AppState {
    /// Server and provider configuration
    pub config: Arc<Config>,
    /// Ultrafast SDK client for provider communication
    pub client: Arc<UltrafastClient>,
    /// Dynamic plugin management system
    pub plugin_manager: Arc<PluginManager>,
    /// Redis and in-memory caching layer
    pub cache_manager: Arc<CacheManager>,
    /// Instance registry and adaptive/weighted/fallback selection
    pub model_router: Arc<ModelRouter>,
    /// Routes a chat request through the Model Router with retrying fallback
    pub forwarder: Arc<Forwarder>,
    /// Pre/post/during/logging-only request guardrail pipeline
    pub guardrail_executor: Arc<GuardrailExecutor>,
    /// Per-key/user/team spend tracking shared with the Redis deployment
    pub budget_cache: Arc<BudgetCache>,
    /// Durable usage record queue drained by the Batch Processor
    pub usage_queue: Arc<UsageQueue>,
    /// Cross-replica coordination for the Batch Processor and cache refreshes
    pub lock_manager: Arc<DistributedLockManager>,
    /// Rolling per-model latency EMA shared with the Model Router
    pub latency_tracker: Arc<LatencyTracker>,
    /// Shutdown signal for the Batch Processor and retry sweeper background
    /// loops. Held here so dropping it doesn't tear down those loops while
    /// the server is still running.
    pub background_shutdown: tokio::sync::watch::Sender<bool>,
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            client: self.client.clone(),
            plugin_manager: self.plugin_manager.clone(),
            cache_manager: self.cache_manager.clone(),
            model_router: self.model_router.clone(),
            forwarder: self.forwarder.clone(),
            guardrail_executor: self.guardrail_executor.clone(),
            budget_cache: self.budget_cache.clone(),
            usage_queue: self.usage_queue.clone(),
            lock_manager: self.lock_manager.clone(),
            latency_tracker: self.latency_tracker.clone(),
            background_shutdown: self.background_shutdown.clone(),
        }
    }
}

/// Create and configure the HTTP server with all middleware and routes.
///
/// This function initializes all components of the gateway:
/// - Ultrafast SDK client with configured providers
/// - Cache manager (Redis or in-memory)
/// - Authentication service and rate limiter
/// - Metrics collection system
/// - Plugin manager with configured plugins
/// - Model Router, Forwarder, and usage/budget accounting pipeline
/// - HTTP server with middleware stack and routes
///
/// # Arguments
///
/// * `config` - The gateway configuration containing all settings
///
/// # Returns
///
/// Returns a configured Axum router ready to handle HTTP requests.
///
/// # Errors
///
/// Returns an error if:
/// - SDK client cannot be created
/// - Cache manager cannot be initialized
/// - Authentication service cannot be set up
/// - Metrics system cannot be initialized
/// - Plugin manager cannot be created
///
/// # Example
///
/// ```rust
/// let config = Config::load("config.toml")?;
/// let app = create_server(config).await?;
/// ```
pub async fn create_server(config: Config) -> anyhow::Result<Router> {
    // Create the SDK client in standalone mode with configured providers
    let mut client_builder = UltrafastClient::standalone();

    // Add configured providers to the client
    for (name, provider_config) in &config.providers {
        client_builder = client_builder.with_provider(name.clone(), provider_config.clone());
    }

    // If no providers configured, add Ollama as default for development
    if config.providers.is_empty() {
        client_builder = client_builder.with_ollama("http://localhost:11434");
    }

    // Build the client with the configured routing strategy
    let client = client_builder
        .with_routing_strategy(config.routing.strategy.clone())
        .build()?;

    // Initialize cache manager with the configured backend
    let cache_manager = Arc::new(CacheManager::new(config.cache.clone()).await?);

    // Initialize authentication service and rate limiter with cache manager
    crate::auth::initialize_auth_service(config.auth.clone(), cache_manager.clone()).await;

    // Perform security sanity check for JWT secrets
    if let Err(e) = {
        // Create a temporary auth service instance for sanity checking
        let tmp = crate::auth::AuthService::new(config.auth.clone());
        tmp.sanity_check()
    } {
        return Err(anyhow::anyhow!(e.to_string()));
    }

    // Initialize rate limiter with cache manager for distributed rate limiting
    crate::auth::initialize_rate_limiter(cache_manager.clone()).await?;

    // Initialize metrics collector with configuration
    let metrics_config = crate::metrics::MetricsConfig {
        enabled: config.metrics.enabled,
        max_requests: config.metrics.max_requests,
        retention_duration: config.metrics.retention_duration,
        cleanup_interval: config.metrics.cleanup_interval,
    };
    crate::metrics::initialize_metrics(metrics_config).await;

    // Initialize plugin manager for dynamic functionality
    let mut plugin_manager = PluginManager::new();

    // Register plugins from configuration
    for plugin_config in &config.plugins {
        if plugin_config.enabled {
            match create_plugin(plugin_config) {
                Ok(plugin) => {
                    if let Err(e) = plugin_manager.register_plugin(plugin).await {
                        tracing::error!("Failed to register plugin {}: {}", plugin_config.name, e);
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to create plugin {}: {}", plugin_config.name, e);
                }
            }
        }
    }

    let plugin_manager = Arc::new(plugin_manager);

    let redis_client = cache_manager.redis_client();

    // Model Router: one instance per (provider, exposed model) mapping
    // configured for that provider, scored with the configured adaptive
    // weights.
    let model_router = Arc::new(ModelRouter::new(RoutingWeights {
        w_latency: config.routing.w_latency,
        w_success: config.routing.w_success,
        w_load: config.routing.w_load,
    }));
    let mut provider_registry: ProviderRegistry = ProviderRegistry::new();
    for (name, provider_config) in &config.providers {
        match create_provider_with_circuit_breaker(provider_config.clone(), None) {
            Ok(provider) => {
                provider_registry.insert(name.clone(), Arc::from(provider));
            }
            Err(e) => {
                tracing::error!("Failed to build provider adapter {name}: {e}");
                continue;
            }
        }
        for (exposed_model, provider_model) in &provider_config.model_mapping {
            model_router.register_instance(ModelInstanceConfig {
                provider: name.clone(),
                provider_model: provider_model.clone(),
                exposed_model: exposed_model.clone(),
                weight: 1,
                max_concurrent: config.routing.max_concurrent_per_instance,
                circuit_breaker: ultrafast_models_sdk::circuit_breaker::CircuitBreakerConfig {
                    failure_threshold: config.circuit_breaker.failure_threshold,
                    recovery_timeout: config.circuit_breaker.recovery_timeout,
                    request_timeout: config.circuit_breaker.request_timeout,
                    half_open_max_calls: config.circuit_breaker.half_open_max_calls,
                    half_open_probe_count: config.circuit_breaker.half_open_probe_count,
                },
            });
        }
    }
    let forwarder = Arc::new(Forwarder::new(model_router.clone(), provider_registry));

    let guardrail_executor = Arc::new(GuardrailExecutor::new());
    let budget_cache = Arc::new(BudgetCache::new(redis_client.clone()));
    let usage_queue = Arc::new(UsageQueue::new(redis_client.clone()));
    let lock_manager = Arc::new(DistributedLockManager::new(redis_client.clone()));
    let latency_tracker = Arc::new(LatencyTracker::new(
        redis_client.clone(),
        LatencyTrackerConfig::default(),
    ));

    // Drains the usage queue in the background, serialised across replicas
    // by the distributed lock, alongside a sweeper that requeues ready
    // retry entries back onto `main`.
    let batch_processor = Arc::new(BatchProcessor::new(
        usage_queue.clone(),
        lock_manager.clone(),
        Arc::new(InMemoryUsagePersistence::new()),
        budget_cache.clone(),
    ));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(batch_processor.run_forever(shutdown_rx.clone()));
    tokio::spawn(crate::usage_queue::run_retry_sweeper(
        usage_queue.clone(),
        shutdown_rx,
    ));

    let state = AppState {
        config: Arc::new(config.clone()),
        client: Arc::new(client),
        plugin_manager,
        cache_manager,
        model_router,
        forwarder,
        guardrail_executor,
        budget_cache,
        usage_queue,
        lock_manager,
        latency_tracker,
        background_shutdown: shutdown_tx,
    };

    // Warn if permissive CORS is used in production-like settings
    if config.server.cors.enabled && config.server.cors.allowed_origins.iter().any(|o| o == "*") {
        tracing::warn!(
            "CORS is enabled with wildcard origins. This is unsafe for production. Configure explicit allowed_origins."
        );
    }

    // Create the main router
    let app = Router::new()
        // OpenAI-compatible endpoints
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/embeddings", post(handlers::embeddings))
        .route("/v1/images/generations", post(handlers::image_generations))
        .route(
            "/v1/audio/transcriptions",
            post(handlers::audio_transcriptions),
        )
        .route("/v1/audio/speech", post(handlers::text_to_speech))
        .route("/v1/models", get(handlers::router_models))
        .route("/v1/messages", post(handlers::anthropic_messages))
        .route(
            "/admin/provider-catalog",
            get(handlers::list_models),
        )
        // Health and admin endpoints
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .route("/metrics/prometheus", get(handlers::prometheus_metrics))
        .route("/admin/providers", get(handlers::list_providers))
        .route("/admin/config", get(handlers::get_config))
        .route(
            "/admin/circuit-breakers",
            get(handlers::get_circuit_breaker_metrics),
        )
        // Middleware stack (plugins now handle input validation)
        .layer(
            ServiceBuilder::new()
                .layer(cors_middleware(&config.server.cors)) // 1. CORS (first)
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    auth_middleware,
                )) // 2. Authentication (includes rate limiting)
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    plugin_middleware::plugin_middleware,
                )) // 3. Plugins (after auth)
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    logging_middleware,
                )) // 4. Logging (only authenticated requests)
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    metrics_middleware,
                )) // 5. Metrics (only authenticated requests)
                .layer(TimeoutLayer::new(config.server.timeout)), // 6. Timeout (last)
        )
        .with_state(state);

    Ok(app)
}
