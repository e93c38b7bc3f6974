use crate::error::ProviderError;
use crate::models::{
    AudioRequest, AudioResponse, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse,
    ImageRequest, ImageResponse, SpeechRequest, SpeechResponse, StreamChunk,
};
use crate::providers::{HealthStatus, Provider, ProviderConfig, ProviderHealth, StreamResult};
use async_stream::stream;
use std::collections::HashMap;
use std::time::Instant;

use super::http_client::{map_error_response, AuthStrategy, HttpProviderClient};

pub struct OpenAIProvider {
    http: HttpProviderClient,
    config: ProviderConfig,
}

impl OpenAIProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let http = HttpProviderClient::new(
            config.timeout,
            config.base_url.clone(),
            "https://api.openai.com/v1",
            &config.headers,
            AuthStrategy::Bearer {
                token: config.api_key.clone(),
            },
        )?;

        Ok(Self { http, config })
    }

    fn map_model(&self, model: &str) -> String {
        self.config
            .model_mapping
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }
}

#[async_trait::async_trait]
impl Provider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn supports_function_calling(&self) -> bool {
        true
    }

    fn supported_models(&self) -> Vec<String> {
        vec![
            "gpt-4o".to_string(),
            "gpt-4o-mini".to_string(),
            "gpt-4-turbo".to_string(),
            "gpt-4".to_string(),
            "gpt-3.5-turbo".to_string(),
        ]
    }

    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut request = request;
        request.model = self.map_model(&request.model);
        request.stream = Some(false);

        self.http
            .post_json("/chat/completions", &request)
            .await
    }

    async fn stream_chat_completion(
        &self,
        request: ChatRequest,
    ) -> Result<StreamResult, ProviderError> {
        let mut request = request;
        request.model = self.map_model(&request.model);
        request.stream = Some(true);

        let response = self.http.post_json_raw("/chat/completions", &request).await?;
        if !response.status().is_success() {
            return Err(map_error_response(response).await);
        }

        // OpenAI's stream chunks are already shaped like `StreamChunk`, so no
        // per-field translation is needed here, only SSE line framing.
        let stream = Box::pin(stream! {
            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = futures::StreamExt::next(&mut bytes_stream).await {
                match chunk_result {
                    Ok(chunk) => {
                        let chunk_str = String::from_utf8_lossy(&chunk);
                        buffer.push_str(&chunk_str);

                        while let Some(line_end) = buffer.find('\n') {
                            let line = buffer[..line_end].trim().to_string();
                            buffer = buffer[line_end + 1..].to_string();

                            if let Some(json_str) = line.strip_prefix("data: ") {
                                if json_str == "[DONE]" {
                                    return;
                                }
                                if json_str.is_empty() {
                                    continue;
                                }

                                match serde_json::from_str::<StreamChunk>(json_str) {
                                    Ok(parsed) => yield Ok(parsed),
                                    Err(e) => yield Err(ProviderError::Serialization(e)),
                                }
                            }
                        }
                    }
                    Err(e) => yield Err(ProviderError::Http(e)),
                }
            }
        });

        Ok(stream)
    }

    async fn embedding(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError> {
        self.http.post_json("/embeddings", &request).await
    }

    async fn image_generation(&self, request: ImageRequest) -> Result<ImageResponse, ProviderError> {
        self.http.post_json("/images/generations", &request).await
    }

    async fn audio_transcription(
        &self,
        _request: AudioRequest,
    ) -> Result<AudioResponse, ProviderError> {
        Err(ProviderError::Configuration {
            message: "audio transcription requires multipart upload, not yet wired for this provider"
                .to_string(),
        })
    }

    async fn text_to_speech(&self, request: SpeechRequest) -> Result<SpeechResponse, ProviderError> {
        let resp = self.http.post_json_raw("/audio/speech", &request).await?;
        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("audio/mpeg")
            .to_string();
        let audio = resp.bytes().await?.to_vec();
        Ok(SpeechResponse { audio, content_type })
    }

    async fn health_check(&self) -> Result<ProviderHealth, ProviderError> {
        let start = Instant::now();
        let response = self
            .http
            .get_json::<serde_json::Value>("/models")
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match response {
            Ok(_) => Ok(ProviderHealth {
                status: HealthStatus::Healthy,
                latency_ms: Some(latency_ms),
                error_rate: 0.0,
                last_check: chrono::Utc::now(),
                details: HashMap::new(),
            }),
            Err(e) => {
                let mut details = HashMap::new();
                details.insert("error".to_string(), e.to_string());
                Ok(ProviderHealth {
                    status: HealthStatus::Degraded,
                    latency_ms: Some(latency_ms),
                    error_rate: 1.0,
                    last_check: chrono::Utc::now(),
                    details,
                })
            }
        }
    }
}
