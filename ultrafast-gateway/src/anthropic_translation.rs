//! # Anthropic Messages Translation
//!
//! Pure request/response translation between the Anthropic Messages wire
//! format (`POST /v1/messages`) and the gateway's internal OpenAI-style
//! `ChatRequest`/`ChatResponse`, so `/v1/messages` can be served by the same
//! Model Router / Forwarder pipeline as `/v1/chat/completions`.
//!
//! Grounded on [`ultrafast_models_sdk::providers::anthropic`]'s own
//! Anthropic-wire-format types and its `convert_messages`/`convert_response`
//! conversion pair, generalised here into gateway-facing request/response
//! translation instead of outbound provider calls.

use serde::{Deserialize, Serialize};

use ultrafast_models_sdk::models::{ChatRequest, ChatResponse, Choice, Message, Role, Usage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicMessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicMessagesResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub response_type: String,
    pub role: String,
    pub content: Vec<AnthropicContentBlock>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub usage: AnthropicUsage,
}

/// `system` becomes a leading `system`-role message; `stop_sequences`
/// becomes `stop`. Ordering of the remaining messages is preserved.
pub fn anthropic_to_openai(request: AnthropicMessagesRequest) -> ChatRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    if let Some(system) = request.system {
        messages.push(Message {
            role: Role::System,
            content: system,
            name: None,
            tool_calls: None,
            tool_call_id: None,
        });
    }

    messages.extend(request.messages.into_iter().map(|m| Message {
        role: parse_role(&m.role),
        content: m.content,
        name: None,
        tool_calls: None,
        tool_call_id: None,
    }));

    ChatRequest {
        model: request.model,
        messages,
        temperature: request.temperature,
        max_tokens: Some(request.max_tokens),
        stream: request.stream,
        top_p: request.top_p,
        stop: request.stop_sequences,
        ..Default::default()
    }
}

fn parse_role(role: &str) -> Role {
    match role {
        "assistant" => Role::Assistant,
        "system" => Role::System,
        "tool" => Role::Tool,
        _ => Role::User,
    }
}

fn role_to_anthropic(role: &Role) -> &'static str {
    match role {
        Role::Assistant => "assistant",
        Role::System => "system",
        Role::Tool => "tool",
        Role::User => "user",
    }
}

/// `finish_reason` maps `stop -> end_turn`, `length -> max_tokens`; anything
/// else passes through unchanged so provider-specific reasons aren't lost.
pub fn finish_reason_to_anthropic(reason: &str) -> String {
    match reason {
        "stop" => "end_turn".to_string(),
        "length" => "max_tokens".to_string(),
        other => other.to_string(),
    }
}

pub fn finish_reason_to_openai(reason: &str) -> String {
    match reason {
        "end_turn" => "stop".to_string(),
        "max_tokens" => "length".to_string(),
        other => other.to_string(),
    }
}

pub fn openai_to_anthropic(response: ChatResponse) -> AnthropicMessagesResponse {
    let choice: Choice = response
        .choices
        .into_iter()
        .next()
        .unwrap_or_else(|| Choice {
            index: 0,
            message: Message {
                role: Role::Assistant,
                content: String::new(),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            },
            finish_reason: None,
            logprobs: None,
        });

    let usage = response.usage.unwrap_or(Usage {
        prompt_tokens: 0,
        completion_tokens: 0,
        total_tokens: 0,
    });

    AnthropicMessagesResponse {
        id: response.id,
        response_type: "message".to_string(),
        role: role_to_anthropic(&choice.message.role).to_string(),
        content: vec![AnthropicContentBlock {
            block_type: "text".to_string(),
            text: choice.message.content,
        }],
        model: response.model,
        stop_reason: choice
            .finish_reason
            .as_deref()
            .map(finish_reason_to_anthropic),
        usage: AnthropicUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelListEntry {
    pub id: String,
    pub object: String,
    pub owned_by: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelsListResponse {
    pub object: String,
    pub data: Vec<ModelListEntry>,
}

/// Enumerates the exposed models currently registered with the Model
/// Router, for `GET /v1/models`.
pub fn models_list_response(exposed_models: Vec<String>) -> ModelsListResponse {
    ModelsListResponse {
        object: "list".to_string(),
        data: exposed_models
            .into_iter()
            .map(|id| ModelListEntry {
                id,
                object: "model".to_string(),
                owned_by: "ultrafast-gateway".to_string(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_message_is_prepended() {
        let request = AnthropicMessagesRequest {
            model: "claude-3-opus".to_string(),
            max_tokens: 100,
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
            system: Some("be concise".to_string()),
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            stream: None,
        };

        let chat = anthropic_to_openai(request);
        assert_eq!(chat.messages.len(), 2);
        assert!(matches!(chat.messages[0].role, Role::System));
        assert_eq!(chat.messages[0].content, "be concise");
        assert!(matches!(chat.messages[1].role, Role::User));
    }

    #[test]
    fn stop_sequences_becomes_stop() {
        let request = AnthropicMessagesRequest {
            model: "claude-3-opus".to_string(),
            max_tokens: 100,
            messages: vec![],
            system: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: Some(vec!["STOP".to_string()]),
            stream: None,
        };
        let chat = anthropic_to_openai(request);
        assert_eq!(chat.stop, Some(vec!["STOP".to_string()]));
    }

    #[test]
    fn finish_reason_round_trips() {
        assert_eq!(finish_reason_to_anthropic("stop"), "end_turn");
        assert_eq!(finish_reason_to_anthropic("length"), "max_tokens");
        assert_eq!(finish_reason_to_openai("end_turn"), "stop");
        assert_eq!(finish_reason_to_openai("max_tokens"), "length");
    }

    #[test]
    fn openai_response_translates_to_anthropic_shape() {
        let response = ChatResponse {
            id: "chatcmpl-1".to_string(),
            object: "chat.completion".to_string(),
            created: 0,
            model: "gpt-4".to_string(),
            choices: vec![Choice {
                index: 0,
                message: Message {
                    role: Role::Assistant,
                    content: "hello".to_string(),
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
        };

        let anthropic = openai_to_anthropic(response);
        assert_eq!(anthropic.stop_reason, Some("end_turn".to_string()));
        assert_eq!(anthropic.content[0].text, "hello");
        assert_eq!(anthropic.usage.input_tokens, 3);
    }
}
