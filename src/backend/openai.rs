//! OpenAI-compatible chat completions client
//!
//! Talks to any `/chat/completions` endpoint that follows the OpenAI wire
//! format, in both JSON and server-sent-event modes.

use super::{Generation, GenerationParams, LlmBackend, TokenStream, TokenUsage};
use crate::config::BackendConfig;
use crate::context::{ContentPart, ConversationMessage, MessageContent};
use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

/// Backend speaking the OpenAI chat completions protocol
pub struct OpenAiCompatibleBackend {
    client: Client,
    config: BackendConfig,
}

impl OpenAiCompatibleBackend {
    pub fn new(config: BackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| RuntimeError::Configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn request_body<'a>(
        model_id: &'a str,
        messages: &[ConversationMessage],
        params: &GenerationParams,
        stream: bool,
    ) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: model_id,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: wire_content(&m.content),
                })
                .collect(),
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            stream,
        }
    }

    /// POST with retry and exponential backoff on transient failures
    async fn send(&self, model_id: &str, body: &ChatCompletionRequest<'_>) -> Result<Response> {
        let attempts = self.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                debug!(model_id, attempt, "Retrying backend request");
                tokio::time::sleep(Duration::from_millis(100 * (1 << attempt))).await;
            }

            let mut req = self.client.post(self.endpoint()).json(body);
            if let Some(ref api_key) = self.config.api_key {
                req = req.bearer_auth(api_key);
            }

            match req.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    let error = RuntimeError::backend(model_id, format!("HTTP {}: {}", status, text));
                    if !is_transient(status) {
                        return Err(error);
                    }
                    last_error = Some(error);
                }
                Err(e) => {
                    last_error = Some(RuntimeError::backend(model_id, e));
                }
            }
        }

        warn!(model_id, attempts, "Backend request failed after retries");
        Err(last_error.unwrap_or_else(|| RuntimeError::backend(model_id, "no attempts made")))
    }
}

#[async_trait]
impl LlmBackend for OpenAiCompatibleBackend {
    async fn generate(
        &self,
        model_id: &str,
        messages: &[ConversationMessage],
        params: &GenerationParams,
    ) -> Result<Generation> {
        let body = Self::request_body(model_id, messages, params, false);
        let response = self.send(model_id, &body).await?;

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| RuntimeError::backend(model_id, format!("failed to parse response: {}", e)))?;

        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| RuntimeError::backend(model_id, "no choices in response"))?;

        Ok(Generation {
            text,
            usage: completion.usage,
            model: completion.model.unwrap_or_else(|| model_id.to_string()),
        })
    }

    async fn stream(
        &self,
        model_id: &str,
        messages: &[ConversationMessage],
        params: &GenerationParams,
    ) -> Result<TokenStream> {
        let body = Self::request_body(model_id, messages, params, true);
        let response = self.send(model_id, &body).await?;

        let bytes = Box::pin(
            response
                .bytes_stream()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
        );
        let lines = BufReader::new(StreamReader::new(bytes)).lines();
        let model = model_id.to_string();

        let stream = futures::stream::unfold(Some(lines), move |state| {
            let model = model.clone();
            async move {
                let mut lines = state?;
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => match parse_sse_line(&line) {
                            Ok(SseEvent::Delta(text)) => return Some((Ok(text), Some(lines))),
                            Ok(SseEvent::Skip) => continue,
                            Ok(SseEvent::Done) => return None,
                            Err(e) => {
                                let error = RuntimeError::backend(&model, format!("malformed stream chunk: {}", e));
                                return Some((Err(error), None));
                            }
                        },
                        Ok(None) => return None,
                        Err(e) => return Some((Err(RuntimeError::backend(&model, e)), None)),
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn wire_content(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => Value::String(text.clone()),
        MessageContent::Parts(parts) => Value::Array(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                    ContentPart::ImageUrl { url } => json!({ "type": "image_url", "image_url": { "url": url } }),
                })
                .collect(),
        ),
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum SseEvent {
    Delta(String),
    Done,
    Skip,
}

/// Interpret one line of an SSE completion stream
pub(crate) fn parse_sse_line(line: &str) -> std::result::Result<SseEvent, serde_json::Error> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        // blank separators, comments and other fields
        return Ok(SseEvent::Skip);
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }

    let chunk: StreamChunk = serde_json::from_str(data)?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty())
        .map(SseEvent::Delta)
        .unwrap_or(SseEvent::Skip))
}

// OpenAI-compatible API types
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Value,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
