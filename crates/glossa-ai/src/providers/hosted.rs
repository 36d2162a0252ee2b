//! Hosted provider: OpenAI-compatible Chat Completions API

use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

use super::{LlmProvider, ProviderSettings, build_client};
use crate::{
    error::{Error, Result},
    stream::{DeltaEvent, DeltaStream, TextAccumulator},
    structured::StructuredSchema,
    types::{ChatRequest, Provider, Usage},
};

/// Hosted API client
pub struct HostedProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    request_timeout: Duration,
}

impl HostedProvider {
    /// Create a new hosted provider with an API key
    pub fn new(api_key: impl Into<String>, settings: &ProviderSettings) -> Result<Self> {
        Ok(Self {
            client: build_client(settings)?,
            api_key: api_key.into(),
            base_url: settings.openai_base_url.trim_end_matches('/').to_string(),
            request_timeout: settings.request_timeout,
        })
    }

    fn build_request<'a>(
        &self,
        request: &'a ChatRequest,
        stream: bool,
        schema: Option<&StructuredSchema>,
    ) -> CompletionsRequest<'a> {
        CompletionsRequest {
            model: &request.model,
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            stream,
            temperature: request.temperature,
            response_format: schema.map(|s| {
                serde_json::json!({
                    "type": "json_schema",
                    "json_schema": {
                        "name": s.name,
                        "schema": s.schema,
                    }
                })
            }),
            stream_options: stream.then(|| serde_json::json!({ "include_usage": true })),
        }
    }
}

#[async_trait]
impl LlmProvider for HostedProvider {
    fn kind(&self) -> Provider {
        Provider::Hosted
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        schema: Option<&StructuredSchema>,
    ) -> Result<String> {
        request.validate()?;
        let body = self.build_request(request, false, schema);
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry = retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(parse_api_error(status, retry, &text));
        }

        let completion: CompletionResponse = response.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::UnexpectedResponse("completion has no message content".into()))
    }

    async fn stream(&self, request: &ChatRequest) -> Result<DeltaStream> {
        request.validate()?;
        let body = self.build_request(request, true, None);
        let url = format!("{}/chat/completions", self.base_url);

        let request_builder = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body);

        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;

        Ok(Box::pin(create_stream(event_source)))
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry = retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(parse_api_error(status, retry, &text));
        }

        let list: ModelList = response.json().await?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

/// Seconds from a `Retry-After` header; the HTTP-date form is ignored
fn retry_after(headers: &HeaderMap) -> Option<u64> {
    headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()
}

/// Map a non-success response to an error, keeping the backend's message
pub(crate) fn parse_api_error(status: StatusCode, retry_after: Option<u64>, body: &str) -> Error {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Error::RateLimited { retry_after };
    }

    let parsed: Option<ErrorEnvelope> = serde_json::from_str(body).ok();
    let Some(ErrorEnvelope { error }) = parsed else {
        return Error::api(format!("http_{}", status.as_u16()), body.to_string());
    };

    let code = error.code.as_deref().unwrap_or_default();
    if code == "unsupported_value" || code == "unsupported_parameter" {
        return Error::UnsupportedParameter {
            param: error.param.unwrap_or_else(|| "unknown".to_string()),
            message: error.message,
        };
    }

    match status {
        StatusCode::UNAUTHORIZED => Error::Auth(error.message),
        StatusCode::NOT_FOUND if code == "model_not_found" => Error::ModelNotFound(error.message),
        _ => Error::api(
            error
                .error_type
                .unwrap_or_else(|| format!("http_{}", status.as_u16())),
            error.message,
        ),
    }
}

fn create_stream(mut event_source: EventSource) -> impl futures::Stream<Item = DeltaEvent> {
    stream! {
        let mut accumulated = TextAccumulator::new();
        let mut usage = Usage::default();
        let mut finished = false;

        while let Some(event) = event_source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(msg)) => {
                    if msg.data == "[DONE]" {
                        finished = true;
                        break;
                    }

                    let chunk: std::result::Result<StreamChunk, _> = serde_json::from_str(&msg.data);
                    match chunk {
                        Ok(chunk) => {
                            for choice in chunk.choices {
                                if let Some(content) = choice.delta.content {
                                    if content.is_empty() {
                                        continue;
                                    }
                                    accumulated.push(&content);
                                    yield DeltaEvent::Delta { text: content };
                                }
                            }
                            if let Some(stream_usage) = chunk.usage {
                                usage.input = stream_usage.prompt_tokens;
                                usage.output = stream_usage.completion_tokens;
                            }
                        }
                        Err(e) => {
                            event_source.close();
                            yield DeltaEvent::Error {
                                message: format!("Failed to parse chunk: {}", e),
                            };
                            return;
                        }
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                    event_source.close();
                    let retry = retry_after(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    yield DeltaEvent::Error {
                        message: parse_api_error(status, retry, &body).to_string(),
                    };
                    return;
                }
                Err(e) => {
                    event_source.close();
                    yield DeltaEvent::Error {
                        message: format!("SSE error: {}", e),
                    };
                    return;
                }
            }
        }

        // The event source reconnects by default; a finished call must not.
        event_source.close();

        if finished {
            yield DeltaEvent::Done {
                text: accumulated.into_text(),
                usage,
            };
        } else {
            yield DeltaEvent::Error {
                message: "stream closed before completion".to_string(),
            };
        }
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct CompletionsRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
    param: Option<String>,
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    id: String,
}

// Streaming response types

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
