//! Local provider: Ollama daemon `/api/chat`
//!
//! Streaming responses are newline-delimited JSON objects, one per delta,
//! the last one carrying `"done": true`.

use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{LlmProvider, ProviderSettings, build_client};
use crate::{
    error::{Error, Result},
    stream::{DeltaEvent, DeltaStream, LineBuffer, TextAccumulator},
    structured::StructuredSchema,
    types::{ChatRequest, Provider, Usage},
};

/// Ollama daemon client
pub struct LocalProvider {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl LocalProvider {
    pub fn new(settings: &ProviderSettings) -> Result<Self> {
        Ok(Self {
            client: build_client(settings)?,
            base_url: settings.ollama_base_url.trim_end_matches('/').to_string(),
            request_timeout: settings.request_timeout,
        })
    }

    fn build_request<'a>(
        &self,
        request: &'a ChatRequest,
        stream: bool,
        schema: Option<&StructuredSchema>,
    ) -> ChatBody<'a> {
        ChatBody {
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
            format: schema.map(|s| s.schema.clone()),
            options: request
                .temperature
                .map(|temperature| ChatOptions { temperature }),
        }
    }
}

#[async_trait]
impl LlmProvider for LocalProvider {
    fn kind(&self) -> Provider {
        Provider::Local
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        schema: Option<&StructuredSchema>,
    ) -> Result<String> {
        request.validate()?;
        let body = self.build_request(request, false, schema);
        let url = format!("{}/api/chat", self.base_url);

        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(parse_daemon_error(status, &text));
        }

        let reply: ChatChunk = response.json().await?;
        if let Some(error) = reply.error {
            return Err(Error::api("ollama_error", error));
        }
        reply
            .message
            .map(|m| m.content)
            .ok_or_else(|| Error::UnexpectedResponse("reply has no message".into()))
    }

    async fn stream(&self, request: &ChatRequest) -> Result<DeltaStream> {
        request.validate()?;
        let body = self.build_request(request, true, None);
        let url = format!("{}/api/chat", self.base_url);

        let response = self.client.post(&url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(parse_daemon_error(status, &text));
        }

        Ok(Box::pin(decode_ndjson(response.bytes_stream())))
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(parse_daemon_error(status, &text));
        }

        let tags: TagList = response.json().await?;
        Ok(tags
            .models
            .into_iter()
            .map(|m| m.name)
            .filter(|name| !name.is_empty())
            .collect())
    }
}

fn parse_daemon_error(status: StatusCode, body: &str) -> Error {
    let message = serde_json::from_str::<DaemonError>(body)
        .map(|e| e.error)
        .unwrap_or_else(|_| body.to_string());
    match status {
        StatusCode::NOT_FOUND => Error::ModelNotFound(message),
        _ => Error::api(format!("http_{}", status.as_u16()), message),
    }
}

/// Turn the daemon's NDJSON byte stream into delta events
fn decode_ndjson<S, B, E>(bytes: S) -> impl futures::Stream<Item = DeltaEvent>
where
    S: futures::Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    stream! {
        let mut bytes = Box::pin(bytes);
        let mut lines = LineBuffer::new();
        let mut accumulated = TextAccumulator::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield DeltaEvent::Error {
                        message: format!("stream read error: {}", e),
                    };
                    return;
                }
            };

            for line in lines.push(chunk.as_ref()) {
                let (events, ended) = decode_record(&line, &mut accumulated);
                for event in events {
                    yield event;
                }
                if ended {
                    return;
                }
            }
        }

        // The daemon may close the body right after the last record, newline or not.
        if let Some(line) = lines.finish() {
            let (events, ended) = decode_record(&line, &mut accumulated);
            for event in events {
                yield event;
            }
            if ended {
                return;
            }
        }

        yield DeltaEvent::Error {
            message: "stream closed before completion".to_string(),
        };
    }
}

/// Decode one NDJSON record. The flag is set once the stream is over.
fn decode_record(line: &str, accumulated: &mut TextAccumulator) -> (Vec<DeltaEvent>, bool) {
    let parsed: ChatChunk = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            let message = format!("Failed to parse chunk: {}", e);
            return (vec![DeltaEvent::Error { message }], true);
        }
    };

    if let Some(error) = parsed.error {
        return (vec![DeltaEvent::Error { message: error }], true);
    }

    let mut events = Vec::new();
    if let Some(message) = parsed.message {
        if !message.content.is_empty() {
            accumulated.push(&message.content);
            events.push(DeltaEvent::Delta {
                text: message.content,
            });
        }
    }

    if parsed.done {
        events.push(DeltaEvent::Done {
            text: accumulated.text().to_string(),
            usage: Usage {
                input: parsed.prompt_eval_count.unwrap_or_default(),
                output: parsed.eval_count.unwrap_or_default(),
            },
        });
    }
    (events, parsed.done)
}

// Request/Response types

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ChatOptions>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct DaemonError {
    error: String,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    models: Vec<TagInfo>,
}

#[derive(Debug, Deserialize)]
struct TagInfo {
    #[serde(default)]
    name: String,
}
