//! OpenAI-compatible chat completion client.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::LlmEndpoint;
use crate::error::{LlmError, LlmResult};

pub type TextStream = Pin<Box<dyn Stream<Item = LlmResult<String>> + Send>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: role.into(), content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    #[cfg(test)]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

/// A hosted chat model that can answer in one piece or as a text stream.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn default_model(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> LlmResult<String>;

    async fn stream(&self, request: &CompletionRequest) -> LlmResult<TextStream>;
}

pub struct OpenAiClient {
    client: Client,
    endpoint: LlmEndpoint,
}

impl OpenAiClient {
    pub fn new(endpoint: LlmEndpoint, timeout: Duration) -> LlmResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.endpoint.base_url.trim_end_matches('/'))
    }

    async fn send(&self, request: &CompletionRequest, stream: bool) -> LlmResult<reqwest::Response> {
        let body = WireRequest { model: &request.model, messages: &request.messages, stream };
        let response = self
            .client
            .post(self.url())
            .bearer_auth(&self.endpoint.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(parse_api_error(status.as_u16(), &text));
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatProvider for OpenAiClient {
    fn default_model(&self) -> &str {
        &self.endpoint.model
    }

    async fn complete(&self, request: &CompletionRequest) -> LlmResult<String> {
        let response = self.send(request, false).await?;
        let body: WireResponse = response.json().await?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(LlmError::EmptyResponse)
    }

    async fn stream(&self, request: &CompletionRequest) -> LlmResult<TextStream> {
        let response = self.send(request, true).await?;
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(LlmError::from));
        Ok(Box::pin(parse_sse_stream(bytes)))
    }
}

fn parse_api_error(status: u16, body: &str) -> LlmError {
    let message = serde_json::from_str::<WireErrorResponse>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string());
    LlmError::Api { status, message }
}

/// Decodes an OpenAI server-sent-event body into content deltas.
/// Events may be split across chunks at any byte.
pub fn parse_sse_stream(
    stream: impl Stream<Item = LlmResult<Vec<u8>>> + Send + 'static,
) -> impl Stream<Item = LlmResult<String>> + Send {
    futures::stream::unfold(
        (stream.boxed(), Vec::<u8>::new(), false),
        |(mut stream, mut buffer, mut exhausted)| async move {
            loop {
                if let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&line);
                    let Some(data) = line.trim().strip_prefix("data:") else { continue };
                    let data = data.trim();
                    if data == "[DONE]" {
                        return None;
                    }
                    match serde_json::from_str::<WireStreamChunk>(data) {
                        Ok(chunk) => {
                            let delta = chunk
                                .choices
                                .into_iter()
                                .filter_map(|c| c.delta.and_then(|d| d.content))
                                .collect::<String>();
                            if !delta.is_empty() {
                                return Some((Ok(delta), (stream, buffer, exhausted)));
                            }
                        }
                        Err(e) => {
                            buffer.clear();
                            return Some((Err(LlmError::from(e)), (stream, buffer, true)));
                        }
                    }
                    continue;
                }

                if exhausted {
                    return None;
                }
                match stream.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                    Some(Err(e)) => {
                        buffer.clear();
                        return Some((Err(e), (stream, buffer, true)));
                    }
                    None => {
                        exhausted = true;
                        // Flush a final event that was not newline-terminated.
                        if buffer.iter().any(|b| !b.is_ascii_whitespace()) {
                            buffer.push(b'\n');
                        }
                    }
                }
            }
        },
    )
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireStreamChunk {
    #[serde(default)]
    choices: Vec<WireStreamChoice>,
}

#[derive(Deserialize)]
struct WireStreamChoice {
    delta: Option<WireDelta>,
}

#[derive(Deserialize)]
struct WireDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireErrorResponse {
    error: WireErrorBody,
}

#[derive(Deserialize)]
struct WireErrorBody {
    message: String,
}
