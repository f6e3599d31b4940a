//! OpenAI-compatible text generation and embeddings.
//!
//! Works with any endpoint exposing `/chat/completions` (streamed as SSE)
//! and `/embeddings`: OpenAI, OpenRouter, Ollama, vLLM, llama.cpp server.
//! The API key comes from the `api_key` setting or `OPENAI_API_KEY`; local
//! servers may run without one.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use cadenza_core::{Backend, Chunk, ChunkStream, OpConfig, OpKind, OperationError, Value};
use futures::StreamExt;
use serde::Deserialize;
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::{ConfigReader, backend_error, failed, invalid};

const ID: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

fn build_client(kind: OpKind) -> Result<reqwest::Client, OperationError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| backend_error(kind, ID, format!("failed to create HTTP client: {e}")))
}

fn resolve_api_key(configured: &Option<String>) -> Option<String> {
    configured
        .clone()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .filter(|key| !key.is_empty())
}

fn authorized(request: reqwest::RequestBuilder, api_key: &Option<String>) -> reqwest::RequestBuilder {
    match resolve_api_key(api_key) {
        Some(key) => request.bearer_auth(key),
        None => request,
    }
}

async fn check_status(kind: OpKind, response: reqwest::Response) -> Result<reqwest::Response, OperationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), body = %body, "OpenAI-compatible endpoint returned error");
    Err(backend_error(kind, ID, format!("HTTP {}: {body}", status.as_u16())))
}

// ── Text generation ──────────────────────────────────────────────────

/// Redact a secret for Debug output.
fn redact(key: &Option<String>) -> &'static str {
    match key {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Clone, PartialEq)]
struct ChatSettings {
    base_url: String,
    model: String,
    temperature: f64,
    top_p: f64,
    presence_penalty: f64,
    frequency_penalty: f64,
    api_key: Option<String>,
}

impl std::fmt::Debug for ChatSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSettings")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("presence_penalty", &self.presence_penalty)
            .field("frequency_penalty", &self.frequency_penalty)
            .field("api_key", &redact(&self.api_key))
            .finish()
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            model: "gpt-4o".into(),
            temperature: 1.0,
            top_p: 0.9,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            api_key: None,
        }
    }
}

/// `t2t/openai`: streamed chat completion.
///
/// Input `messages` is a list of `{role, content}` objects; the instruction
/// prompt is sent ahead of them as the system message. Each content delta
/// becomes one output chunk.
#[derive(Debug, Default)]
pub struct OpenAiChat {
    settings: RwLock<ChatSettings>,
    client: Mutex<Option<reqwest::Client>>,
}

impl OpenAiChat {
    pub fn new() -> Self {
        Self::default()
    }

    fn settings(&self) -> ChatSettings {
        self.settings.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

fn chat_body(settings: &ChatSettings, instruction_prompt: &str, messages: &serde_json::Value) -> serde_json::Value {
    let mut history = vec![serde_json::json!({ "role": "system", "content": instruction_prompt })];
    if let Some(items) = messages.as_array() {
        history.extend(items.iter().cloned());
    }
    serde_json::json!({
        "model": settings.model,
        "messages": history,
        "stream": true,
        "temperature": settings.temperature,
        "top_p": settings.top_p,
        "presence_penalty": settings.presence_penalty,
        "frequency_penalty": settings.frequency_penalty,
    })
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
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
    content: Option<String>,
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Content(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<StreamResponse>(data) {
        Ok(response) => response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty())
            .map_or(SseLine::Skip, SseLine::Content),
        Err(e) => {
            trace!(data = %data, error = %e, "Ignoring unparseable SSE chunk");
            SseLine::Skip
        }
    }
}

#[async_trait]
impl Backend for OpenAiChat {
    async fn configure(&self, config: &OpConfig) -> Result<(), OperationError> {
        let reader = ConfigReader::new(config, OpKind::T2t, ID);
        let mut next = self.settings();

        if let Some(v) = reader.string("base_url")? {
            next.base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = reader.string("model")? {
            next.model = v;
        }
        if let Some(v) = reader.string("api_key")? {
            next.api_key = Some(v);
        }
        if let Some(v) = reader.float("temperature")? {
            reader.in_range("temperature", v, 0.0, 2.0)?;
            next.temperature = v;
        }
        if let Some(v) = reader.float("top_p")? {
            reader.in_range("top_p", v, 0.0, 1.0)?;
            next.top_p = v;
        }
        if let Some(v) = reader.float("presence_penalty")? {
            reader.in_range("presence_penalty", v, 0.0, 1.0)?;
            next.presence_penalty = v;
        }
        if let Some(v) = reader.float("frequency_penalty")? {
            reader.in_range("frequency_penalty", v, 0.0, 1.0)?;
            next.frequency_penalty = v;
        }
        if next.base_url.is_empty() || next.model.is_empty() {
            return Err(invalid(OpKind::T2t, ID, "base_url and model must not be empty"));
        }

        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = next;
        Ok(())
    }

    async fn configuration(&self) -> OpConfig {
        let settings = self.settings();
        let mut config = OpConfig::new();
        config.insert("base_url".into(), settings.base_url.into());
        config.insert("model".into(), settings.model.into());
        config.insert("temperature".into(), settings.temperature.into());
        config.insert("top_p".into(), settings.top_p.into());
        config.insert("presence_penalty".into(), settings.presence_penalty.into());
        config.insert("frequency_penalty".into(), settings.frequency_penalty.into());
        config
    }

    async fn start(&self) -> Result<(), OperationError> {
        let client = build_client(OpKind::T2t)?;
        *self.client.lock().unwrap_or_else(|e| e.into_inner()) = Some(client);
        Ok(())
    }

    async fn close(&self) -> Result<(), OperationError> {
        self.client.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }

    fn generate(&self, input: Chunk) -> ChunkStream {
        let settings = self.settings();
        let Some(client) = self.client.lock().unwrap_or_else(|e| e.into_inner()).clone() else {
            return failed(backend_error(OpKind::T2t, ID, "client not started"));
        };
        let instruction_prompt = input.text("instruction_prompt").unwrap_or_default().to_string();
        let messages = input
            .get("messages")
            .and_then(Value::as_json)
            .cloned()
            .unwrap_or_else(|| serde_json::json!([]));

        Box::pin(async_stream::try_stream! {
            let url = format!("{}/chat/completions", settings.base_url);
            let body = chat_body(&settings, &instruction_prompt, &messages);
            debug!(model = %settings.model, "Sending streaming completion request");

            let response = authorized(client.post(&url), &settings.api_key)
                .header("Accept", "text/event-stream")
                .json(&body)
                .send()
                .await
                .map_err(|e| backend_error(OpKind::T2t, ID, e.to_string()))?;
            let response = check_status(OpKind::T2t, response).await?;

            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            'read: while let Some(next) = bytes.next().await {
                let next = next.map_err(|e| backend_error(OpKind::T2t, ID, format!("stream interrupted: {e}")))?;
                buffer.push_str(&String::from_utf8_lossy(&next));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim_end_matches('\r').to_string();
                    buffer.drain(..=line_end);
                    match parse_sse_line(&line) {
                        SseLine::Content(content) => yield Chunk::new().with("content", content),
                        SseLine::Done => break 'read,
                        SseLine::Skip => {}
                    }
                }
            }
        })
    }
}

// ── Embeddings ───────────────────────────────────────────────────────

#[derive(Clone, PartialEq)]
struct EmbeddingSettings {
    base_url: String,
    model: String,
    dimensions: i64,
    api_key: Option<String>,
}

impl std::fmt::Debug for EmbeddingSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingSettings")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .field("api_key", &redact(&self.api_key))
            .finish()
    }
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            model: "text-embedding-3-small".into(),
            dimensions: 1536,
            api_key: None,
        }
    }
}

/// `embedding/openai`: one vector per input, emitted as base64 of
/// little-endian `f32`s under `embedding`.
#[derive(Debug, Default)]
pub struct OpenAiEmbedding {
    settings: RwLock<EmbeddingSettings>,
    client: Mutex<Option<reqwest::Client>>,
}

impl OpenAiEmbedding {
    pub fn new() -> Self {
        Self::default()
    }

    fn settings(&self) -> EmbeddingSettings {
        self.settings.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Pack floats as little-endian `f32` and base64 the bytes.
pub fn encode_embedding(vector: &[f32]) -> String {
    let bytes: Vec<u8> = vector.iter().flat_map(|f| f.to_le_bytes()).collect();
    BASE64.encode(bytes)
}

#[async_trait]
impl Backend for OpenAiEmbedding {
    async fn configure(&self, config: &OpConfig) -> Result<(), OperationError> {
        let reader = ConfigReader::new(config, OpKind::Embedding, ID);
        let mut next = self.settings();

        if let Some(v) = reader.string("base_url")? {
            next.base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = reader.string("model")? {
            next.model = v;
        }
        if let Some(v) = reader.string("api_key")? {
            next.api_key = Some(v);
        }
        if let Some(v) = reader.int("dimensions")? {
            if v <= 0 {
                return Err(invalid(OpKind::Embedding, ID, "dimensions must be > 0"));
            }
            next.dimensions = v;
        }
        if next.base_url.is_empty() || next.model.is_empty() {
            return Err(invalid(OpKind::Embedding, ID, "base_url and model must not be empty"));
        }

        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = next;
        Ok(())
    }

    async fn configuration(&self) -> OpConfig {
        let settings = self.settings();
        let mut config = OpConfig::new();
        config.insert("base_url".into(), settings.base_url.into());
        config.insert("model".into(), settings.model.into());
        config.insert("dimensions".into(), settings.dimensions.into());
        config
    }

    async fn start(&self) -> Result<(), OperationError> {
        let client = build_client(OpKind::Embedding)?;
        *self.client.lock().unwrap_or_else(|e| e.into_inner()) = Some(client);
        Ok(())
    }

    async fn close(&self) -> Result<(), OperationError> {
        self.client.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }

    fn generate(&self, input: Chunk) -> ChunkStream {
        let settings = self.settings();
        let Some(client) = self.client.lock().unwrap_or_else(|e| e.into_inner()).clone() else {
            return failed(backend_error(OpKind::Embedding, ID, "client not started"));
        };
        let content = input.text("content").unwrap_or_default().to_string();

        Box::pin(async_stream::try_stream! {
            let url = format!("{}/embeddings", settings.base_url);
            let body = serde_json::json!({
                "model": settings.model,
                "input": content,
                "dimensions": settings.dimensions,
                "encoding_format": "float",
            });
            debug!(model = %settings.model, chars = content.len(), "Sending embedding request");

            let response = authorized(client.post(&url), &settings.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| backend_error(OpKind::Embedding, ID, e.to_string()))?;
            let response = check_status(OpKind::Embedding, response).await?;
            let parsed: EmbeddingResponse = response.json().await.map_err(|e| {
                backend_error(OpKind::Embedding, ID, format!("failed to parse embedding response: {e}"))
            })?;
            let vector = parsed
                .data
                .into_iter()
                .next()
                .map(|d| d.embedding)
                .ok_or_else(|| backend_error(OpKind::Embedding, ID, "no embedding in response"))?;

            yield Chunk::new().with("embedding", encode_embedding(&vector));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_lines_parse() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#),
            SseLine::Content("Hi".into())
        );
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive"), SseLine::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            SseLine::Skip
        );
        assert_eq!(parse_sse_line("data: not json"), SseLine::Skip);
    }

    #[test]
    fn chat_body_puts_instruction_first() {
        let settings = ChatSettings::default();
        let body = chat_body(
            &settings,
            "You are Cadenza",
            &serde_json::json!([{ "role": "user", "content": "[Ann]: hi" }]),
        );
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "You are Cadenza");
        assert_eq!(body["messages"][1]["content"], "[Ann]: hi");
        assert_eq!(body["stream"], true);
    }

    #[tokio::test]
    async fn configure_validates_before_committing() {
        let chat = OpenAiChat::new();
        let mut config = OpConfig::new();
        config.insert("model".into(), "gpt-4o-mini".into());
        config.insert("temperature".into(), 3.0.into());
        assert!(matches!(
            chat.configure(&config).await,
            Err(OperationError::InvalidConfig { .. })
        ));
        assert_eq!(chat.configuration().await["model"], "gpt-4o");

        config.insert("temperature".into(), 0.5.into());
        chat.configure(&config).await.unwrap();
        let current = chat.configuration().await;
        assert_eq!(current["model"], "gpt-4o-mini");
        assert_eq!(current["temperature"], 0.5);
        assert!(!current.contains_key("api_key"));
    }

    #[test]
    fn embeddings_pack_little_endian_floats() {
        let encoded = encode_embedding(&[1.0, -2.0]);
        let bytes = BASE64.decode(encoded).unwrap();
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[4..], &(-2.0f32).to_le_bytes());
    }
}
