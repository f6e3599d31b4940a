//! Generations requested by a tool server in the middle of a tool call.
//!
//! A `sampling/createMessage` request is answered straight from the
//! operation registry. It never goes through the job queue: the job that
//! issued the tool call is still running and holds the only job slot.

use async_trait::async_trait;
use cadenza_core::{Chunk, OpRole, ProtocolError};
use cadenza_operations::OperationRegistry;
use futures::StreamExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, error};

/// Longest system prompt forwarded to an embedding request, in characters.
pub const EMBEDDING_INPUT_LIMIT: usize = 10_000;

/// JSON-RPC internal error.
const INTERNAL_ERROR: i64 = -32603;
const INVALID_PARAMS: i64 = -32602;

/// Answers server-to-client requests.
#[async_trait]
pub trait SamplingHandler: Send + Sync {
    /// Handle the params of `sampling/createMessage`, returning the
    /// `CreateMessageResult` object.
    async fn create_message(&self, params: Value) -> Result<Value, ProtocolError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    T2t,
    Embedding,
}

impl SampleType {
    /// Read `metadata.sample_type`, defaulting to text generation.
    pub fn from_params(params: &Value) -> Result<Self, ProtocolError> {
        match params
            .get("metadata")
            .and_then(|m| m.get("sample_type"))
            .and_then(Value::as_str)
        {
            None | Some("t2t") => Ok(Self::T2t),
            Some("embedding") => Ok(Self::Embedding),
            Some(other) => Err(ProtocolError::Rpc {
                code: INVALID_PARAMS,
                message: format!("unsupported sample_type '{other}'"),
            }),
        }
    }
}

/// Build the chat `messages` list a text generator expects from sampling
/// messages (`{role, content: {type: "text", text}}`).
pub fn sampling_messages(params: &Value) -> Value {
    let messages = params
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| {
            messages
                .iter()
                .filter_map(|message| {
                    let text = message.get("content")?.get("text")?.as_str()?;
                    let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
                    Some(json!({ "role": role, "content": text }))
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    Value::Array(messages)
}

fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((at, _)) => &text[..at],
        None => text,
    }
}

/// Sampling backed by the `MCP` and `EMBEDDING` roles.
pub struct RegistrySampler {
    registry: Arc<OperationRegistry>,
}

impl RegistrySampler {
    pub fn new(registry: Arc<OperationRegistry>) -> Self {
        Self { registry }
    }

    async fn collect(&self, role: OpRole, chunk: Chunk, field: &str) -> Result<String, ProtocolError> {
        let rpc = |e: cadenza_core::OperationError| ProtocolError::Rpc {
            code: INTERNAL_ERROR,
            message: e.to_string(),
        };
        let mut stream = self.registry.use_operation(role, chunk, None).map_err(rpc)?;
        let mut output = String::new();
        while let Some(next) = stream.next().await {
            let chunk = next.map_err(rpc)?;
            output.push_str(chunk.text(field).unwrap_or_default());
        }
        Ok(output)
    }
}

#[async_trait]
impl SamplingHandler for RegistrySampler {
    async fn create_message(&self, params: Value) -> Result<Value, ProtocolError> {
        let system_prompt = params
            .get("systemPrompt")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let result = match SampleType::from_params(&params)? {
            SampleType::T2t => {
                let chunk = Chunk::new()
                    .with("instruction_prompt", system_prompt)
                    .with("messages", sampling_messages(&params));
                self.collect(OpRole::Mcp, chunk, "content")
                    .await
                    .map(|text| (text, "mcp"))
            }
            SampleType::Embedding => {
                let chunk =
                    Chunk::new().with("content", truncate_chars(system_prompt, EMBEDDING_INPUT_LIMIT));
                self.collect(OpRole::Embedding, chunk, "embedding")
                    .await
                    .map(|text| (text, "embedding"))
            }
        };

        match result {
            Ok((text, model)) => {
                debug!(model, chars = text.len(), "Answered sampling request");
                Ok(json!({
                    "role": "assistant",
                    "content": { "type": "text", "text": text },
                    "model": model,
                    "stopReason": "endTurn",
                }))
            }
            Err(e) => {
                error!(error = %e, "MCP sampler encountered an issue");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_core::operation::once;
    use cadenza_core::{Backend, ChunkStream, OpConfig, OpKind, OperationError};
    use cadenza_operations::BackendTable;

    struct Echo;

    #[async_trait]
    impl Backend for Echo {
        async fn configure(&self, _config: &OpConfig) -> Result<(), OperationError> {
            Ok(())
        }
        async fn configuration(&self) -> OpConfig {
            OpConfig::new()
        }
        fn generate(&self, input: Chunk) -> ChunkStream {
            let instruction = input.text("instruction_prompt").unwrap_or_default();
            let messages = input.get("messages").and_then(|v| v.as_json()).cloned();
            let last = messages
                .as_ref()
                .and_then(|m| m.as_array())
                .and_then(|m| m.last())
                .and_then(|m| m["content"].as_str())
                .unwrap_or_default()
                .to_string();
            once(Chunk::new().with("content", format!("{instruction}|{last}")))
        }
    }

    struct Length;

    #[async_trait]
    impl Backend for Length {
        async fn configure(&self, _config: &OpConfig) -> Result<(), OperationError> {
            Ok(())
        }
        async fn configuration(&self) -> OpConfig {
            OpConfig::new()
        }
        fn generate(&self, input: Chunk) -> ChunkStream {
            let len = input.text("content").unwrap_or_default().chars().count();
            once(Chunk::new().with("embedding", len.to_string()))
        }
    }

    async fn registry() -> Arc<OperationRegistry> {
        let mut table = BackendTable::new();
        table.register(OpKind::T2t, "echo", || Arc::new(Echo));
        table.register(OpKind::Embedding, "length", || Arc::new(Length));
        let registry = Arc::new(OperationRegistry::new(Arc::new(table)));
        registry
            .load_operation(OpRole::Mcp, "echo", &OpConfig::new())
            .await
            .unwrap();
        registry
            .load_operation(OpRole::Embedding, "length", &OpConfig::new())
            .await
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn text_sampling_uses_mcp_role() {
        let sampler = RegistrySampler::new(registry().await);
        let result = sampler
            .create_message(json!({
                "systemPrompt": "Summarize",
                "messages": [{ "role": "user", "content": { "type": "text", "text": "long text" } }],
                "maxTokens": 100
            }))
            .await
            .unwrap();
        assert_eq!(result["content"]["text"], "Summarize|long text");
        assert_eq!(result["model"], "mcp");
        assert_eq!(result["stopReason"], "endTurn");
    }

    #[tokio::test]
    async fn embedding_sampling_truncates_input() {
        let sampler = RegistrySampler::new(registry().await);
        let result = sampler
            .create_message(json!({
                "systemPrompt": "é".repeat(EMBEDDING_INPUT_LIMIT + 50),
                "messages": [],
                "metadata": { "sample_type": "embedding" }
            }))
            .await
            .unwrap();
        assert_eq!(result["content"]["text"], EMBEDDING_INPUT_LIMIT.to_string());
        assert_eq!(result["model"], "embedding");
    }

    #[tokio::test]
    async fn unloaded_role_and_unknown_type_fail() {
        let table = Arc::new(BackendTable::new());
        let sampler = RegistrySampler::new(Arc::new(OperationRegistry::new(table)));
        assert!(sampler.create_message(json!({ "messages": [] })).await.is_err());
        assert!(
            sampler
                .create_message(json!({ "metadata": { "sample_type": "image" } }))
                .await
                .is_err()
        );
    }
}
