//! Operation: the pluggable, stateful unit implementing one pipeline capability.
//!
//! Concrete capabilities (an OpenAI text generator, a sentence splitter, a
//! pitch shifter) implement [`Backend`]. The registry never talks to a
//! backend directly: it wraps each one in an [`Operation`], which owns the
//! lifecycle flag and the shared invocation path:
//!
//! 1. reject the call if the operation is not active (`UsedInactive`)
//! 2. extract and validate the kind's required input fields
//! 3. delegate to [`Backend::generate`] and forward every output chunk
//! 4. log the elapsed time once the output stream drains
//!
//! Backend errors pass through unmodified.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info};

use crate::chunk::{Chunk, Value};
use crate::error::OperationError;

/// A lazy, finite sequence of output chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Chunk, OperationError>> + Send>>;

/// Operation-specific settings. Keys a backend does not know are ignored.
pub type OpConfig = serde_json::Map<String, serde_json::Value>;

/// A stream yielding exactly one chunk.
pub fn once(chunk: Chunk) -> ChunkStream {
    futures::stream::once(async move { Ok(chunk) }).boxed()
}

/// A stream yielding the given chunks in order.
pub fn from_chunks(chunks: Vec<Chunk>) -> ChunkStream {
    futures::stream::iter(chunks.into_iter().map(Ok)).boxed()
}

/// What an operation does. Determines the input contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Stt,
    T2t,
    Tts,
    FilterText,
    FilterAudio,
    Embedding,
}

/// Input field shape required by an operation kind.
#[derive(Debug, Clone, Copy)]
enum FieldRule {
    Text,
    OptionalText,
    Bytes,
    PositiveInt,
    JsonArray,
}

impl FieldRule {
    fn check(self, value: &Value) -> Result<(), String> {
        match (self, value) {
            (FieldRule::Text, Value::Text(s)) if s.is_empty() => Err("must not be empty".into()),
            (FieldRule::Text | FieldRule::OptionalText, Value::Text(_)) => Ok(()),
            (FieldRule::Bytes, Value::Bytes(b)) if b.is_empty() => Err("must not be empty".into()),
            (FieldRule::Bytes, Value::Bytes(_)) => Ok(()),
            (FieldRule::PositiveInt, Value::Int(i)) if *i <= 0 => Err(format!("must be > 0, got {i}")),
            (FieldRule::PositiveInt, Value::Int(_)) => Ok(()),
            (FieldRule::JsonArray, Value::Json(serde_json::Value::Array(_))) => Ok(()),
            (rule, other) => Err(format!("expected {rule:?}, got {}", other.type_name())),
        }
    }
}

const AUDIO_FIELDS: &[(&str, FieldRule)] = &[
    ("audio_bytes", FieldRule::Bytes),
    ("sr", FieldRule::PositiveInt),
    ("sw", FieldRule::PositiveInt),
    ("ch", FieldRule::PositiveInt),
];

impl OpKind {
    pub const ALL: [OpKind; 6] = [
        OpKind::Stt,
        OpKind::T2t,
        OpKind::Tts,
        OpKind::FilterText,
        OpKind::FilterAudio,
        OpKind::Embedding,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Stt => "stt",
            OpKind::T2t => "t2t",
            OpKind::Tts => "tts",
            OpKind::FilterText => "filter_text",
            OpKind::FilterAudio => "filter_audio",
            OpKind::Embedding => "embedding",
        }
    }

    fn fields(self) -> &'static [(&'static str, FieldRule)] {
        match self {
            OpKind::Stt => &[
                ("prompt", FieldRule::OptionalText),
                ("audio_bytes", FieldRule::Bytes),
                ("sr", FieldRule::PositiveInt),
                ("sw", FieldRule::PositiveInt),
                ("ch", FieldRule::PositiveInt),
            ],
            OpKind::T2t => &[
                ("instruction_prompt", FieldRule::OptionalText),
                ("messages", FieldRule::JsonArray),
            ],
            OpKind::Tts | OpKind::FilterText | OpKind::Embedding => {
                &[("content", FieldRule::Text)]
            }
            OpKind::FilterAudio => AUDIO_FIELDS,
        }
    }

    /// Names of the input fields this kind reads.
    pub fn input_fields(self) -> Vec<&'static str> {
        self.fields().iter().map(|(name, _)| *name).collect()
    }

    /// Filters pass unknown fields through; outputs are overlaid on the input.
    pub fn accumulates(self) -> bool {
        matches!(self, OpKind::FilterText | OpKind::FilterAudio)
    }

    /// Pull out and validate the fields this kind needs.
    ///
    /// A missing or mistyped required field is a contract violation and
    /// fails with [`OperationError::InvalidChunk`]. An absent optional text
    /// field is filled with the empty string.
    pub fn extract(self, chunk: &Chunk) -> Result<Chunk, OperationError> {
        let mut out = Chunk::new();
        for &(field, rule) in self.fields() {
            match chunk.get(field) {
                None if matches!(rule, FieldRule::OptionalText) => {
                    out.insert(field, "");
                }
                None => {
                    return Err(OperationError::InvalidChunk {
                        kind: self,
                        field: field.into(),
                        reason: "missing".into(),
                    });
                }
                Some(value) => {
                    rule.check(value).map_err(|reason| OperationError::InvalidChunk {
                        kind: self,
                        field: field.into(),
                        reason,
                    })?;
                    out.insert(field, value.clone());
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OpKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| OperationError::UnknownType(s.to_string()))
    }
}

/// The pipeline position an operation occupies.
///
/// Singleton roles hold at most one operation; chain roles hold an ordered
/// list with unique ids. `Mcp` is a dedicated text generator used for tool
/// selection, so it is backed by a `T2t` kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpRole {
    Stt,
    Mcp,
    T2t,
    Tts,
    FilterText,
    FilterAudio,
    Embedding,
}

impl OpRole {
    pub const ALL: [OpRole; 7] = [
        OpRole::Stt,
        OpRole::Mcp,
        OpRole::T2t,
        OpRole::Tts,
        OpRole::FilterText,
        OpRole::FilterAudio,
        OpRole::Embedding,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OpRole::Stt => "stt",
            OpRole::Mcp => "mcp",
            OpRole::T2t => "t2t",
            OpRole::Tts => "tts",
            OpRole::FilterText => "filter_text",
            OpRole::FilterAudio => "filter_audio",
            OpRole::Embedding => "embedding",
        }
    }

    pub fn kind(self) -> OpKind {
        match self {
            OpRole::Stt => OpKind::Stt,
            OpRole::Mcp | OpRole::T2t => OpKind::T2t,
            OpRole::Tts => OpKind::Tts,
            OpRole::FilterText => OpKind::FilterText,
            OpRole::FilterAudio => OpKind::FilterAudio,
            OpRole::Embedding => OpKind::Embedding,
        }
    }

    pub fn is_chain(self) -> bool {
        matches!(self, OpRole::FilterText | OpRole::FilterAudio)
    }
}

impl fmt::Display for OpRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpRole {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OpRole::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| OperationError::UnknownRole(s.to_string()))
    }
}

/// The variant-specific half of an operation.
///
/// `generate` receives only the fields its kind declares (already
/// validated) and returns a lazy stream; it must not borrow `self` into the
/// stream, so implementations clone whatever state they need.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Validate and apply settings. Keys not present leave settings unchanged.
    async fn configure(&self, config: &OpConfig) -> Result<(), OperationError>;

    /// Current values of every configurable field.
    async fn configuration(&self) -> OpConfig;

    /// Acquire resources (connections, models). Called once per activation.
    async fn start(&self) -> Result<(), OperationError> {
        Ok(())
    }

    /// Release resources.
    async fn close(&self) -> Result<(), OperationError> {
        Ok(())
    }

    fn generate(&self, input: Chunk) -> ChunkStream;
}

/// A backend plus its identity and lifecycle state.
pub struct Operation {
    kind: OpKind,
    id: String,
    active: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
    backend: Arc<dyn Backend>,
}

impl Operation {
    pub fn new(kind: OpKind, id: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self {
            kind,
            id: id.into(),
            active: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
            backend,
        }
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn configure(&self, config: &OpConfig) -> Result<(), OperationError> {
        self.backend.configure(config).await
    }

    pub async fn configuration(&self) -> OpConfig {
        self.backend.configuration().await
    }

    /// Activate the operation. Fails if it is already active.
    pub async fn start(&self) -> Result<(), OperationError> {
        let _guard = self.lifecycle.lock().await;
        if self.is_active() {
            return Err(OperationError::StartActive {
                kind: self.kind,
                id: self.id.clone(),
            });
        }
        info!(kind = %self.kind, id = %self.id, "Starting operation");
        self.backend.start().await?;
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Deactivate the operation. Fails if it is already inactive.
    pub async fn close(&self) -> Result<(), OperationError> {
        let _guard = self.lifecycle.lock().await;
        if !self.is_active() {
            return Err(OperationError::CloseInactive {
                kind: self.kind,
                id: self.id.clone(),
            });
        }
        info!(kind = %self.kind, id = %self.id, "Closing operation");
        self.active.store(false, Ordering::SeqCst);
        self.backend.close().await
    }

    /// Run the operation over one input chunk.
    ///
    /// Nothing happens until the returned stream is polled; the activity
    /// check and input validation surface as the stream's first item.
    pub fn invoke(self: &Arc<Self>, chunk: Chunk) -> ChunkStream {
        let op = Arc::clone(self);
        Box::pin(async_stream::try_stream! {
            if !op.is_active() {
                Err::<(), _>(OperationError::UsedInactive { kind: op.kind, id: op.id.clone() })?;
            }
            let started = Instant::now();
            let input = op.kind.extract(&chunk)?;
            let mut outputs = op.backend.generate(input);
            let mut produced = 0usize;
            while let Some(output) = outputs.next().await {
                let output = output?;
                produced += 1;
                if op.kind.accumulates() {
                    let mut merged = chunk.clone();
                    merged.merge(output);
                    yield merged;
                } else {
                    yield output;
                }
            }
            debug!(kind = %op.kind, id = %op.id, produced, "Operation stream drained");
            info!(
                kind = %op.kind,
                id = %op.id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Operation completed"
            );
        })
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::sync::Mutex;

    /// Uppercases `content`, remembers the last configured `suffix`.
    struct ShoutBackend {
        suffix: Mutex<String>,
    }

    #[async_trait]
    impl Backend for ShoutBackend {
        async fn configure(&self, config: &OpConfig) -> Result<(), OperationError> {
            if let Some(v) = config.get("suffix") {
                let s = v.as_str().ok_or_else(|| OperationError::InvalidConfig {
                    kind: OpKind::FilterText,
                    id: "shout".into(),
                    reason: "suffix must be a string".into(),
                })?;
                *self.suffix.lock().unwrap() = s.to_string();
            }
            Ok(())
        }

        async fn configuration(&self) -> OpConfig {
            let mut map = OpConfig::new();
            map.insert("suffix".into(), self.suffix.lock().unwrap().clone().into());
            map
        }

        fn generate(&self, input: Chunk) -> ChunkStream {
            let suffix = self.suffix.lock().unwrap().clone();
            let content = input.text("content").unwrap_or_default().to_uppercase();
            once(Chunk::new().with("content", format!("{content}{suffix}")))
        }
    }

    fn shout() -> Arc<Operation> {
        Arc::new(Operation::new(
            OpKind::FilterText,
            "shout",
            Arc::new(ShoutBackend {
                suffix: Mutex::new(String::new()),
            }),
        ))
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let op = shout();
        op.start().await.unwrap();
        let err = op.start().await.unwrap_err();
        assert!(matches!(err, OperationError::StartActive { .. }));
    }

    #[tokio::test]
    async fn close_inactive_fails() {
        let op = shout();
        let err = op.close().await.unwrap_err();
        assert!(matches!(err, OperationError::CloseInactive { .. }));
        op.start().await.unwrap();
        op.close().await.unwrap();
        assert!(!op.is_active());
    }

    #[tokio::test]
    async fn invoking_inactive_operation_fails() {
        let op = shout();
        let result: Result<Vec<Chunk>, _> = op.invoke(Chunk::new().with("content", "hi")).try_collect().await;
        assert!(matches!(result, Err(OperationError::UsedInactive { .. })));
    }

    #[tokio::test]
    async fn missing_required_field_is_a_contract_violation() {
        let op = shout();
        op.start().await.unwrap();
        let result: Result<Vec<Chunk>, _> = op.invoke(Chunk::new().with("text", "hi")).try_collect().await;
        match result {
            Err(OperationError::InvalidChunk { field, .. }) => assert_eq!(field, "content"),
            other => panic!("expected InvalidChunk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn filter_output_overlays_input_fields() {
        let op = shout();
        op.start().await.unwrap();
        let mut cfg = OpConfig::new();
        cfg.insert("suffix".into(), "!".into());
        op.configure(&cfg).await.unwrap();

        let out: Vec<Chunk> = op
            .invoke(Chunk::new().with("content", "hi").with("emotion", "joy"))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text("content"), Some("HI!"));
        assert_eq!(out[0].text("emotion"), Some("joy"));
    }

    #[test]
    fn stt_extract_defaults_prompt_and_checks_audio() {
        let chunk = Chunk::new()
            .with("audio_bytes", vec![0u8; 4])
            .with("sr", 16_000i64)
            .with("sw", 2i64)
            .with("ch", 1i64);
        let extracted = OpKind::Stt.extract(&chunk).unwrap();
        assert_eq!(extracted.text("prompt"), Some(""));

        let bad = chunk.clone().with("sr", 0i64);
        assert!(OpKind::Stt.extract(&bad).is_err());
    }

    #[test]
    fn role_and_kind_parse() {
        assert_eq!("filter_text".parse::<OpRole>().unwrap(), OpRole::FilterText);
        assert_eq!(OpRole::Mcp.kind(), OpKind::T2t);
        assert!(OpRole::FilterAudio.is_chain());
        assert!(!OpRole::Tts.is_chain());
        assert!(matches!("nope".parse::<OpRole>(), Err(OperationError::UnknownRole(_))));
        assert!(matches!("nope".parse::<OpKind>(), Err(OperationError::UnknownType(_))));
    }
}
