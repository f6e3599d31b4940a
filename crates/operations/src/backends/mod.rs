//! Built-in backends.
//!
//! Each backend keeps its settings behind a lock and applies a configure
//! call only after every supplied value has validated.

mod clean;
mod openai;
mod pitch;
mod sentence;

pub use clean::ResponseCleaner;
pub use openai::{OpenAiChat, OpenAiEmbedding};
pub use pitch::PitchShift;
pub use sentence::SentenceChunker;

use cadenza_core::{ChunkStream, OpConfig, OpKind, OperationError};

fn invalid(kind: OpKind, id: &str, reason: impl Into<String>) -> OperationError {
    OperationError::InvalidConfig {
        kind,
        id: id.to_string(),
        reason: reason.into(),
    }
}

fn backend_error(kind: OpKind, id: &str, reason: impl Into<String>) -> OperationError {
    OperationError::Backend {
        kind,
        id: id.to_string(),
        reason: reason.into(),
    }
}

/// A stream whose only item is `err`.
fn failed(err: OperationError) -> ChunkStream {
    Box::pin(futures::stream::once(async move { Err(err) }))
}

/// Typed reads of optional configuration keys.
struct ConfigReader<'a> {
    config: &'a OpConfig,
    kind: OpKind,
    id: &'a str,
}

impl<'a> ConfigReader<'a> {
    fn new(config: &'a OpConfig, kind: OpKind, id: &'a str) -> Self {
        Self { config, kind, id }
    }

    fn string(&self, key: &str) -> Result<Option<String>, OperationError> {
        match self.config.get(key) {
            None => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(invalid(self.kind, self.id, format!("{key} must be text, got {other}"))),
        }
    }

    fn float(&self, key: &str) -> Result<Option<f64>, OperationError> {
        match self.config.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| invalid(self.kind, self.id, format!("{key} must be a number, got {v}"))),
        }
    }

    fn int(&self, key: &str) -> Result<Option<i64>, OperationError> {
        match self.config.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_i64()
                .map(Some)
                .ok_or_else(|| invalid(self.kind, self.id, format!("{key} must be an integer, got {v}"))),
        }
    }

    fn in_range(&self, key: &str, value: f64, min: f64, max: f64) -> Result<(), OperationError> {
        if (min..=max).contains(&value) {
            Ok(())
        } else {
            Err(invalid(
                self.kind,
                self.id,
                format!("{key} must be between {min} and {max}, got {value}"),
            ))
        }
    }
}
