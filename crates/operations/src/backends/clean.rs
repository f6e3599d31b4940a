use async_trait::async_trait;
use cadenza_core::operation::once;
use cadenza_core::{Backend, Chunk, ChunkStream, OpConfig, OpKind, OperationError};
use regex::Regex;
use std::sync::Mutex;

use super::{backend_error, failed};

const ID: &str = "filter_clean";
const SPEAKER_TAG: &str = r"\[[^\[\]]+\]:\s*";

/// `filter_text/filter_clean`: strips `[Name]: ` speaker tags that
/// generators echo from the history format.
#[derive(Debug, Default)]
pub struct ResponseCleaner {
    pattern: Mutex<Option<Regex>>,
}

impl ResponseCleaner {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Remove tags until none remain; removing one can expose another.
pub fn strip_speaker_tags(pattern: &Regex, text: &str) -> String {
    let mut content = text.to_string();
    while let Some(found) = pattern.find(&content) {
        content.replace_range(found.range(), "");
    }
    content
}

#[async_trait]
impl Backend for ResponseCleaner {
    async fn configure(&self, _config: &OpConfig) -> Result<(), OperationError> {
        Ok(())
    }

    async fn configuration(&self) -> OpConfig {
        OpConfig::new()
    }

    async fn start(&self) -> Result<(), OperationError> {
        let pattern =
            Regex::new(SPEAKER_TAG).map_err(|e| backend_error(OpKind::FilterText, ID, e.to_string()))?;
        *self.pattern.lock().unwrap_or_else(|e| e.into_inner()) = Some(pattern);
        Ok(())
    }

    async fn close(&self) -> Result<(), OperationError> {
        *self.pattern.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    fn generate(&self, input: Chunk) -> ChunkStream {
        let guard = self.pattern.lock().unwrap_or_else(|e| e.into_inner());
        let Some(pattern) = guard.as_ref() else {
            return failed(backend_error(OpKind::FilterText, ID, "pattern not compiled"));
        };
        let content = strip_speaker_tags(pattern, input.text("content").unwrap_or_default());
        once(Chunk::new().with("content", content))
    }
}
