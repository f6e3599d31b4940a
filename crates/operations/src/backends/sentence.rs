use async_trait::async_trait;
use cadenza_core::operation::from_chunks;
use cadenza_core::{Backend, Chunk, ChunkStream, OpConfig, OperationError};

/// `filter_text/chunker_sentence`: one output chunk per sentence.
#[derive(Debug, Default)]
pub struct SentenceChunker;

impl SentenceChunker {
    pub fn new() -> Self {
        Self
    }
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '…' | '。' | '！' | '？')
}

fn is_closer(c: char) -> bool {
    matches!(c, '"' | '\'' | ')' | ']' | '”' | '’' | '*')
}

fn flush(sentences: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    current.clear();
}

/// Split on terminal punctuation followed by whitespace, and on newlines.
///
/// Trailing quotes and brackets stay with their sentence. A terminator
/// followed by a non-space (`3.5`, `a.b`) does not split.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\n' {
            flush(&mut sentences, &mut current);
            continue;
        }
        current.push(c);
        if !is_terminator(c) {
            continue;
        }
        while let Some(&next) = chars.peek() {
            if is_terminator(next) || is_closer(next) {
                current.push(next);
                chars.next();
            } else {
                break;
            }
        }
        if chars.peek().is_none_or(|next| next.is_whitespace()) {
            flush(&mut sentences, &mut current);
        }
    }
    flush(&mut sentences, &mut current);
    sentences
}

#[async_trait]
impl Backend for SentenceChunker {
    async fn configure(&self, _config: &OpConfig) -> Result<(), OperationError> {
        Ok(())
    }

    async fn configuration(&self) -> OpConfig {
        OpConfig::new()
    }

    fn generate(&self, input: Chunk) -> ChunkStream {
        let content = input.text("content").unwrap_or_default();
        from_chunks(
            split_sentences(content)
                .into_iter()
                .map(|sentence| Chunk::new().with("content", sentence))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_terminators() {
        assert_eq!(
            split_sentences("Hello there! How are you? I'm fine."),
            vec!["Hello there!", "How are you?", "I'm fine."]
        );
    }

    #[test]
    fn keeps_decimals_and_trailing_quotes() {
        assert_eq!(
            split_sentences("It costs 3.5 dollars. She said \"no.\" Then left"),
            vec!["It costs 3.5 dollars.", "She said \"no.\"", "Then left"]
        );
    }

    #[test]
    fn groups_repeated_punctuation_and_newlines() {
        assert_eq!(
            split_sentences("Wait... what?!\nOkay"),
            vec!["Wait...", "what?!", "Okay"]
        );
        assert!(split_sentences("   ").is_empty());
    }
}
