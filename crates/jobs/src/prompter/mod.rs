//! Conversation context: history, custom context sources, and the prompts
//! built from them.
//!
//! History is bounded to `history_length` messages. When a history file is
//! configured every inserted line is queued for it; the owner drains the
//! queue with [`Prompter::take_unwritten_history`] and appends it with
//! [`append_history`] outside any lock.

mod message;

pub use message::{ContextMetadata, Message, time_from_timestamp};

use cadenza_config::PrompterConfig;
use cadenza_core::{ContextError, Error};
use cadenza_mcp::ToolCallRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Partial prompter settings, as sent by `context_configure`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrompterUpdate {
    pub name_translations: Option<HashMap<String, String>>,
    pub character_name: Option<String>,
    pub history_length: Option<usize>,
    pub instruction_prompt_filename: Option<String>,
    pub character_prompt_filename: Option<String>,
    pub scene_prompt_filename: Option<String>,
}

fn read_prompt(path: &Path) -> Result<String, ContextError> {
    std::fs::read_to_string(path).map_err(|e| ContextError::PromptFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn require_file(path: &Path) -> Result<(), ContextError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ContextError::PromptFile {
            path: path.to_path_buf(),
            reason: "no such file".into(),
        })
    }
}

/// Append `lines` to the history file at `path`, creating it and its
/// directory as needed.
pub async fn append_history(path: &Path, lines: &[String]) -> Result<(), ContextError> {
    let history_err = |e: std::io::Error| ContextError::HistoryFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(history_err)?;
    }
    let mut text = String::new();
    for line in lines {
        text.push_str(line);
        text.push('\n');
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(history_err)?;
    file.write_all(text.as_bytes()).await.map_err(history_err)?;
    file.flush().await.map_err(history_err)
}

#[derive(Debug)]
pub struct Prompter {
    config: PrompterConfig,
    contexts: Vec<ContextMetadata>,
    history: VecDeque<Message>,
    /// Lines inserted since the history file was last written.
    unwritten: Vec<String>,
    tooling_prompt: String,
    response_template: String,
}

impl Prompter {
    pub fn new(config: PrompterConfig) -> Self {
        Self {
            config,
            contexts: Vec::new(),
            history: VecDeque::new(),
            unwritten: Vec::new(),
            tooling_prompt: String::new(),
            response_template: String::new(),
        }
    }

    pub fn config(&self) -> &PrompterConfig {
        &self.config
    }

    pub fn character_name(&self) -> &str {
        &self.config.character_name
    }

    /// Apply a partial update. The result must validate and every prompt
    /// file must exist, otherwise nothing changes.
    pub fn configure(&mut self, update: PrompterUpdate) -> Result<(), Error> {
        let mut candidate = self.config.clone();
        if let Some(translations) = update.name_translations {
            candidate.name_translations = translations;
        }
        if let Some(name) = update.character_name {
            candidate.character_name = name;
        }
        if let Some(length) = update.history_length {
            candidate.history_length = length;
        }
        if let Some(file) = update.instruction_prompt_filename {
            candidate.instruction_prompt_filename = file;
        }
        if let Some(file) = update.character_prompt_filename {
            candidate.character_prompt_filename = file;
        }
        if let Some(file) = update.scene_prompt_filename {
            candidate.scene_prompt_filename = file;
        }

        candidate.validate()?;
        require_file(&candidate.instruction_path())?;
        require_file(&candidate.character_path())?;
        require_file(&candidate.scene_path())?;

        self.config = candidate;
        self.trim_history();
        Ok(())
    }

    fn trim_history(&mut self) {
        while self.history.len() > self.config.history_length {
            self.history.pop_front();
        }
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn insert_history(&mut self, message: Message) {
        if self.config.history_file.is_some() {
            self.unwritten.push(message.to_line());
        }
        self.history.push_back(message);
        self.trim_history();
    }

    /// Lines still owed to the history file, with its path.
    pub fn take_unwritten_history(&mut self) -> Option<(PathBuf, Vec<String>)> {
        let path = self.config.history_file.clone()?;
        if self.unwritten.is_empty() {
            return None;
        }
        Some((path, std::mem::take(&mut self.unwritten)))
    }

    pub fn history(&self) -> &VecDeque<Message> {
        &self.history
    }

    pub fn last(&self) -> Option<&Message> {
        self.history.back()
    }

    // Custom contexts

    /// Register a context source. Registering an existing id replaces it.
    pub fn register_custom_context(
        &mut self,
        id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<(), ContextError> {
        let metadata = ContextMetadata::new(id, name, description)?;
        match self.contexts.iter_mut().find(|c| c.id == id) {
            Some(existing) => *existing = metadata,
            None => self.contexts.push(metadata),
        }
        Ok(())
    }

    pub fn remove_custom_context(&mut self, id: &str) -> Result<(), ContextError> {
        let at = self
            .contexts
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| ContextError::UnknownContext(id.to_string()))?;
        self.contexts.remove(at);
        Ok(())
    }

    pub fn custom_context(&self, id: &str) -> Option<ContextMetadata> {
        self.contexts.iter().find(|c| c.id == id).cloned()
    }

    pub fn add_custom_context(
        &mut self,
        id: &str,
        contents: &str,
        time: Option<DateTime<Utc>>,
    ) -> Result<(), ContextError> {
        let context = self
            .custom_context(id)
            .ok_or_else(|| ContextError::UnknownContext(id.to_string()))?;
        let message = Message::custom(context, contents, time.unwrap_or_else(Utc::now))?;
        self.insert_history(message);
        Ok(())
    }

    // Conversation

    pub fn translate_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.config
            .name_translations
            .get(name)
            .map_or(name, String::as_str)
    }

    pub fn add_chat(
        &mut self,
        name: &str,
        message: &str,
        time: Option<DateTime<Utc>>,
    ) -> Result<(), ContextError> {
        let user = self.translate_name(name).to_string();
        let message = Message::chat(&user, message, time.unwrap_or_else(Utc::now))?;
        self.insert_history(message);
        Ok(())
    }

    pub fn add_request(&mut self, message: &str, time: Option<DateTime<Utc>>) -> Result<(), ContextError> {
        let message = Message::request(message, time.unwrap_or_else(Utc::now))?;
        self.insert_history(message);
        Ok(())
    }

    pub fn add_mcp_results(&mut self, results: &[ToolCallRecord]) -> Result<(), ContextError> {
        let now = Utc::now();
        for record in results {
            self.insert_history(Message::tool(&record.tool_name, &record.result, now)?);
        }
        debug!(count = results.len(), "Added tool results to history");
        Ok(())
    }

    // Prompts

    pub fn set_mcp_prompts(&mut self, tooling_prompt: String, response_template: String) {
        self.tooling_prompt = tooling_prompt;
        self.response_template = response_template;
    }

    fn context_descriptions(&self) -> String {
        self.contexts
            .iter()
            .map(|c| format!("{}: {}\n", c.name, c.description))
            .collect()
    }

    pub fn system_prompt(&self) -> Result<String, ContextError> {
        let instructions = read_prompt(&self.config.instruction_path())?;
        let character = read_prompt(&self.config.character_path())?;
        let scene = read_prompt(&self.config.scene_path())?;
        Ok(format!(
            "{instructions}\n{}\n{}\n### Character ###\n{character}\n### Scene ###\n{scene}",
            self.response_template,
            self.context_descriptions(),
        ))
    }

    /// History as newline-prefixed lines.
    pub fn history_text(&self) -> String {
        self.history
            .iter()
            .map(|m| format!("\n{}", m.to_line()))
            .collect()
    }

    pub fn history_dicts(&self) -> Vec<Value> {
        self.history.iter().map(Message::to_dict).collect()
    }

    /// History as chat-completion messages: the character's own lines are
    /// `assistant` turns, everything else is a `user` turn in line form.
    pub fn generation_messages(&self) -> Value {
        Value::Array(self.history.iter().map(|m| self.generation_message(m)).collect())
    }

    pub fn generation_message(&self, message: &Message) -> Value {
        let character = self.translate_name(&self.config.character_name);
        match message {
            Message::Chat { user, message, .. } if user == character => {
                json!({ "role": "assistant", "content": message })
            }
            other => json!({ "role": "user", "content": other.to_line() }),
        }
    }

    pub fn mcp_system_context(&self) -> &str {
        &self.tooling_prompt
    }

    pub fn mcp_user_context(&self) -> Result<String, ContextError> {
        let character = read_prompt(&self.config.character_path())?;
        let scene = read_prompt(&self.config.scene_path())?;
        Ok(format!(
            "<CHARACTER>{character}<SCENE>{scene}<SCRIPT>{}\n",
            self.history_text()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn prompt_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        for (sub, text) in [
            ("instructions", "Be brief."),
            ("characters", "Emi is cheerful."),
            ("scenes", "A stream."),
        ] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
            std::fs::write(dir.path().join(sub).join("example.txt"), text).unwrap();
        }
        dir
    }

    fn prompter(dir: &TempDir) -> Prompter {
        Prompter::new(PrompterConfig {
            prompt_dir: dir.path().to_path_buf(),
            character_name: "Emi".into(),
            history_length: 3,
            ..PrompterConfig::default()
        })
    }

    #[test]
    fn history_is_bounded() {
        let dir = prompt_dir();
        let mut p = prompter(&dir);
        for i in 0..5 {
            p.add_request(&format!("r{i}"), None).unwrap();
        }
        let lines: Vec<_> = p.history().iter().map(Message::to_line).collect();
        assert_eq!(lines, vec!["[REQUEST]: r2", "[REQUEST]: r3", "[REQUEST]: r4"]);
    }

    #[test]
    fn names_are_translated() {
        let dir = prompt_dir();
        let mut p = prompter(&dir);
        p.configure(PrompterUpdate {
            name_translations: Some(HashMap::from([("ann_42".to_string(), "Ann".to_string())])),
            ..Default::default()
        })
        .unwrap();
        p.add_chat("ann_42", "hello", None).unwrap();
        assert_eq!(p.last().unwrap().to_line(), "[Ann]: hello");
    }

    #[test]
    fn configure_rejects_missing_prompt_file_atomically() {
        let dir = prompt_dir();
        let mut p = prompter(&dir);
        let err = p
            .configure(PrompterUpdate {
                character_name: Some("Mika".into()),
                scene_prompt_filename: Some("missing.txt".into()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), "context_invalid");
        assert_eq!(p.character_name(), "Emi");
    }

    #[test]
    fn system_prompt_includes_contexts_and_tool_descriptions() {
        let dir = prompt_dir();
        let mut p = prompter(&dir);
        p.register_custom_context("game", "Game", Some("Live game state")).unwrap();
        p.set_mcp_prompts("TOOLS".into(), "<add> Add numbers\n\n".into());

        assert_eq!(
            p.system_prompt().unwrap(),
            "Be brief.\n<add> Add numbers\n\n\nGame: Live game state\n\n### Character ###\nEmi is cheerful.\n### Scene ###\nA stream."
        );
        assert_eq!(p.mcp_system_context(), "TOOLS");
    }

    #[test]
    fn custom_contexts_must_be_registered() {
        let dir = prompt_dir();
        let mut p = prompter(&dir);
        assert!(matches!(
            p.add_custom_context("game", "score", None),
            Err(ContextError::UnknownContext(_))
        ));
        p.register_custom_context("game", "Game", None).unwrap();
        p.add_custom_context("game", "score 2", None).unwrap();
        assert_eq!(p.last().unwrap().to_line(), "[CONTEXT#Game]: score 2");

        p.remove_custom_context("game").unwrap();
        assert!(p.remove_custom_context("game").is_err());
    }

    #[test]
    fn generation_messages_split_roles() {
        let dir = prompt_dir();
        let mut p = prompter(&dir);
        p.add_chat("Ann", "hi Emi", None).unwrap();
        p.add_chat("Emi", "hi Ann", None).unwrap();
        p.add_mcp_results(&[ToolCallRecord {
            tool_name: "weather".into(),
            arguments: json!({}),
            result: "sunny".into(),
        }])
        .unwrap();

        assert_eq!(
            p.generation_messages(),
            json!([
                { "role": "user", "content": "[Ann]: hi Emi" },
                { "role": "assistant", "content": "hi Ann" },
                { "role": "user", "content": "[MCP#weather]: sunny" },
            ])
        );
        assert_eq!(
            p.mcp_user_context().unwrap(),
            "<CHARACTER>Emi is cheerful.<SCENE>A stream.<SCRIPT>\n[Ann]: hi Emi\n[Emi]: hi Ann\n[MCP#weather]: sunny\n"
        );
    }

    #[tokio::test]
    async fn history_lines_are_appended_to_file() {
        let dir = prompt_dir();
        let log = dir.path().join("output").join("history.txt");
        let mut p = Prompter::new(PrompterConfig {
            prompt_dir: dir.path().to_path_buf(),
            history_file: Some(log.clone()),
            ..PrompterConfig::default()
        });
        p.add_request("one", None).unwrap();
        p.clear_history();
        p.add_request("two", None).unwrap();

        let (path, lines) = p.take_unwritten_history().unwrap();
        assert_eq!(path, log);
        append_history(&path, &lines).await.unwrap();
        assert!(p.take_unwritten_history().is_none());

        p.add_request("three", None).unwrap();
        let (path, lines) = p.take_unwritten_history().unwrap();
        append_history(&path, &lines).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(log).unwrap(),
            "[REQUEST]: one\n[REQUEST]: two\n[REQUEST]: three\n"
        );
    }

    #[test]
    fn nothing_is_queued_without_a_history_file() {
        let dir = prompt_dir();
        let mut p = prompter(&dir);
        p.add_request("one", None).unwrap();
        assert!(p.take_unwritten_history().is_none());
    }
}
