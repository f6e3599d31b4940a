//! Configuration loading, validation, and management for Cadenza.
//!
//! Named configurations live as TOML files in a config directory
//! (`configs/` by default). A configuration declares the operations to load,
//! the MCP tool servers to spawn, conversation-context settings, and
//! scheduler tuning.

use cadenza_core::{OpConfig, OpRole};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

pub use cadenza_core::ConfigError;

/// Name recorded in `current_config` when in-memory settings differ from
/// any file on disk.
pub const UNSAVED: &str = "Unsaved";

/// Top-level keys accepted by [`AppConfig::apply_update`].
const KNOWN_FIELDS: &[&str] = &[
    "config_dir",
    "current_config",
    "operations",
    "mcp",
    "prompter",
    "scheduler",
];

/// The root configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding named configuration files
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Name of the last loaded configuration, or `Unsaved`
    #[serde(default = "default_current_config")]
    pub current_config: String,

    /// Operations loaded at startup and by `operation_reload_from_config`, in order
    #[serde(default)]
    pub operations: Vec<OperationSpec>,

    /// MCP tool servers to spawn
    #[serde(default)]
    pub mcp: Vec<McpServerConfig>,

    /// Conversation context settings
    #[serde(default)]
    pub prompter: PrompterConfig,

    /// Job loop settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("configs")
}
fn default_current_config() -> String {
    UNSAVED.into()
}

/// One entry of the declarative operation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSpec {
    pub role: OpRole,
    pub id: String,
    #[serde(default)]
    pub config: OpConfig,
}

/// An external tool server reached over stdio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrompterConfig {
    #[serde(default = "default_prompt_dir")]
    pub prompt_dir: PathBuf,

    #[serde(default = "default_instruction_subdir")]
    pub instruction_subdir: String,

    #[serde(default = "default_character_subdir")]
    pub character_subdir: String,

    #[serde(default = "default_scene_subdir")]
    pub scene_subdir: String,

    #[serde(default = "default_prompt_file")]
    pub instruction_prompt_filename: String,

    #[serde(default = "default_prompt_file")]
    pub character_prompt_filename: String,

    #[serde(default = "default_prompt_file")]
    pub scene_prompt_filename: String,

    /// Name the character's own lines are recorded under
    #[serde(default = "default_character_name")]
    pub character_name: String,

    /// Display-name rewrites applied to incoming chat users
    #[serde(default)]
    pub name_translations: HashMap<String, String>,

    /// Maximum number of messages kept in history
    #[serde(default = "default_history_length")]
    pub history_length: usize,

    /// Append-only log of every history line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_file: Option<PathBuf>,
}

fn default_prompt_dir() -> PathBuf {
    PathBuf::from("prompts")
}
fn default_instruction_subdir() -> String {
    "instructions".into()
}
fn default_character_subdir() -> String {
    "characters".into()
}
fn default_scene_subdir() -> String {
    "scenes".into()
}
fn default_prompt_file() -> String {
    "example.txt".into()
}
fn default_character_name() -> String {
    "Cadenza".into()
}
fn default_history_length() -> usize {
    50
}

impl Default for PrompterConfig {
    fn default() -> Self {
        Self {
            prompt_dir: default_prompt_dir(),
            instruction_subdir: default_instruction_subdir(),
            character_subdir: default_character_subdir(),
            scene_subdir: default_scene_subdir(),
            instruction_prompt_filename: default_prompt_file(),
            character_prompt_filename: default_prompt_file(),
            scene_prompt_filename: default_prompt_file(),
            character_name: default_character_name(),
            name_translations: HashMap::new(),
            history_length: default_history_length(),
            history_file: None,
        }
    }
}

impl PrompterConfig {
    pub fn instruction_path(&self) -> PathBuf {
        self.prompt_dir
            .join(&self.instruction_subdir)
            .join(&self.instruction_prompt_filename)
    }

    pub fn character_path(&self) -> PathBuf {
        self.prompt_dir
            .join(&self.character_subdir)
            .join(&self.character_prompt_filename)
    }

    pub fn scene_path(&self) -> PathBuf {
        self.prompt_dir.join(&self.scene_subdir).join(&self.scene_prompt_filename)
    }

    /// Check the values that do not need the filesystem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.character_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "prompter.character_name must not be empty".into(),
            ));
        }
        if self.history_length == 0 {
            return Err(ConfigError::Validation(
                "prompter.history_length must be > 0".into(),
            ));
        }
        for (field, name) in [
            ("instruction_prompt_filename", &self.instruction_prompt_filename),
            ("character_prompt_filename", &self.character_prompt_filename),
            ("scene_prompt_filename", &self.scene_prompt_filename),
        ] {
            if name.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "prompter.{field} must not be empty"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Pause after an unexpected failure in the job loop itself
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
}

fn default_error_backoff_ms() -> u64 {
    1000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            error_backoff_ms: default_error_backoff_ms(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error: defaults are returned.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::read_file(path)
    }

    /// Load `<config_dir>/<name>.toml`, falling back to `<config_dir>/<name>`.
    pub fn load_named(config_dir: &Path, name: &str) -> Result<Self, ConfigError> {
        let with_ext = config_dir.join(format!("{name}.toml"));
        let bare = config_dir.join(name);
        let path = if with_ext.is_file() {
            with_ext
        } else if bare.is_file() {
            bare
        } else {
            return Err(ConfigError::UnknownFile(bare));
        };

        let mut config = Self::read_file(&path)?;
        config.config_dir = config_dir.to_path_buf();
        config.current_config = name.to_string();
        tracing::info!(config = name, path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Write this configuration as `<config_dir>/<name>.toml` and record the name.
    pub fn save_named(&mut self, name: &str) -> Result<PathBuf, ConfigError> {
        let file_name = if name.ends_with(".toml") {
            name.to_string()
        } else {
            format!("{name}.toml")
        };
        let path = self.config_dir.join(file_name);
        let write_err = |e: &dyn std::fmt::Display| ConfigError::Write {
            path: path.clone(),
            reason: e.to_string(),
        };

        std::fs::create_dir_all(&self.config_dir).map_err(|e| write_err(&e))?;
        let previous = std::mem::replace(&mut self.current_config, name.to_string());
        let rendered = match toml::to_string_pretty(self) {
            Ok(rendered) => rendered,
            Err(e) => {
                self.current_config = previous;
                return Err(write_err(&e));
            }
        };
        if let Err(e) = std::fs::write(&path, rendered) {
            self.current_config = previous;
            return Err(write_err(&e));
        }
        tracing::info!(config = name, path = %path.display(), "Saved configuration");
        Ok(path)
    }

    /// Merge a partial update given as a JSON object.
    ///
    /// Every key must be a known top-level field; on any failure nothing is
    /// committed. A successful update marks the configuration `Unsaved`.
    pub fn apply_update(&mut self, update: &serde_json::Value) -> Result<(), ConfigError> {
        let fields = update
            .as_object()
            .ok_or_else(|| ConfigError::Validation("config update must be an object".into()))?;

        if let Some(unknown) = fields.keys().find(|k| !KNOWN_FIELDS.contains(&k.as_str())) {
            return Err(ConfigError::UnknownField(unknown.clone()));
        }

        let mut merged = serde_json::to_value(&*self)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        if let Some(target) = merged.as_object_mut() {
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
        }

        let mut candidate: Self =
            serde_json::from_value(merged).map_err(|e| ConfigError::Validation(e.to_string()))?;
        candidate.validate()?;
        candidate.current_config = UNSAVED.into();
        *self = candidate;
        Ok(())
    }

    /// JSON view for status queries.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut chain_ids = HashSet::new();
        for op in &self.operations {
            if op.id.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "operation id for role {} must not be empty",
                    op.role
                )));
            }
            if op.role.is_chain() && !chain_ids.insert((op.role, op.id.as_str())) {
                return Err(ConfigError::Validation(format!(
                    "{} '{}' listed more than once",
                    op.role, op.id
                )));
            }
        }

        let mut mcp_ids = HashSet::new();
        for server in &self.mcp {
            if server.command.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "mcp server '{}' has no command",
                    server.id
                )));
            }
            if !mcp_ids.insert(server.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "mcp server id '{}' listed more than once",
                    server.id
                )));
            }
        }

        self.prompter.validate()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            current_config: default_current_config(),
            operations: vec![],
            mcp: vec![],
            prompter: PrompterConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[operations]]
role = "t2t"
id = "openai"
config = { model = "gpt-4o-mini", temperature = 0.7 }

[[operations]]
role = "filter_text"
id = "chunker_sentence"

[[operations]]
role = "filter_text"
id = "filter_clean"

[[mcp]]
id = "internet"
command = "python"
args = ["internet.py"]

[prompter]
character_name = "Emi"
history_length = 20

[scheduler]
error_backoff_ms = 250
"#;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.current_config, UNSAVED);
        assert_eq!(config.scheduler.error_backoff_ms, 1000);
        assert_eq!(config.prompter.history_length, 50);
    }

    #[test]
    fn parses_operation_list_in_order() {
        let config: AppConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.operations.len(), 3);
        assert_eq!(config.operations[0].role, OpRole::T2t);
        assert_eq!(config.operations[0].config["model"], "gpt-4o-mini");
        assert_eq!(config.operations[2].id, "filter_clean");
        assert_eq!(config.mcp[0].args, vec!["internet.py"]);
        assert_eq!(config.prompter.character_name, "Emi");
        assert_eq!(config.scheduler.error_backoff_ms, 250);
    }

    #[test]
    fn duplicate_chain_entries_rejected() {
        let mut config: AppConfig = toml::from_str(SAMPLE).unwrap();
        config.operations.push(OperationSpec {
            role: OpRole::FilterText,
            id: "filter_clean".into(),
            config: OpConfig::new(),
        });
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn load_named_tries_extension_then_bare_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("emi.toml"), SAMPLE).unwrap();
        std::fs::write(dir.path().join("plain"), "[scheduler]\nerror_backoff_ms = 5\n").unwrap();

        let config = AppConfig::load_named(dir.path(), "emi").unwrap();
        assert_eq!(config.current_config, "emi");
        assert_eq!(config.config_dir, dir.path());
        assert_eq!(config.operations.len(), 3);

        let config = AppConfig::load_named(dir.path(), "plain").unwrap();
        assert_eq!(config.scheduler.error_backoff_ms, 5);

        let err = AppConfig::load_named(dir.path(), "ghost").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownFile(_)));
        assert_eq!(err.kind(), "config_unknown_file");
    }

    #[test]
    fn update_rejects_unknown_fields_without_committing() {
        let mut config = AppConfig::default();
        let err = config
            .apply_update(&serde_json::json!({
                "scheduler": { "error_backoff_ms": 10 },
                "bogus": 1
            }))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownField(ref f) if f == "bogus"));
        assert_eq!(config.scheduler.error_backoff_ms, 1000);
    }

    #[test]
    fn update_rejects_invalid_values_without_committing() {
        let mut config = AppConfig::default();
        let err = config
            .apply_update(&serde_json::json!({ "prompter": { "history_length": 0 } }))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert_eq!(config.prompter.history_length, 50);
    }

    #[test]
    fn update_merges_and_marks_unsaved() {
        let mut config = AppConfig {
            current_config: "emi".into(),
            ..AppConfig::default()
        };
        config
            .apply_update(&serde_json::json!({
                "operations": [{ "role": "tts", "id": "openai" }]
            }))
            .unwrap();
        assert_eq!(config.operations.len(), 1);
        assert_eq!(config.operations[0].role, OpRole::Tts);
        assert_eq!(config.current_config, UNSAVED);
    }

    #[test]
    fn save_then_load_named() {
        let dir = tempfile::tempdir().unwrap();
        let mut config: AppConfig = toml::from_str(SAMPLE).unwrap();
        config.config_dir = dir.path().join("nested");

        let path = config.save_named("snapshot").unwrap();
        assert!(path.ends_with("snapshot.toml"));
        assert_eq!(config.current_config, "snapshot");

        let loaded = AppConfig::load_named(&config.config_dir, "snapshot").unwrap();
        assert_eq!(loaded.operations, config.operations);
        assert_eq!(loaded.prompter.character_name, "Emi");
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("error_backoff_ms"));
        assert!(toml_str.contains("Unsaved"));
    }
}
