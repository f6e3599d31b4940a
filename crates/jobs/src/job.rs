//! Job identity, types, and typed arguments.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cadenza_core::{JobError, OpConfig, OpRole};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::prompter::PrompterUpdate;

/// Opaque unique job token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    SkipRequested,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Response,
    ContextClear,
    ContextConfigure,
    ContextRequestAdd,
    ContextConversationAddText,
    ContextConversationAddAudio,
    ContextCustomRegister,
    ContextCustomRemove,
    ContextCustomAdd,
    OperationLoad,
    #[serde(rename = "operation_reload_from_config")]
    OperationReloadFromConfig,
    OperationUnload,
    OperationConfigure,
    OperationUse,
    ConfigLoad,
    ConfigUpdate,
    ConfigSave,
}

impl JobType {
    pub const ALL: [JobType; 17] = [
        JobType::Response,
        JobType::ContextClear,
        JobType::ContextConfigure,
        JobType::ContextRequestAdd,
        JobType::ContextConversationAddText,
        JobType::ContextConversationAddAudio,
        JobType::ContextCustomRegister,
        JobType::ContextCustomRemove,
        JobType::ContextCustomAdd,
        JobType::OperationLoad,
        JobType::OperationReloadFromConfig,
        JobType::OperationUnload,
        JobType::OperationConfigure,
        JobType::OperationUse,
        JobType::ConfigLoad,
        JobType::ConfigUpdate,
        JobType::ConfigSave,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Response => "response",
            JobType::ContextClear => "context_clear",
            JobType::ContextConfigure => "context_configure",
            JobType::ContextRequestAdd => "context_request_add",
            JobType::ContextConversationAddText => "context_conversation_add_text",
            JobType::ContextConversationAddAudio => "context_conversation_add_audio",
            JobType::ContextCustomRegister => "context_custom_register",
            JobType::ContextCustomRemove => "context_custom_remove",
            JobType::ContextCustomAdd => "context_custom_add",
            JobType::OperationLoad => "operation_load",
            JobType::OperationReloadFromConfig => "operation_reload_from_config",
            JobType::OperationUnload => "operation_unload",
            JobType::OperationConfigure => "operation_configure",
            JobType::OperationUse => "operation_use",
            JobType::ConfigLoad => "config_load",
            JobType::ConfigUpdate => "config_update",
            JobType::ConfigSave => "config_save",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| JobError::UnknownType(s.to_string()))
    }
}

// --- Arguments ---

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Empty {}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseArgs {
    #[serde(default = "default_true")]
    pub include_audio: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestAddArgs {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversationTextArgs {
    pub user: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    pub content: String,
}

fn base64_bytes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversationAudioArgs {
    pub user: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Base64 on the wire, raw PCM here
    #[serde(deserialize_with = "base64_bytes")]
    pub audio_bytes: Vec<u8>,
    pub sr: i64,
    pub sw: i64,
    pub ch: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomRegisterArgs {
    pub context_id: String,
    pub context_name: String,
    #[serde(default)]
    pub context_description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomRemoveArgs {
    pub context_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomAddArgs {
    pub context_id: String,
    pub context_contents: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// One entry of an `operation_*` job's `ops` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpEntry {
    pub role: OpRole,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub config: OpConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpsArgs {
    #[serde(default)]
    pub ops: Vec<OpEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperationUseArgs {
    pub role: OpRole,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigNameArgs {
    pub config_name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigUpdateArgs {
    pub config_d: serde_json::Map<String, serde_json::Value>,
}

/// A job type with its validated arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum JobArgs {
    Response(ResponseArgs),
    ContextClear,
    ContextConfigure(PrompterUpdate),
    ContextRequestAdd(RequestAddArgs),
    ContextConversationAddText(ConversationTextArgs),
    ContextConversationAddAudio(ConversationAudioArgs),
    ContextCustomRegister(CustomRegisterArgs),
    ContextCustomRemove(CustomRemoveArgs),
    ContextCustomAdd(CustomAddArgs),
    OperationLoad(OpsArgs),
    OperationReloadFromConfig,
    OperationUnload(OpsArgs),
    OperationConfigure(OpsArgs),
    OperationUse(OperationUseArgs),
    ConfigLoad(ConfigNameArgs),
    ConfigUpdate(ConfigUpdateArgs),
    ConfigSave(ConfigNameArgs),
}

fn decode<T: DeserializeOwned>(
    job_type: JobType,
    kwargs: serde_json::Value,
) -> Result<T, JobError> {
    serde_json::from_value(kwargs).map_err(|e| JobError::InvalidArguments {
        job_type: job_type.to_string(),
        reason: e.to_string(),
    })
}

impl JobArgs {
    /// Deserialize `kwargs` into the argument struct for `job_type`.
    ///
    /// `null` is treated as an empty object.
    pub fn parse(job_type: JobType, kwargs: serde_json::Value) -> Result<Self, JobError> {
        let kwargs = match kwargs {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other,
        };
        let args = match job_type {
            JobType::Response => JobArgs::Response(decode(job_type, kwargs)?),
            JobType::ContextClear => {
                decode::<Empty>(job_type, kwargs)?;
                JobArgs::ContextClear
            }
            JobType::ContextConfigure => JobArgs::ContextConfigure(decode(job_type, kwargs)?),
            JobType::ContextRequestAdd => JobArgs::ContextRequestAdd(decode(job_type, kwargs)?),
            JobType::ContextConversationAddText => {
                JobArgs::ContextConversationAddText(decode(job_type, kwargs)?)
            }
            JobType::ContextConversationAddAudio => {
                JobArgs::ContextConversationAddAudio(decode(job_type, kwargs)?)
            }
            JobType::ContextCustomRegister => {
                JobArgs::ContextCustomRegister(decode(job_type, kwargs)?)
            }
            JobType::ContextCustomRemove => JobArgs::ContextCustomRemove(decode(job_type, kwargs)?),
            JobType::ContextCustomAdd => JobArgs::ContextCustomAdd(decode(job_type, kwargs)?),
            JobType::OperationLoad => {
                let args: OpsArgs = decode(job_type, kwargs)?;
                if let Some(entry) = args.ops.iter().find(|entry| entry.id.is_none()) {
                    return Err(JobError::InvalidArguments {
                        job_type: job_type.to_string(),
                        reason: format!("ops entry for role {} has no id", entry.role),
                    });
                }
                JobArgs::OperationLoad(args)
            }
            JobType::OperationReloadFromConfig => {
                decode::<Empty>(job_type, kwargs)?;
                JobArgs::OperationReloadFromConfig
            }
            JobType::OperationUnload => JobArgs::OperationUnload(decode(job_type, kwargs)?),
            JobType::OperationConfigure => JobArgs::OperationConfigure(decode(job_type, kwargs)?),
            JobType::OperationUse => JobArgs::OperationUse(decode(job_type, kwargs)?),
            JobType::ConfigLoad => JobArgs::ConfigLoad(decode(job_type, kwargs)?),
            JobType::ConfigUpdate => JobArgs::ConfigUpdate(decode(job_type, kwargs)?),
            JobType::ConfigSave => JobArgs::ConfigSave(decode(job_type, kwargs)?),
        };
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_type_names_round_trip() {
        for job_type in JobType::ALL {
            assert_eq!(job_type.as_str().parse::<JobType>().unwrap(), job_type);
            let encoded = serde_json::to_value(job_type).unwrap();
            assert_eq!(encoded, job_type.as_str());
        }
        assert!(matches!(
            "dance".parse::<JobType>(),
            Err(JobError::UnknownType(_))
        ));
    }

    #[test]
    fn arguments_are_typed_per_job() {
        let args = JobArgs::parse(JobType::Response, serde_json::Value::Null).unwrap();
        assert_eq!(args, JobArgs::Response(ResponseArgs { include_audio: true }));

        let args = JobArgs::parse(
            JobType::ContextConversationAddAudio,
            json!({ "user": "Ann", "audio_bytes": "AAEC", "sr": 16000, "sw": 2, "ch": 1 }),
        )
        .unwrap();
        match args {
            JobArgs::ContextConversationAddAudio(audio) => assert_eq!(audio.audio_bytes, vec![0, 1, 2]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn invalid_arguments_are_rejected() {
        let missing = JobArgs::parse(JobType::ContextRequestAdd, json!({}));
        assert!(matches!(missing, Err(JobError::InvalidArguments { .. })));

        let unknown = JobArgs::parse(JobType::ContextClear, json!({ "force": true }));
        assert!(unknown.is_err());

        let bad_audio = JobArgs::parse(
            JobType::ContextConversationAddAudio,
            json!({ "user": "Ann", "audio_bytes": "%%%", "sr": 16000, "sw": 2, "ch": 1 }),
        );
        assert!(bad_audio.is_err());

        let no_id = JobArgs::parse(JobType::OperationLoad, json!({ "ops": [{ "role": "tts" }] }));
        assert!(no_id.unwrap_err().to_string().contains("no id"));

        let bad_role = JobArgs::parse(JobType::OperationUnload, json!({ "ops": [{ "role": "dj" }] }));
        assert!(bad_role.is_err());
    }
}
