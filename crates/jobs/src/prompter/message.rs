use cadenza_core::ContextError;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};

/// A registered custom context source, e.g. a game-state feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextMetadata {
    pub id: String,
    pub name: String,
    pub description: String,
}

impl ContextMetadata {
    pub fn new(id: &str, name: &str, description: Option<&str>) -> Result<Self, ContextError> {
        if id.is_empty() {
            return Err(ContextError::Empty("context_id"));
        }
        if name.is_empty() {
            return Err(ContextError::Empty("context_name"));
        }
        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.unwrap_or_default().to_string(),
        })
    }
}

/// One history entry. Every message renders to a single line.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Raw {
        message: String,
    },
    Request {
        message: String,
        time: DateTime<Utc>,
    },
    Chat {
        user: String,
        message: String,
        time: DateTime<Utc>,
    },
    Tool {
        tool: String,
        message: String,
        time: DateTime<Utc>,
    },
    Custom {
        context: ContextMetadata,
        message: String,
        time: DateTime<Utc>,
    },
}

fn one_line(message: &str, field: &'static str) -> Result<String, ContextError> {
    if message.is_empty() {
        return Err(ContextError::Empty(field));
    }
    Ok(message.replace('\n', ""))
}

/// Seconds since the epoch, falling back to now for out-of-range values.
pub fn time_from_timestamp(timestamp: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(timestamp, 0).single().unwrap_or_else(Utc::now)
}

impl Message {
    pub fn raw(message: &str) -> Result<Self, ContextError> {
        Ok(Self::Raw {
            message: one_line(message, "message")?,
        })
    }

    pub fn request(message: &str, time: DateTime<Utc>) -> Result<Self, ContextError> {
        Ok(Self::Request {
            message: one_line(message, "message")?,
            time,
        })
    }

    pub fn chat(user: &str, message: &str, time: DateTime<Utc>) -> Result<Self, ContextError> {
        if user.is_empty() {
            return Err(ContextError::Empty("user"));
        }
        Ok(Self::Chat {
            user: user.to_string(),
            message: one_line(message, "message")?,
            time,
        })
    }

    pub fn tool(tool: &str, result: &str, time: DateTime<Utc>) -> Result<Self, ContextError> {
        Ok(Self::Tool {
            tool: tool.to_string(),
            message: one_line(result, "tool result")?,
            time,
        })
    }

    pub fn custom(
        context: ContextMetadata,
        message: &str,
        time: DateTime<Utc>,
    ) -> Result<Self, ContextError> {
        Ok(Self::Custom {
            context,
            message: one_line(message, "context_contents")?,
            time,
        })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Raw { message }
            | Self::Request { message, .. }
            | Self::Chat { message, .. }
            | Self::Tool { message, .. }
            | Self::Custom { message, .. } => message,
        }
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Raw { .. } => None,
            Self::Request { time, .. }
            | Self::Chat { time, .. }
            | Self::Tool { time, .. }
            | Self::Custom { time, .. } => Some(*time),
        }
    }

    pub fn to_line(&self) -> String {
        match self {
            Self::Raw { message } => message.clone(),
            Self::Request { message, .. } => format!("[REQUEST]: {message}"),
            Self::Chat { user, message, .. } => format!("[{user}]: {message}"),
            Self::Tool { tool, message, .. } => format!("[MCP#{tool}]: {message}"),
            Self::Custom {
                context, message, ..
            } => format!("[CONTEXT#{}]: {message}", context.name),
        }
    }

    pub fn to_dict(&self) -> Value {
        match self {
            Self::Raw { message } => json!({ "type": "raw", "message": message }),
            Self::Request { message, time } => json!({
                "type": "request",
                "time": time.timestamp(),
                "message": message,
            }),
            Self::Chat {
                user,
                message,
                time,
            } => json!({
                "type": "chat",
                "user": user,
                "time": time.timestamp(),
                "message": message,
            }),
            Self::Tool {
                tool,
                message,
                time,
            } => json!({
                "type": "tool",
                "tool": tool,
                "time": time.timestamp(),
                "message": message,
            }),
            Self::Custom {
                context,
                message,
                time,
            } => json!({
                "type": "custom",
                "id": context.id,
                "time": time.timestamp(),
                "message": message,
            }),
        }
    }

    /// Rebuild a message from its [`to_dict`](Self::to_dict) form.
    ///
    /// Custom messages name their context by id; `lookup` resolves it.
    pub fn from_dict(
        value: &Value,
        lookup: impl Fn(&str) -> Option<ContextMetadata>,
    ) -> Result<Self, String> {
        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .ok_or_else(|| format!("message is missing '{name}'"))
        };
        let time = || {
            value
                .get("time")
                .and_then(Value::as_f64)
                .map(|t| time_from_timestamp(t as i64))
                .ok_or_else(|| "message is missing 'time'".to_string())
        };
        let message = field("message")?;

        let built = match field("type")? {
            "raw" => Self::raw(message),
            "request" => Self::request(message, time()?),
            "chat" => Self::chat(field("user")?, message, time()?),
            "tool" => Self::tool(field("tool")?, message, time()?),
            "custom" => {
                let id = field("id")?;
                let context = lookup(id).ok_or_else(|| format!("unknown context id '{id}'"))?;
                Self::custom(context, message, time()?)
            }
            other => return Err(format!("invalid message type '{other}'")),
        };
        built.map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> DateTime<Utc> {
        time_from_timestamp(1_700_000_000)
    }

    #[test]
    fn renders_one_line_per_kind() {
        let game = ContextMetadata::new("game", "Game", Some("Live game state")).unwrap();
        assert_eq!(Message::raw("a\nb").unwrap().to_line(), "ab");
        assert_eq!(Message::request("sing", at()).unwrap().to_line(), "[REQUEST]: sing");
        assert_eq!(Message::chat("Ann", "hi\nthere", at()).unwrap().to_line(), "[Ann]: hithere");
        assert_eq!(Message::tool("add", "3", at()).unwrap().to_line(), "[MCP#add]: 3");
        assert_eq!(
            Message::custom(game, "boss fight", at()).unwrap().to_line(),
            "[CONTEXT#Game]: boss fight"
        );
    }

    #[test]
    fn empty_messages_are_rejected() {
        assert!(matches!(Message::raw(""), Err(ContextError::Empty(_))));
        assert!(Message::chat("", "hi", at()).is_err());
        assert!(ContextMetadata::new("", "x", None).is_err());
    }

    #[test]
    fn dict_form_round_trips_through_lookup() {
        let game = ContextMetadata::new("game", "Game", None).unwrap();
        let original = Message::custom(game.clone(), "score 3", at()).unwrap();
        let dict = original.to_dict();
        assert_eq!(dict["type"], "custom");
        assert_eq!(dict["time"], 1_700_000_000);

        let rebuilt = Message::from_dict(&dict, |id| (id == "game").then(|| game.clone())).unwrap();
        assert_eq!(rebuilt, original);

        let unknown = Message::from_dict(&dict, |_| None);
        assert!(unknown.unwrap_err().contains("game"));
        assert!(Message::from_dict(&json!({ "type": "shout", "message": "x" }), |_| None).is_err());
    }
}
