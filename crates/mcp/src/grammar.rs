//! The line-oriented tool-call grammar.
//!
//! A generator answers the tooling prompt with one call per line:
//!
//! ```text
//! <add> {"a": 1, "b": 2}
//! <weather> city="Oslo" days=3
//! <no-tool>
//! ```
//!
//! A line is a call when it starts with a `<name>` token (no whitespace
//! inside). The remainder is a JSON object, `key=value` pairs, or nothing.
//! Lines without a token are ignored; a token with a bad remainder is
//! reported as [`ProtocolError::MalformedToolCall`] for that line only.

use cadenza_core::ProtocolError;
use serde_json::{Map, Value};

/// Tool names that mean "call nothing".
pub const NO_OP_NAMES: &[&str] = &["no-tool", "no_op"];

#[derive(Debug, Clone)]
pub struct ParsedCall {
    pub name: String,
    pub arguments: Result<Map<String, Value>, ProtocolError>,
}

fn malformed(line: &str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedToolCall {
        line: line.to_string(),
        reason: reason.into(),
    }
}

/// Split a line into its `<name>` token and the remainder.
///
/// The token runs from the leading `<` to the last `>` before the first
/// whitespace.
fn split_token(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix('<')?;
    let token_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let close = rest[..token_end].rfind('>')?;
    let name = rest[..close].trim_start_matches('<').trim_end_matches('>');
    Some((name, &rest[close + 1..]))
}

/// Parse `key="quoted value" key=bare` pairs.
fn parse_pairs(text: &str) -> Result<Map<String, Value>, String> {
    let mut arguments = Map::new();
    let mut rest = text.trim_start();
    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| format!("expected key=value near '{rest}'"))?;
        let key = rest[..eq].trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(format!("invalid parameter name '{key}'"));
        }
        let after = &rest[eq + 1..];
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            let end = quoted
                .find('"')
                .ok_or_else(|| format!("unterminated string for '{key}'"))?;
            (Value::String(quoted[..end].to_string()), &quoted[end + 1..])
        } else {
            let end = after.find(char::is_whitespace).unwrap_or(after.len());
            let raw = &after[..end];
            let value = match serde_json::from_str::<Value>(raw) {
                Ok(value @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => value,
                _ => Value::String(raw.to_string()),
            };
            (value, &after[end..])
        };
        arguments.insert(key.to_string(), value);
        rest = remaining.trim_start();
    }
    Ok(arguments)
}

fn parse_arguments(line: &str, remainder: &str) -> Result<Map<String, Value>, ProtocolError> {
    let remainder = remainder.trim();
    if remainder.is_empty() {
        return Ok(Map::new());
    }
    if remainder.starts_with('{') {
        return match serde_json::from_str::<Value>(remainder) {
            Ok(Value::Object(arguments)) => Ok(arguments),
            Ok(other) => Err(malformed(line, format!("expected an object, got {other}"))),
            Err(e) => Err(malformed(line, e.to_string())),
        };
    }
    parse_pairs(remainder).map_err(|reason| malformed(line, reason))
}

/// Parse one line. `None` means the line dispatches nothing.
pub fn parse_line(line: &str) -> Option<ParsedCall> {
    let (name, remainder) = split_token(line)?;
    if name.is_empty() || NO_OP_NAMES.contains(&name) {
        return None;
    }
    Some(ParsedCall {
        name: name.to_string(),
        arguments: parse_arguments(line, remainder),
    })
}

/// Parse a whole generator response, one call per dispatching line.
pub fn parse_calls(text: &str) -> Vec<ParsedCall> {
    text.lines().filter_map(parse_line).collect()
}

/// Fill `{param}` placeholders in a URI template.
///
/// String values are percent-encoded; other values are inserted as their
/// JSON rendering. `{{` and `}}` produce literal braces.
pub fn fill_template(template: &str, arguments: &Map<String, Value>) -> Result<String, ProtocolError> {
    let mut uri = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                uri.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                uri.push('}');
            }
            '{' => {
                let mut key = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => key.push(c),
                        None => return Err(malformed(template, "unclosed '{' in URI template")),
                    }
                }
                let value = arguments.get(&key).ok_or_else(|| {
                    malformed(template, format!("missing template parameter '{key}'"))
                })?;
                match value {
                    Value::String(s) => uri.push_str(&urlencoding::encode(s)),
                    other => uri.push_str(&other.to_string()),
                }
            }
            c => uri.push(c),
        }
    }
    Ok(uri)
}
