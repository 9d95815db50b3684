//! Classification of one upstream NDJSON object.
//!
//! Only three things matter to the relay: whether the object carries a
//! `message.content` string (forward the line), a truthy `done` flag
//! (complete), or a truthy `error` field (fail). Everything else Ollama sends
//! is ignored.

use serde_json::Value;

/// What one upstream line asks the relay to do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamFrame {
    /// The object has a `message.content` string
    pub has_content: bool,
    /// The object has a truthy `done` flag
    pub done: bool,
    /// Text of a truthy `error` field
    pub error: Option<String>,
}

impl UpstreamFrame {
    /// Parse one line; fails when the line is not a complete JSON value.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;
        Ok(Self::from_value(&value))
    }

    pub fn from_value(value: &Value) -> Self {
        let has_content = value
            .get("message")
            .and_then(|m| m.get("content"))
            .is_some_and(Value::is_string);

        let done = value.get("done").is_some_and(is_truthy);

        let error = value.get("error").filter(|e| is_truthy(e)).map(|e| match e {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });

        Self { has_content, done, error }
    }
}

/// Loose truthiness, matching how JSON producers tend to signal flags:
/// `false`, `null`, `0`, `""` are false; everything else is true.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
