//! Complete SDK messages surfaced to subscribers.
//!
//! Each variant keeps the raw frame alongside the extracted fields so hosts
//! can reach anything the typed surface does not model.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Assistant {
        /// The nested assistant message payload (`message` field).
        content: Value,
        model: Option<String>,
        session_id: Option<String>,
        raw: Value,
    },
    User {
        content: Value,
        session_id: Option<String>,
        raw: Value,
    },
    System {
        subtype: Option<String>,
        session_id: Option<String>,
        raw: Value,
    },
    Result {
        subtype: Option<String>,
        is_error: bool,
        result: Option<String>,
        session_id: Option<String>,
        raw: Value,
    },
    Other {
        raw: Value,
    },
}

impl Message {
    pub fn from_value(value: Value) -> Message {
        let session_id = string_field(&value, "session_id");
        match value.get("type").and_then(Value::as_str) {
            Some("assistant") => Message::Assistant {
                content: value.get("message").cloned().unwrap_or(Value::Null),
                model: value
                    .get("message")
                    .and_then(|m| m.get("model"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                session_id,
                raw: value,
            },
            Some("user") => Message::User {
                content: value.get("message").cloned().unwrap_or(Value::Null),
                session_id,
                raw: value,
            },
            Some("system") => Message::System {
                subtype: string_field(&value, "subtype"),
                session_id,
                raw: value,
            },
            Some("result") => Message::Result {
                subtype: string_field(&value, "subtype"),
                is_error: value
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                result: string_field(&value, "result"),
                session_id,
                raw: value,
            },
            _ => Message::Other { raw: value },
        }
    }

    pub fn raw(&self) -> &Value {
        match self {
            Message::Assistant { raw, .. }
            | Message::User { raw, .. }
            | Message::System { raw, .. }
            | Message::Result { raw, .. }
            | Message::Other { raw } => raw,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Message::Assistant { session_id, .. }
            | Message::User { session_id, .. }
            | Message::System { session_id, .. }
            | Message::Result { session_id, .. } => session_id.as_deref(),
            Message::Other { raw } => raw.get("session_id").and_then(Value::as_str),
        }
    }

    /// Concatenated text blocks of an assistant message, if any.
    pub fn assistant_text(&self) -> Option<String> {
        let Message::Assistant { content, .. } = self else {
            return None;
        };
        let blocks = content.get("content")?.as_array()?;
        let mut text = String::new();
        for block in blocks {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(part) = block.get("text").and_then(Value::as_str) {
                    text.push_str(part);
                }
            }
        }
        (!text.is_empty()).then_some(text)
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}
