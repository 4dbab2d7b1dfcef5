//! Codec for the line-delimited JSON protocol spoken with the CLI.
//!
//! Classification is total: a line that parses as JSON always maps to some
//! [`InboundFrame`], with unrecognized shapes falling through to
//! [`InboundFrame::Message`]. Only invalid JSON is an error, and the caller
//! is expected to log and drop it.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Map, Value};

use crate::message::Message;

/// One classified inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    ControlRequest(ControlRequestFrame),
    ControlCancel { request_id: String },
    ControlResponse(ControlResponseFrame),
    StreamEvent { event: Value, session_id: Option<String> },
    Message(Message),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlRequestFrame {
    pub request_id: String,
    pub body: ControlRequestBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequestBody {
    HookCallback {
        callback_id: String,
        input: Value,
        tool_use_id: Option<String>,
    },
    CanUseTool {
        tool_name: String,
        input: Value,
        permission_suggestions: Vec<Value>,
        blocked_path: Option<String>,
    },
    SdkMcpRequest {
        server_name: String,
        message: Value,
    },
    Unknown {
        subtype: String,
    },
}

/// Reply to an outbound control request.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlResponseFrame {
    pub request_id: String,
    pub result: Result<Value, String>,
}

/// Decodes one raw line. `Ok(None)` for blank lines.
pub fn decode_line(line: &str) -> Result<Option<InboundFrame>, serde_json::Error> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.trim().is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(line)?;
    Ok(Some(classify(value)))
}

/// Classifies a decoded frame. Never fails: malformed control frames fall
/// back to [`InboundFrame::Message`] so the client can keep running.
pub fn classify(value: Value) -> InboundFrame {
    match value.get("type").and_then(Value::as_str) {
        Some("control_request") => classify_control_request(value),
        Some("control_cancel_request") => match value.get("request_id").and_then(Value::as_str) {
            Some(request_id) => InboundFrame::ControlCancel {
                request_id: request_id.to_string(),
            },
            None => InboundFrame::Message(Message::from_value(value)),
        },
        Some("control_response") => classify_control_response(value),
        Some("stream_event") => {
            let session_id = value
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            let event = value.get("event").cloned().unwrap_or(Value::Null);
            InboundFrame::StreamEvent { event, session_id }
        }
        _ => InboundFrame::Message(Message::from_value(value)),
    }
}

fn classify_control_request(value: Value) -> InboundFrame {
    let Some(request_id) = value.get("request_id").and_then(Value::as_str) else {
        return InboundFrame::Message(Message::from_value(value));
    };
    let request_id = request_id.to_string();
    let request = value.get("request").cloned().unwrap_or(Value::Null);
    let subtype = request
        .get("subtype")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let body = match subtype.as_str() {
        "hook_callback" => ControlRequestBody::HookCallback {
            callback_id: str_field(&request, "callback_id").unwrap_or_default(),
            input: request.get("input").cloned().unwrap_or(Value::Null),
            tool_use_id: str_field(&request, "tool_use_id"),
        },
        "can_use_tool" => ControlRequestBody::CanUseTool {
            tool_name: str_field(&request, "tool_name").unwrap_or_default(),
            input: request.get("input").cloned().unwrap_or(Value::Null),
            permission_suggestions: request
                .get("permission_suggestions")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            blocked_path: str_field(&request, "blocked_path"),
        },
        "sdk_mcp_request" => ControlRequestBody::SdkMcpRequest {
            server_name: str_field(&request, "serverName")
                .or_else(|| str_field(&request, "server_name"))
                .unwrap_or_default(),
            message: request.get("message").cloned().unwrap_or(Value::Null),
        },
        other => ControlRequestBody::Unknown {
            subtype: other.to_string(),
        },
    };
    InboundFrame::ControlRequest(ControlRequestFrame { request_id, body })
}

fn classify_control_response(value: Value) -> InboundFrame {
    let response = value.get("response").cloned().unwrap_or(Value::Null);
    let Some(request_id) = response.get("request_id").and_then(Value::as_str) else {
        return InboundFrame::Message(Message::from_value(value));
    };
    let request_id = request_id.to_string();
    let result = match response.get("subtype").and_then(Value::as_str) {
        Some("error") => Err(response
            .get("error")
            .map(|e| match e.as_str() {
                Some(s) => s.to_string(),
                None => e.to_string(),
            })
            .unwrap_or_else(|| "unknown control error".to_string())),
        _ => Ok(response.get("result").cloned().unwrap_or(Value::Null)),
    };
    InboundFrame::ControlResponse(ControlResponseFrame { request_id, result })
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Mints request IDs unique within the process; IDs are never reused within
/// a client lifetime.
#[derive(Debug, Default)]
pub(crate) struct RequestIdSource {
    counter: AtomicU64,
}

impl RequestIdSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("req_{}_{:x}", n, std::process::id())
    }
}

/// Handshake payload sent in the initialize request.
#[derive(Debug, Clone, Default)]
pub(crate) struct HandshakePayload {
    /// `eventName → [{matcher, hookCallbackIds, timeout?}]`.
    pub hooks: Map<String, Value>,
    /// `serverName → {name, version}`.
    pub mcp_servers: Map<String, Value>,
}

pub(crate) fn control_request(request_id: &str, body: Value) -> Value {
    json!({
        "type": "control_request",
        "request_id": request_id,
        "request": body,
    })
}

pub(crate) fn initialize_body(handshake: &HandshakePayload) -> Value {
    json!({
        "subtype": "initialize",
        "hooks": if handshake.hooks.is_empty() {
            Value::Null
        } else {
            Value::Object(handshake.hooks.clone())
        },
        "mcpServers": Value::Object(handshake.mcp_servers.clone()),
        "version": env!("CARGO_PKG_VERSION"),
    })
}

pub(crate) fn set_model_body(model: &str) -> Value {
    json!({"subtype": "set_model", "model": model})
}

pub(crate) fn set_permission_mode_body(mode: &str) -> Value {
    json!({"subtype": "set_permission_mode", "mode": mode})
}

pub(crate) fn set_agent_body(agent: &str) -> Value {
    json!({"subtype": "set_agent", "agent": agent})
}

pub(crate) fn interrupt_body() -> Value {
    json!({"subtype": "interrupt"})
}

pub(crate) fn control_success(request_id: &str, result: Value) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "result": result,
        },
    })
}

pub(crate) fn control_error(request_id: &str, message: &str) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": message,
        },
    })
}

/// Wraps a prompt into the user-message frame the CLI reads from stdin.
/// String payloads become a plain text message; objects pass through as-is
/// so callers can send fully formed messages.
pub(crate) fn user_message(payload: Value) -> Value {
    match payload {
        Value::String(prompt) => json!({
            "type": "user",
            "message": {"role": "user", "content": prompt},
        }),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_and_crlf_lines_are_skipped() {
        assert!(decode_line("").unwrap().is_none());
        assert!(decode_line("   \r").unwrap().is_none());
        assert!(decode_line("{\"type\":\"system\"}\r").unwrap().is_some());
    }

    #[test]
    fn invalid_json_is_an_error_not_a_panic() {
        assert!(decode_line("{not-json").is_err());
    }

    #[test]
    fn classifies_hook_callback_request() {
        let frame = classify(json!({
            "type": "control_request",
            "request_id": "cli_1",
            "request": {
                "subtype": "hook_callback",
                "callback_id": "hook_0",
                "input": {"tool_name": "Bash"},
                "tool_use_id": "tu_9",
            },
        }));

        match frame {
            InboundFrame::ControlRequest(ControlRequestFrame { request_id, body }) => {
                assert_eq!(request_id, "cli_1");
                match body {
                    ControlRequestBody::HookCallback {
                        callback_id,
                        input,
                        tool_use_id,
                    } => {
                        assert_eq!(callback_id, "hook_0");
                        assert_eq!(input["tool_name"], "Bash");
                        assert_eq!(tool_use_id.as_deref(), Some("tu_9"));
                    }
                    other => panic!("unexpected body: {other:?}"),
                }
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn classifies_sdk_mcp_request_with_either_name_key() {
        for key in ["serverName", "server_name"] {
            let frame = classify(json!({
                "type": "control_request",
                "request_id": "cli_2",
                "request": {
                    "subtype": "sdk_mcp_request",
                    key: "calc",
                    "message": {"jsonrpc": "2.0", "id": 1, "method": "tools/list"},
                },
            }));
            match frame {
                InboundFrame::ControlRequest(ControlRequestFrame { body, .. }) => match body {
                    ControlRequestBody::SdkMcpRequest { server_name, .. } => {
                        assert_eq!(server_name, "calc");
                    }
                    other => panic!("unexpected body: {other:?}"),
                },
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_subtype_is_preserved_for_the_error_reply() {
        let frame = classify(json!({
            "type": "control_request",
            "request_id": "cli_3",
            "request": {"subtype": "mystery"},
        }));
        match frame {
            InboundFrame::ControlRequest(ControlRequestFrame { body, .. }) => {
                assert_eq!(
                    body,
                    ControlRequestBody::Unknown {
                        subtype: "mystery".to_string()
                    }
                );
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn control_response_success_and_error() {
        let ok = classify(json!({
            "type": "control_response",
            "response": {"subtype": "success", "request_id": "req_0", "result": {"model": "opus"}},
        }));
        match ok {
            InboundFrame::ControlResponse(frame) => {
                assert_eq!(frame.request_id, "req_0");
                assert_eq!(frame.result.unwrap()["model"], "opus");
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let err = classify(json!({
            "type": "control_response",
            "response": {"subtype": "error", "request_id": "req_1", "error": "no such model"},
        }));
        match err {
            InboundFrame::ControlResponse(frame) => {
                assert_eq!(frame.result.unwrap_err(), "no such model");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unrecognized_type_falls_back_to_message() {
        let frame = classify(json!({"type": "surprise", "k": 1}));
        assert!(matches!(frame, InboundFrame::Message(_)));

        // A control_request missing its request_id cannot be replied to and
        // is surfaced as an opaque message instead of being dropped.
        let frame = classify(json!({"type": "control_request", "request": {}}));
        assert!(matches!(frame, InboundFrame::Message(_)));
    }

    #[test]
    fn request_ids_are_unique_and_monotonic() {
        let ids = RequestIdSource::new();
        let a = ids.next();
        let b = ids.next();
        assert_ne!(a, b);
        assert!(a.starts_with("req_0_"));
        assert!(b.starts_with("req_1_"));
    }

    #[test]
    fn initialize_body_carries_hooks_and_server_manifest() {
        let mut handshake = HandshakePayload::default();
        handshake.hooks.insert(
            "PreToolUse".to_string(),
            json!([{"matcher": "Bash", "hookCallbackIds": ["hook_0"]}]),
        );
        handshake
            .mcp_servers
            .insert("calc".to_string(), json!({"name": "calc", "version": "1.0.0"}));

        let body = initialize_body(&handshake);
        assert_eq!(body["subtype"], "initialize");
        assert_eq!(body["hooks"]["PreToolUse"][0]["matcher"], "Bash");
        assert_eq!(body["mcpServers"]["calc"]["version"], "1.0.0");
        assert!(body["version"].is_string());

        let empty = initialize_body(&HandshakePayload::default());
        assert!(empty["hooks"].is_null());
    }

    #[test]
    fn user_message_wraps_strings_and_passes_objects() {
        let wrapped = user_message(Value::String("Run: ls".to_string()));
        assert_eq!(wrapped["type"], "user");
        assert_eq!(wrapped["message"]["content"], "Run: ls");

        let custom = json!({"type": "user", "message": {"role": "user", "content": []}});
        assert_eq!(user_message(custom.clone()), custom);
    }

    #[test]
    fn outbound_response_shapes() {
        let ok = control_success("cli_1", json!({"behavior": "allow"}));
        assert_eq!(ok["type"], "control_response");
        assert_eq!(ok["response"]["subtype"], "success");
        assert_eq!(ok["response"]["request_id"], "cli_1");

        let err = control_error("cli_2", "boom");
        assert_eq!(err["response"]["subtype"], "error");
        assert_eq!(err["response"]["error"], "boom");
    }
}
