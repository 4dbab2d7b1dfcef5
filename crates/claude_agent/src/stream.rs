//! Typed partial-message events and the fast-path streaming session.
//!
//! The CLI emits `stream_event` frames when partial-message mode is on; the
//! [`StreamEventParser`] turns them into the typed surface hosts consume and
//! maintains the running text accumulator. [`StreamingSession`] is the thin
//! wrapper used when no control-plane feature is configured: one transport,
//! one in-flight message, FIFO turns.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc, Mutex, OwnedMutexGuard},
    time,
};
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::options::AgentOptions;
use crate::protocol::{self, InboundFrame};
use crate::transport::{SubprocessTransport, Transport, TransportEvent, TransportStatus};

const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Typed stream events surfaced to hosts.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    MessageStart {
        model: Option<String>,
        role: Option<String>,
        usage: Option<Value>,
    },
    ContentBlockStart,
    ToolUseStart {
        name: String,
        id: Option<String>,
    },
    ToolInputDelta {
        json: String,
    },
    ThinkingStart,
    ThinkingDelta {
        thinking: String,
    },
    TextDelta {
        text: String,
        /// All text observed so far in the current message, this delta
        /// included.
        accumulated: String,
    },
    ContentBlockStop {
        final_text: String,
    },
    MessageDelta {
        stop_reason: Option<String>,
        stop_sequence: Option<String>,
    },
    MessageStop {
        final_text: String,
    },
    /// Synthesized by the adapter, never by the CLI: receive timeout,
    /// transport exit mid-stream, client shutdown.
    Error {
        error: String,
    },
}

impl StreamEvent {
    /// True for events that end the stream they appear on.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::MessageStop { .. } | StreamEvent::Error { .. }
        )
    }
}

/// Parses raw `stream_event` payloads into [`StreamEvent`]s, tracking the
/// text accumulator across one message. The accumulator resets when the
/// message terminates, so the next message starts from empty.
#[derive(Debug, Clone, Default)]
pub struct StreamEventParser {
    accumulated: String,
}

impl StreamEventParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn reset(&mut self) {
        self.accumulated.clear();
    }

    /// Maps one inner event object. Unknown event types yield `None`.
    pub fn parse_event(&mut self, event: &Value) -> Option<StreamEvent> {
        match event.get("type").and_then(Value::as_str)? {
            "message_start" => {
                let message = event.get("message");
                Some(StreamEvent::MessageStart {
                    model: nested_str(message, "model"),
                    role: nested_str(message, "role"),
                    usage: message.and_then(|m| m.get("usage")).cloned(),
                })
            }
            "content_block_start" => {
                let block = event.get("content_block");
                match block.and_then(|b| b.get("type")).and_then(Value::as_str) {
                    Some("tool_use") => Some(StreamEvent::ToolUseStart {
                        name: nested_str(block, "name").unwrap_or_default(),
                        id: nested_str(block, "id"),
                    }),
                    Some("thinking") => Some(StreamEvent::ThinkingStart),
                    _ => Some(StreamEvent::ContentBlockStart),
                }
            }
            "content_block_delta" => {
                let delta = event.get("delta");
                match delta.and_then(|d| d.get("type")).and_then(Value::as_str) {
                    Some("text_delta") => {
                        let text = nested_str(delta, "text").unwrap_or_default();
                        self.accumulated.push_str(&text);
                        Some(StreamEvent::TextDelta {
                            text,
                            accumulated: self.accumulated.clone(),
                        })
                    }
                    Some("input_json_delta") => Some(StreamEvent::ToolInputDelta {
                        json: nested_str(delta, "partial_json").unwrap_or_default(),
                    }),
                    Some("thinking_delta") => Some(StreamEvent::ThinkingDelta {
                        thinking: nested_str(delta, "thinking").unwrap_or_default(),
                    }),
                    _ => None,
                }
            }
            "content_block_stop" => Some(StreamEvent::ContentBlockStop {
                final_text: self.accumulated.clone(),
            }),
            "message_delta" => {
                let delta = event.get("delta");
                Some(StreamEvent::MessageDelta {
                    stop_reason: nested_str(delta, "stop_reason"),
                    stop_sequence: nested_str(delta, "stop_sequence"),
                })
            }
            "message_stop" => Some(StreamEvent::MessageStop {
                final_text: std::mem::take(&mut self.accumulated),
            }),
            other => {
                debug!(event_type = other, "ignoring unrecognized stream event");
                None
            }
        }
    }
}

fn nested_str(value: Option<&Value>, key: &str) -> Option<String> {
    value?.get(key)?.as_str().map(str::to_string)
}

/// Lazy event sequence for one prompt; ends after the terminal event.
pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl EventStream {
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

impl futures_core::Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        self.rx.poll_recv(cx)
    }
}

/// Fast-path session: no control plane, just prompts in and typed events
/// out. Concurrent `send_message` calls take FIFO turns; a second caller
/// waits until the first message has terminated.
pub struct StreamingSession {
    transport: Arc<Mutex<Box<dyn Transport>>>,
    turn_lock: Arc<Mutex<()>>,
    receive_timeout: Duration,
}

impl StreamingSession {
    /// Spawns the CLI subprocess configured by `options` and wraps it.
    pub async fn connect(options: AgentOptions) -> Result<Self, AgentError> {
        let receive_timeout = options.subscriber_receive_timeout();
        let mut transport = SubprocessTransport::from_options(&options);
        transport.start().await?;
        Ok(Self::from_started(Box::new(transport), receive_timeout))
    }

    /// Wraps an already started transport; the plug-in point for mocks.
    pub fn from_started(transport: Box<dyn Transport>, receive_timeout: Duration) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            turn_lock: Arc::new(Mutex::new(())),
            receive_timeout,
        }
    }

    /// Sends one prompt and returns its event sequence. The returned stream
    /// ends at `message_stop` (or a synthesized error); the session can then
    /// take the next message on the same transport.
    pub async fn send_message(
        &self,
        prompt: impl Into<Value>,
    ) -> Result<EventStream, AgentError> {
        let turn = Arc::clone(&self.turn_lock).lock_owned().await;

        let events = {
            let transport = self.transport.lock().await;
            if transport.status() != TransportStatus::Connected {
                return Err(AgentError::NotConnected);
            }
            let events = transport.subscribe();
            let frame = protocol::user_message(prompt.into());
            transport.send(&serde_json::to_string(&frame)?).await?;
            events
        };

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(forward_stream_events(
            events,
            tx,
            turn,
            self.receive_timeout,
        ));
        Ok(EventStream { rx })
    }

    pub async fn close(&self) -> Result<(), AgentError> {
        self.transport.lock().await.close().await
    }
}

/// Consumes transport lines for one message and forwards typed events until
/// the terminal event. Holds the turn permit for the whole message so queued
/// senders stay ordered even if the consumer walks away early.
async fn forward_stream_events(
    mut events: broadcast::Receiver<TransportEvent>,
    tx: mpsc::Sender<StreamEvent>,
    turn: OwnedMutexGuard<()>,
    receive_timeout: Duration,
) {
    let mut parser = StreamEventParser::new();
    let mut consumer_gone = false;

    loop {
        let line = match time::timeout(receive_timeout, events.recv()).await {
            Err(_) => {
                let error = format!("no stream event within {receive_timeout:?}");
                warn!(error = %error, "streaming receive timeout");
                if !consumer_gone {
                    let _ = tx.send(StreamEvent::Error { error }).await;
                }
                break;
            }
            Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                warn!(missed, "streaming consumer lagged; events dropped");
                continue;
            }
            Ok(Err(broadcast::error::RecvError::Closed)) | Ok(Ok(TransportEvent::Exited { .. })) => {
                if !consumer_gone {
                    let _ = tx
                        .send(StreamEvent::Error {
                            error: "agent process exited before message completed".to_string(),
                        })
                        .await;
                }
                break;
            }
            Ok(Ok(TransportEvent::Line(line))) => line,
        };

        match protocol::decode_line(&line) {
            Err(err) => {
                warn!(error = %err, "dropping undecodable agent line");
            }
            Ok(None) => {}
            Ok(Some(InboundFrame::StreamEvent { event, .. })) => {
                if let Some(parsed) = parser.parse_event(&event) {
                    let terminal = parsed.is_terminal();
                    if !consumer_gone && tx.send(parsed).await.is_err() {
                        consumer_gone = true;
                    }
                    if terminal {
                        break;
                    }
                }
            }
            // Complete messages are not part of the fast-path surface.
            Ok(Some(_)) => {}
        }
    }

    drop(turn);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_delta(text: &str) -> Value {
        json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": text}})
    }

    #[test]
    fn accumulates_prefixes_and_resets_at_message_stop() {
        let mut parser = StreamEventParser::new();

        let first = parser.parse_event(&text_delta("Hel")).unwrap();
        let second = parser.parse_event(&text_delta("lo")).unwrap();
        assert_eq!(
            first,
            StreamEvent::TextDelta {
                text: "Hel".to_string(),
                accumulated: "Hel".to_string()
            }
        );
        assert_eq!(
            second,
            StreamEvent::TextDelta {
                text: "lo".to_string(),
                accumulated: "Hello".to_string()
            }
        );

        let stop = parser.parse_event(&json!({"type": "message_stop"})).unwrap();
        assert_eq!(
            stop,
            StreamEvent::MessageStop {
                final_text: "Hello".to_string()
            }
        );
        assert_eq!(parser.accumulated(), "");

        let next = parser.parse_event(&text_delta("x")).unwrap();
        assert_eq!(
            next,
            StreamEvent::TextDelta {
                text: "x".to_string(),
                accumulated: "x".to_string()
            }
        );
    }

    #[test]
    fn maps_tool_use_and_thinking_blocks() {
        let mut parser = StreamEventParser::new();

        let tool = parser
            .parse_event(&json!({
                "type": "content_block_start",
                "content_block": {"type": "tool_use", "name": "Bash", "id": "tu_1"},
            }))
            .unwrap();
        assert_eq!(
            tool,
            StreamEvent::ToolUseStart {
                name: "Bash".to_string(),
                id: Some("tu_1".to_string())
            }
        );

        let input = parser
            .parse_event(&json!({
                "type": "content_block_delta",
                "delta": {"type": "input_json_delta", "partial_json": "{\"cmd\":"},
            }))
            .unwrap();
        assert_eq!(
            input,
            StreamEvent::ToolInputDelta {
                json: "{\"cmd\":".to_string()
            }
        );

        assert_eq!(
            parser
                .parse_event(&json!({
                    "type": "content_block_start",
                    "content_block": {"type": "thinking"},
                }))
                .unwrap(),
            StreamEvent::ThinkingStart
        );
        assert_eq!(
            parser
                .parse_event(&json!({
                    "type": "content_block_delta",
                    "delta": {"type": "thinking_delta", "thinking": "hmm"},
                }))
                .unwrap(),
            StreamEvent::ThinkingDelta {
                thinking: "hmm".to_string()
            }
        );
    }

    #[test]
    fn message_lifecycle_events() {
        let mut parser = StreamEventParser::new();

        let start = parser
            .parse_event(&json!({
                "type": "message_start",
                "message": {"model": "claude-x", "role": "assistant", "usage": {"input_tokens": 3}},
            }))
            .unwrap();
        match start {
            StreamEvent::MessageStart { model, role, usage } => {
                assert_eq!(model.as_deref(), Some("claude-x"));
                assert_eq!(role.as_deref(), Some("assistant"));
                assert_eq!(usage.unwrap()["input_tokens"], 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let delta = parser
            .parse_event(&json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn"},
            }))
            .unwrap();
        assert_eq!(
            delta,
            StreamEvent::MessageDelta {
                stop_reason: Some("end_turn".to_string()),
                stop_sequence: None
            }
        );
    }

    #[test]
    fn text_interleaved_with_tool_use_keeps_order_and_accumulator() {
        // message_start, text "Running ", tool_use_start, text "Done",
        // message_stop: four surfaced events plus start/stop bookkeeping.
        let mut parser = StreamEventParser::new();
        let script = [
            json!({"type": "message_start", "message": {"model": "m", "role": "assistant"}}),
            text_delta("Running "),
            json!({"type": "content_block_start", "content_block": {"type": "tool_use", "name": "Bash", "id": "t"}}),
            text_delta("Done"),
            json!({"type": "message_stop"}),
        ];

        let events: Vec<StreamEvent> = script
            .iter()
            .filter_map(|e| parser.parse_event(e))
            .collect();

        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
        assert!(matches!(events[1], StreamEvent::TextDelta { .. }));
        assert!(matches!(events[2], StreamEvent::ToolUseStart { .. }));
        assert!(matches!(events[3], StreamEvent::TextDelta { .. }));
        match &events[4] {
            StreamEvent::MessageStop { final_text } => assert_eq!(final_text, "Running Done"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        let mut parser = StreamEventParser::new();
        assert!(parser.parse_event(&json!({"type": "ping"})).is_none());
        assert!(parser.parse_event(&json!({"no_type": true})).is_none());
    }
}
