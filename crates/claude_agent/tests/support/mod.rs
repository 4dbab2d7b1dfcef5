#![allow(dead_code)]

//! Scripted in-memory transport driving the control client and streaming
//! session through the `Transport` plug-in seam.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time;

use claude_agent::{AgentError, Transport, TransportEvent, TransportStatus};

const WAIT_DEADLINE: Duration = Duration::from_secs(2);
const WAIT_POLL: Duration = Duration::from_millis(5);

pub struct MockTransport {
    events: broadcast::Sender<TransportEvent>,
    sent: Arc<Mutex<Vec<Value>>>,
    connected: Arc<AtomicBool>,
}

/// Test-side handle: pushes scripted CLI output and inspects what the SDK
/// wrote.
#[derive(Clone)]
pub struct MockHandle {
    events: broadcast::Sender<TransportEvent>,
    sent: Arc<Mutex<Vec<Value>>>,
    connected: Arc<AtomicBool>,
}

pub fn mock_transport() -> (Box<dyn Transport>, MockHandle) {
    let (events, _) = broadcast::channel(1024);
    let sent = Arc::new(Mutex::new(Vec::new()));
    let connected = Arc::new(AtomicBool::new(true));
    let transport = MockTransport {
        events: events.clone(),
        sent: Arc::clone(&sent),
        connected: Arc::clone(&connected),
    };
    let handle = MockHandle {
        events,
        sent,
        connected,
    };
    (Box::new(transport), handle)
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&mut self) -> Result<(), AgentError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, payload: &str) -> Result<(), AgentError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(AgentError::NotConnected);
        }
        let value: Value = serde_json::from_str(payload.trim_end())?;
        self.sent.lock().unwrap().push(value);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn close(&mut self) -> Result<(), AgentError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Exited { status: Some(0) });
        }
        Ok(())
    }

    fn status(&self) -> TransportStatus {
        if self.connected.load(Ordering::SeqCst) {
            TransportStatus::Connected
        } else {
            TransportStatus::Disconnected
        }
    }
}

impl MockHandle {
    /// Feeds one scripted CLI output line.
    pub fn push(&self, value: Value) {
        let _ = self
            .events
            .send(TransportEvent::Line(value.to_string()));
    }

    pub fn push_raw(&self, line: &str) {
        let _ = self.events.send(TransportEvent::Line(line.to_string()));
    }

    /// Simulates the CLI process exiting.
    pub fn exit(&self, status: Option<i32>) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Exited { status });
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    /// Waits until `count` frames have been written, then returns them.
    pub async fn wait_for_sent(&self, count: usize) -> Vec<Value> {
        let deadline = time::Instant::now() + WAIT_DEADLINE;
        loop {
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            if time::Instant::now() >= deadline {
                panic!("timed out waiting for {count} sent frames; got {sent:?}");
            }
            time::sleep(WAIT_POLL).await;
        }
    }

    /// Waits for the first written frame matching `predicate`.
    pub async fn wait_for_frame(&self, predicate: impl Fn(&Value) -> bool) -> Value {
        let deadline = time::Instant::now() + WAIT_DEADLINE;
        loop {
            if let Some(frame) = self.sent().into_iter().find(|frame| predicate(frame)) {
                return frame;
            }
            if time::Instant::now() >= deadline {
                panic!("timed out waiting for frame; sent: {:?}", self.sent());
            }
            time::sleep(WAIT_POLL).await;
        }
    }

    /// Waits for the outbound control request with the given subtype.
    pub async fn wait_for_control_request(&self, subtype: &str) -> Value {
        self.wait_for_frame(|frame| {
            frame["type"] == "control_request" && frame["request"]["subtype"] == subtype
        })
        .await
    }

    /// Waits for the control response answering `request_id`.
    pub async fn wait_for_control_response(&self, request_id: &str) -> Value {
        self.wait_for_frame(|frame| {
            frame["type"] == "control_response" && frame["response"]["request_id"] == request_id
        })
        .await
    }

    pub fn respond_success(&self, request_id: &str, result: Value) {
        self.push(json!({
            "type": "control_response",
            "response": {"subtype": "success", "request_id": request_id, "result": result},
        }));
    }

    pub fn respond_error(&self, request_id: &str, message: &str) {
        self.push(json!({
            "type": "control_response",
            "response": {"subtype": "error", "request_id": request_id, "error": message},
        }));
    }

    /// Answers the initialize handshake and returns its request body.
    pub async fn complete_handshake(&self) -> Value {
        let request = self.wait_for_control_request("initialize").await;
        let request_id = request["request_id"].as_str().unwrap().to_string();
        self.respond_success(&request_id, json!({"commands": []}));
        request["request"].clone()
    }

    /// Scripts a CLI-initiated control request.
    pub fn push_control_request(&self, request_id: &str, request: Value) {
        self.push(json!({
            "type": "control_request",
            "request_id": request_id,
            "request": request,
        }));
    }

    pub fn push_stream_event(&self, event: Value) {
        self.push(json!({"type": "stream_event", "session_id": "sess-1", "event": event}));
    }

    pub fn push_text_delta(&self, text: &str) {
        self.push_stream_event(json!({
            "type": "content_block_delta",
            "delta": {"type": "text_delta", "text": text},
        }));
    }

    pub fn push_message_start(&self) {
        self.push_stream_event(json!({
            "type": "message_start",
            "message": {"model": "claude-test", "role": "assistant"},
        }));
    }

    pub fn push_message_stop(&self) {
        self.push_stream_event(json!({"type": "message_stop"}));
    }

    /// User-message frames written so far, in order.
    pub fn user_messages(&self) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|frame| frame["type"] == "user")
            .collect()
    }
}
