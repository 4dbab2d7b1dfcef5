//! The dispatcher task behind a [`ControlClient`](super::ControlClient).
//!
//! Exactly one dispatcher runs per client. It owns the transport and every
//! mutable piece of protocol state: the pending-request map, the subscriber
//! queue and active slot, the stream-text accumulator, and the handshake
//! flag. Host callbacks never run here; each CLI-initiated request is
//! dispatched to its own task and its reply funnels back through the
//! internal channel so the dispatcher stays the only writer.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use serde_json::{json, Value};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};

use crate::callbacks::{
    AbortSignal, CallbackRegistry, HookContext, PermissionCallback, PermissionDecision,
    PermissionRequest,
};
use crate::error::AgentError;
use crate::mcp::SdkMcpServer;
use crate::message::Message;
use crate::options::{AgentOptions, McpServerConfig, PermissionMode};
use crate::protocol::{
    self, ControlRequestBody, ControlRequestFrame, ControlResponseFrame, HandshakePayload,
    InboundFrame, RequestIdSource,
};
use crate::stream::{StreamEvent, StreamEventParser};
use crate::transport::{Transport, TransportEvent, TransportStatus};

use super::{SharedState, SubscriberId};

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const INTERNAL_CHANNEL_CAPACITY: usize = 64;
const MESSAGE_CHANNEL_CAPACITY: usize = 256;
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

pub(crate) enum Command {
    Subscribe {
        reply: oneshot::Sender<(
            SubscriberId,
            mpsc::Receiver<StreamEvent>,
            broadcast::Receiver<Message>,
        )>,
    },
    Unsubscribe {
        id: SubscriberId,
        reply: Option<oneshot::Sender<()>>,
    },
    SendMessage {
        subscriber: Option<SubscriberId>,
        payload: Value,
        reply: oneshot::Sender<Result<(), AgentError>>,
    },
    SetModel {
        model: String,
        reply: oneshot::Sender<Result<Value, AgentError>>,
    },
    SetPermissionMode {
        mode: PermissionMode,
        reply: oneshot::Sender<Result<Value, AgentError>>,
    },
    SetAgent {
        name: String,
        reply: oneshot::Sender<Result<Value, AgentError>>,
    },
    Interrupt {
        reply: oneshot::Sender<Result<Value, AgentError>>,
    },
    Stop {
        reply: Option<oneshot::Sender<()>>,
    },
}

enum Internal {
    CallbackReply { request_id: String, frame: Value },
    CancelExpired { request_id: String },
}

struct PendingRequest {
    reply: Option<oneshot::Sender<Result<Value, AgentError>>>,
    kind: PendingKind,
}

enum PendingKind {
    Initialize,
    SetModel { model: String },
    SetPermissionMode,
    SetAgent { name: String },
    Interrupt,
}

struct InflightCallback {
    signal: AbortSignal,
    handle: JoinHandle<()>,
}

struct SubscriberEntry {
    /// Absent for anonymous prompts queued without a consumer.
    events: Option<mpsc::Sender<StreamEvent>>,
    queued_payload: Option<Value>,
}

#[derive(Clone, Copy)]
enum ShutdownReason {
    Stopped,
    Disconnected,
}

impl ShutdownReason {
    fn error(&self) -> AgentError {
        match self {
            ShutdownReason::Stopped => AgentError::Stopped,
            ShutdownReason::Disconnected => AgentError::Disconnected,
        }
    }

    fn terminal_message(&self) -> &'static str {
        match self {
            ShutdownReason::Stopped => "client stopped",
            ShutdownReason::Disconnected => "agent process exited",
        }
    }
}

/// Builds the registry and handshake from `options`, spawns the dispatcher,
/// and returns the handles the client front-end keeps.
pub(crate) fn spawn(
    options: AgentOptions,
    transport: Box<dyn Transport>,
    transport_rx: broadcast::Receiver<TransportEvent>,
) -> (mpsc::Sender<Command>, Arc<SharedState>) {
    let mut registry = CallbackRegistry::new();
    let mut handshake = HandshakePayload::default();

    for (event, matchers) in &options.hooks {
        let mut entries = Vec::new();
        for matcher in matchers {
            let ids: Vec<String> = matcher
                .hooks
                .iter()
                .map(|callback| registry.register(callback, matcher.timeout))
                .collect();
            let mut entry = json!({"hookCallbackIds": ids});
            if let Some(pattern) = &matcher.matcher {
                entry["matcher"] = Value::from(pattern.clone());
            }
            if let Some(timeout) = matcher.timeout {
                entry["timeout"] = Value::from(timeout.as_secs_f64());
            }
            entries.push(entry);
        }
        handshake
            .hooks
            .insert(event.as_str().to_string(), Value::Array(entries));
    }

    let mut sdk_servers = BTreeMap::new();
    for (name, config) in &options.mcp_servers {
        if let McpServerConfig::Sdk(server) = config {
            handshake.mcp_servers.insert(
                name.clone(),
                json!({"name": server.name(), "version": server.version()}),
            );
            sdk_servers.insert(name.clone(), Arc::clone(server));
        }
    }

    let shared = Arc::new(SharedState::new(
        options.agents.keys().cloned().collect(),
    ));
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_CHANNEL_CAPACITY);
    let (message_tx, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);

    let dispatcher = Dispatcher {
        transport,
        transport_rx,
        commands: command_rx,
        internal_tx,
        internal_rx,
        registry: Arc::new(registry),
        permission_callback: options.can_use_tool.clone(),
        sdk_servers,
        callback_timeout: options.callback_timeout(),
        cancel_grace: options.cancel_grace(),
        ids: RequestIdSource::new(),
        handshake,
        pending: HashMap::new(),
        inflight: HashMap::new(),
        subscribers: HashMap::new(),
        queue: VecDeque::new(),
        active: None,
        parser: StreamEventParser::new(),
        message_tx,
        shared: Arc::clone(&shared),
        next_subscriber: 0,
        pending_model_change: None,
    };
    tokio::spawn(dispatcher.run());

    (command_tx, shared)
}

struct Dispatcher {
    transport: Box<dyn Transport>,
    transport_rx: broadcast::Receiver<TransportEvent>,
    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    registry: Arc<CallbackRegistry>,
    permission_callback: Option<PermissionCallback>,
    sdk_servers: BTreeMap<String, Arc<SdkMcpServer>>,
    callback_timeout: Duration,
    cancel_grace: Duration,
    ids: RequestIdSource,
    handshake: HandshakePayload,
    pending: HashMap<String, PendingRequest>,
    inflight: HashMap<String, InflightCallback>,
    subscribers: HashMap<SubscriberId, SubscriberEntry>,
    queue: VecDeque<SubscriberId>,
    active: Option<SubscriberId>,
    parser: StreamEventParser,
    message_tx: broadcast::Sender<Message>,
    shared: Arc<SharedState>,
    next_subscriber: u64,
    pending_model_change: Option<String>,
}

impl Dispatcher {
    async fn run(mut self) {
        if let Err(err) = self.send_handshake().await {
            warn!(error = %err, "failed to send initialize handshake");
            self.shutdown(ShutdownReason::Disconnected).await;
            return;
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Stop { reply }) => {
                        self.shutdown(ShutdownReason::Stopped).await;
                        if let Some(reply) = reply {
                            let _ = reply.send(());
                        }
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        // Client handle and all subscribers are gone.
                        self.shutdown(ShutdownReason::Stopped).await;
                        break;
                    }
                },
                event = self.transport_rx.recv() => match event {
                    Ok(TransportEvent::Line(line)) => self.handle_line(line).await,
                    Ok(TransportEvent::Exited { status }) => {
                        debug!(?status, "agent process exited");
                        self.shutdown(ShutdownReason::Disconnected).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.shutdown(ShutdownReason::Disconnected).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "dispatcher lagged behind transport events");
                    }
                },
                Some(internal) = self.internal_rx.recv() => {
                    self.handle_internal(internal).await;
                }
            }
        }
    }

    async fn send_handshake(&mut self) -> Result<(), AgentError> {
        let request_id = self.ids.next();
        let frame =
            protocol::control_request(&request_id, protocol::initialize_body(&self.handshake));
        self.write_frame(&frame).await?;
        self.pending.insert(
            request_id,
            PendingRequest {
                reply: None,
                kind: PendingKind::Initialize,
            },
        );
        Ok(())
    }

    async fn write_frame(&self, frame: &Value) -> Result<(), AgentError> {
        let line = serde_json::to_string(frame)?;
        self.transport.send(&line).await
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe { reply } => {
                let id = self.mint_subscriber_id();
                let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
                self.subscribers.insert(
                    id,
                    SubscriberEntry {
                        events: Some(tx),
                        queued_payload: None,
                    },
                );
                if self.active.is_none() {
                    self.active = Some(id);
                } else {
                    self.queue.push_back(id);
                }
                let _ = reply.send((id, rx, self.message_tx.subscribe()));
            }
            Command::Unsubscribe { id, reply } => {
                self.subscribers.remove(&id);
                self.queue.retain(|queued| *queued != id);
                if self.active == Some(id) {
                    self.active = None;
                    self.promote_next().await;
                }
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Command::SendMessage {
                subscriber,
                payload,
                reply,
            } => {
                let result = self.handle_send_message(subscriber, payload).await;
                let _ = reply.send(result);
            }
            Command::SetModel { model, reply } => {
                if self.pending_model_change.is_some() {
                    let _ = reply.send(Err(AgentError::ModelChangeInProgress));
                    return;
                }
                let body = protocol::set_model_body(&model);
                let kind = PendingKind::SetModel {
                    model: model.clone(),
                };
                if self.send_control(body, kind, reply).await {
                    self.pending_model_change = Some(model);
                }
            }
            Command::SetPermissionMode { mode, reply } => {
                let body = protocol::set_permission_mode_body(mode.as_str());
                self.send_control(body, PendingKind::SetPermissionMode, reply)
                    .await;
            }
            Command::SetAgent { name, reply } => {
                if !self.shared.available_agents.contains(&name) {
                    let _ = reply.send(Err(AgentError::AgentNotFound { name }));
                    return;
                }
                let body = protocol::set_agent_body(&name);
                self.send_control(body, PendingKind::SetAgent { name }, reply)
                    .await;
            }
            Command::Interrupt { reply } => {
                self.send_control(protocol::interrupt_body(), PendingKind::Interrupt, reply)
                    .await;
            }
            Command::Stop { .. } => unreachable!("Stop is handled by the run loop"),
        }
    }

    fn mint_subscriber_id(&mut self) -> SubscriberId {
        let id = SubscriberId(self.next_subscriber);
        self.next_subscriber += 1;
        id
    }

    /// Writes a control request and parks the caller until the matching
    /// response arrives. Returns whether the request made it onto the wire.
    async fn send_control(
        &mut self,
        body: Value,
        kind: PendingKind,
        reply: oneshot::Sender<Result<Value, AgentError>>,
    ) -> bool {
        if self.transport.status() != TransportStatus::Connected {
            let _ = reply.send(Err(AgentError::NotConnected));
            return false;
        }
        let request_id = self.ids.next();
        let frame = protocol::control_request(&request_id, body);
        match self.write_frame(&frame).await {
            Ok(()) => {
                self.pending.insert(
                    request_id,
                    PendingRequest {
                        reply: Some(reply),
                        kind,
                    },
                );
                true
            }
            Err(err) => {
                let _ = reply.send(Err(err));
                false
            }
        }
    }

    async fn handle_send_message(
        &mut self,
        subscriber: Option<SubscriberId>,
        payload: Value,
    ) -> Result<(), AgentError> {
        if self.transport.status() != TransportStatus::Connected {
            return Err(AgentError::NotConnected);
        }
        match subscriber {
            Some(id) => {
                if !self.subscribers.contains_key(&id) {
                    return Err(AgentError::UnknownSubscriber);
                }
                if self.active == Some(id) {
                    self.write_user_message(payload).await
                } else {
                    if let Some(entry) = self.subscribers.get_mut(&id) {
                        entry.queued_payload = Some(payload);
                    }
                    Ok(())
                }
            }
            None => {
                // Anonymous prompt: it still occupies the active slot while
                // in flight so later subscribers queue behind it.
                let id = self.mint_subscriber_id();
                if self.active.is_none() && self.queue.is_empty() {
                    self.subscribers.insert(
                        id,
                        SubscriberEntry {
                            events: None,
                            queued_payload: None,
                        },
                    );
                    self.active = Some(id);
                    match self.write_user_message(payload).await {
                        Ok(()) => Ok(()),
                        Err(err) => {
                            self.subscribers.remove(&id);
                            self.active = None;
                            Err(err)
                        }
                    }
                } else {
                    self.subscribers.insert(
                        id,
                        SubscriberEntry {
                            events: None,
                            queued_payload: Some(payload),
                        },
                    );
                    self.queue.push_back(id);
                    Ok(())
                }
            }
        }
    }

    async fn write_user_message(&self, payload: Value) -> Result<(), AgentError> {
        let frame = protocol::user_message(payload);
        self.write_frame(&frame).await
    }

    async fn handle_line(&mut self, line: String) {
        match protocol::decode_line(&line) {
            Err(err) => {
                let total = self.shared.decode_errors.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(error = %err, total, "dropping undecodable agent line");
            }
            Ok(None) => {}
            Ok(Some(frame)) => self.handle_frame(frame).await,
        }
    }

    async fn handle_frame(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::ControlRequest(request) => {
                self.dispatch_control_request(request).await;
            }
            InboundFrame::ControlCancel { request_id } => {
                self.handle_cancel(request_id);
            }
            InboundFrame::ControlResponse(response) => {
                self.handle_control_response(response);
            }
            InboundFrame::StreamEvent { event, session_id } => {
                self.cache_session_id(session_id.as_deref());
                if let Some(parsed) = self.parser.parse_event(&event) {
                    let terminal = matches!(parsed, StreamEvent::MessageStop { .. });
                    self.deliver_stream_event(parsed);
                    if terminal {
                        self.finish_active_message().await;
                    }
                }
            }
            InboundFrame::Message(message) => {
                self.cache_session_id(message.session_id());
                // Complete messages fan out to every subscriber; send only
                // fails when nobody is listening.
                let _ = self.message_tx.send(message);
            }
        }
    }

    fn cache_session_id(&self, session_id: Option<&str>) {
        if let Some(session_id) = session_id {
            if self.shared.session_id().is_none() {
                SharedState::write(&self.shared.session_id, Some(session_id.to_string()));
            }
        }
    }

    fn deliver_stream_event(&mut self, event: StreamEvent) {
        let Some(id) = self.active else {
            return;
        };
        let Some(entry) = self.subscribers.get(&id) else {
            return;
        };
        let Some(tx) = entry.events.as_ref() else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = ?id, "subscriber event channel full; dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = ?id, "subscriber gone; dropping event");
            }
        }
    }

    async fn finish_active_message(&mut self) {
        if let Some(id) = self.active.take() {
            // The terminal event is already delivered; dropping the entry
            // closes its channel.
            self.subscribers.remove(&id);
        }
        self.promote_next().await;
    }

    async fn promote_next(&mut self) {
        while let Some(id) = self.queue.pop_front() {
            if !self.subscribers.contains_key(&id) {
                continue;
            }
            self.active = Some(id);
            let payload = self
                .subscribers
                .get_mut(&id)
                .and_then(|entry| entry.queued_payload.take());
            let Some(payload) = payload else {
                return;
            };
            match self.write_user_message(payload).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(error = %err, subscriber = ?id, "failed writing queued prompt");
                    if let Some(entry) = self.subscribers.remove(&id) {
                        if let Some(tx) = entry.events {
                            let _ = tx.try_send(StreamEvent::Error {
                                error: err.to_string(),
                            });
                        }
                    }
                    self.active = None;
                }
            }
        }
    }

    fn handle_control_response(&mut self, response: ControlResponseFrame) {
        let Some(pending) = self.pending.remove(&response.request_id) else {
            warn!(request_id = %response.request_id, "control response for unknown request");
            return;
        };

        match (&pending.kind, &response.result) {
            (PendingKind::Initialize, Ok(result)) => {
                SharedState::write(&self.shared.server_info, Some(result.clone()));
                self.shared.initialized.store(true, Ordering::Release);
                debug!("control handshake complete");
            }
            (PendingKind::Initialize, Err(message)) => {
                warn!(message = %message, "initialize handshake rejected");
            }
            (PendingKind::SetModel { model }, Ok(result)) => {
                let accepted = result
                    .get("model")
                    .and_then(Value::as_str)
                    .unwrap_or(model)
                    .to_string();
                SharedState::write(&self.shared.current_model, Some(accepted));
                self.pending_model_change = None;
            }
            (PendingKind::SetModel { .. }, Err(_)) => {
                self.pending_model_change = None;
            }
            (PendingKind::SetAgent { name }, Ok(_)) => {
                SharedState::write(&self.shared.current_agent, Some(name.clone()));
            }
            _ => {}
        }

        if let Some(reply) = pending.reply {
            let _ = reply.send(
                response
                    .result
                    .map_err(|message| AgentError::ControlError { message }),
            );
        }
    }

    fn handle_cancel(&mut self, request_id: String) {
        let Some(entry) = self.inflight.get(&request_id) else {
            debug!(request_id = %request_id, "cancel for unknown or finished request");
            return;
        };
        entry.signal.raise();
        // Give the callback the grace period to return on its own before the
        // task is hard-cancelled and the reply synthesized.
        let internal = self.internal_tx.clone();
        let grace = self.cancel_grace;
        tokio::spawn(async move {
            time::sleep(grace).await;
            let _ = internal
                .send(Internal::CancelExpired { request_id })
                .await;
        });
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::CallbackReply { request_id, frame } => {
                if self.inflight.remove(&request_id).is_some() {
                    if let Err(err) = self.write_frame(&frame).await {
                        warn!(error = %err, request_id = %request_id, "failed writing control reply");
                    }
                } else {
                    debug!(request_id = %request_id, "dropping late callback reply");
                }
            }
            Internal::CancelExpired { request_id } => {
                if let Some(entry) = self.inflight.remove(&request_id) {
                    entry.handle.abort();
                    let frame = protocol::control_error(&request_id, "callback cancelled");
                    if let Err(err) = self.write_frame(&frame).await {
                        warn!(error = %err, request_id = %request_id, "failed writing cancel reply");
                    }
                }
            }
        }
    }

    async fn dispatch_control_request(&mut self, request: ControlRequestFrame) {
        let request_id = request.request_id;
        match request.body {
            ControlRequestBody::HookCallback {
                callback_id,
                input,
                tool_use_id,
            } => {
                let Some(entry) = self.registry.get(&callback_id) else {
                    warn!(callback_id = %callback_id, "hook callback not registered");
                    self.reply_error(
                        &request_id,
                        &format!("unknown hook callback id: {callback_id}"),
                    )
                    .await;
                    return;
                };
                let callback = Arc::clone(&entry.callback);
                let timeout = entry.timeout.unwrap_or(self.callback_timeout);
                let signal = AbortSignal::new();
                let context = HookContext {
                    signal: signal.clone(),
                };
                let internal = self.internal_tx.clone();
                let task_request_id = request_id.clone();
                let handle = tokio::spawn(async move {
                    let frame =
                        match time::timeout(timeout, callback(input, tool_use_id, context)).await {
                            Ok(Ok(output)) => match serde_json::to_value(&output) {
                                Ok(value) => protocol::control_success(&task_request_id, value),
                                Err(err) => protocol::control_error(
                                    &task_request_id,
                                    &format!("failed to serialize hook output: {err}"),
                                ),
                            },
                            Ok(Err(err)) => {
                                protocol::control_error(&task_request_id, &err.to_string())
                            }
                            Err(_) => protocol::control_error(
                                &task_request_id,
                                &format!("hook callback timed out after {timeout:?}"),
                            ),
                        };
                    let _ = internal
                        .send(Internal::CallbackReply {
                            request_id: task_request_id,
                            frame,
                        })
                        .await;
                });
                self.inflight
                    .insert(request_id, InflightCallback { signal, handle });
            }
            ControlRequestBody::CanUseTool {
                tool_name,
                input,
                permission_suggestions,
                blocked_path,
            } => {
                let Some(callback) = self.permission_callback.clone() else {
                    // No permission callback configured: allow.
                    let frame = protocol::control_success(
                        &request_id,
                        PermissionDecision::allow().to_wire(),
                    );
                    if let Err(err) = self.write_frame(&frame).await {
                        warn!(error = %err, "failed writing default permission reply");
                    }
                    return;
                };
                let signal = AbortSignal::new();
                let permission_request = PermissionRequest {
                    tool_name,
                    tool_input: input,
                    session_id: self.shared.session_id(),
                    suggestions: permission_suggestions,
                    blocked_path,
                    signal: signal.clone(),
                };
                let timeout = self.callback_timeout;
                let internal = self.internal_tx.clone();
                let task_request_id = request_id.clone();
                let handle = tokio::spawn(async move {
                    let frame = match time::timeout(timeout, callback(permission_request)).await {
                        Ok(Ok(decision)) => {
                            protocol::control_success(&task_request_id, decision.to_wire())
                        }
                        Ok(Err(err)) => {
                            protocol::control_error(&task_request_id, &err.to_string())
                        }
                        Err(_) => protocol::control_error(
                            &task_request_id,
                            &format!("permission callback timed out after {timeout:?}"),
                        ),
                    };
                    let _ = internal
                        .send(Internal::CallbackReply {
                            request_id: task_request_id,
                            frame,
                        })
                        .await;
                });
                self.inflight
                    .insert(request_id, InflightCallback { signal, handle });
            }
            ControlRequestBody::SdkMcpRequest {
                server_name,
                message,
            } => {
                let Some(server) = self.sdk_servers.get(&server_name).cloned() else {
                    warn!(server = %server_name, "sdk mcp request for unknown server");
                    self.reply_error(
                        &request_id,
                        &format!("unknown sdk mcp server: {server_name}"),
                    )
                    .await;
                    return;
                };
                let signal = AbortSignal::new();
                let timeout = self.callback_timeout;
                let internal = self.internal_tx.clone();
                let task_request_id = request_id.clone();
                let handle = tokio::spawn(async move {
                    let frame = match time::timeout(timeout, server.handle_message(&message)).await
                    {
                        Ok(Some(reply)) => protocol::control_success(
                            &task_request_id,
                            json!({"mcp_response": reply}),
                        ),
                        Ok(None) => protocol::control_success(&task_request_id, json!({})),
                        Err(_) => protocol::control_error(
                            &task_request_id,
                            &format!("mcp request timed out after {timeout:?}"),
                        ),
                    };
                    let _ = internal
                        .send(Internal::CallbackReply {
                            request_id: task_request_id,
                            frame,
                        })
                        .await;
                });
                self.inflight
                    .insert(request_id, InflightCallback { signal, handle });
            }
            ControlRequestBody::Unknown { subtype } => {
                warn!(subtype = %subtype, "unsupported control request subtype");
                self.reply_error(
                    &request_id,
                    &format!("unsupported control request subtype: {subtype}"),
                )
                .await;
            }
        }
    }

    async fn reply_error(&self, request_id: &str, message: &str) {
        let frame = protocol::control_error(request_id, message);
        if let Err(err) = self.write_frame(&frame).await {
            warn!(error = %err, request_id = %request_id, "failed writing error reply");
        }
    }

    async fn shutdown(&mut self, reason: ShutdownReason) {
        // Cancel in-flight callbacks and answer the CLI for each before the
        // transport goes away.
        let inflight: Vec<(String, InflightCallback)> = self.inflight.drain().collect();
        for (request_id, entry) in inflight {
            entry.signal.raise();
            entry.handle.abort();
            let frame = protocol::control_error(&request_id, "client shutting down");
            if let Err(err) = self.write_frame(&frame).await {
                debug!(error = %err, request_id = %request_id, "could not answer pending callback");
            }
        }

        for (_, pending) in self.pending.drain() {
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err(reason.error()));
            }
        }
        self.pending_model_change = None;

        let terminal = reason.terminal_message();
        for (_, entry) in self.subscribers.drain() {
            if let Some(tx) = entry.events {
                let _ = tx.try_send(StreamEvent::Error {
                    error: terminal.to_string(),
                });
            }
        }
        self.queue.clear();
        self.active = None;
        self.parser.reset();

        if let Err(err) = self.transport.close().await {
            debug!(error = %err, "transport close reported an error");
        }
    }
}

impl SharedState {
    fn session_id(&self) -> Option<String> {
        SharedState::read(&self.session_id)
    }
}
