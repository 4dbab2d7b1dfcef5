//! The bidirectional control client.
//!
//! One dispatcher task per client multiplexes the CLI's stdio pair: outbound
//! user prompts, outbound control requests, inbound CLI-initiated control
//! requests (hooks, permission checks, in-process MCP calls), and streamed
//! partial-message events. The [`ControlClient`] handle is a thin command
//! front-end over that dispatcher; all mutable protocol state lives on the
//! dispatcher side.

mod dispatcher;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::warn;

use crate::error::AgentError;
use crate::message::Message;
use crate::options::{AgentOptions, PermissionMode};
use crate::stream::StreamEvent;
use crate::transport::{SubprocessTransport, Transport};

use dispatcher::Command;

/// Opaque reference to one subscriber slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// State readable without a round-trip to the dispatcher. Only the
/// dispatcher writes here.
#[derive(Debug)]
pub(crate) struct SharedState {
    initialized: AtomicBool,
    current_model: RwLock<Option<String>>,
    current_agent: RwLock<Option<String>>,
    session_id: RwLock<Option<String>>,
    server_info: RwLock<Option<Value>>,
    available_agents: Vec<String>,
    decode_errors: AtomicU64,
}

impl SharedState {
    fn new(available_agents: Vec<String>) -> Self {
        Self {
            initialized: AtomicBool::new(false),
            current_model: RwLock::new(None),
            current_agent: RwLock::new(None),
            session_id: RwLock::new(None),
            server_info: RwLock::new(None),
            available_agents,
            decode_errors: AtomicU64::new(0),
        }
    }

    fn read<T: Clone>(lock: &RwLock<Option<T>>) -> Option<T> {
        lock.read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write<T>(lock: &RwLock<Option<T>>, value: Option<T>) {
        *lock.write().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

/// Handle to a running control client.
///
/// Dropping the handle (and every [`Subscriber`]) shuts the dispatcher down;
/// call [`ControlClient::stop`] for a deterministic shutdown that waits for
/// cleanup to finish.
pub struct ControlClient {
    commands: mpsc::Sender<Command>,
    shared: Arc<SharedState>,
    receive_timeout: Duration,
}

impl ControlClient {
    /// Spawns the CLI subprocess configured by `options` and runs the
    /// control handshake against it.
    pub async fn start(options: AgentOptions) -> Result<Self, AgentError> {
        let transport = Box::new(SubprocessTransport::from_options(&options));
        Self::start_with_transport(options, transport).await
    }

    /// Like [`ControlClient::start`] but over a caller-supplied transport;
    /// the plug-in point for mocks and non-subprocess transports.
    pub async fn start_with_transport(
        options: AgentOptions,
        mut transport: Box<dyn Transport>,
    ) -> Result<Self, AgentError> {
        // Subscribe before spawning so no early output slips past the
        // dispatcher.
        let transport_rx = transport.subscribe();
        transport.start().await?;
        let receive_timeout = options.subscriber_receive_timeout();
        let (commands, shared) = dispatcher::spawn(options, transport, transport_rx);
        Ok(Self {
            commands,
            shared,
            receive_timeout,
        })
    }

    /// Registers a subscriber. The first subscriber becomes active
    /// immediately; later ones wait in FIFO order and are promoted one at a
    /// time as messages complete.
    pub async fn subscribe(&self) -> Result<Subscriber, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Subscribe { reply })
            .await
            .map_err(|_| AgentError::Stopped)?;
        let (id, events, messages) = rx.await.map_err(|_| AgentError::Stopped)?;
        Ok(Subscriber {
            id,
            events,
            messages,
            commands: self.commands.clone(),
            receive_timeout: self.receive_timeout,
            done: false,
        })
    }

    /// Removes a subscriber from the active slot or the queue. Idempotent;
    /// events already in flight on its channel may still be observed.
    pub async fn unsubscribe(&self, id: SubscriberId) -> Result<(), AgentError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Unsubscribe {
                id,
                reply: Some(reply),
            })
            .await
            .map_err(|_| AgentError::Stopped)?;
        rx.await.map_err(|_| AgentError::Stopped)
    }

    /// Sends a prompt with no subscriber attached: written immediately when
    /// the client is idle, otherwise queued behind the in-flight message.
    pub async fn send_message(&self, payload: impl Into<Value>) -> Result<(), AgentError> {
        self.send_message_inner(None, payload.into()).await
    }

    /// Subscribes and sends in one step, returning the subscriber that will
    /// observe the response.
    pub async fn query(&self, prompt: impl Into<Value>) -> Result<Subscriber, AgentError> {
        let subscriber = self.subscribe().await?;
        subscriber.send(prompt).await?;
        Ok(subscriber)
    }

    /// Requests a model switch; resolves when the CLI acknowledges it. Only
    /// one model change may be pending at a time.
    pub async fn set_model(&self, model: impl Into<String>) -> Result<String, AgentError> {
        let model = model.into();
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SetModel {
                model: model.clone(),
                reply,
            })
            .await
            .map_err(|_| AgentError::Stopped)?;
        let result = rx.await.map_err(|_| AgentError::Stopped)??;
        Ok(result
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(model))
    }

    pub async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), AgentError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SetPermissionMode { mode, reply })
            .await
            .map_err(|_| AgentError::Stopped)?;
        rx.await.map_err(|_| AgentError::Stopped)?.map(|_| ())
    }

    /// Switches the active subagent. Fails with [`AgentError::AgentNotFound`]
    /// before touching the wire when `name` is not a configured agent.
    pub async fn set_agent(&self, name: impl Into<String>) -> Result<(), AgentError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SetAgent {
                name: name.into(),
                reply,
            })
            .await
            .map_err(|_| AgentError::Stopped)?;
        rx.await.map_err(|_| AgentError::Stopped)?.map(|_| ())
    }

    /// Interrupts the in-flight turn.
    pub async fn interrupt(&self) -> Result<(), AgentError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Interrupt { reply })
            .await
            .map_err(|_| AgentError::Stopped)?;
        rx.await.map_err(|_| AgentError::Stopped)?.map(|_| ())
    }

    /// Last model accepted by the CLI; `None` until a `set_model` succeeds.
    pub fn get_model(&self) -> Option<String> {
        SharedState::read(&self.shared.current_model)
    }

    pub fn get_agent(&self) -> Option<String> {
        SharedState::read(&self.shared.current_agent)
    }

    pub fn get_available_agents(&self) -> Vec<String> {
        self.shared.available_agents.clone()
    }

    /// Session ID extracted from the first inbound message that carried one.
    pub fn session_id(&self) -> Option<String> {
        SharedState::read(&self.shared.session_id)
    }

    /// True once the CLI has acknowledged the initialize handshake; never
    /// reverts.
    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire)
    }

    /// The initialize response payload, once the handshake completed.
    pub fn server_info(&self) -> Option<Value> {
        SharedState::read(&self.shared.server_info)
    }

    /// Count of inbound lines dropped because they failed to decode.
    pub fn decode_error_count(&self) -> u64 {
        self.shared.decode_errors.load(Ordering::Relaxed)
    }

    /// Shuts the client down: pending control requests fail with a terminal
    /// error, in-flight callbacks are cancelled and answered with `error`
    /// replies, every subscriber receives a terminal event, and the
    /// transport is closed. Idempotent.
    pub async fn stop(&self) -> Result<(), AgentError> {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Stop { reply: Some(reply) })
            .await
            .is_err()
        {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    async fn send_message_inner(
        &self,
        subscriber: Option<SubscriberId>,
        payload: Value,
    ) -> Result<(), AgentError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SendMessage {
                subscriber,
                payload,
                reply,
            })
            .await
            .map_err(|_| AgentError::Stopped)?;
        rx.await.map_err(|_| AgentError::Stopped)?
    }
}

/// One consumer of one streamed response.
pub struct Subscriber {
    id: SubscriberId,
    events: mpsc::Receiver<StreamEvent>,
    messages: broadcast::Receiver<Message>,
    commands: mpsc::Sender<Command>,
    receive_timeout: Duration,
    done: bool,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Sends this subscriber's prompt: written immediately while the
    /// subscriber is active, otherwise stored and written on promotion.
    pub async fn send(&self, payload: impl Into<Value>) -> Result<(), AgentError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SendMessage {
                subscriber: Some(self.id),
                payload: payload.into(),
                reply,
            })
            .await
            .map_err(|_| AgentError::Stopped)?;
        rx.await.map_err(|_| AgentError::Stopped)?
    }

    /// Next stream event for this subscriber's message. Returns `None` once
    /// the stream is finished. If no event arrives within the configured
    /// receive timeout a synthetic [`StreamEvent::Error`] is returned and
    /// the stream ends.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.done {
            return None;
        }
        match tokio::time::timeout(self.receive_timeout, self.events.recv()).await {
            Ok(Some(event)) => {
                if event.is_terminal() {
                    self.done = true;
                }
                Some(event)
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(_) => {
                self.done = true;
                Some(StreamEvent::Error {
                    error: format!("no stream event within {:?}", self.receive_timeout),
                })
            }
        }
    }

    /// Next complete SDK message. All subscribers receive every complete
    /// message, independent of the stream-event channel.
    pub async fn next_message(&mut self) -> Option<Message> {
        loop {
            match self.messages.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "subscriber lagged behind message broadcasts");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let _ = self.commands.try_send(Command::Unsubscribe {
            id: self.id,
            reply: None,
        });
    }
}
