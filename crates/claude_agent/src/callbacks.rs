//! Host-supplied callbacks and the registry that addresses them by ID.
//!
//! Hooks and the permission callback are untrusted host code. The control
//! client never runs them on its dispatcher: each invocation gets its own
//! task, a bounded timeout, and an [`AbortSignal`] for cooperative
//! cancellation. Callback IDs are assigned once while the option set is
//! walked at startup and shipped to the CLI in the handshake; the registry
//! is read-only afterwards.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Type-erased future returned by host callbacks and tool handlers.
pub type CallbackFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Error raised inside a host callback; the message text is forwarded to the
/// CLI in the `error` reply.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct CallbackError(pub String);

impl From<String> for CallbackError {
    fn from(message: String) -> Self {
        CallbackError(message)
    }
}

impl From<&str> for CallbackError {
    fn from(message: &str) -> Self {
        CallbackError(message.to_string())
    }
}

pub type CallbackResult<T> = Result<T, CallbackError>;

/// Cooperative cancellation flag handed to every callback invocation.
///
/// Raised when the CLI cancels the originating control request or when the
/// client shuts down. `is_raised` is a cheap atomic read; long-running
/// callbacks should poll it and return promptly once raised.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Context passed to a hook callback invocation.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub signal: AbortSignal,
}

/// Lifecycle events the CLI fires hooks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    UserPromptSubmit,
    Stop,
    SubagentStop,
    PreCompact,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::PreToolUse => "PreToolUse",
            HookEvent::PostToolUse => "PostToolUse",
            HookEvent::UserPromptSubmit => "UserPromptSubmit",
            HookEvent::Stop => "Stop",
            HookEvent::SubagentStop => "SubagentStop",
            HookEvent::PreCompact => "PreCompact",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hook callback: raw event input, optional tool-use ID, context.
pub type HookCallback = Arc<
    dyn Fn(Value, Option<String>, HookContext) -> CallbackFuture<CallbackResult<HookOutput>>
        + Send
        + Sync,
>;

/// Builds a [`HookCallback`] from an async closure.
pub fn hook<F, Fut>(f: F) -> HookCallback
where
    F: Fn(Value, Option<String>, HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallbackResult<HookOutput>> + Send + 'static,
{
    Arc::new(move |input, tool_use_id, ctx| {
        let future: CallbackFuture<CallbackResult<HookOutput>> =
            Box::pin(f(input, tool_use_id, ctx));
        future
    })
}

/// Decision map returned by a hook callback and forwarded to the CLI.
///
/// When several matchers fire for one event the CLI invokes each callback
/// in order; where the host aggregates conflicting replies, the first
/// `block` decision wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HookOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl HookOutput {
    pub fn allow() -> Self {
        Self::default()
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            decision: Some("block".to_string()),
            reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// One matcher entry under a hook event: a tool-name pattern, the callbacks
/// it routes to, and an optional per-matcher timeout override.
#[derive(Clone)]
pub struct HookMatcher {
    pub matcher: Option<String>,
    pub hooks: Vec<HookCallback>,
    pub timeout: Option<Duration>,
}

impl HookMatcher {
    pub fn new(matcher: impl Into<String>) -> Self {
        Self {
            matcher: Some(matcher.into()),
            hooks: Vec::new(),
            timeout: None,
        }
    }

    pub fn any() -> Self {
        Self {
            matcher: None,
            hooks: Vec::new(),
            timeout: None,
        }
    }

    pub fn hook(mut self, callback: HookCallback) -> Self {
        self.hooks.push(callback);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for HookMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookMatcher")
            .field("matcher", &self.matcher)
            .field("hooks", &self.hooks.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Context for a `can_use_tool` permission check.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub tool_name: String,
    pub tool_input: Value,
    pub session_id: Option<String>,
    pub suggestions: Vec<Value>,
    pub blocked_path: Option<String>,
    pub signal: AbortSignal,
}

/// Host verdict on a tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    Allow {
        /// Substituted for the input the CLI actually executes.
        updated_input: Option<Value>,
        /// Rule updates folded into the CLI's persistent permission store.
        updated_permissions: Vec<Value>,
    },
    Deny {
        message: String,
        interrupt: bool,
    },
}

impl PermissionDecision {
    pub fn allow() -> Self {
        PermissionDecision::Allow {
            updated_input: None,
            updated_permissions: Vec::new(),
        }
    }

    pub fn allow_with_input(updated_input: Value) -> Self {
        PermissionDecision::Allow {
            updated_input: Some(updated_input),
            updated_permissions: Vec::new(),
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        PermissionDecision::Deny {
            message: message.into(),
            interrupt: false,
        }
    }

    /// Wire shape consumed by the CLI.
    pub fn to_wire(&self) -> Value {
        match self {
            PermissionDecision::Allow {
                updated_input,
                updated_permissions,
            } => {
                let mut out = serde_json::Map::new();
                out.insert("behavior".to_string(), Value::from("allow"));
                if let Some(input) = updated_input {
                    out.insert("updatedInput".to_string(), input.clone());
                }
                if !updated_permissions.is_empty() {
                    out.insert(
                        "updatedPermissions".to_string(),
                        Value::Array(updated_permissions.clone()),
                    );
                }
                Value::Object(out)
            }
            PermissionDecision::Deny { message, interrupt } => {
                let mut out = serde_json::Map::new();
                out.insert("behavior".to_string(), Value::from("deny"));
                out.insert("message".to_string(), Value::from(message.clone()));
                if *interrupt {
                    out.insert("interrupt".to_string(), Value::from(true));
                }
                Value::Object(out)
            }
        }
    }
}

pub type PermissionCallback = Arc<
    dyn Fn(PermissionRequest) -> CallbackFuture<CallbackResult<PermissionDecision>> + Send + Sync,
>;

/// Builds a [`PermissionCallback`] from an async closure.
pub fn permission<F, Fut>(f: F) -> PermissionCallback
where
    F: Fn(PermissionRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallbackResult<PermissionDecision>> + Send + 'static,
{
    Arc::new(move |request| {
        let future: CallbackFuture<CallbackResult<PermissionDecision>> = Box::pin(f(request));
        future
    })
}

/// Append-only map from synthetic callback IDs to hook callbacks.
///
/// IDs are assigned while the option set is walked at client startup and
/// advertised to the CLI in the handshake. Each distinct callback function
/// gets exactly one ID (reverse lookup by function identity), so a callback
/// shared between matchers is registered once. Reads after the handshake are
/// lock-free: the registry is shared behind an `Arc` and never mutated again.
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    entries: Vec<RegistryEntry>,
}

pub(crate) struct RegistryEntry {
    pub id: String,
    pub callback: HookCallback,
    pub timeout: Option<Duration>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback`, reusing the existing ID when the same function
    /// was registered before. The first registration's timeout wins.
    pub fn register(&mut self, callback: &HookCallback, timeout: Option<Duration>) -> String {
        if let Some(entry) = self
            .entries
            .iter()
            .find(|entry| Arc::ptr_eq(&entry.callback, callback))
        {
            return entry.id.clone();
        }
        let id = format!("hook_{}", self.entries.len());
        self.entries.push(RegistryEntry {
            id: id.clone(),
            callback: Arc::clone(callback),
            timeout,
        });
        id
    }

    pub fn get(&self, id: &str) -> Option<&RegistryEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("entries", &self.len())
            .finish()
    }
}
