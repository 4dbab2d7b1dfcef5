#![forbid(unsafe_code)]
//! Async client SDK for driving an interactive AI agent CLI over a
//! bidirectional line-delimited JSON protocol.
//!
//! The crate spawns the CLI as a subprocess, frames its stdio as line JSON,
//! and — on the control path — participates in the agent's inner loop:
//! permission checks before tool execution, lifecycle hook callbacks, and
//! in-process MCP tool calls are all serviced from host-supplied functions
//! while responses stream back.
//!
//! ## Choosing a path
//! [`router::select`] inspects the option set and picks one of two shapes:
//! - **Streaming only** ([`StreamingSession`]): no control-plane feature is
//!   configured, so prompts go straight in and typed [`StreamEvent`]s come
//!   back. Cheapest possible wrapper.
//! - **Control client** ([`ControlClient`]): hooks, a permission callback,
//!   in-process MCP servers, subagents, or a non-default permission mode
//!   require servicing CLI-initiated control requests concurrently with the
//!   streamed response.
//!
//! [`connect`] applies the router and returns whichever session the options
//! call for.
//!
//! ```rust,no_run
//! use claude_agent::{AgentOptions, ControlClient, PermissionDecision};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let options = AgentOptions::builder()
//!     .cli_args(["--output-format", "stream-json", "--include-partial-messages"])
//!     .can_use_tool(claude_agent::permission(|req| async move {
//!         if req.tool_name == "Bash" {
//!             Ok(PermissionDecision::deny("no shell access"))
//!         } else {
//!             Ok(PermissionDecision::allow())
//!         }
//!     }))
//!     .build();
//!
//! let client = ControlClient::start(options).await?;
//! let mut subscriber = client.query("List the files in this repo").await?;
//! while let Some(event) = subscriber.next_event().await {
//!     println!("{event:?}");
//! }
//! client.stop().await?;
//! # Ok(()) }
//! ```
//!
//! ## Surfaces
//! - [`ControlClient`]: subscribe/send with FIFO subscriber turns, runtime
//!   `set_model` / `set_permission_mode` / `set_agent` / `interrupt`, and
//!   synchronous reads of the negotiated state.
//! - [`StreamingSession`]: `send_message` returning a lazy [`EventStream`].
//! - [`SdkMcpServer`] + [`tool`]: in-process tools the CLI can call without
//!   an extra subprocess.
//! - [`Transport`]: the plug-in seam; anything honoring the contract can
//!   stand in for the subprocess transport (tests inject mocks this way).

mod callbacks;
mod control;
mod error;
mod message;
mod options;
mod protocol;
mod stream;
mod transport;

pub mod mcp;
pub mod router;

pub use callbacks::{
    hook, permission, AbortSignal, CallbackError, CallbackFuture, CallbackResult, HookCallback,
    HookContext, HookEvent, HookMatcher, HookOutput, PermissionCallback, PermissionDecision,
    PermissionRequest,
};
pub use control::{ControlClient, Subscriber, SubscriberId};
pub use error::AgentError;
pub use mcp::{tool, McpTool, SdkMcpServer, ToolHandler, ToolOutput};
pub use message::Message;
pub use options::{
    AgentDefinition, AgentOptions, AgentOptionsBuilder, McpServerConfig, PermissionMode,
    StderrLineHandler, TransportPreference,
};
pub use protocol::{
    decode_line, ControlRequestBody, ControlRequestFrame, ControlResponseFrame, InboundFrame,
};
pub use router::{ControlFeature, RoutingDecision, TransportChoice};
pub use stream::{EventStream, StreamEvent, StreamEventParser, StreamingSession};
pub use transport::{SubprocessTransport, Transport, TransportEvent, TransportStatus};

/// A session opened by [`connect`]: whichever shape the router selected.
pub enum AgentSession {
    Streaming(StreamingSession),
    Control(ControlClient),
}

/// Opens a session, routing to the streaming-only or control-client shape
/// based on the configured features.
pub async fn connect(options: AgentOptions) -> Result<AgentSession, AgentError> {
    match router::select(&options) {
        TransportChoice::StreamingOnly => {
            Ok(AgentSession::Streaming(StreamingSession::connect(options).await?))
        }
        TransportChoice::ControlClient => {
            Ok(AgentSession::Control(ControlClient::start(options).await?))
        }
    }
}
