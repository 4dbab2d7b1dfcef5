use std::{path::PathBuf, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to spawn agent process (binary={binary:?}): {source}")]
    Spawn {
        binary: PathBuf,
        source: std::io::Error,
    },
    #[error("working directory does not exist: {path:?}")]
    WorkingDirectory { path: PathBuf },
    #[error("transport is not connected")]
    NotConnected,
    #[error("failed writing to agent stdin: {0}")]
    SendFailed(std::io::Error),
    #[error("agent process exited")]
    Disconnected,
    #[error("failed to encode outbound frame: {0}")]
    JsonEncode(#[from] serde_json::Error),
    #[error("control request failed: {message}")]
    ControlError { message: String },
    #[error("a model change is already in progress")]
    ModelChangeInProgress,
    #[error("unknown agent: {name}")]
    AgentNotFound { name: String },
    #[error("unknown subscriber reference")]
    UnknownSubscriber,
    #[error("callback timed out after {timeout:?}")]
    CallbackTimeout { timeout: Duration },
    #[error("client is stopped")]
    Stopped,
    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Transient errors are surfaced to the individual caller; terminal
    /// errors shut the client down.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentError::Disconnected | AgentError::Stopped)
    }
}
