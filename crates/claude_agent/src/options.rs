//! The option set a host supplies when opening a session.
//!
//! Only the control-plane options are interpreted here; everything the CLI
//! consumes directly (model, toolset, working directory flags, …) arrives
//! pre-assembled in `cli_args` from the layer that owns option-to-flag
//! construction.

use std::{collections::BTreeMap, fmt, path::PathBuf, sync::Arc, time::Duration};

use serde::Serialize;

use crate::callbacks::{HookEvent, HookMatcher, PermissionCallback};
use crate::mcp::SdkMcpServer;

pub(crate) const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;
pub(crate) const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(300);
pub(crate) const DEFAULT_CANCEL_GRACE: Duration = Duration::from_millis(500);

/// Permission mode forwarded to the CLI; any non-default value routes the
/// session onto the control path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::Plan => "plan",
            PermissionMode::BypassPermissions => "bypassPermissions",
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, PermissionMode::Default)
    }
}

/// Caller override for the transport routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportPreference {
    #[default]
    Auto,
    CliOnly,
    Control,
}

/// An MCP server entry: either an external subprocess the CLI launches
/// itself, or an in-process registry served over the control plane.
#[derive(Clone)]
pub enum McpServerConfig {
    External {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    },
    Sdk(Arc<SdkMcpServer>),
}

impl McpServerConfig {
    pub fn is_sdk(&self) -> bool {
        matches!(self, McpServerConfig::Sdk(_))
    }
}

impl fmt::Debug for McpServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McpServerConfig::External { command, args, .. } => f
                .debug_struct("External")
                .field("command", command)
                .field("args", args)
                .finish(),
            McpServerConfig::Sdk(server) => f
                .debug_struct("Sdk")
                .field("name", &server.name())
                .finish(),
        }
    }
}

/// A named subagent definition, passed through to the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct AgentDefinition {
    pub description: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl AgentDefinition {
    pub fn new(description: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            prompt: prompt.into(),
            tools: None,
            model: None,
        }
    }
}

/// Callback receiving each stderr line the CLI emits. Absent, stderr is
/// discarded.
pub type StderrLineHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Configuration for one client. Build with [`AgentOptions::builder`].
#[derive(Clone, Default)]
pub struct AgentOptions {
    pub hooks: BTreeMap<HookEvent, Vec<HookMatcher>>,
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
    pub can_use_tool: Option<PermissionCallback>,
    pub agents: BTreeMap<String, AgentDefinition>,
    pub permission_mode: PermissionMode,
    pub include_partial_messages: bool,
    pub preferred_transport: TransportPreference,
    pub binary: Option<PathBuf>,
    pub cli_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub stderr_handler: Option<StderrLineHandler>,
    pub max_line_bytes: Option<usize>,
    pub callback_timeout: Option<Duration>,
    pub subscriber_receive_timeout: Option<Duration>,
    pub cancel_grace: Option<Duration>,
}

impl AgentOptions {
    pub fn builder() -> AgentOptionsBuilder {
        AgentOptionsBuilder::default()
    }

    pub(crate) fn max_line_bytes(&self) -> usize {
        self.max_line_bytes.unwrap_or(DEFAULT_MAX_LINE_BYTES)
    }

    pub(crate) fn callback_timeout(&self) -> Duration {
        self.callback_timeout.unwrap_or(DEFAULT_CALLBACK_TIMEOUT)
    }

    pub(crate) fn subscriber_receive_timeout(&self) -> Duration {
        self.subscriber_receive_timeout
            .unwrap_or(DEFAULT_RECEIVE_TIMEOUT)
    }

    pub(crate) fn cancel_grace(&self) -> Duration {
        self.cancel_grace.unwrap_or(DEFAULT_CANCEL_GRACE)
    }
}

impl fmt::Debug for AgentOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentOptions")
            .field("hooks", &self.hooks)
            .field("mcp_servers", &self.mcp_servers)
            .field("can_use_tool", &self.can_use_tool.is_some())
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .field("permission_mode", &self.permission_mode)
            .field("include_partial_messages", &self.include_partial_messages)
            .field("preferred_transport", &self.preferred_transport)
            .field("binary", &self.binary)
            .field("cli_args", &self.cli_args)
            .field("working_dir", &self.working_dir)
            .finish()
    }
}

#[derive(Default)]
pub struct AgentOptionsBuilder {
    options: AgentOptions,
}

impl AgentOptionsBuilder {
    pub fn hook(mut self, event: HookEvent, matcher: HookMatcher) -> Self {
        self.options.hooks.entry(event).or_default().push(matcher);
        self
    }

    pub fn mcp_server(mut self, name: impl Into<String>, config: McpServerConfig) -> Self {
        self.options.mcp_servers.insert(name.into(), config);
        self
    }

    pub fn sdk_mcp_server(mut self, server: SdkMcpServer) -> Self {
        let name = server.name().to_string();
        self.options
            .mcp_servers
            .insert(name, McpServerConfig::Sdk(Arc::new(server)));
        self
    }

    pub fn can_use_tool(mut self, callback: PermissionCallback) -> Self {
        self.options.can_use_tool = Some(callback);
        self
    }

    pub fn agent(mut self, name: impl Into<String>, definition: AgentDefinition) -> Self {
        self.options.agents.insert(name.into(), definition);
        self
    }

    pub fn permission_mode(mut self, mode: PermissionMode) -> Self {
        self.options.permission_mode = mode;
        self
    }

    pub fn include_partial_messages(mut self, enabled: bool) -> Self {
        self.options.include_partial_messages = enabled;
        self
    }

    pub fn preferred_transport(mut self, preference: TransportPreference) -> Self {
        self.options.preferred_transport = preference;
        self
    }

    pub fn binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.options.binary = Some(binary.into());
        self
    }

    /// Argument list assembled by the option-to-flag layer; opaque here.
    pub fn cli_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.cli_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.env.insert(key.into(), value.into());
        self
    }

    pub fn stderr_handler(mut self, handler: StderrLineHandler) -> Self {
        self.options.stderr_handler = Some(handler);
        self
    }

    pub fn max_line_bytes(mut self, bytes: usize) -> Self {
        self.options.max_line_bytes = Some(bytes);
        self
    }

    pub fn callback_timeout(mut self, timeout: Duration) -> Self {
        self.options.callback_timeout = Some(timeout);
        self
    }

    pub fn subscriber_receive_timeout(mut self, timeout: Duration) -> Self {
        self.options.subscriber_receive_timeout = Some(timeout);
        self
    }

    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.options.cancel_grace = Some(grace);
        self
    }

    pub fn build(self) -> AgentOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{hook, HookOutput};

    #[test]
    fn builder_collects_hook_matchers_per_event() {
        let deny = hook(|_, _, _| async { Ok(HookOutput::block("no")) });
        let options = AgentOptions::builder()
            .hook(HookEvent::PreToolUse, HookMatcher::new("Bash").hook(deny))
            .hook(HookEvent::PreToolUse, HookMatcher::any())
            .build();

        assert_eq!(options.hooks[&HookEvent::PreToolUse].len(), 2);
        assert!(options.hooks.get(&HookEvent::Stop).is_none());
    }

    #[test]
    fn defaults_are_applied_lazily() {
        let options = AgentOptions::default();
        assert_eq!(options.max_line_bytes(), DEFAULT_MAX_LINE_BYTES);
        assert_eq!(options.callback_timeout(), DEFAULT_CALLBACK_TIMEOUT);
        assert_eq!(
            options.subscriber_receive_timeout(),
            DEFAULT_RECEIVE_TIMEOUT
        );

        let tuned = AgentOptions::builder()
            .max_line_bytes(1024 * 1024)
            .callback_timeout(Duration::from_secs(5))
            .build();
        assert_eq!(tuned.max_line_bytes(), 1024 * 1024);
        assert_eq!(tuned.callback_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn permission_mode_wire_names() {
        assert_eq!(PermissionMode::Default.as_str(), "default");
        assert_eq!(PermissionMode::AcceptEdits.as_str(), "acceptEdits");
        assert_eq!(PermissionMode::Plan.as_str(), "plan");
        assert_eq!(
            PermissionMode::BypassPermissions.as_str(),
            "bypassPermissions"
        );
    }
}
