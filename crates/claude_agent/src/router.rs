//! Pure transport selection from the option set.
//!
//! Any feature that requires servicing CLI-initiated control requests forces
//! the control client; otherwise the cheap streaming-only path suffices. No
//! I/O, no logging: callers run this on every session open.

use std::fmt;

use crate::options::{AgentOptions, TransportPreference};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportChoice {
    StreamingOnly,
    ControlClient,
}

/// A feature that forced the control path; diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFeature {
    Hooks,
    SdkMcpServers,
    PermissionCallback,
    Agents,
    PermissionMode,
    PreferredTransport,
}

impl fmt::Display for ControlFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlFeature::Hooks => "hooks",
            ControlFeature::SdkMcpServers => "sdk_mcp_servers",
            ControlFeature::PermissionCallback => "can_use_tool",
            ControlFeature::Agents => "agents",
            ControlFeature::PermissionMode => "permission_mode",
            ControlFeature::PreferredTransport => "preferred_transport",
        };
        f.write_str(name)
    }
}

/// Routing verdict plus every feature that triggered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub choice: TransportChoice,
    pub features: Vec<ControlFeature>,
}

/// Selects the transport for `options`.
pub fn select(options: &AgentOptions) -> TransportChoice {
    match options.preferred_transport {
        TransportPreference::CliOnly => TransportChoice::StreamingOnly,
        TransportPreference::Control => TransportChoice::ControlClient,
        TransportPreference::Auto => {
            if has_hooks(options)
                || has_sdk_mcp(options)
                || options.can_use_tool.is_some()
                || !options.agents.is_empty()
                || !options.permission_mode.is_default()
            {
                TransportChoice::ControlClient
            } else {
                TransportChoice::StreamingOnly
            }
        }
    }
}

/// Like [`select`], but reports which features drove the decision.
pub fn explain(options: &AgentOptions) -> RoutingDecision {
    if options.preferred_transport != TransportPreference::Auto {
        return RoutingDecision {
            choice: select(options),
            features: vec![ControlFeature::PreferredTransport],
        };
    }

    let mut features = Vec::new();
    if has_hooks(options) {
        features.push(ControlFeature::Hooks);
    }
    if has_sdk_mcp(options) {
        features.push(ControlFeature::SdkMcpServers);
    }
    if options.can_use_tool.is_some() {
        features.push(ControlFeature::PermissionCallback);
    }
    if !options.agents.is_empty() {
        features.push(ControlFeature::Agents);
    }
    if !options.permission_mode.is_default() {
        features.push(ControlFeature::PermissionMode);
    }

    RoutingDecision {
        choice: if features.is_empty() {
            TransportChoice::StreamingOnly
        } else {
            TransportChoice::ControlClient
        },
        features,
    }
}

fn has_hooks(options: &AgentOptions) -> bool {
    options.hooks.values().any(|matchers| !matchers.is_empty())
}

fn has_sdk_mcp(options: &AgentOptions) -> bool {
    options.mcp_servers.values().any(|config| config.is_sdk())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{hook, permission, HookEvent, HookMatcher, HookOutput};
    use crate::callbacks::PermissionDecision;
    use crate::mcp::SdkMcpServer;
    use crate::options::{AgentDefinition, McpServerConfig, PermissionMode};
    use std::collections::BTreeMap;

    #[test]
    fn default_options_take_the_streaming_path() {
        let options = AgentOptions::default();
        assert_eq!(select(&options), TransportChoice::StreamingOnly);
        assert!(explain(&options).features.is_empty());
    }

    #[test]
    fn each_control_feature_forces_the_control_path() {
        let with_hooks = AgentOptions::builder()
            .hook(
                HookEvent::PreToolUse,
                HookMatcher::new("Bash").hook(hook(|_, _, _| async { Ok(HookOutput::allow()) })),
            )
            .build();
        assert_eq!(select(&with_hooks), TransportChoice::ControlClient);
        assert_eq!(explain(&with_hooks).features, vec![ControlFeature::Hooks]);

        let with_sdk_mcp = AgentOptions::builder()
            .sdk_mcp_server(SdkMcpServer::new("calc", "1.0.0"))
            .build();
        assert_eq!(select(&with_sdk_mcp), TransportChoice::ControlClient);

        let with_permission = AgentOptions::builder()
            .can_use_tool(permission(|_| async { Ok(PermissionDecision::allow()) }))
            .build();
        assert_eq!(select(&with_permission), TransportChoice::ControlClient);

        let with_agents = AgentOptions::builder()
            .agent("reviewer", AgentDefinition::new("reviews", "Review code."))
            .build();
        assert_eq!(select(&with_agents), TransportChoice::ControlClient);

        let with_mode = AgentOptions::builder()
            .permission_mode(PermissionMode::Plan)
            .build();
        assert_eq!(select(&with_mode), TransportChoice::ControlClient);
    }

    #[test]
    fn empty_matcher_lists_do_not_count_as_hooks() {
        let mut options = AgentOptions::default();
        options.hooks.insert(HookEvent::PreToolUse, Vec::new());
        assert_eq!(select(&options), TransportChoice::StreamingOnly);
    }

    #[test]
    fn external_mcp_servers_do_not_force_the_control_path() {
        let options = AgentOptions::builder()
            .mcp_server(
                "files",
                McpServerConfig::External {
                    command: "mcp-files".to_string(),
                    args: Vec::new(),
                    env: BTreeMap::new(),
                },
            )
            .build();
        assert_eq!(select(&options), TransportChoice::StreamingOnly);
    }

    #[test]
    fn preferred_transport_overrides_in_both_directions() {
        let forced_control = AgentOptions::builder()
            .preferred_transport(crate::options::TransportPreference::Control)
            .build();
        assert_eq!(select(&forced_control), TransportChoice::ControlClient);
        assert_eq!(
            explain(&forced_control).features,
            vec![ControlFeature::PreferredTransport]
        );

        let forced_cli = AgentOptions::builder()
            .can_use_tool(permission(|_| async { Ok(PermissionDecision::allow()) }))
            .preferred_transport(crate::options::TransportPreference::CliOnly)
            .build();
        assert_eq!(select(&forced_cli), TransportChoice::StreamingOnly);
    }

    #[test]
    fn select_is_deterministic_and_matches_explain() {
        let options = AgentOptions::builder()
            .permission_mode(PermissionMode::AcceptEdits)
            .agent("planner", AgentDefinition::new("plans", "Plan work."))
            .build();
        for _ in 0..3 {
            assert_eq!(select(&options), explain(&options).choice);
        }
        assert_eq!(
            explain(&options).features,
            vec![ControlFeature::Agents, ControlFeature::PermissionMode]
        );
    }
}
