use {
    clawgate_config::{ClawgateConfig, schema::ToolPolicyConfig},
    serde::Serialize,
    tracing::debug,
};

/// Named tool groups usable anywhere a tool pattern is accepted.
pub const TOOL_GROUPS: &[(&str, &[&str])] = &[
    ("group:fs", &["read", "write", "edit", "apply_patch"]),
    ("group:runtime", &["exec", "process"]),
    ("group:sessions", &["sessions_list", "sessions_history", "sessions_send"]),
];

/// Every tool the gateway knows how to gate.
pub const KNOWN_TOOLS: &[&str] = &[
    "read",
    "write",
    "edit",
    "apply_patch",
    "exec",
    "process",
    "sessions_list",
    "sessions_history",
    "sessions_send",
];

/// Check if a tool name matches a pattern (`*`, trailing `*`, or a group).
fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some((_, members)) = TOOL_GROUPS.iter().find(|(group, _)| *group == pattern) {
        return members.contains(&name);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return name.starts_with(prefix);
    }
    pattern == name
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyLayer {
    pub name: String,
    pub allow: Option<Vec<String>>,
    pub deny: Vec<String>,
}

impl PolicyLayer {
    fn new(name: impl Into<String>, cfg: &ToolPolicyConfig) -> Self {
        Self {
            name: name.into(),
            allow: cfg.allow.clone(),
            deny: cfg.deny.clone(),
        }
    }

    fn denies(&self, tool: &str) -> Option<String> {
        if let Some(p) = self.deny.iter().find(|p| pattern_matches(p, tool)) {
            return Some(format!("denied by '{p}'"));
        }
        match &self.allow {
            Some(allow) if !allow.iter().any(|p| pattern_matches(p, tool)) => {
                Some("not in allow list".into())
            },
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDecision {
    pub tool: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Ordered restriction layers. A tool passes only if every layer lets it
/// through, so a later layer can narrow but never re-grant.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EffectivePolicy {
    pub layers: Vec<PolicyLayer>,
}

impl EffectivePolicy {
    pub fn push(&mut self, name: impl Into<String>, cfg: &ToolPolicyConfig) {
        if cfg.allow.is_none() && cfg.deny.is_empty() {
            return;
        }
        self.layers.push(PolicyLayer::new(name, cfg));
    }

    pub fn decide(&self, tool: &str) -> ToolDecision {
        for layer in &self.layers {
            if let Some(reason) = layer.denies(tool) {
                return ToolDecision {
                    tool: tool.to_string(),
                    allowed: false,
                    layer: Some(layer.name.clone()),
                    reason: Some(reason),
                };
            }
        }
        ToolDecision {
            tool: tool.to_string(),
            allowed: true,
            layer: None,
            reason: None,
        }
    }

    pub fn is_allowed(&self, tool: &str) -> bool {
        self.decide(tool).allowed
    }

    pub fn filter<'a>(&self, tools: &[&'a str]) -> Vec<&'a str> {
        tools.iter().copied().filter(|t| self.is_allowed(t)).collect()
    }
}

/// Layer global → agent → sandbox → subagent policies for one turn.
pub fn resolve_policy(
    config: &ClawgateConfig,
    agent_id: &str,
    sandboxed: bool,
    subagent: bool,
) -> EffectivePolicy {
    let mut policy = EffectivePolicy::default();
    policy.push("global", &config.tools.policy);

    let agent = config.agents.get(agent_id);
    if let Some(tools) = agent.and_then(|a| a.tools.as_ref()) {
        policy.push(format!("agent:{agent_id}"), tools);
    }
    if sandboxed {
        policy.push("sandbox", &config.tools.sandbox);
    }
    if subagent {
        policy.push("subagent", &config.tools.subagents);
        if let Some(sub) = agent.and_then(|a| a.subagents.as_ref()) {
            policy.push(format!("agent:{agent_id}:subagent"), &sub.tools);
        }
    }
    debug!(agent_id, sandboxed, subagent, layers = policy.layers.len(), "tool policy resolved");
    policy
}
