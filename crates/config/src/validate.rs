use std::collections::HashSet;

use crate::{
    error::{ConfigError, ConfigIssue},
    schema::{ChannelKind, ClawgateConfig},
};

/// Check cross-field invariants the schema types cannot express.
///
/// Every issue is collected so one round trip reports all of them.
pub fn validate(config: &ClawgateConfig) -> Result<(), ConfigError> {
    let issues = collect_issues(config);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(issues))
    }
}

pub fn collect_issues(config: &ClawgateConfig) -> Vec<ConfigIssue> {
    let mut issues = Vec::new();

    if config.gateway.port == 0 {
        issues.push(ConfigIssue::new("gateway.port", "must be between 1 and 65535"));
    }
    if config.gateway.bind.trim().is_empty() {
        issues.push(ConfigIssue::new("gateway.bind", "must not be empty"));
    }
    if config.gateway.turn_timeout_ms == 0 {
        issues.push(ConfigIssue::new("gateway.turnTimeoutMs", "must be positive"));
    }

    let mut seen = HashSet::new();
    for (i, agent) in config.agents.list.iter().enumerate() {
        if agent.id.trim().is_empty() {
            issues.push(ConfigIssue::new(format!("agents.list.{i}.id"), "must not be empty"));
        } else if !seen.insert(agent.id.as_str()) {
            issues.push(ConfigIssue::new(
                format!("agents.list.{i}.id"),
                format!("duplicate agent id '{}'", agent.id),
            ));
        }
    }

    let agents = &config.agents;
    if let Some(default) = &agents.default
        && !agents.list.is_empty()
        && agents.get(default).is_none()
    {
        issues.push(ConfigIssue::new(
            "agents.default",
            format!("unknown agent '{default}'"),
        ));
    }

    for (i, binding) in config.bindings.iter().enumerate() {
        if !agents.contains(&binding.agent_id) {
            issues.push(ConfigIssue::new(
                format!("bindings.{i}.agentId"),
                format!("unknown agent '{}'", binding.agent_id),
            ));
        }
        if binding.matcher.channel.trim().is_empty() {
            issues.push(ConfigIssue::new(
                format!("bindings.{i}.match.channel"),
                "must not be empty",
            ));
        }
    }

    for (peer, targets) in &config.broadcast.groups {
        if targets.is_empty() {
            issues.push(ConfigIssue::new(
                format!("broadcast.{peer}"),
                "broadcast group has no agents",
            ));
        }
        for agent_id in targets {
            if !agents.contains(agent_id) {
                issues.push(ConfigIssue::new(
                    format!("broadcast.{peer}"),
                    format!("unknown agent '{agent_id}'"),
                ));
            }
        }
    }

    let cd = &config.auth.cooldowns;
    if cd.base_secs == 0 {
        issues.push(ConfigIssue::new("auth.cooldowns.baseSecs", "must be positive"));
    }
    if cd.max_secs < cd.base_secs {
        issues.push(ConfigIssue::new(
            "auth.cooldowns.maxSecs",
            "must not be below baseSecs",
        ));
    }
    if cd.billing_max_hours < cd.billing_base_hours {
        issues.push(ConfigIssue::new(
            "auth.cooldowns.billingMaxHours",
            "must not be below billingBaseHours",
        ));
    }
    if cd.multiplier == 0 {
        issues.push(ConfigIssue::new("auth.cooldowns.multiplier", "must be positive"));
    }

    for (name, channel) in &config.channels {
        if channel.kind == ChannelKind::Webhook
            && channel.outbound_url.as_deref().is_none_or(|u| u.trim().is_empty())
        {
            issues.push(ConfigIssue::new(
                format!("channels.{name}.outboundUrl"),
                "required for webhook channels",
            ));
        }
    }

    for (name, backend) in &config.cli_backends {
        if backend.command.trim().is_empty() {
            issues.push(ConfigIssue::new(
                format!("cliBackends.{name}.command"),
                "must not be empty",
            ));
        }
    }
    for (name, provider) in &config.models.providers {
        if provider.enabled && provider.base_url.trim().is_empty() {
            issues.push(ConfigIssue::new(
                format!("models.providers.{name}.baseUrl"),
                "must not be empty for an enabled provider",
            ));
        }
    }

    if config.process.max_output_bytes == 0 {
        issues.push(ConfigIssue::new("process.maxOutputBytes", "must be positive"));
    }
    if config.sandbox.prune_interval_secs == 0 {
        issues.push(ConfigIssue::new("sandbox.pruneIntervalSecs", "must be positive"));
    }
    if tracing_level_is_unknown(&config.logging.level) {
        issues.push(ConfigIssue::new(
            "logging.level",
            format!("unknown level '{}'", config.logging.level),
        ));
    }

    issues
}

/// Accepts a bare level or `target=level` directives separated by commas.
fn tracing_level_is_unknown(filter: &str) -> bool {
    filter.split(',').map(str::trim).any(|directive| {
        let level = directive.rsplit('=').next().unwrap_or(directive);
        !matches!(
            level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error" | "off"
        )
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::{AgentConfig, BindingConfig, BindingMatch};

    fn agent(id: &str) -> AgentConfig {
        AgentConfig {
            id: id.into(),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_are_valid() {
        validate(&ClawgateConfig::default()).unwrap();
    }

    #[test]
    fn reports_every_issue_at_once() {
        let mut cfg = ClawgateConfig::default();
        cfg.gateway.port = 0;
        cfg.agents.list = vec![agent("a"), agent("a")];
        cfg.bindings.push(BindingConfig {
            agent_id: "ghost".into(),
            matcher: BindingMatch {
                channel: "slack".into(),
                ..Default::default()
            },
        });
        cfg.broadcast.groups.insert("peer".into(), vec!["a".into(), "nobody".into()]);

        let err = validate(&cfg).unwrap_err();
        let paths: Vec<_> = err.issues().iter().map(|i| i.path.as_str()).collect();
        assert!(paths.contains(&"gateway.port"));
        assert!(paths.contains(&"agents.list.1.id"));
        assert!(paths.contains(&"bindings.0.agentId"));
        assert!(paths.contains(&"broadcast.peer"));
    }

    #[test]
    fn implicit_default_agent_satisfies_bindings() {
        let mut cfg = ClawgateConfig::default();
        cfg.bindings.push(BindingConfig {
            agent_id: "main".into(),
            matcher: BindingMatch {
                channel: "memory".into(),
                ..Default::default()
            },
        });
        validate(&cfg).unwrap();
    }

    #[test]
    fn cooldown_ceiling_below_base_is_rejected() {
        let mut cfg = ClawgateConfig::default();
        cfg.auth.cooldowns.max_secs = 10;
        let err = validate(&cfg).unwrap_err();
        assert_eq!(err.issues()[0].path, "auth.cooldowns.maxSecs");
    }

    #[test]
    fn webhook_channel_needs_outbound_url() {
        let mut cfg = ClawgateConfig::default();
        cfg.channels.insert("hooks".into(), crate::schema::ChannelConfig {
            kind: ChannelKind::Webhook,
            ..Default::default()
        });
        let err = validate(&cfg).unwrap_err();
        assert_eq!(err.issues()[0].path, "channels.hooks.outboundUrl");
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let mut cfg = ClawgateConfig::default();
        cfg.logging.level = "chatty".into();
        assert!(validate(&cfg).is_err());

        cfg.logging.level = "info,clawgate_gateway=debug".into();
        validate(&cfg).unwrap();
    }
}
