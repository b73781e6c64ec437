//! Classifies config edits into no-op, hot-apply, and full-restart work.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::{
    diff::{ChangedPaths, diff},
    schema::{ClawgateConfig, ReloadMode},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadKind {
    None,
    Hot,
    Restart,
}

/// Subsystem refresh a hot plan asks the gateway to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HotAction {
    ReloadRouting,
    ReloadSessions,
    ReloadAuth,
    ReloadModels,
    ReloadSandbox,
    ReloadTools,
    ReloadLogging,
    ReloadChannels,
    ReloadProcess,
}

#[derive(Debug, Clone, Copy)]
pub struct ReloadRule {
    pub prefix: &'static str,
    pub kind: ReloadKind,
    pub action: Option<HotAction>,
}

const fn rule(prefix: &'static str, kind: ReloadKind, action: Option<HotAction>) -> ReloadRule {
    ReloadRule {
        prefix,
        kind,
        action,
    }
}

/// Ordered rule table; the first prefix matching a path decides its kind.
pub const DEFAULT_RULES: &[ReloadRule] = &[
    rule("meta", ReloadKind::None, None),
    rule("gateway.reload", ReloadKind::Hot, None),
    rule("gateway.shutdownGraceMs", ReloadKind::Hot, None),
    rule("gateway.turnTimeoutMs", ReloadKind::Hot, None),
    rule("gateway.auth", ReloadKind::Hot, None),
    rule("gateway", ReloadKind::Restart, None),
    rule("logging", ReloadKind::Hot, Some(HotAction::ReloadLogging)),
    rule("agents", ReloadKind::Hot, Some(HotAction::ReloadRouting)),
    rule("bindings", ReloadKind::Hot, Some(HotAction::ReloadRouting)),
    rule("broadcast", ReloadKind::Hot, Some(HotAction::ReloadRouting)),
    rule("routing", ReloadKind::Hot, Some(HotAction::ReloadRouting)),
    rule("channels", ReloadKind::Hot, Some(HotAction::ReloadChannels)),
    rule("session", ReloadKind::Hot, Some(HotAction::ReloadSessions)),
    rule("sandbox.backend", ReloadKind::Restart, None),
    rule("sandbox.workspaceRoot", ReloadKind::Restart, None),
    rule("sandbox", ReloadKind::Hot, Some(HotAction::ReloadSandbox)),
    rule("tools", ReloadKind::Hot, Some(HotAction::ReloadTools)),
    rule("auth", ReloadKind::Hot, Some(HotAction::ReloadAuth)),
    rule("models", ReloadKind::Hot, Some(HotAction::ReloadModels)),
    rule("cliBackends", ReloadKind::Hot, Some(HotAction::ReloadModels)),
    rule("process", ReloadKind::Hot, Some(HotAction::ReloadProcess)),
];

/// Outcome of one classification cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadPlan {
    pub restart_gateway: bool,
    pub restart_paths: BTreeSet<String>,
    pub hot_paths: BTreeSet<String>,
    pub noop_paths: BTreeSet<String>,
    pub hot_actions: BTreeSet<HotAction>,
}

impl ReloadPlan {
    /// True when nothing needs to happen.
    pub fn is_empty(&self) -> bool {
        !self.restart_gateway && self.hot_paths.is_empty()
    }

    pub fn changed_paths(&self) -> BTreeSet<String> {
        self.restart_paths
            .iter()
            .chain(&self.hot_paths)
            .chain(&self.noop_paths)
            .cloned()
            .collect()
    }
}

/// Segment-aware prefix test: `session` matches `session.idleMinutes` but not
/// `sessionStore`.
fn matches_prefix(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'))
}

pub fn classify_path(path: &str, rules: &[ReloadRule]) -> (ReloadKind, Option<HotAction>) {
    rules
        .iter()
        .find(|r| matches_prefix(path, r.prefix))
        .map(|r| (r.kind, r.action))
        .unwrap_or((ReloadKind::Restart, None))
}

pub fn classify(changed: &ChangedPaths, rules: &[ReloadRule]) -> ReloadPlan {
    let mut plan = ReloadPlan::default();
    for path in changed {
        match classify_path(path, rules) {
            (ReloadKind::None, _) => {
                plan.noop_paths.insert(path.clone());
            },
            (ReloadKind::Hot, action) => {
                plan.hot_paths.insert(path.clone());
                plan.hot_actions.extend(action);
            },
            (ReloadKind::Restart, _) => {
                plan.restart_paths.insert(path.clone());
                plan.restart_gateway = true;
            },
        }
    }
    plan
}

/// Diff and classify in one step with the default rule table.
pub fn plan_reload(prev: &ClawgateConfig, next: &ClawgateConfig) -> ReloadPlan {
    classify(&diff(prev, next), DEFAULT_RULES)
}

/// What the gateway should do with a plan under the configured reload mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadDecision {
    Ignore,
    Hot(ReloadPlan),
    Restart(ReloadPlan),
}

pub fn decide(mode: ReloadMode, plan: ReloadPlan) -> ReloadDecision {
    if plan.is_empty() || mode == ReloadMode::Off {
        return ReloadDecision::Ignore;
    }
    match mode {
        ReloadMode::Hybrid if plan.restart_gateway => ReloadDecision::Restart(plan),
        ReloadMode::Restart => ReloadDecision::Restart(plan),
        ReloadMode::Hot if plan.hot_paths.is_empty() => ReloadDecision::Ignore,
        _ => ReloadDecision::Hot(plan),
    }
}
