//! Config schema types (gateway, agents, routing, sessions, sandbox, auth,
//! models, CLI backends).
//!
//! Every section deserializes with `#[serde(default)]` so a partial document
//! is always valid input; semantic checks live in [`crate::validate`].

use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18789;
pub const DEFAULT_AGENT_ID: &str = "main";
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4-5";
pub const DEFAULT_SANDBOX_IMAGE: &str = "ubuntu:25.10";

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClawgateConfig {
    pub meta: MetaConfig,
    pub gateway: GatewayConfig,
    pub logging: LoggingConfig,
    pub agents: AgentsConfig,
    pub bindings: Vec<BindingConfig>,
    pub broadcast: BroadcastConfig,
    pub routing: RoutingConfig,
    pub channels: BTreeMap<String, ChannelConfig>,
    pub session: SessionConfig,
    pub sandbox: SandboxConfig,
    pub tools: ToolsConfig,
    pub auth: AuthConfig,
    pub models: ModelsConfig,
    pub cli_backends: BTreeMap<String, CliBackendConfig>,
    pub process: ProcessConfig,
}

/// Bookkeeping fields rewritten by tooling on every save.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetaConfig {
    pub last_touched_at: Option<String>,
    pub last_touched_version: Option<String>,
}

// ── Gateway ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    pub bind: String,
    pub port: u16,
    /// Root of persisted state. Defaults to `~/.clawgate`.
    pub state_dir: Option<PathBuf>,
    /// How long in-flight turns may keep running after shutdown begins.
    pub shutdown_grace_ms: u64,
    /// Deadline for a single agent turn, including model failover.
    pub turn_timeout_ms: u64,
    pub auth: GatewayAuthConfig,
    pub reload: ReloadConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            state_dir: None,
            shutdown_grace_ms: 10_000,
            turn_timeout_ms: 600_000,
            auth: GatewayAuthConfig::default(),
            reload: ReloadConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadMode {
    Off,
    Hot,
    Restart,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReloadConfig {
    pub mode: ReloadMode,
    pub debounce_ms: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            mode: ReloadMode::default(),
            debounce_ms: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Agents ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentsConfig {
    /// Agent used when no binding matches. Falls back to the first listed agent.
    pub default: Option<String>,
    /// Model selection inherited by agents without their own.
    pub model: ModelSelection,
    pub list: Vec<AgentConfig>,
}

impl AgentsConfig {
    pub fn default_agent_id(&self) -> &str {
        self.default
            .as_deref()
            .or_else(|| self.list.first().map(|a| a.id.as_str()))
            .unwrap_or(DEFAULT_AGENT_ID)
    }

    pub fn get(&self, id: &str) -> Option<&AgentConfig> {
        self.list.iter().find(|a| a.id == id)
    }

    /// Agent ids known to the gateway. An empty list still has the default agent.
    pub fn ids(&self) -> Vec<String> {
        if self.list.is_empty() {
            vec![self.default_agent_id().to_string()]
        } else {
            self.list.iter().map(|a| a.id.clone()).collect()
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        if self.list.is_empty() {
            id == self.default_agent_id()
        } else {
            self.get(id).is_some()
        }
    }

    /// Effective model selection for an agent: its own, else the shared one.
    pub fn model_for(&self, id: &str) -> ModelSelection {
        self.get(id)
            .and_then(|a| a.model.clone())
            .unwrap_or_else(|| self.model.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    pub id: String,
    pub name: Option<String>,
    pub model: Option<ModelSelection>,
    /// Prompt handed to the model on the first turn of a session.
    pub system_prompt: Option<String>,
    pub sandbox: Option<AgentSandboxConfig>,
    pub tools: Option<ToolPolicyConfig>,
    pub subagents: Option<SubagentConfig>,
}

/// Primary model plus ordered fallbacks, as `provider/model` references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelSelection {
    pub primary: String,
    pub fallbacks: Vec<String>,
}

impl Default for ModelSelection {
    fn default() -> Self {
        Self {
            primary: DEFAULT_MODEL.into(),
            fallbacks: Vec::new(),
        }
    }
}

impl ModelSelection {
    pub fn candidates(&self) -> Vec<String> {
        let mut out = vec![self.primary.clone()];
        for f in &self.fallbacks {
            if !out.contains(f) {
                out.push(f.clone());
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentSandboxConfig {
    pub mode: Option<SandboxMode>,
    pub scope: Option<SandboxScope>,
    pub workspace_access: Option<WorkspaceAccess>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubagentConfig {
    pub tools: ToolPolicyConfig,
}

// ── Routing ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    Direct,
    Group,
    Channel,
}

impl std::fmt::Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Group => f.write_str("group"),
            Self::Channel => f.write_str("channel"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BindingConfig {
    pub agent_id: String,
    #[serde(rename = "match")]
    pub matcher: BindingMatch,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BindingMatch {
    pub channel: String,
    /// `*` matches any account; absent matches any account as well.
    pub account_id: Option<String>,
    pub peer: Option<PeerMatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerMatch {
    pub kind: PeerKind,
    pub id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastStrategy {
    #[default]
    Parallel,
    Sequential,
}

/// Broadcast groups: peer id → agent ids, plus the fan-out strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BroadcastConfig {
    pub strategy: BroadcastStrategy,
    #[serde(flatten)]
    pub groups: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoutingConfig {
    /// Recent inbound messages kept per peer and shared across fan-out agents.
    pub context_window: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self { context_window: 20 }
    }
}

/// Channel that exists even when `channels` does not list it.
pub const MEMORY_CHANNEL: &str = "memory";

/// Adapter behind a channel entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// In-process queue; used by `chat.send` and tests.
    #[default]
    Memory,
    /// Inbound over `POST /channels/<name>/inbound`, outbound POSTed to `outboundUrl`.
    Webhook,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    pub enabled: bool,
    pub outbound_url: Option<String>,
    /// Sender ids allowed to reach an agent. Empty allows everyone.
    pub allow_from: Vec<String>,
    /// Group peers only activate when a mention pattern appears in the body.
    pub require_mention: bool,
    pub mention_patterns: Vec<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            kind: ChannelKind::Memory,
            enabled: true,
            outbound_url: None,
            allow_from: Vec::new(),
            require_mention: false,
            mention_patterns: Vec::new(),
        }
    }
}

// ── Sessions ─────────────────────────────────────────────────────────────────

/// How direct-message conversations map onto session keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DmScope {
    #[default]
    Main,
    PerPeer,
    PerChannelPeer,
    PerAccountChannelPeer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Inactivity window after which the next message starts a new session.
    pub idle_minutes: u64,
    pub dm_scope: DmScope,
    pub reset_triggers: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_minutes: 60,
            dm_scope: DmScope::default(),
            reset_triggers: vec!["/new".into(), "/reset".into()],
        }
    }
}

// ── Sandbox ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    #[default]
    Off,
    NonMain,
    All,
}

impl std::fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => f.write_str("off"),
            Self::NonMain => f.write_str("non-main"),
            Self::All => f.write_str("all"),
        }
    }
}

/// Lifecycle boundary of a sandbox context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxScope {
    #[default]
    Session,
    Agent,
    /// One context for everything. Isolation between sessions is relaxed.
    Shared,
}

impl std::fmt::Display for SandboxScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Session => f.write_str("session"),
            Self::Agent => f.write_str("agent"),
            Self::Shared => f.write_str("shared"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceAccess {
    #[default]
    None,
    Ro,
    Rw,
}

impl std::fmt::Display for WorkspaceAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Ro => f.write_str("ro"),
            Self::Rw => f.write_str("rw"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackendKind {
    #[default]
    Auto,
    Docker,
    Host,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Memory limit (e.g. "512M", "1G").
    pub memory_limit: Option<String>,
    /// CPU quota as a fraction of a core.
    pub cpu_quota: Option<f64>,
    pub pids_max: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SandboxConfig {
    pub mode: SandboxMode,
    pub scope: SandboxScope,
    pub backend: SandboxBackendKind,
    pub image: String,
    pub container_prefix: String,
    pub no_network: bool,
    pub workspace_access: WorkspaceAccess,
    /// Where per-context workspaces live. Defaults to `<stateDir>/sandboxes`.
    pub workspace_root: Option<PathBuf>,
    /// Extra host paths sandboxed file access may reach.
    pub allowed_paths: Vec<PathBuf>,
    pub idle_hours: u64,
    pub max_age_days: u64,
    pub prune_interval_secs: u64,
    pub resources: ResourceLimits,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: SandboxMode::default(),
            scope: SandboxScope::default(),
            backend: SandboxBackendKind::default(),
            image: DEFAULT_SANDBOX_IMAGE.into(),
            container_prefix: "clawgate-sbx".into(),
            no_network: true,
            workspace_access: WorkspaceAccess::default(),
            workspace_root: None,
            allowed_paths: Vec::new(),
            idle_hours: 24,
            max_age_days: 7,
            prune_interval_secs: 300,
            resources: ResourceLimits::default(),
        }
    }
}

// ── Tools ────────────────────────────────────────────────────────────────────

/// One layer of tool policy. `allow: None` leaves the layer unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolPolicyConfig {
    pub allow: Option<Vec<String>>,
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolsConfig {
    #[serde(flatten)]
    pub policy: ToolPolicyConfig,
    /// Applied on top of the agent layer when a turn runs sandboxed.
    pub sandbox: ToolPolicyConfig,
    /// Applied on top of everything for subagent turns.
    pub subagents: ToolPolicyConfig,
}

// ── Auth profiles ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthConfig {
    /// Provider → profile ids in priority order.
    pub order: BTreeMap<String, Vec<String>>,
    pub cooldowns: CooldownConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CooldownConfig {
    pub base_secs: u64,
    pub multiplier: u32,
    pub max_secs: u64,
    pub billing_base_hours: u64,
    pub billing_max_hours: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            base_secs: 60,
            multiplier: 5,
            max_secs: 3600,
            billing_base_hours: 5,
            billing_max_hours: 24,
        }
    }
}

// ── Models ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelsConfig {
    /// OpenAI-compatible HTTP providers keyed by provider name.
    pub providers: BTreeMap<String, ProviderEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderEntry {
    pub enabled: bool,
    pub base_url: String,
    /// Seeds an auth profile named `<provider>:config` when set.
    pub api_key: Option<String>,
    pub timeout_ms: u64,
}

impl Default for ProviderEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: String::new(),
            api_key: None,
            timeout_ms: 120_000,
        }
    }
}

// ── CLI backends ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CliOutputMode {
    #[default]
    Json,
    Jsonl,
    Text,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CliInputMode {
    #[default]
    Arg,
    Stdin,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CliSessionMode {
    /// Pass a session id on every turn (a fresh one on the first).
    Always,
    /// Only pass a session id once the CLI has reported one.
    #[default]
    Existing,
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemPromptWhen {
    #[default]
    First,
    Always,
    Never,
}

/// Declarative template that turns an external CLI into a model provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CliBackendConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Used instead of `args` once a session id is known. `{sessionId}` is substituted.
    pub resume_args: Option<Vec<String>>,
    pub output: CliOutputMode,
    pub input: CliInputMode,
    pub model_arg: Option<String>,
    pub model_aliases: BTreeMap<String, String>,
    pub session_arg: Option<String>,
    pub session_mode: CliSessionMode,
    /// Output fields checked in order for the CLI's session id.
    pub session_id_fields: Vec<String>,
    pub system_prompt_arg: Option<String>,
    pub system_prompt_when: SystemPromptWhen,
    pub env: BTreeMap<String, String>,
    pub clear_env: Vec<String>,
    pub timeout_ms: Option<u64>,
    /// Flag that receives the denied tools, comma-separated, as named in `tool_names`.
    pub deny_tools_arg: Option<String>,
    /// Gateway tool name → the CLI's own name for it. Unmapped tools are not passed.
    pub tool_names: BTreeMap<String, String>,
}

// ── Processes ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessConfig {
    /// Bytes retained per stream for each background process.
    pub max_output_bytes: usize,
    pub finished_ttl_minutes: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: 200 * 1024,
            finished_ttl_minutes: 30,
        }
    }
}
