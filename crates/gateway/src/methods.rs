use std::{collections::HashMap, future::Future, path::PathBuf, pin::Pin, sync::Arc};

use {
    clawgate_agents::{AuthError, AuthProfile, Credential},
    clawgate_config::{ClawgateConfig, ConfigError, ReloadDecision, decide},
    clawgate_protocol::{ErrorShape, PROTOCOL_VERSION, ResponseFrame, error_codes},
    clawgate_routing::{NormalizedMessage, Peer},
    clawgate_sessions::{SessionKey, metadata::now_ms},
    clawgate_tools::{
        ExecOpts, ProcessError, resolve_policy,
        sandbox::{SandboxFsError, SandboxSettings, scope_key},
    },
    serde::{Deserialize, Serialize, de::DeserializeOwned},
    tracing::{debug, info, warn},
};

use crate::{
    dispatch::{Delivery, DispatchKind, DispatchReport},
    events::GatewayEvent,
    reload,
    state::GatewayState,
};

/// Placeholder returned by `config.get` in place of secrets.
pub const REDACTED: &str = "***";

// ── Types ────────────────────────────────────────────────────────────────────

/// Context passed to every method handler.
pub struct MethodContext {
    pub request_id: String,
    pub method: String,
    pub params: serde_json::Value,
    /// `http` for `/rpc` calls, the connection id for WebSocket clients.
    pub client_conn_id: String,
    pub state: Arc<GatewayState>,
}

/// The result a method handler produces.
pub type MethodResult = Result<serde_json::Value, ErrorShape>;

/// A boxed async method handler.
pub type HandlerFn =
    Box<dyn Fn(MethodContext) -> Pin<Box<dyn Future<Output = MethodResult> + Send>> + Send + Sync>;

// ── Param helpers ────────────────────────────────────────────────────────────

fn parse<T: DeserializeOwned>(params: serde_json::Value) -> Result<T, ErrorShape> {
    let params = if params.is_null() {
        serde_json::json!({})
    } else {
        params
    };
    serde_json::from_value(params)
        .map_err(|e| ErrorShape::new(error_codes::INVALID_REQUEST, format!("invalid params: {e}")))
}

fn to_json<T: Serialize>(value: &T) -> MethodResult {
    serde_json::to_value(value).map_err(internal)
}

fn internal(e: impl std::fmt::Display) -> ErrorShape {
    ErrorShape::new(error_codes::INTERNAL, e.to_string())
}

fn session_key(raw: &str) -> Result<SessionKey, ErrorShape> {
    SessionKey::parse(raw).ok_or_else(|| {
        ErrorShape::new(
            error_codes::INVALID_REQUEST,
            format!("invalid session key: {raw}"),
        )
    })
}

/// `agentId` if given and known, else the default agent.
fn agent_id(state: &GatewayState, requested: Option<String>) -> Result<String, ErrorShape> {
    let cfg = state.config.snapshot();
    match requested {
        Some(id) if cfg.agents.contains(&id) => Ok(id),
        Some(id) => Err(ErrorShape::new(
            error_codes::NOT_FOUND,
            format!("unknown agent: {id}"),
        )),
        None => Ok(cfg.agents.default_agent_id().to_string()),
    }
}

fn auth_error(e: AuthError) -> ErrorShape {
    match e {
        AuthError::NotFound(_) => ErrorShape::new(error_codes::NOT_FOUND, e.to_string()),
        other => internal(other),
    }
}

fn process_error(e: ProcessError) -> ErrorShape {
    match e {
        ProcessError::NotFound(_) => ErrorShape::new(error_codes::NOT_FOUND, e.to_string()),
        ProcessError::NotRunning(_) => ErrorShape::new(error_codes::INVALID_REQUEST, e.to_string()),
        ProcessError::Spawn { .. } => internal(e),
    }
}

fn config_error(e: &ConfigError) -> ErrorShape {
    let issues: Vec<String> = e.issues().iter().map(ToString::to_string).collect();
    let message = if issues.is_empty() {
        e.to_string()
    } else {
        format!("{e}: {}", issues.join("; "))
    };
    ErrorShape::new(error_codes::CONFIG_INVALID, message)
}

fn sandbox_fs_error(e: SandboxFsError) -> ErrorShape {
    let code = if e.is_violation() {
        error_codes::SANDBOX_VIOLATION
    } else {
        error_codes::INVALID_REQUEST
    };
    ErrorShape::new(code, e.to_string())
}

/// Start a background process for a session under the same tool policy and
/// sandbox that session's turns get.
async fn spawn_process(state: &GatewayState, p: ProcessSpawnParams) -> MethodResult {
    let key = session_key(&p.session_key)?;
    let Some(agent_id) = key.agent_id() else {
        return Err(ErrorShape::new(
            error_codes::INVALID_REQUEST,
            format!("invalid session key: {key}"),
        ));
    };
    let cfg = state.config.snapshot();
    if !cfg.agents.contains(agent_id) {
        return Err(ErrorShape::new(
            error_codes::NOT_FOUND,
            format!("unknown agent: {agent_id}"),
        ));
    }

    let settings = SandboxSettings::for_agent(&cfg, agent_id);
    let sandboxed = settings.is_sandboxed(key.is_main());
    let policy = resolve_policy(&cfg, agent_id, sandboxed, key.is_subagent());
    if let Some(tool) = ["exec", "process"].into_iter().find(|t| !policy.is_allowed(t)) {
        warn!(session_key = %key, tool, "process spawn denied by tool policy");
        return Err(ErrorShape::new(
            error_codes::SANDBOX_VIOLATION,
            format!("tool '{tool}' is not allowed for {key}"),
        ));
    }

    if !sandboxed {
        let info = state
            .processes
            .spawn(&p.command, key.as_str(), p.cwd.map(PathBuf::from))
            .map_err(process_error)?;
        return to_json(&info);
    }

    let scope = scope_key(settings.scope, agent_id, key.as_str());
    let runner = state.sandbox.acquire_runner(&scope).await.map_err(|e| {
        ErrorShape::new(error_codes::UNAVAILABLE, format!("sandbox unavailable: {e:#}")).retryable()
    })?;
    let fs = state.sandbox.fs(runner.context(), settings.workspace_access);
    let dir = runner
        .working_dir(&fs, p.cwd.as_deref().unwrap_or("."))
        .map_err(sandbox_fs_error)?;
    let host_dir = runner.context().workspace.join(&dir);
    let opts = ExecOpts {
        working_dir: Some(dir),
        ..Default::default()
    };
    let cmd = runner.command("sh", &["-c".to_string(), p.command.clone()], &opts);
    let info = state
        .processes
        .spawn_prepared(cmd, &p.command, key.as_str(), Some(host_dir))
        .map_err(process_error)?;
    info!(session_key = %key, scope_key = %scope, id = %info.id, "sandboxed process started");
    to_json(&info)
}

fn draining_error() -> ErrorShape {
    ErrorShape::new(error_codes::UNAVAILABLE, "gateway is shutting down").retryable()
}

// ── Config redaction ─────────────────────────────────────────────────────────

/// The config with the gateway token and provider keys masked.
pub fn redact(cfg: &ClawgateConfig) -> ClawgateConfig {
    let mut out = cfg.clone();
    if out.gateway.auth.token.is_some() {
        out.gateway.auth.token = Some(REDACTED.into());
    }
    for entry in out.models.providers.values_mut() {
        if entry.api_key.is_some() {
            entry.api_key = Some(REDACTED.into());
        }
    }
    out
}

/// Put back secrets a client echoed as [`REDACTED`] after a `config.get`.
fn restore_redacted(next: &mut ClawgateConfig, current: &ClawgateConfig) {
    if next.gateway.auth.token.as_deref() == Some(REDACTED) {
        next.gateway.auth.token = current.gateway.auth.token.clone();
    }
    for (name, entry) in &mut next.models.providers {
        if entry.api_key.as_deref() == Some(REDACTED) {
            entry.api_key = current
                .models
                .providers
                .get(name)
                .and_then(|c| c.api_key.clone());
        }
    }
}

fn candidate_config(raw: serde_json::Value, current: &ClawgateConfig) -> Result<ClawgateConfig, ErrorShape> {
    let mut next: ClawgateConfig = serde_json::from_value(raw).map_err(|e| {
        ErrorShape::new(error_codes::CONFIG_INVALID, format!("config does not parse: {e}"))
    })?;
    restore_redacted(&mut next, current);
    Ok(next)
}

// ── Param shapes ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatSendParams {
    #[serde(alias = "message")]
    text: String,
    session_key: Option<String>,
    agent_id: Option<String>,
    channel: Option<String>,
    account_id: Option<String>,
    peer: Option<Peer>,
    sender_id: Option<String>,
    #[serde(default = "yes")]
    deliver: bool,
}

fn yes() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionKeyParams {
    session_key: String,
    reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryParams {
    session_key: String,
    session_id: Option<String>,
    limit: Option<usize>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct AgentParams {
    agent_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScopeParams {
    scope_key: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ExplainParams {
    agent_id: Option<String>,
    session_key: Option<String>,
    #[serde(default)]
    subagent: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileUpsertParams {
    agent_id: Option<String>,
    id: String,
    provider: String,
    credential: Credential,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileIdParams {
    agent_id: Option<String>,
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileOrderParams {
    agent_id: Option<String>,
    provider: Option<String>,
    order: Option<Vec<String>>,
}

#[derive(Deserialize, Default)]
struct ConfigGetParams {
    path: Option<String>,
}

#[derive(Deserialize)]
struct ConfigParams {
    config: serde_json::Value,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ProcessListParams {
    session_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessSpawnParams {
    command: String,
    session_key: String,
    cwd: Option<String>,
}

#[derive(Deserialize)]
struct ProcessIdParams {
    id: String,
    tail: Option<usize>,
}

#[derive(Deserialize)]
struct SystemEventParams {
    text: String,
    source: Option<String>,
}

// ── Method registry ──────────────────────────────────────────────────────────

pub struct MethodRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            handlers: HashMap::new(),
        };
        reg.register_defaults();
        reg
    }

    pub fn register(&mut self, method: impl Into<String>, handler: HandlerFn) {
        self.handlers.insert(method.into(), handler);
    }

    pub async fn dispatch(&self, ctx: MethodContext) -> ResponseFrame {
        let method = ctx.method.clone();
        let request_id = ctx.request_id.clone();
        let conn_id = ctx.client_conn_id.clone();

        let Some(handler) = self.handlers.get(&method) else {
            warn!(method, conn_id = %conn_id, "unknown method");
            return ResponseFrame::err(
                &request_id,
                ErrorShape::new(
                    error_codes::INVALID_REQUEST,
                    format!("unknown method: {method}"),
                ),
            );
        };

        debug!(method, request_id = %request_id, conn_id = %conn_id, "dispatching method");
        match handler(ctx).await {
            Ok(payload) => {
                debug!(method, request_id = %request_id, "method ok");
                ResponseFrame::ok(&request_id, payload)
            },
            Err(err) => {
                warn!(method, request_id = %request_id, code = %err.code, msg = %err.message, "method error");
                ResponseFrame::err(&request_id, err)
            },
        }
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    fn register_defaults(&mut self) {
        self.register_gateway_methods();
        self.register_chat_methods();
        self.register_session_methods();
        self.register_sandbox_methods();
        self.register_auth_methods();
        self.register_config_methods();
        self.register_process_methods();
    }

    // ── Gateway-internal methods ─────────────────────────────────────────

    fn register_gateway_methods(&mut self) {
        // health
        self.register(
            "health",
            Box::new(|ctx| {
                Box::pin(async move {
                    Ok(serde_json::json!({
                        "status": "ok",
                        "version": ctx.state.version,
                        "protocol": PROTOCOL_VERSION,
                        "connections": ctx.state.client_count(),
                    }))
                })
            }),
        );

        // status
        self.register(
            "status",
            Box::new(|ctx| {
                Box::pin(async move {
                    let state = &ctx.state;
                    let cfg = state.config.snapshot();
                    Ok(serde_json::json!({
                        "version": state.version,
                        "protocol": PROTOCOL_VERSION,
                        "uptimeMs": u64::try_from(state.uptime().as_millis()).unwrap_or(u64::MAX),
                        "listen": state.local_addr().map(|a| a.to_string()),
                        "connections": state.client_count(),
                        "draining": state.draining.is_cancelled(),
                        "configPath": state.config.path().map(|p| p.display().to_string()),
                        "reloadMode": cfg.gateway.reload.mode,
                        "agents": cfg.agents.ids(),
                        "channels": state.channels.list(),
                        "providers": state.models.names(),
                        "sandboxBackend": state.sandbox.backend_name(),
                        "activeTurns": state.turns.keys(),
                        "liveProcesses": state.processes.live_count(),
                    }))
                })
            }),
        );

        // agents.list
        self.register(
            "agents.list",
            Box::new(|ctx| {
                Box::pin(async move {
                    let cfg = ctx.state.config.snapshot();
                    let default_id = cfg.agents.default_agent_id();
                    let agents: Vec<_> = cfg
                        .agents
                        .ids()
                        .into_iter()
                        .map(|id| {
                            let entry = cfg.agents.get(&id);
                            serde_json::json!({
                                "id": id,
                                "name": entry.and_then(|a| a.name.clone()),
                                "default": id == default_id,
                                "models": cfg.agents.model_for(&id).candidates(),
                                "sandbox": SandboxSettings::for_agent(&cfg, &id),
                            })
                        })
                        .collect();
                    Ok(serde_json::json!({ "agents": agents }))
                })
            }),
        );

        // route.resolve: where a message would go, without running anything
        self.register(
            "route.resolve",
            Box::new(|ctx| {
                Box::pin(async move {
                    let msg: NormalizedMessage = parse(ctx.params)?;
                    to_json(&ctx.state.router().route(&msg))
                })
            }),
        );

        // system-event
        self.register(
            "system-event",
            Box::new(|ctx| {
                Box::pin(async move {
                    let p: SystemEventParams = parse(ctx.params)?;
                    if p.text.trim().is_empty() {
                        return Err(ErrorShape::new(
                            error_codes::INVALID_REQUEST,
                            "text must not be empty",
                        ));
                    }
                    let delivered = ctx.state.events.publish(GatewayEvent::System {
                        text: p.text,
                        source: p.source,
                    });
                    Ok(serde_json::json!({ "delivered": delivered }))
                })
            }),
        );
    }

    // ── Chat ─────────────────────────────────────────────────────────────

    fn register_chat_methods(&mut self) {
        // chat.send: explicit session or agent runs directly; otherwise route
        self.register(
            "chat.send",
            Box::new(|ctx| {
                Box::pin(async move {
                    let state = ctx.state;
                    if state.draining.is_cancelled() {
                        return Err(draining_error());
                    }
                    let p: ChatSendParams = parse(ctx.params)?;

                    let direct = match (&p.session_key, &p.agent_id) {
                        (Some(raw), _) => Some(session_key(raw)?),
                        (None, Some(agent)) => Some(SessionKey::main(&agent_id(
                            &state,
                            Some(agent.clone()),
                        )?)),
                        (None, None) => None,
                    };

                    let report = match direct {
                        Some(key) => {
                            let (text, sender) = (p.text, p.sender_id);
                            let run_state = Arc::clone(&state);
                            let outcome = state
                                .tracker
                                .track_future(async move {
                                    run_state.run_direct(&key, &text, sender.as_deref()).await
                                })
                                .await;
                            DispatchReport {
                                kind: DispatchKind::Single,
                                rejection: None,
                                strategy: None,
                                results: vec![outcome],
                            }
                        },
                        None => {
                            let sender_id = p.sender_id.unwrap_or_else(|| "operator".into());
                            let msg = NormalizedMessage {
                                channel: p.channel.unwrap_or_else(|| "memory".into()),
                                account_id: p.account_id.unwrap_or_else(|| "default".into()),
                                peer: p.peer.unwrap_or_else(|| Peer::direct(sender_id.clone())),
                                sender_id,
                                body: p.text,
                                attachments: Vec::new(),
                                timestamp: now_ms(),
                            };
                            let delivery = if p.deliver {
                                Delivery::Channel
                            } else {
                                Delivery::Caller
                            };
                            let run_state = Arc::clone(&state);
                            state
                                .tracker
                                .track_future(async move { run_state.dispatch(msg, delivery).await })
                                .await
                        },
                    };
                    to_json(&report)
                })
            }),
        );

        // chat.abort
        self.register(
            "chat.abort",
            Box::new(|ctx| {
                Box::pin(async move {
                    let p: SessionKeyParams = parse(ctx.params)?;
                    let key = session_key(&p.session_key)?;
                    let aborted = ctx.state.turns.abort(&key);
                    info!(session_key = %key, aborted, "chat abort requested");
                    Ok(serde_json::json!({ "aborted": aborted }))
                })
            }),
        );
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    fn register_session_methods(&mut self) {
        // sessions.list
        self.register(
            "sessions.list",
            Box::new(|ctx| {
                Box::pin(async move {
                    let p: AgentParams = parse(ctx.params)?;
                    let entries = ctx
                        .state
                        .sessions
                        .list(p.agent_id.as_deref())
                        .await
                        .map_err(|e| internal(format!("{e:#}")))?;
                    let sessions = entries
                        .into_iter()
                        .map(|entry| {
                            let active = SessionKey::parse(&entry.key)
                                .is_some_and(|k| ctx.state.turns.is_active(&k));
                            let mut value = to_json(&entry)?;
                            if let Some(obj) = value.as_object_mut() {
                                obj.insert("active".into(), active.into());
                            }
                            Ok(value)
                        })
                        .collect::<Result<Vec<_>, ErrorShape>>()?;
                    Ok(serde_json::json!({ "sessions": sessions }))
                })
            }),
        );

        // sessions.history
        self.register(
            "sessions.history",
            Box::new(|ctx| {
                Box::pin(async move {
                    let p: HistoryParams = parse(ctx.params)?;
                    let key = session_key(&p.session_key)?;
                    let sessions = &ctx.state.sessions;
                    let mut messages = match &p.session_id {
                        Some(id) => sessions.history_of(&key, id).await,
                        None => sessions.history(&key).await,
                    }
                    .map_err(|e| internal(format!("{e:#}")))?;
                    if let Some(limit) = p.limit {
                        let skip = messages.len().saturating_sub(limit);
                        messages.drain(..skip);
                    }
                    Ok(serde_json::json!({
                        "sessionKey": key.as_str(),
                        "messages": messages,
                    }))
                })
            }),
        );

        // sessions.reset
        self.register(
            "sessions.reset",
            Box::new(|ctx| {
                Box::pin(async move {
                    let p: SessionKeyParams = parse(ctx.params)?;
                    let key = session_key(&p.session_key)?;
                    let reason = p.reason.as_deref().unwrap_or("manual");
                    match ctx.state.reset_session(&key, reason).await {
                        Ok(Some(entry)) => to_json(&entry),
                        Ok(None) => Err(ErrorShape::new(
                            error_codes::NOT_FOUND,
                            format!("no session under {key}"),
                        )),
                        Err(e) => Err(internal(format!("{e:#}"))),
                    }
                })
            }),
        );
    }

    // ── Sandbox ──────────────────────────────────────────────────────────

    fn register_sandbox_methods(&mut self) {
        // sandbox.list
        self.register(
            "sandbox.list",
            Box::new(|ctx| {
                Box::pin(async move {
                    let contexts = ctx.state.sandbox.list().await;
                    Ok(serde_json::json!({
                        "backend": ctx.state.sandbox.backend_name(),
                        "contexts": contexts,
                    }))
                })
            }),
        );

        // sandbox.recreate
        self.register(
            "sandbox.recreate",
            Box::new(|ctx| {
                Box::pin(async move {
                    let p: ScopeParams = parse(ctx.params)?;
                    let Some(key) = p.scope_key else {
                        return Err(ErrorShape::new(
                            error_codes::INVALID_REQUEST,
                            "missing scopeKey",
                        ));
                    };
                    let context = ctx.state.sandbox.recreate(&key).await.map_err(|e| {
                        ErrorShape::new(error_codes::UNAVAILABLE, format!("{e:#}")).retryable()
                    })?;
                    to_json(&context)
                })
            }),
        );

        // sandbox.prune: one scope when named, otherwise every stale context
        self.register(
            "sandbox.prune",
            Box::new(|ctx| {
                Box::pin(async move {
                    let p: ScopeParams = parse(ctx.params)?;
                    let removed = match p.scope_key {
                        Some(key) => {
                            let existed = ctx
                                .state
                                .sandbox
                                .destroy(&key)
                                .await
                                .map_err(|e| internal(format!("{e:#}")))?;
                            if existed { vec![key] } else { Vec::new() }
                        },
                        None => ctx.state.sandbox.prune().await,
                    };
                    Ok(serde_json::json!({ "removed": removed }))
                })
            }),
        );

        // sandbox.explain
        self.register(
            "sandbox.explain",
            Box::new(|ctx| {
                Box::pin(async move {
                    let p: ExplainParams = parse(ctx.params)?;
                    let agent = agent_id(&ctx.state, p.agent_id)?;
                    let key = match p.session_key {
                        Some(raw) => session_key(&raw)?,
                        None => SessionKey::main(&agent),
                    };
                    let cfg = ctx.state.config.snapshot();
                    let explanation = ctx
                        .state
                        .sandbox
                        .explain(
                            &cfg,
                            &agent,
                            key.as_str(),
                            key.is_main(),
                            p.subagent || key.is_subagent(),
                        )
                        .await;
                    to_json(&explanation)
                })
            }),
        );
    }

    // ── Auth profiles ────────────────────────────────────────────────────

    fn register_auth_methods(&mut self) {
        // auth.profiles.list
        self.register(
            "auth.profiles.list",
            Box::new(|ctx| {
                Box::pin(async move {
                    let p: AgentParams = parse(ctx.params)?;
                    let agent = agent_id(&ctx.state, p.agent_id)?;
                    let store = ctx.state.profiles.for_agent(&agent).await.map_err(auth_error)?;
                    Ok(serde_json::json!({
                        "agentId": agent,
                        "profiles": store.list().await,
                        "order": store.order().await,
                    }))
                })
            }),
        );

        // auth.profiles.upsert
        self.register(
            "auth.profiles.upsert",
            Box::new(|ctx| {
                Box::pin(async move {
                    let p: ProfileUpsertParams = parse(ctx.params)?;
                    if p.id.is_empty() || p.provider.is_empty() {
                        return Err(ErrorShape::new(
                            error_codes::INVALID_REQUEST,
                            "id and provider are required",
                        ));
                    }
                    let agent = agent_id(&ctx.state, p.agent_id)?;
                    let store = ctx.state.profiles.for_agent(&agent).await.map_err(auth_error)?;
                    store
                        .upsert(AuthProfile::new(p.id.clone(), p.provider, p.credential))
                        .await
                        .map_err(auth_error)?;
                    info!(agent_id = %agent, profile = %p.id, "auth profile upserted");
                    Ok(serde_json::json!({ "ok": true, "id": p.id }))
                })
            }),
        );

        // auth.profiles.remove
        self.register(
            "auth.profiles.remove",
            Box::new(|ctx| {
                Box::pin(async move {
                    let p: ProfileIdParams = parse(ctx.params)?;
                    let agent = agent_id(&ctx.state, p.agent_id)?;
                    let store = ctx.state.profiles.for_agent(&agent).await.map_err(auth_error)?;
                    store.remove(&p.id).await.map_err(auth_error)?;
                    Ok(serde_json::json!({ "ok": true }))
                })
            }),
        );

        // auth.profiles.order: set when `order` is given, read otherwise
        self.register(
            "auth.profiles.order",
            Box::new(|ctx| {
                Box::pin(async move {
                    let p: ProfileOrderParams = parse(ctx.params)?;
                    let agent = agent_id(&ctx.state, p.agent_id)?;
                    let store = ctx.state.profiles.for_agent(&agent).await.map_err(auth_error)?;
                    if let Some(order) = p.order {
                        let Some(provider) = p.provider else {
                            return Err(ErrorShape::new(
                                error_codes::INVALID_REQUEST,
                                "provider is required to set an order",
                            ));
                        };
                        store.set_order(&provider, order).await.map_err(auth_error)?;
                    }
                    Ok(serde_json::json!({ "order": store.order().await }))
                })
            }),
        );

        // auth.profiles.clear_cooldown
        self.register(
            "auth.profiles.clear_cooldown",
            Box::new(|ctx| {
                Box::pin(async move {
                    let p: ProfileIdParams = parse(ctx.params)?;
                    let agent = agent_id(&ctx.state, p.agent_id)?;
                    let store = ctx.state.profiles.for_agent(&agent).await.map_err(auth_error)?;
                    store.clear_cooldown(&p.id).await.map_err(auth_error)?;
                    Ok(serde_json::json!({ "ok": true }))
                })
            }),
        );
    }

    // ── Config ───────────────────────────────────────────────────────────

    fn register_config_methods(&mut self) {
        // config.get
        self.register(
            "config.get",
            Box::new(|ctx| {
                Box::pin(async move {
                    let p: ConfigGetParams = parse(ctx.params)?;
                    let value = serde_json::to_value(redact(&ctx.state.config.snapshot()))
                        .map_err(internal)?;
                    let value = match p.path.as_deref().filter(|s| !s.is_empty()) {
                        Some(path) => value
                            .pointer(&format!("/{}", path.replace('.', "/")))
                            .cloned()
                            .ok_or_else(|| {
                                ErrorShape::new(
                                    error_codes::NOT_FOUND,
                                    format!("no config value at {path}"),
                                )
                            })?,
                        None => value,
                    };
                    Ok(serde_json::json!({
                        "path": ctx.state.config.path().map(|p| p.display().to_string()),
                        "config": value,
                    }))
                })
            }),
        );

        // config.plan: classify a candidate without applying it
        self.register(
            "config.plan",
            Box::new(|ctx| {
                Box::pin(async move {
                    let p: ConfigParams = parse(ctx.params)?;
                    let current = ctx.state.config.snapshot();
                    let next = candidate_config(p.config, &current)?;
                    let plan = ctx.state.config.preview(&next).map_err(|e| config_error(&e))?;
                    let decision = match decide(current.gateway.reload.mode, plan.clone()) {
                        ReloadDecision::Ignore => "ignore",
                        ReloadDecision::Hot(_) => "hot",
                        ReloadDecision::Restart(_) => "restart",
                    };
                    Ok(serde_json::json!({ "plan": plan, "decision": decision }))
                })
            }),
        );

        // config.apply: persist when file-backed, then act on the plan
        self.register(
            "config.apply",
            Box::new(|ctx| {
                Box::pin(async move {
                    let p: ConfigParams = parse(ctx.params)?;
                    let state = ctx.state;
                    let current = state.config.snapshot();
                    let next = candidate_config(p.config, &current)?;
                    let result = if state.config.path().is_some() {
                        state.config.write(next).await
                    } else {
                        state.config.apply(next)
                    };
                    let plan = match result {
                        Ok(plan) => plan,
                        Err(e) => {
                            reload::reject(&state, &e);
                            return Err(config_error(&e));
                        },
                    };
                    let step = reload::apply_plan(&state, plan.clone()).await;
                    Ok(serde_json::json!({ "plan": plan, "step": step }))
                })
            }),
        );
    }

    // ── Processes ────────────────────────────────────────────────────────

    fn register_process_methods(&mut self) {
        // process.list
        self.register(
            "process.list",
            Box::new(|ctx| {
                Box::pin(async move {
                    let p: ProcessListParams = parse(ctx.params)?;
                    let processes = match p.session_key.as_deref() {
                        Some(key) => ctx.state.processes.list_for_session(key),
                        None => ctx.state.processes.list(),
                    };
                    Ok(serde_json::json!({ "processes": processes }))
                })
            }),
        );

        // process.spawn
        self.register(
            "process.spawn",
            Box::new(|ctx| {
                Box::pin(async move {
                    let p: ProcessSpawnParams = parse(ctx.params)?;
                    if ctx.state.draining.is_cancelled() {
                        return Err(draining_error());
                    }
                    spawn_process(&ctx.state, p).await
                })
            }),
        );

        // process.log
        self.register(
            "process.log",
            Box::new(|ctx| {
                Box::pin(async move {
                    let p: ProcessIdParams = parse(ctx.params)?;
                    let log = ctx.state.processes.log(&p.id, p.tail).map_err(process_error)?;
                    to_json(&log)
                })
            }),
        );

        // process.kill
        self.register(
            "process.kill",
            Box::new(|ctx| {
                Box::pin(async move {
                    let p: ProcessIdParams = parse(ctx.params)?;
                    let info = ctx.state.processes.kill(&p.id).map_err(process_error)?;
                    to_json(&info)
                })
            }),
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::{
            executor::testing::Script,
            state::testing::{TestGateway, gateway},
        },
        clawgate_config::schema::{AgentConfig, BindingConfig, ProviderEntry, SandboxMode},
        serde_json::json,
    };

    async fn call(gw: &TestGateway, method: &str, params: serde_json::Value) -> ResponseFrame {
        MethodRegistry::new()
            .dispatch(MethodContext {
                request_id: "r1".into(),
                method: method.into(),
                params,
                client_conn_id: "test".into(),
                state: Arc::clone(&gw.state),
            })
            .await
    }

    fn payload(frame: ResponseFrame) -> serde_json::Value {
        assert!(frame.ok, "expected ok, got {:?}", frame.error);
        frame.payload.unwrap_or_default()
    }

    fn error_code(frame: ResponseFrame) -> String {
        assert!(!frame.ok);
        frame.error.unwrap().code
    }

    fn two_agents() -> ClawgateConfig {
        let mut cfg = ClawgateConfig::default();
        cfg.agents.list = vec![
            AgentConfig {
                id: "main".into(),
                ..Default::default()
            },
            AgentConfig {
                id: "ops".into(),
                ..Default::default()
            },
        ];
        cfg
    }

    #[test]
    fn method_names_are_sorted_and_complete() {
        let names = MethodRegistry::new().method_names();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        for m in [
            "health",
            "status",
            "agents.list",
            "chat.send",
            "chat.abort",
            "sessions.list",
            "sessions.history",
            "sessions.reset",
            "sandbox.list",
            "sandbox.recreate",
            "sandbox.prune",
            "sandbox.explain",
            "auth.profiles.list",
            "auth.profiles.upsert",
            "auth.profiles.remove",
            "auth.profiles.order",
            "auth.profiles.clear_cooldown",
            "config.get",
            "config.plan",
            "config.apply",
            "process.list",
            "process.log",
            "process.kill",
            "system-event",
        ] {
            assert!(names.iter().any(|n| n == m), "missing {m}");
        }
    }

    #[tokio::test]
    async fn unknown_method_is_invalid_request() {
        let gw = gateway(ClawgateConfig::default()).await;
        let frame = call(&gw, "nope.nothing", json!({})).await;
        assert_eq!(frame.id, "r1");
        assert_eq!(error_code(frame), error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn health_and_status() {
        let gw = gateway(two_agents()).await;
        let health = payload(call(&gw, "health", json!(null)).await);
        assert_eq!(health["status"], "ok");
        assert_eq!(health["protocol"], PROTOCOL_VERSION);

        let status = payload(call(&gw, "status", json!({})).await);
        assert_eq!(status["agents"], json!(["main", "ops"]));
        assert_eq!(status["sandboxBackend"], "host");
        assert_eq!(status["draining"], false);
    }

    #[tokio::test]
    async fn agents_list_marks_the_default() {
        let gw = gateway(two_agents()).await;
        let out = payload(call(&gw, "agents.list", json!({})).await);
        let agents = out["agents"].as_array().unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0]["id"], "main");
        assert_eq!(agents[0]["default"], true);
        assert_eq!(agents[1]["default"], false);
    }

    #[tokio::test]
    async fn route_resolve_reports_the_binding() {
        let mut cfg = two_agents();
        let mut binding = BindingConfig::default();
        binding.agent_id = "ops".into();
        binding.matcher.channel = "memory".into();
        cfg.bindings = vec![binding];
        let gw = gateway(cfg).await;

        let out = payload(
            call(&gw, "route.resolve", json!({
                "channel": "memory",
                "peer": { "kind": "direct", "id": "alice" },
                "senderId": "alice",
                "body": "hi",
            }))
            .await,
        );
        assert_eq!(out["kind"], "single");
        assert_eq!(out["target"]["agentId"], "ops");
        assert!(gw.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn chat_send_routes_and_delivers() {
        let gw = gateway(ClawgateConfig::default()).await;
        let out = payload(call(&gw, "chat.send", json!({ "text": "hello", "senderId": "bob" })).await);
        assert_eq!(out["kind"], "single");
        assert_eq!(out["results"][0]["ok"], true);
        assert_eq!(out["results"][0]["reply"], "main: hello");

        let sent = gw.state.channels.memory("memory").unwrap().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, "main: hello");
    }

    #[tokio::test]
    async fn chat_send_with_agent_runs_its_main_session() {
        let gw = gateway(two_agents()).await;
        let out = payload(call(&gw, "chat.send", json!({ "text": "ping", "agentId": "ops" })).await);
        assert_eq!(out["results"][0]["sessionKey"], "agent:ops:main");
        assert_eq!(out["results"][0]["reply"], "ops: ping");
        assert!(gw.state.channels.memory("memory").unwrap().sent().is_empty());

        let frame = call(&gw, "chat.send", json!({ "text": "x", "agentId": "ghost" })).await;
        assert_eq!(error_code(frame), error_codes::NOT_FOUND);
    }

    #[tokio::test]
    async fn chat_send_refused_while_draining() {
        let gw = gateway(ClawgateConfig::default()).await;
        gw.state.draining.cancel();
        let frame = call(&gw, "chat.send", json!({ "text": "late" })).await;
        let err = frame.error.unwrap();
        assert_eq!(err.code, error_codes::UNAVAILABLE);
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn chat_abort_cancels_a_hanging_turn() {
        let gw = gateway(ClawgateConfig::default()).await;
        gw.executor.script("main", Script::Hang);

        let state = Arc::clone(&gw.state);
        let run = tokio::spawn(async move {
            state.run_direct(&SessionKey::main("main"), "wait", None).await
        });
        while !gw.state.turns.is_active(&SessionKey::main("main")) {
            tokio::task::yield_now().await;
        }

        let out = payload(call(&gw, "chat.abort", json!({ "sessionKey": "agent:main:main" })).await);
        assert_eq!(out["aborted"], true);
        let outcome = run.await.unwrap();
        assert_eq!(outcome.error.unwrap().code, error_codes::CANCELLED);

        let again = payload(call(&gw, "chat.abort", json!({ "sessionKey": "agent:main:main" })).await);
        assert_eq!(again["aborted"], false);
    }

    #[tokio::test]
    async fn sessions_list_history_and_reset() {
        let gw = gateway(ClawgateConfig::default()).await;
        payload(call(&gw, "chat.send", json!({ "text": "one", "agentId": "main" })).await);
        payload(call(&gw, "chat.send", json!({ "text": "two", "agentId": "main" })).await);

        let list = payload(call(&gw, "sessions.list", json!({})).await);
        let sessions = list["sessions"].as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["key"], "agent:main:main");
        assert_eq!(sessions[0]["active"], false);
        let first_id = sessions[0]["sessionId"].as_str().unwrap().to_string();

        let history = payload(
            call(&gw, "sessions.history", json!({ "sessionKey": "agent:main:main", "limit": 2 })).await,
        );
        let messages = history["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["content"], "two");

        let reset = payload(call(&gw, "sessions.reset", json!({ "sessionKey": "agent:main:main" })).await);
        assert_ne!(reset["sessionId"], first_id);
        assert_eq!(reset["lastResetReason"], "manual");

        let old = payload(
            call(&gw, "sessions.history", json!({
                "sessionKey": "agent:main:main",
                "sessionId": first_id,
            }))
            .await,
        );
        assert_eq!(old["messages"].as_array().unwrap().len(), 4);

        let missing = call(&gw, "sessions.reset", json!({ "sessionKey": "agent:main:dm:nobody" })).await;
        assert_eq!(error_code(missing), error_codes::NOT_FOUND);
        let bad = call(&gw, "sessions.reset", json!({ "sessionKey": "not a key" })).await;
        assert_eq!(error_code(bad), error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn sandbox_methods() {
        let gw = gateway(ClawgateConfig::default()).await;
        let explain = payload(call(&gw, "sandbox.explain", json!({})).await);
        assert_eq!(explain["agentId"], "main");
        assert_eq!(explain["sandboxed"], false);

        let ctx = payload(call(&gw, "sandbox.recreate", json!({ "scopeKey": "agent:main" })).await);
        assert_eq!(ctx["scopeKey"], "agent:main");
        let list = payload(call(&gw, "sandbox.list", json!({})).await);
        assert_eq!(list["contexts"].as_array().unwrap().len(), 1);

        let pruned = payload(call(&gw, "sandbox.prune", json!({ "scopeKey": "agent:main" })).await);
        assert_eq!(pruned["removed"], json!(["agent:main"]));
        let list = payload(call(&gw, "sandbox.list", json!({})).await);
        assert!(list["contexts"].as_array().unwrap().is_empty());

        let missing = call(&gw, "sandbox.recreate", json!({})).await;
        assert_eq!(error_code(missing), error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn auth_profile_lifecycle() {
        let gw = gateway(ClawgateConfig::default()).await;
        payload(
            call(&gw, "auth.profiles.upsert", json!({
                "id": "openai:work",
                "provider": "openai",
                "credential": { "type": "api_key", "key": "sk-1" },
            }))
            .await,
        );
        payload(
            call(&gw, "auth.profiles.upsert", json!({
                "id": "openai:home",
                "provider": "openai",
                "credential": { "type": "token", "token": "t-2" },
            }))
            .await,
        );

        let list = payload(call(&gw, "auth.profiles.list", json!({})).await);
        let profiles = list["profiles"].as_array().unwrap();
        assert_eq!(profiles.len(), 2);
        assert!(!list.to_string().contains("sk-1"));

        let order = payload(
            call(&gw, "auth.profiles.order", json!({
                "provider": "openai",
                "order": ["openai:home", "openai:work"],
            }))
            .await,
        );
        assert_eq!(order["order"]["openai"], json!(["openai:home", "openai:work"]));

        payload(call(&gw, "auth.profiles.clear_cooldown", json!({ "id": "openai:work" })).await);
        payload(call(&gw, "auth.profiles.remove", json!({ "id": "openai:work" })).await);
        let gone = call(&gw, "auth.profiles.remove", json!({ "id": "openai:work" })).await;
        assert_eq!(error_code(gone), error_codes::NOT_FOUND);

        let order = payload(call(&gw, "auth.profiles.order", json!({})).await);
        assert_eq!(order["order"]["openai"], json!(["openai:home"]));
    }

    #[tokio::test]
    async fn config_get_redacts_secrets() {
        let mut cfg = ClawgateConfig::default();
        cfg.gateway.auth.token = Some("hunter2".into());
        cfg.models.providers.insert("openai".into(), ProviderEntry {
            api_key: Some("sk-secret".into()),
            ..Default::default()
        });
        let gw = gateway(cfg).await;

        let out = payload(call(&gw, "config.get", json!({})).await);
        let text = out.to_string();
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("sk-secret"));
        assert_eq!(out["config"]["gateway"]["auth"]["token"], REDACTED);

        let port = payload(call(&gw, "config.get", json!({ "path": "gateway.port" })).await);
        assert_eq!(port["config"], 18789);
        let missing = call(&gw, "config.get", json!({ "path": "gateway.nothing" })).await;
        assert_eq!(error_code(missing), error_codes::NOT_FOUND);
    }

    #[tokio::test]
    async fn config_plan_classifies_without_applying() {
        let gw = gateway(ClawgateConfig::default()).await;
        let mut next = serde_json::to_value(&*gw.state.config.snapshot()).unwrap();
        next["gateway"]["port"] = json!(19000);

        let out = payload(call(&gw, "config.plan", json!({ "config": next })).await);
        assert_eq!(out["decision"], "restart");
        assert_eq!(out["plan"]["restartGateway"], true);
        assert_eq!(gw.state.config.snapshot().gateway.port, 18789);
        assert!(!gw.state.restart.is_cancelled());
    }

    #[tokio::test]
    async fn config_apply_hot_and_invalid() {
        let mut cfg = ClawgateConfig::default();
        cfg.gateway.auth.token = Some("keep-me".into());
        let gw = gateway(cfg).await;
        let mut events = gw.state.events.subscribe();

        let current = payload(call(&gw, "config.get", json!({})).await);
        let mut next = current["config"].clone();
        next["session"]["resetTriggers"] = json!(["/again"]);
        let out = payload(call(&gw, "config.apply", json!({ "config": next })).await);
        assert_eq!(out["step"], "applied");
        assert!(gw.state.router().is_reset_trigger("/again"));
        assert_eq!(
            gw.state.config.snapshot().gateway.auth.token.as_deref(),
            Some("keep-me")
        );
        assert_eq!(events.recv().await.unwrap().event, "config.reloaded");

        let mut bad = current["config"].clone();
        bad["gateway"]["port"] = json!(0);
        let frame = call(&gw, "config.apply", json!({ "config": bad })).await;
        assert_eq!(error_code(frame), error_codes::CONFIG_INVALID);
        assert_eq!(gw.state.config.snapshot().gateway.port, 18789);
        assert_eq!(events.recv().await.unwrap().event, "config.invalid");
    }

    #[tokio::test]
    async fn process_methods() {
        let gw = gateway(ClawgateConfig::default()).await;
        let info = payload(
            call(&gw, "process.spawn", json!({
                "command": "sleep 30",
                "sessionKey": "agent:main:main",
            }))
            .await,
        );
        let id = info["id"].as_str().unwrap().to_string();
        assert_eq!(info["status"], "running");

        let list = payload(call(&gw, "process.list", json!({ "sessionKey": "agent:main:main" })).await);
        assert_eq!(list["processes"].as_array().unwrap().len(), 1);

        let killed = payload(call(&gw, "process.kill", json!({ "id": id })).await);
        assert_eq!(killed["status"], "killed");
        let log = payload(call(&gw, "process.log", json!({ "id": id })).await);
        assert_eq!(log["id"], id.as_str());

        let missing = call(&gw, "process.kill", json!({ "id": "proc-missing" })).await;
        assert_eq!(error_code(missing), error_codes::NOT_FOUND);
    }

    #[tokio::test]
    async fn process_spawn_honors_the_session_tool_policy() {
        let marker = tempfile::tempdir().unwrap();
        let target = marker.path().join("touched");
        let mut cfg = ClawgateConfig::default();
        cfg.sandbox.mode = SandboxMode::All;
        cfg.tools.policy.deny = vec!["exec".into(), "process".into()];
        let gw = gateway(cfg).await;

        let frame = call(&gw, "process.spawn", json!({
            "command": format!("touch {}", target.display()),
            "sessionKey": "agent:main:dm:u1",
            "cwd": "/",
        }))
        .await;
        assert_eq!(error_code(frame), error_codes::SANDBOX_VIOLATION);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!target.exists());
        assert!(gw.state.processes.list().is_empty());
    }

    #[tokio::test]
    async fn sandboxed_process_spawn_is_confined_to_the_workspace() {
        let mut cfg = ClawgateConfig::default();
        cfg.sandbox.mode = SandboxMode::All;
        let gw = gateway(cfg).await;

        for cwd in ["/", "../.."] {
            let frame = call(&gw, "process.spawn", json!({
                "command": "true",
                "sessionKey": "agent:main:dm:u1",
                "cwd": cwd,
            }))
            .await;
            assert_eq!(error_code(frame), error_codes::SANDBOX_VIOLATION, "cwd {cwd}");
        }
        assert!(gw.state.processes.list().is_empty());

        let info = payload(
            call(&gw, "process.spawn", json!({
                "command": "pwd > where.txt",
                "sessionKey": "agent:main:dm:u1",
            }))
            .await,
        );
        let workspace = gw.state.sandbox.list().await[0].workspace.clone();
        assert_eq!(
            PathBuf::from(info["cwd"].as_str().unwrap()).canonicalize().unwrap(),
            workspace.canonicalize().unwrap()
        );

        let written = workspace.join("where.txt");
        let mut reported = String::new();
        for _ in 0..200 {
            reported = std::fs::read_to_string(&written).unwrap_or_default();
            if !reported.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(
            PathBuf::from(reported.trim()).canonicalize().unwrap(),
            workspace.canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn system_event_reaches_subscribers() {
        let gw = gateway(ClawgateConfig::default()).await;
        let mut events = gw.state.events.subscribe();
        let out = payload(call(&gw, "system-event", json!({ "text": "deploy done", "source": "ci" })).await);
        assert_eq!(out["delivered"], 1);

        let frame = events.recv().await.unwrap();
        assert_eq!(frame.event, "system-event");
        assert_eq!(frame.payload["text"], "deploy done");
        assert_eq!(frame.payload["source"], "ci");

        let empty = call(&gw, "system-event", json!({ "text": "  " })).await;
        assert_eq!(error_code(empty), error_codes::INVALID_REQUEST);
    }
}
