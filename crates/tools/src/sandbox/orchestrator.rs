use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    anyhow::Result,
    clawgate_config::{
        ClawgateConfig,
        schema::{SandboxConfig, SandboxMode, SandboxScope, WorkspaceAccess},
    },
    dashmap::DashMap,
    serde::Serialize,
    tokio::{process::Command, sync::Mutex},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    super::{
        backend::{SandboxBackend, workspace_for},
        fs::{SandboxFs, SandboxFsError},
        path::normalize,
    },
    crate::{
        exec::{ExecError, ExecOpts, ExecResult, run_command},
        policy::{KNOWN_TOOLS, PolicyLayer, ToolDecision, resolve_policy},
    },
};

const SHARED_SCOPE_KEY: &str = "shared";

/// A live execution context for one scope key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxContext {
    pub scope_key: String,
    pub backend: String,
    pub handle: String,
    pub workspace: PathBuf,
    pub created_at: u64,
    pub last_used_at: u64,
}

/// A context bound to the backend that runs it. Everything a sandboxed turn
/// or process executes goes through one of these.
#[derive(Clone)]
pub struct SandboxRunner {
    context: SandboxContext,
    backend: Arc<dyn SandboxBackend>,
}

impl fmt::Debug for SandboxRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxRunner")
            .field("context", &self.context)
            .field("backend", &self.backend.backend_name())
            .finish()
    }
}

impl SandboxRunner {
    pub fn new(context: SandboxContext, backend: Arc<dyn SandboxBackend>) -> Self {
        Self { context, backend }
    }

    pub fn context(&self) -> &SandboxContext {
        &self.context
    }

    pub fn scope_key(&self) -> &str {
        &self.context.scope_key
    }

    /// `program args` prepared to run inside the context.
    pub fn command(&self, program: &str, args: &[String], opts: &ExecOpts) -> Command {
        self.backend
            .command(&self.context.handle, &self.context.workspace, program, args, opts)
    }

    pub async fn run(
        &self,
        program: &str,
        args: &[String],
        opts: &ExecOpts,
    ) -> Result<ExecResult, ExecError> {
        debug!(scope_key = %self.context.scope_key, program, "sandbox run");
        run_command(self.command(program, args, opts), &opts.prepared()).await
    }

    pub async fn exec(&self, command: &str, opts: &ExecOpts) -> Result<ExecResult> {
        debug!(scope_key = %self.context.scope_key, command, "sandbox exec");
        self.backend
            .exec(&self.context.handle, &self.context.workspace, command, opts)
            .await
    }

    /// Confine `raw` through `fs` and express it as a working dir for
    /// [`Self::command`]: workspace-relative inside the workspace, absolute
    /// for an allow-listed path.
    pub fn working_dir(&self, fs: &SandboxFs, raw: &str) -> Result<PathBuf, SandboxFsError> {
        let located = fs.locate(raw)?;
        if located.base == normalize(&self.context.workspace) {
            Ok(located.relative)
        } else {
            Ok(located.resolved)
        }
    }
}

/// Effective sandbox settings for an agent after per-agent overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSettings {
    pub mode: SandboxMode,
    pub scope: SandboxScope,
    pub workspace_access: WorkspaceAccess,
}

impl SandboxSettings {
    pub fn for_agent(config: &ClawgateConfig, agent_id: &str) -> Self {
        let global = &config.sandbox;
        let agent = config.agents.get(agent_id).and_then(|a| a.sandbox.as_ref());
        Self {
            mode: agent.and_then(|a| a.mode).unwrap_or(global.mode),
            scope: agent.and_then(|a| a.scope).unwrap_or(global.scope),
            workspace_access: agent
                .and_then(|a| a.workspace_access)
                .unwrap_or(global.workspace_access),
        }
    }

    pub fn is_sandboxed(&self, is_main_session: bool) -> bool {
        match self.mode {
            SandboxMode::Off => false,
            SandboxMode::All => true,
            SandboxMode::NonMain => !is_main_session,
        }
    }
}

/// Which context a session lands in for a given scope.
pub fn scope_key(scope: SandboxScope, agent_id: &str, session_key: &str) -> String {
    match scope {
        SandboxScope::Session => session_key.to_string(),
        SandboxScope::Agent => format!("agent:{agent_id}"),
        SandboxScope::Shared => SHARED_SCOPE_KEY.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxExplanation {
    pub agent_id: String,
    pub session_key: String,
    pub settings: SandboxSettings,
    pub sandboxed: bool,
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    pub live: bool,
    pub policy: Vec<PolicyLayer>,
    pub tools: Vec<ToolDecision>,
}

#[derive(Debug, Clone, Copy)]
struct Thresholds {
    idle_ms: u64,
    max_age_ms: u64,
    prune_every: Duration,
}

impl From<&SandboxConfig> for Thresholds {
    fn from(cfg: &SandboxConfig) -> Self {
        Self {
            idle_ms: cfg.idle_hours.saturating_mul(3_600_000),
            max_age_ms: cfg.max_age_days.saturating_mul(86_400_000),
            prune_every: Duration::from_secs(cfg.prune_interval_secs.max(1)),
        }
    }
}

impl Thresholds {
    fn stale_reason(&self, ctx: &SandboxContext, now: u64) -> Option<&'static str> {
        if now.saturating_sub(ctx.last_used_at) >= self.idle_ms {
            Some("idle")
        } else if now.saturating_sub(ctx.created_at) >= self.max_age_ms {
            Some("max-age")
        } else {
            None
        }
    }
}

type Slot = Arc<Mutex<Option<SandboxContext>>>;

/// Owns every sandbox context. At most one live context exists per scope key.
pub struct SandboxOrchestrator {
    backend: Arc<dyn SandboxBackend>,
    workspace_root: PathBuf,
    allowed_paths: RwLock<Vec<PathBuf>>,
    thresholds: RwLock<Thresholds>,
    slots: DashMap<String, Slot>,
}

impl SandboxOrchestrator {
    pub fn new(config: &SandboxConfig, workspace_root: PathBuf, backend: Arc<dyn SandboxBackend>) -> Self {
        Self {
            backend,
            workspace_root,
            allowed_paths: RwLock::new(config.allowed_paths.clone()),
            thresholds: RwLock::new(Thresholds::from(config)),
            slots: DashMap::new(),
        }
    }

    /// Hot-apply thresholds and the allow-list. Backend changes need a restart.
    pub fn apply_config(&self, config: &SandboxConfig) {
        *self.thresholds.write().unwrap_or_else(PoisonError::into_inner) = Thresholds::from(config);
        *self.allowed_paths.write().unwrap_or_else(PoisonError::into_inner) =
            config.allowed_paths.clone();
    }

    fn thresholds(&self) -> Thresholds {
        *self.thresholds.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    fn slot(&self, key: &str) -> Slot {
        Arc::clone(self.slots.entry(key.to_string()).or_default().value())
    }

    pub async fn acquire(&self, key: &str) -> Result<SandboxContext> {
        self.acquire_at(key, now_ms()).await
    }

    /// Return the live context for `key`, creating it on first use and
    /// replacing it once it has gone idle or aged out.
    pub async fn acquire_at(&self, key: &str, now: u64) -> Result<SandboxContext> {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;

        if let Some(ctx) = guard.as_mut() {
            match self.thresholds().stale_reason(ctx, now) {
                None => {
                    ctx.last_used_at = now;
                    return Ok(ctx.clone());
                },
                Some(reason) => {
                    info!(scope_key = key, reason, "recycling stale sandbox");
                    let handle = ctx.handle.clone();
                    *guard = None;
                    self.backend.destroy(&handle).await?;
                },
            }
        }

        let ctx = self.create(key, now).await?;
        *guard = Some(ctx.clone());
        Ok(ctx)
    }

    async fn create(&self, key: &str, now: u64) -> Result<SandboxContext> {
        let workspace = workspace_for(&self.workspace_root, key);
        tokio::fs::create_dir_all(&workspace).await?;
        let handle = self
            .backend
            .create(&super::backend::sanitize_key(key), &workspace)
            .await?;
        info!(scope_key = key, backend = self.backend.backend_name(), %handle, "sandbox created");
        Ok(SandboxContext {
            scope_key: key.to_string(),
            backend: self.backend.backend_name().to_string(),
            handle,
            workspace,
            created_at: now,
            last_used_at: now,
        })
    }

    /// Destroy and recreate the context for `key`. The workspace is kept.
    pub async fn recreate(&self, key: &str) -> Result<SandboxContext> {
        let now = now_ms();
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        if let Some(old) = guard.take() {
            self.backend.destroy(&old.handle).await?;
        }
        let ctx = self.create(key, now).await?;
        *guard = Some(ctx.clone());
        Ok(ctx)
    }

    /// Destroy the context for `key` if one is live.
    pub async fn destroy(&self, key: &str) -> Result<bool> {
        let Some(slot) = self.slots.get(key).map(|s| Arc::clone(s.value())) else {
            return Ok(false);
        };
        let mut guard = slot.lock().await;
        let Some(old) = guard.take() else {
            return Ok(false);
        };
        self.backend.destroy(&old.handle).await?;
        drop(guard);
        self.forget_if_empty(key);
        Ok(true)
    }

    /// Bind `ctx` to this orchestrator's backend.
    pub fn runner(&self, ctx: SandboxContext) -> SandboxRunner {
        SandboxRunner::new(ctx, Arc::clone(&self.backend))
    }

    pub async fn acquire_runner(&self, key: &str) -> Result<SandboxRunner> {
        Ok(self.runner(self.acquire(key).await?))
    }

    /// File access confined to `ctx`'s workspace plus the allow-list.
    pub fn fs(&self, ctx: &SandboxContext, access: WorkspaceAccess) -> SandboxFs {
        let allowed = self
            .allowed_paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        SandboxFs::new(&ctx.workspace).with_allowed(allowed, access)
    }

    pub async fn list(&self) -> Vec<SandboxContext> {
        let slots: Vec<Slot> = self.slots.iter().map(|s| Arc::clone(s.value())).collect();
        let mut out = Vec::new();
        for slot in slots {
            if let Some(ctx) = slot.lock().await.clone() {
                out.push(ctx);
            }
        }
        out.sort_by(|a, b| a.scope_key.cmp(&b.scope_key));
        out
    }

    pub async fn prune(&self) -> Vec<String> {
        self.prune_at(now_ms()).await
    }

    /// Destroy every context past its idle or age threshold, whatever its scope.
    pub async fn prune_at(&self, now: u64) -> Vec<String> {
        let thresholds = self.thresholds();
        let slots: Vec<(String, Slot)> = self
            .slots
            .iter()
            .map(|s| (s.key().clone(), Arc::clone(s.value())))
            .collect();

        let mut pruned = Vec::new();
        for (key, slot) in slots {
            let mut guard = slot.lock().await;
            let Some(reason) = guard.as_ref().and_then(|ctx| thresholds.stale_reason(ctx, now))
            else {
                continue;
            };
            if let Some(ctx) = guard.take()
                && let Err(e) = self.backend.destroy(&ctx.handle).await
            {
                warn!(scope_key = %key, error = %e, "failed to destroy pruned sandbox");
            }
            drop(guard);
            info!(scope_key = %key, reason, "sandbox pruned");
            self.forget_if_empty(&key);
            pruned.push(key);
        }
        pruned
    }

    /// Drop an empty slot nobody else is holding.
    fn forget_if_empty(&self, key: &str) {
        self.slots.remove_if(key, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|g| g.is_none())
        });
    }

    pub async fn prune_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let every = self.thresholds().prune_every;
            tokio::select! {
                () = tokio::time::sleep(every) => {
                    let pruned = self.prune().await;
                    if !pruned.is_empty() {
                        debug!(count = pruned.len(), "prune sweep finished");
                    }
                },
                () = cancel.cancelled() => break,
            }
        }
    }

    /// Why a session would or would not run sandboxed, and with which tools.
    pub async fn explain(
        &self,
        config: &ClawgateConfig,
        agent_id: &str,
        session_key: &str,
        is_main_session: bool,
        subagent: bool,
    ) -> SandboxExplanation {
        let settings = SandboxSettings::for_agent(config, agent_id);
        let sandboxed = settings.is_sandboxed(is_main_session);
        let key = sandboxed.then(|| scope_key(settings.scope, agent_id, session_key));
        let live = match &key {
            Some(k) => match self.slots.get(k).map(|s| Arc::clone(s.value())) {
                Some(slot) => slot.lock().await.is_some(),
                None => false,
            },
            None => false,
        };
        let policy = resolve_policy(config, agent_id, sandboxed, subagent);
        SandboxExplanation {
            agent_id: agent_id.to_string(),
            session_key: session_key.to_string(),
            settings,
            sandboxed,
            backend: self.backend.backend_name().to_string(),
            workspace: key.as_deref().map(|k| workspace_for(&self.workspace_root, k)),
            scope_key: key,
            live,
            tools: KNOWN_TOOLS.iter().map(|t| policy.decide(t)).collect(),
            policy: policy.layers,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
