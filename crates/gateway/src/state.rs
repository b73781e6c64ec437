use std::{
    net::SocketAddr,
    sync::{
        Arc, OnceLock, PoisonError, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use {
    anyhow::Context,
    clawgate_agents::{AuthProfileRegistry, ModelRegistry},
    clawgate_channels::{ChannelRegistry, InboundSink},
    clawgate_config::{ClawgateConfig, ConfigStore, expand_home, state_dir},
    clawgate_routing::{NormalizedMessage, RecentContext, Router},
    clawgate_sessions::SessionRegistry,
    clawgate_tools::{
        ProcessRegistry,
        sandbox::{SandboxBackend, SandboxOrchestrator, create_backend},
    },
    tokio::sync::mpsc,
    tokio_util::{sync::CancellationToken, task::TaskTracker},
    tracing::{debug, info},
};

use crate::{
    events::EventBus,
    executor::{ActiveTurns, AgentExecutor, LiveExecutor},
};

/// Queue depth between channel adapters and the dispatcher.
const INBOUND_CAPACITY: usize = 1024;

/// Applies a new `logging.level` to the process-wide subscriber.
pub type LogLevelHook = Arc<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>;

/// Overrides for [`GatewayState::build`]; production leaves them empty.
#[derive(Default, Clone)]
pub struct GatewayOptions {
    pub executor: Option<Arc<dyn AgentExecutor>>,
    pub sandbox_backend: Option<Arc<dyn SandboxBackend>>,
    pub log_level_hook: Option<LogLevelHook>,
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Composition root: one instance of every registry, shared by `Arc`.
pub struct GatewayState {
    pub version: String,
    pub started_at: Instant,
    pub config: Arc<ConfigStore>,
    router: RwLock<Arc<Router>>,
    pub context: RecentContext,
    pub sessions: Arc<SessionRegistry>,
    pub profiles: Arc<AuthProfileRegistry>,
    pub models: Arc<ModelRegistry>,
    pub executor: Arc<dyn AgentExecutor>,
    pub sandbox: Arc<SandboxOrchestrator>,
    pub processes: ProcessRegistry,
    pub channels: Arc<ChannelRegistry>,
    pub events: EventBus,
    pub turns: ActiveTurns,
    pub log_level_hook: Option<LogLevelHook>,
    /// Stop accepting new work.
    pub draining: CancellationToken,
    /// Cancel whatever is still running. Turn tokens are children of this.
    pub shutdown: CancellationToken,
    /// Fired by a restart-classified reload.
    pub restart: CancellationToken,
    /// In-flight turns, waited on during drain.
    pub tracker: TaskTracker,
    ws_clients: AtomicUsize,
    local_addr: OnceLock<SocketAddr>,
}

impl GatewayState {
    /// Build every registry from the store's current snapshot. Returns the
    /// receiving end of the inbound channel queue.
    pub async fn build(
        config: Arc<ConfigStore>,
        opts: GatewayOptions,
    ) -> anyhow::Result<(Arc<Self>, mpsc::Receiver<NormalizedMessage>)> {
        let cfg = config.snapshot();
        let state_root = state_dir(&cfg);
        std::fs::create_dir_all(&state_root)
            .with_context(|| format!("failed to create state dir {}", state_root.display()))?;

        let sessions = Arc::new(SessionRegistry::new(&state_root, idle_window(&cfg)));
        let profiles = Arc::new(AuthProfileRegistry::new(
            state_root.clone(),
            cfg.auth.cooldowns.clone(),
            cfg.auth.order.clone(),
            cfg.models.clone(),
        ));
        let models = Arc::new(ModelRegistry::persistent(&cfg, &state_root));
        let executor = opts.executor.unwrap_or_else(|| {
            Arc::new(LiveExecutor::new(Arc::clone(&models), Arc::clone(&profiles)))
        });

        let workspace_root = cfg
            .sandbox
            .workspace_root
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| state_root.join("sandboxes"));
        let backend = match opts.sandbox_backend {
            Some(b) => b,
            None => {
                let sandbox_cfg = cfg.sandbox.clone();
                tokio::task::spawn_blocking(move || create_backend(&sandbox_cfg))
                    .await
                    .context("sandbox backend detection failed")?
            },
        };
        let sandbox = Arc::new(SandboxOrchestrator::new(&cfg.sandbox, workspace_root, backend));

        let (sink, inbound_rx) = InboundSink::channel(INBOUND_CAPACITY);
        let channels = Arc::new(ChannelRegistry::new(sink));
        channels
            .apply_config(&cfg.channels)
            .await
            .context("failed to start channels")?;

        let state = Arc::new(Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Instant::now(),
            router: RwLock::new(Arc::new(Router::new(Arc::clone(&cfg)))),
            context: RecentContext::new(cfg.routing.context_window),
            sessions,
            profiles,
            models,
            executor,
            sandbox,
            processes: ProcessRegistry::from_config(&cfg.process),
            channels,
            events: EventBus::new(),
            turns: ActiveTurns::default(),
            log_level_hook: opts.log_level_hook,
            draining: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            restart: CancellationToken::new(),
            tracker: TaskTracker::new(),
            ws_clients: AtomicUsize::new(0),
            local_addr: OnceLock::new(),
            config,
        });
        info!(
            state_dir = %state_root.display(),
            sandbox = state.sandbox.backend_name(),
            agents = cfg.agents.ids().len(),
            "gateway state built"
        );
        Ok((state, inbound_rx))
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Rebuild the router over the store's current snapshot.
    pub fn refresh_router(&self) -> Arc<ClawgateConfig> {
        let cfg = self.config.snapshot();
        *self.router.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(Router::new(Arc::clone(&cfg)));
        debug!("router rebuilt");
        cfg
    }

    pub fn set_local_addr(&self, addr: SocketAddr) {
        let _ = self.local_addr.set(addr);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn client_connected(&self) -> usize {
        self.ws_clients.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn client_disconnected(&self) {
        self.ws_clients.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn client_count(&self) -> usize {
        self.ws_clients.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Spawn the periodic sandbox prune and process sweep loops. Both stop
    /// on `shutdown`.
    pub fn spawn_maintenance(self: &Arc<Self>) {
        tokio::spawn(Arc::clone(&self.sandbox).prune_loop(self.shutdown.clone()));
        tokio::spawn(
            self.processes
                .clone()
                .sweep_loop(PROCESS_SWEEP_EVERY, self.shutdown.clone()),
        );
    }
}

const PROCESS_SWEEP_EVERY: Duration = Duration::from_secs(60);

pub(crate) fn idle_window(cfg: &ClawgateConfig) -> Duration {
    Duration::from_secs(cfg.session.idle_minutes.saturating_mul(60))
}
