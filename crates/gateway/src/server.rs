use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    axum::{
        Json, Router,
        body::Bytes,
        extract::{ConnectInfo, DefaultBodyLimit, Path, Query, State, WebSocketUpgrade},
        http::{HeaderMap, StatusCode},
        response::{IntoResponse, Response},
        routing::{get, post},
    },
    clawgate_config::{ConfigError, ConfigStore, ConfigWatcher, ReloadCoordinator, ReloadOutcome},
    clawgate_protocol::{
        ErrorShape, MAX_PAYLOAD_BYTES, PROTOCOL_VERSION, ResponseFrame, TICK_INTERVAL_MS,
        error_codes,
    },
    clawgate_routing::{Attachment, NormalizedMessage, Peer},
    clawgate_sessions::metadata::now_ms,
    serde::Deserialize,
    tokio::sync::{mpsc, watch},
    tokio_util::sync::CancellationToken,
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{debug, info, warn},
};

use crate::{
    auth,
    dispatch::InboundPump,
    events::GatewayEvent,
    exit_codes,
    lock::{GatewayLock, LockError},
    methods::{MethodContext, MethodRegistry},
    reload,
    state::{GatewayOptions, GatewayState},
    ws::handle_connection,
};

/// Upper bound on waiting for the HTTP server task once connections were told to close.
const SERVER_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Lock(LockError::Held { .. }) => exit_codes::LOCK_HELD,
            Self::Lock(LockError::InvalidAddress { .. }) | Self::Config(_) => {
                exit_codes::CONFIG_INVALID
            },
            Self::Lock(LockError::Bind { .. }) | Self::Fatal(_) => exit_codes::FATAL,
        }
    }
}

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
struct AppState {
    gateway: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
}

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>, methods: Arc<MethodRegistry>) -> Router {
    let app_state = AppState {
        gateway: state,
        methods,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/rpc", post(rpc_handler))
        .route("/ws", get(ws_upgrade_handler))
        .route("/channels/{name}/inbound", post(webhook_handler))
        .layer(DefaultBodyLimit::max(MAX_PAYLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

// ── Server lifecycle ─────────────────────────────────────────────────────────

/// Owns the config store across generations. A restart-classified reload
/// ends the current generation and binds a new one with the fresh snapshot.
pub struct GatewayServer {
    store: Arc<ConfigStore>,
    opts: GatewayOptions,
    stop: CancellationToken,
    bound: watch::Sender<Option<SocketAddr>>,
}

impl GatewayServer {
    pub fn new(store: Arc<ConfigStore>, opts: GatewayOptions) -> Self {
        Self {
            store,
            opts,
            stop: CancellationToken::new(),
            bound: watch::Sender::new(None),
        }
    }

    /// Cancel to drain and exit.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// The listen address of the live generation, `None` between generations.
    pub fn bound(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.bound.subscribe()
    }

    /// Run until stopped. Fails when the port is owned elsewhere or a
    /// generation cannot be built.
    pub async fn run(self) -> Result<(), GatewayError> {
        let (outcome_tx, mut outcomes) = mpsc::unbounded_channel();
        let _watcher = match self.store.path() {
            Some(path) => match ConfigWatcher::start(path) {
                Ok((watcher, changes)) => {
                    tokio::spawn(ReloadCoordinator::new(Arc::clone(&self.store)).run(
                        changes,
                        outcome_tx.clone(),
                        self.stop.clone(),
                    ));
                    Some(watcher)
                },
                Err(e) => {
                    warn!(error = %e, "config watcher unavailable, edits apply on restart");
                    None
                },
            },
            None => None,
        };

        let mut generation = 0u32;
        loop {
            generation += 1;
            let cfg = self.store.snapshot();
            let lock = GatewayLock::acquire(&cfg.gateway.bind, cfg.gateway.port).await?;
            let restart = self.serve_generation(lock, &mut outcomes, generation).await?;
            if !restart {
                info!("gateway stopped");
                return Ok(());
            }
            info!(generation, "restarting gateway with the new config");
        }
    }

    async fn serve_generation(
        &self,
        lock: GatewayLock,
        outcomes: &mut mpsc::UnboundedReceiver<ReloadOutcome>,
        generation: u32,
    ) -> Result<bool, GatewayError> {
        let addr = lock.local_addr();
        let (state, inbound) = GatewayState::build(Arc::clone(&self.store), self.opts.clone()).await?;
        state.set_local_addr(addr);
        state.spawn_maintenance();

        let methods = Arc::new(MethodRegistry::new());
        let pump = tokio::spawn(InboundPump::new(Arc::clone(&state)).run(inbound));
        spawn_tick(Arc::clone(&state));
        print_banner(&state, &methods, addr, generation);

        let app = build_gateway_app(Arc::clone(&state), Arc::clone(&methods));
        let draining = state.draining.clone();
        let mut server = tokio::spawn(async move {
            axum::serve(
                lock.into_listener(),
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { draining.cancelled().await })
            .await
        });
        self.bound.send_replace(Some(addr));

        let restart = loop {
            tokio::select! {
                () = self.stop.cancelled() => break false,
                () = state.restart.cancelled() => break true,
                Some(outcome) = outcomes.recv() => {
                    reload::handle_outcome(&state, outcome).await;
                },
                result = &mut server => {
                    // The listener died under us; nothing left to serve.
                    let err = match result {
                        Ok(Ok(())) => anyhow::anyhow!("http server exited unexpectedly"),
                        Ok(Err(e)) => anyhow::Error::new(e).context("http server failed"),
                        Err(e) => anyhow::Error::new(e).context("http server task failed"),
                    };
                    drain(&state, false).await;
                    self.bound.send_replace(None);
                    return Err(err.into());
                },
            }
        };

        drain(&state, restart).await;
        match tokio::time::timeout(SERVER_STOP_GRACE, &mut server).await {
            Ok(Ok(Ok(()))) => debug!("http server stopped"),
            Ok(Ok(Err(e))) => warn!(error = %e, "http server stopped with an error"),
            Ok(Err(e)) => warn!(error = %e, "http server task failed"),
            Err(_) => {
                warn!("http server did not stop in time");
                server.abort();
            },
        }
        pump.abort();
        self.bound.send_replace(None);
        Ok(restart)
    }
}

/// Stop intake, give in-flight turns the configured grace period, then
/// cancel whatever is left.
async fn drain(state: &GatewayState, restart: bool) {
    let grace = Duration::from_millis(state.config.snapshot().gateway.shutdown_grace_ms);
    info!(restart, grace_ms = grace.as_millis(), "draining gateway");
    state.draining.cancel();
    state.events.publish(GatewayEvent::Shutdown { restart });

    state.tracker.close();
    if tokio::time::timeout(grace, state.tracker.wait()).await.is_err() {
        let active = state.turns.keys();
        warn!(?active, "grace period elapsed, aborting in-flight turns");
    }
    state.shutdown.cancel();
    let aborted = state.turns.abort_all();
    let killed = state.processes.kill_all();
    // Aborted turns still need to record their outcome.
    state.tracker.wait().await;
    info!(aborted, killed, "gateway drained");
}

fn spawn_tick(state: Arc<GatewayState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
        interval.tick().await;
        loop {
            tokio::select! {
                () = state.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    state.events.publish(GatewayEvent::Tick);
                },
            }
        }
    });
}

fn print_banner(state: &GatewayState, methods: &MethodRegistry, addr: SocketAddr, generation: u32) {
    let cfg = state.config.snapshot();
    let config_path = state
        .config
        .path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults)".into());
    let lines = [
        format!("clawgate gateway v{}", state.version),
        format!("protocol v{PROTOCOL_VERSION}, listening on {addr}"),
        format!(
            "{} methods registered, generation {generation}",
            methods.method_names().len()
        ),
        format!("agents: {}", cfg.agents.ids().join(", ")),
        format!("sandbox: {}", state.sandbox.backend_name()),
        format!("config: {config_path}"),
    ];
    let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));
}

// ── Handlers ─────────────────────────────────────────────────────────────────

fn unauthorized(failure: auth::AuthFailure) -> Response {
    let frame = ResponseFrame::err(
        "",
        ErrorShape::new(error_codes::UNAUTHORIZED, failure.as_str()),
    );
    (StatusCode::UNAUTHORIZED, Json(frame)).into_response()
}

fn check_auth(state: &GatewayState, provided: Option<&str>) -> Result<(), Response> {
    let expected = auth::resolve_token(&state.config.snapshot());
    auth::authorize(expected.as_deref(), provided).map_err(|failure| {
        warn!(reason = failure.as_str(), "request refused");
        unauthorized(failure)
    })
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": state.gateway.version,
        "protocol": PROTOCOL_VERSION,
        "connections": state.gateway.client_count(),
    }))
}

/// `/rpc` accepts a request frame with `type` optional.
#[derive(Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<String>,
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

async fn rpc_handler(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(resp) = check_auth(&state.gateway, auth::bearer_token(&headers)) {
        return resp;
    }
    let req: RpcRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            let frame = ResponseFrame::err(
                "",
                ErrorShape::new(error_codes::INVALID_REQUEST, format!("invalid request: {e}")),
            );
            return (StatusCode::BAD_REQUEST, Json(frame)).into_response();
        },
    };
    let ctx = MethodContext {
        request_id: req.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        method: req.method,
        params: req.params,
        client_conn_id: "http".into(),
        state: Arc::clone(&state.gateway),
    };
    Json(state.methods.dispatch(ctx).await).into_response()
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> Response {
    let provided = auth::bearer_token(&headers).or(query.token.as_deref());
    if let Err(resp) = check_auth(&state.gateway, provided) {
        return resp;
    }
    if state.gateway.draining.is_cancelled() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.max_message_size(MAX_PAYLOAD_BYTES)
        .on_upgrade(move |socket| handle_connection(socket, state.gateway, state.methods, addr))
}

/// Body of `POST /channels/{name}/inbound`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookInbound {
    #[serde(default)]
    account_id: Option<String>,
    peer: Peer,
    sender_id: String,
    body: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
    #[serde(default)]
    timestamp: Option<u64>,
}

async fn webhook_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = check_auth(&state.gateway, auth::bearer_token(&headers)) {
        return resp;
    }
    if state.gateway.draining.is_cancelled() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let Some(channel) = state.gateway.channels.webhook(&name) else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no webhook channel named '{name}'") })),
        )
            .into_response();
    };
    let inbound: WebhookInbound = match serde_json::from_slice(&body) {
        Ok(inbound) => inbound,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("invalid message: {e}") })),
            )
                .into_response();
        },
    };
    let msg = NormalizedMessage {
        channel: name.clone(),
        account_id: inbound.account_id.unwrap_or_else(|| "default".into()),
        peer: inbound.peer,
        sender_id: inbound.sender_id,
        body: inbound.body,
        attachments: inbound.attachments,
        timestamp: inbound.timestamp.unwrap_or_else(now_ms),
    };
    match channel.receive(msg).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(serde_json::json!({ "accepted": true }))).into_response(),
        Err(e) => {
            warn!(channel = %name, error = %e, "webhook message not queued");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        },
    }
}
