//! Runs one agent turn against the model layer, under a deadline and a
//! per-session cancellation token.

use std::{
    fmt::Write as _,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    clawgate_agents::{
        Attempt, AuthError, AuthProfileRegistry, ChatMessage, FailoverError, ModelRegistry,
        ModelReply, ModelRequest, run_with_failover,
    },
    clawgate_protocol::{ErrorShape, error_codes},
    clawgate_routing::ContextSnapshot,
    clawgate_sessions::SessionKey,
    clawgate_tools::sandbox::SandboxRunner,
    dashmap::DashMap,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

// ── Turn input ───────────────────────────────────────────────────────────────

/// Everything an executor sees for one turn.
#[derive(Debug, Clone)]
pub struct TurnInput {
    pub agent_id: String,
    pub session_key: SessionKey,
    pub session_id: String,
    pub system_prompt: Option<String>,
    /// Prior transcript of this agent's own session, oldest first.
    pub history: Vec<ChatMessage>,
    pub prompt: String,
    /// Recent inbound messages from the triggering conversation, shared by
    /// every agent a broadcast fans out to.
    pub context: ContextSnapshot,
    /// `provider/model` candidates, primary first.
    pub candidates: Vec<String>,
    /// Set for sandboxed sessions; process-backed models run inside it.
    pub sandbox: Option<SandboxRunner>,
    /// Tools the layered policy allows for this turn.
    pub tools: Vec<String>,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("turn timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("turn cancelled")]
    Cancelled,
    #[error("all models failed: {}", summarize(.0))]
    AllModelsFailed(Vec<Attempt>),
    #[error("sandbox unavailable: {0}")]
    Sandbox(String),
    #[error("session store failed: {0}")]
    Session(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),
    #[error("{0}")]
    Agent(String),
}

fn summarize(attempts: &[Attempt]) -> String {
    if attempts.is_empty() {
        return "no candidates configured".into();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<FailoverError> for TurnError {
    fn from(e: FailoverError) -> Self {
        match e {
            FailoverError::AllModelsFailed { attempts } => Self::AllModelsFailed(attempts),
            FailoverError::Cancelled => Self::Cancelled,
        }
    }
}

impl TurnError {
    pub fn to_error_shape(&self) -> ErrorShape {
        let message = self.to_string();
        match self {
            Self::Timeout(_) => ErrorShape::new(error_codes::TIMEOUT, message).retryable(),
            Self::Cancelled => ErrorShape::new(error_codes::CANCELLED, message),
            Self::AllModelsFailed(_) => {
                ErrorShape::new(error_codes::ALL_MODELS_FAILED, message).retryable()
            },
            Self::Sandbox(_) => ErrorShape::new(error_codes::UNAVAILABLE, message).retryable(),
            Self::UnknownAgent(_) => ErrorShape::new(error_codes::NOT_FOUND, message),
            Self::Agent(_) => ErrorShape::new(error_codes::AGENT_ERROR, message),
            Self::Session(_) | Self::Auth(_) => ErrorShape::new(error_codes::INTERNAL, message),
        }
    }
}

// ── Executors ────────────────────────────────────────────────────────────────

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, input: &TurnInput) -> Result<ModelReply, TurnError>;
}

/// Model failover over the configured providers and the agent's auth profiles.
pub struct LiveExecutor {
    models: Arc<ModelRegistry>,
    profiles: Arc<AuthProfileRegistry>,
}

impl LiveExecutor {
    pub fn new(models: Arc<ModelRegistry>, profiles: Arc<AuthProfileRegistry>) -> Self {
        Self { models, profiles }
    }
}

#[async_trait]
impl AgentExecutor for LiveExecutor {
    async fn execute(&self, input: &TurnInput) -> Result<ModelReply, TurnError> {
        let store = self.profiles.for_agent(&input.agent_id).await?;
        let req = model_request(input);
        let reply = run_with_failover(self.models.as_ref(), &store, &input.candidates, &req).await?;
        info!(
            agent_id = %input.agent_id,
            session_key = %input.session_key,
            model = %reply.model,
            "turn answered"
        );
        Ok(reply)
    }
}

/// The model-layer view of a turn: its tool policy and sandbox travel with it.
pub fn model_request(input: &TurnInput) -> ModelRequest {
    ModelRequest {
        session_key: input.session_key.as_str().to_string(),
        session_id: input.session_id.clone(),
        system_prompt: compose_system_prompt(input),
        messages: input.history.clone(),
        prompt: input.prompt.clone(),
        tools: Some(input.tools.clone()),
        sandbox: input.sandbox.clone(),
        timeout: input.timeout,
        cancel: input.cancel.clone(),
    }
}

/// The agent's own prompt, followed by the shared recent context when the
/// conversation has more than the triggering message.
pub fn compose_system_prompt(input: &TurnInput) -> Option<String> {
    let earlier = input.context.len().saturating_sub(1);
    if earlier == 0 {
        return input.system_prompt.clone();
    }
    let mut out = input.system_prompt.clone().unwrap_or_default();
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str("Recent messages in this conversation:\n");
    for entry in &input.context[..earlier] {
        let _ = writeln!(out, "[{}] {}", entry.sender_id, entry.body);
    }
    Some(out.trim_end().to_string())
}

/// Run `executor` until it answers, the deadline passes, or the turn is
/// cancelled. A missed deadline cancels the turn token so backends stop.
pub async fn execute_with_deadline(
    executor: &dyn AgentExecutor,
    input: &TurnInput,
) -> Result<ModelReply, TurnError> {
    tokio::select! {
        res = executor.execute(input) => res,
        () = tokio::time::sleep(input.timeout) => {
            input.cancel.cancel();
            warn!(session_key = %input.session_key, timeout_ms = input.timeout.as_millis() as u64, "turn deadline exceeded");
            Err(TurnError::Timeout(input.timeout))
        },
        () = input.cancel.cancelled() => Err(TurnError::Cancelled),
    }
}

// ── Active turns ─────────────────────────────────────────────────────────────

/// Cancellation handles of in-flight turns, one per session key.
#[derive(Default)]
pub struct ActiveTurns {
    turns: DashMap<String, (u64, CancellationToken)>,
    next_id: AtomicU64,
}

/// Deregisters its turn on drop, unless a newer turn took the slot.
pub struct ActiveTurnGuard<'a> {
    turns: &'a ActiveTurns,
    key: String,
    id: u64,
}

impl Drop for ActiveTurnGuard<'_> {
    fn drop(&mut self) {
        self.turns.turns.remove_if(&self.key, |_, (id, _)| *id == self.id);
    }
}

impl ActiveTurns {
    pub fn register(&self, key: &SessionKey, token: CancellationToken) -> ActiveTurnGuard<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.turns.insert(key.as_str().to_string(), (id, token));
        ActiveTurnGuard {
            turns: self,
            key: key.as_str().to_string(),
            id,
        }
    }

    /// Cancel the in-flight turn for exactly this key.
    pub fn abort(&self, key: &SessionKey) -> bool {
        match self.turns.get(key.as_str()) {
            Some(entry) => {
                entry.value().1.cancel();
                debug!(session_key = %key, "turn aborted");
                true
            },
            None => false,
        }
    }

    pub fn abort_all(&self) -> usize {
        let mut n = 0;
        for entry in self.turns.iter() {
            entry.value().1.cancel();
            n += 1;
        }
        n
    }

    pub fn is_active(&self, key: &SessionKey) -> bool {
        self.turns.contains_key(key.as_str())
    }

    pub fn keys(&self) -> Vec<String> {
        self.turns.iter().map(|e| e.key().clone()).collect()
    }
}

// ── Test executor ────────────────────────────────────────────────────────────
