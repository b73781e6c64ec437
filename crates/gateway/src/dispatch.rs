//! Inbound dispatch: route a normalized message, run every target agent's
//! turn in its own session, and deliver replies back through the channel.

use std::{sync::Arc, time::Duration};

use {
    clawgate_agents::ChatMessage,
    clawgate_config::{ClawgateConfig, schema::BroadcastStrategy},
    clawgate_protocol::ErrorShape,
    clawgate_routing::{
        ContextSnapshot, MatchedBy, NormalizedMessage, Rejection, RouteDecision, RouteTarget,
    },
    clawgate_sessions::{Role, SessionEntry, SessionKey, TranscriptMessage, metadata::now_ms},
    clawgate_tools::{
        policy::KNOWN_TOOLS,
        resolve_policy,
        sandbox::{SandboxSettings, scope_key},
    },
    dashmap::DashMap,
    futures::future::join_all,
    serde::Serialize,
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use crate::{
    events::GatewayEvent,
    executor::{TurnError, TurnInput, execute_with_deadline},
    state::GatewayState,
};

/// Reply sent when a reset trigger recycles the conversation.
pub const RESET_ACK: &str = "Started a new session.";

/// How long an idle conversation worker lingers before exiting.
const WORKER_IDLE: Duration = Duration::from_secs(300);

/// Where replies go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Send each reply back out through the originating channel.
    Channel,
    /// Only return replies to the caller.
    Caller,
}

// ── Reports ──────────────────────────────────────────────────────────────────

/// Result of one agent's turn inside a dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutcome {
    pub agent_id: String,
    pub session_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reset: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
    /// Set when the reply was produced but the channel refused it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_error: Option<String>,
}

impl AgentOutcome {
    fn new(target: &RouteTarget) -> Self {
        Self {
            agent_id: target.agent_id.clone(),
            session_key: target.session_key.as_str().to_string(),
            session_id: None,
            ok: false,
            reply: None,
            model: None,
            profile_id: None,
            sandbox: None,
            reset: false,
            error: None,
            delivery_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchKind {
    Rejected,
    Single,
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub kind: DispatchKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<BroadcastStrategy>,
    pub results: Vec<AgentOutcome>,
}

impl DispatchReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &AgentOutcome> {
        self.results.iter().filter(|r| r.ok)
    }

    pub fn failed(&self) -> impl Iterator<Item = &AgentOutcome> {
        self.results.iter().filter(|r| !r.ok)
    }
}

/// A finished turn.
struct TurnDone {
    session_id: String,
    text: String,
    model: String,
    profile_id: Option<String>,
    sandbox: Option<String>,
}

fn session_err(e: anyhow::Error) -> TurnError {
    TurnError::Session(format!("{e:#}"))
}

fn to_chat(message: &TranscriptMessage) -> ChatMessage {
    let role = match message.role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    };
    ChatMessage::new(role, message.content.clone())
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

impl GatewayState {
    /// Route `msg` and run every target. Per-agent failures are reported in
    /// the result list and never stop sibling agents.
    pub async fn dispatch(&self, msg: NormalizedMessage, delivery: Delivery) -> DispatchReport {
        let context = self.context.record(&msg);
        let router = self.router();
        let decision = router.route(&msg);

        let (kind, strategy, targets) = match decision {
            RouteDecision::Rejected { rejection } => {
                return DispatchReport {
                    kind: DispatchKind::Rejected,
                    rejection: Some(rejection),
                    strategy: None,
                    results: Vec::new(),
                };
            },
            RouteDecision::Single { target } => (DispatchKind::Single, None, vec![target]),
            RouteDecision::Broadcast { strategy, targets } => {
                (DispatchKind::Broadcast, Some(strategy), targets)
            },
        };

        if router.is_reset_trigger(&msg.body) {
            let results = self.reset_targets(&targets, &msg, delivery).await;
            return DispatchReport {
                kind,
                rejection: None,
                strategy,
                results,
            };
        }

        let cfg = router.config();
        let results = match strategy {
            Some(BroadcastStrategy::Sequential) => {
                let mut out = Vec::with_capacity(targets.len());
                for target in &targets {
                    out.push(self.run_target(cfg, target, &msg, &context, delivery).await);
                }
                out
            },
            _ => {
                join_all(
                    targets
                        .iter()
                        .map(|t| self.run_target(cfg, t, &msg, &context, delivery)),
                )
                .await
            },
        };
        let failed = results.iter().filter(|r| !r.ok).count();
        if failed > 0 {
            warn!(channel = %msg.channel, peer = %msg.peer.id, failed, total = results.len(), "dispatch had failures");
        }
        DispatchReport {
            kind,
            rejection: None,
            strategy,
            results,
        }
    }

    /// Run one turn on an explicit session key, bypassing routing.
    pub async fn run_direct(
        &self,
        key: &SessionKey,
        body: &str,
        sender_id: Option<&str>,
    ) -> AgentOutcome {
        let router = self.router();
        let agent_id = key.agent_id().unwrap_or_default().to_string();
        let target = RouteTarget {
            agent_id,
            session_key: key.clone(),
            matched_by: MatchedBy::Default,
        };
        let mut outcome = AgentOutcome::new(&target);
        if router.is_reset_trigger(body) {
            return self.reset_outcome(&target, "trigger").await;
        }
        let context: ContextSnapshot = Arc::from(Vec::new());
        let prompt = Prompt {
            body,
            sender_id,
            channel: None,
        };
        let result = self.turn(router.config(), &target, &prompt, context).await;
        fill(&mut outcome, result);
        outcome
    }

    async fn run_target(
        &self,
        cfg: &ClawgateConfig,
        target: &RouteTarget,
        msg: &NormalizedMessage,
        context: &ContextSnapshot,
        delivery: Delivery,
    ) -> AgentOutcome {
        let prompt = Prompt {
            body: &msg.body,
            sender_id: Some(&msg.sender_id),
            channel: Some(&msg.channel),
        };
        let mut outcome = AgentOutcome::new(target);
        let result = self.turn(cfg, target, &prompt, Arc::clone(context)).await;
        fill(&mut outcome, result);

        if delivery == Delivery::Channel
            && let Some(reply) = outcome.reply.clone()
        {
            outcome.delivery_error = self.deliver(msg, &reply).await;
        }
        outcome
    }

    async fn deliver(&self, msg: &NormalizedMessage, content: &str) -> Option<String> {
        match self.channels.send(&msg.channel, &msg.peer, content).await {
            Ok(()) => {
                self.events.publish(GatewayEvent::Outbound {
                    channel: msg.channel.clone(),
                    peer: msg.peer.id.clone(),
                    content: content.to_string(),
                });
                None
            },
            Err(e) => Some(e.to_string()),
        }
    }

    async fn turn(
        &self,
        cfg: &ClawgateConfig,
        target: &RouteTarget,
        prompt: &Prompt<'_>,
        context: ContextSnapshot,
    ) -> Result<TurnDone, TurnError> {
        let agent_id = target.agent_id.as_str();
        let key = &target.session_key;
        if !cfg.agents.contains(agent_id) {
            return Err(TurnError::UnknownAgent(agent_id.to_string()));
        }

        self.events.publish(GatewayEvent::TurnStarted {
            agent_id: agent_id.to_string(),
            session_key: key.as_str().to_string(),
        });
        let result = self.turn_locked(cfg, agent_id, key, prompt, context).await;
        self.events.publish(GatewayEvent::TurnFinished {
            agent_id: agent_id.to_string(),
            session_key: key.as_str().to_string(),
            ok: result.is_ok(),
        });
        if let Err(e) = &result {
            warn!(agent_id, session_key = %key, error = %e, "turn failed");
        }
        result
    }

    async fn turn_locked(
        &self,
        cfg: &ClawgateConfig,
        agent_id: &str,
        key: &SessionKey,
        prompt: &Prompt<'_>,
        context: ContextSnapshot,
    ) -> Result<TurnDone, TurnError> {
        let _turn = self.sessions.begin_turn(key).await;
        let session = self.sessions.resolve(key).await.map_err(session_err)?;
        if let Some(old) = &session.recycled_from {
            debug!(session_key = %key, old, new = %session.session_id, "session recycled after idle");
        }
        let history: Vec<ChatMessage> = self
            .sessions
            .history_of(key, &session.session_id)
            .await
            .map_err(session_err)?
            .iter()
            .map(to_chat)
            .collect();

        let settings = SandboxSettings::for_agent(cfg, agent_id);
        let sandboxed = settings.is_sandboxed(key.is_main());
        let sandbox = if sandboxed {
            let scope = scope_key(settings.scope, agent_id, key.as_str());
            Some(
                self.sandbox
                    .acquire_runner(&scope)
                    .await
                    .map_err(|e| TurnError::Sandbox(format!("{e:#}")))?,
            )
        } else {
            None
        };
        let tools = resolve_policy(cfg, agent_id, sandboxed, key.is_subagent())
            .filter(KNOWN_TOOLS)
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut user = TranscriptMessage::user(prompt.body, now_ms());
        user.sender_id = prompt.sender_id.map(str::to_string);
        user.channel = prompt.channel.map(str::to_string);
        // Both halves of the turn land in the session it started in, even if
        // the key is reset while the model is working.
        self.sessions
            .append_to(key, &session.session_id, user)
            .await
            .map_err(session_err)?;

        let cancel = self.shutdown.child_token();
        let _active = self.turns.register(key, cancel.clone());
        let input = TurnInput {
            agent_id: agent_id.to_string(),
            session_key: key.clone(),
            session_id: session.session_id.clone(),
            system_prompt: cfg.agents.get(agent_id).and_then(|a| a.system_prompt.clone()),
            history,
            prompt: prompt.body.to_string(),
            context,
            candidates: cfg.agents.model_for(agent_id).candidates(),
            sandbox,
            tools,
            timeout: Duration::from_millis(cfg.gateway.turn_timeout_ms),
            cancel,
        };
        let reply = execute_with_deadline(self.executor.as_ref(), &input).await?;

        let mut assistant =
            TranscriptMessage::assistant(reply.text.clone(), now_ms());
        assistant.model = Some(reply.model.clone());
        self.sessions
            .append_to(key, &session.session_id, assistant)
            .await
            .map_err(session_err)?;

        Ok(TurnDone {
            session_id: session.session_id,
            text: reply.text,
            model: reply.model,
            profile_id: reply.profile_id,
            sandbox: input.sandbox.map(|r| r.scope_key().to_string()),
        })
    }

    // ── Resets ───────────────────────────────────────────────────────────────

    /// Recycle the session under `key`. `None` when the key was never used.
    pub async fn reset_session(
        &self,
        key: &SessionKey,
        reason: &str,
    ) -> anyhow::Result<Option<SessionEntry>> {
        let entry = self.sessions.reset(key, reason).await?;
        self.models.forget_session(key.as_str()).await;
        if let Some(e) = &entry {
            self.events.publish(GatewayEvent::SessionReset {
                session_key: key.as_str().to_string(),
                session_id: e.session_id.clone(),
            });
        }
        Ok(entry)
    }

    async fn reset_outcome(&self, target: &RouteTarget, reason: &str) -> AgentOutcome {
        let mut outcome = AgentOutcome::new(target);
        outcome.reset = true;
        match self.reset_session(&target.session_key, reason).await {
            Ok(entry) => {
                outcome.ok = true;
                outcome.session_id = entry.map(|e| e.session_id);
                outcome.reply = Some(RESET_ACK.to_string());
            },
            Err(e) => outcome.error = Some(session_err(e).to_error_shape()),
        }
        outcome
    }

    async fn reset_targets(
        &self,
        targets: &[RouteTarget],
        msg: &NormalizedMessage,
        delivery: Delivery,
    ) -> Vec<AgentOutcome> {
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            results.push(self.reset_outcome(target, "trigger").await);
        }
        info!(channel = %msg.channel, peer = %msg.peer.id, targets = targets.len(), "reset trigger handled");
        // One acknowledgement per inbound message, however many agents reset.
        if delivery == Delivery::Channel && results.iter().any(|r| r.ok) {
            let err = self.deliver(msg, RESET_ACK).await;
            if let Some(first) = results.first_mut() {
                first.delivery_error = err;
            }
        }
        results
    }
}

struct Prompt<'a> {
    body: &'a str,
    sender_id: Option<&'a str>,
    channel: Option<&'a str>,
}

fn fill(outcome: &mut AgentOutcome, result: Result<TurnDone, TurnError>) {
    match result {
        Ok(done) => {
            outcome.ok = true;
            outcome.session_id = Some(done.session_id);
            outcome.reply = Some(done.text);
            outcome.model = Some(done.model);
            outcome.profile_id = done.profile_id;
            outcome.sandbox = done.sandbox;
        },
        Err(e) => outcome.error = Some(e.to_error_shape()),
    }
}

// ── Inbound pump ─────────────────────────────────────────────────────────────

type ConversationKey = (String, String);

/// Feeds channel traffic into [`GatewayState::dispatch`].
///
/// Each `(channel, peer)` conversation gets a worker that handles its
/// messages strictly in arrival order; different conversations run
/// concurrently.
pub struct InboundPump {
    state: Arc<GatewayState>,
    workers: Arc<DashMap<ConversationKey, mpsc::UnboundedSender<NormalizedMessage>>>,
}

impl InboundPump {
    pub fn new(state: Arc<GatewayState>) -> Self {
        Self {
            state,
            workers: Arc::new(DashMap::new()),
        }
    }

    /// Run until the gateway starts draining or every adapter hung up.
    pub async fn run(self, mut inbound: mpsc::Receiver<NormalizedMessage>) {
        loop {
            let msg = tokio::select! {
                () = self.state.draining.cancelled() => break,
                msg = inbound.recv() => match msg {
                    Some(m) => m,
                    None => break,
                },
            };
            self.submit(msg);
        }
        debug!("inbound pump stopped");
    }

    fn submit(&self, mut msg: NormalizedMessage) {
        let key = (msg.channel.clone(), msg.peer.id.clone());
        loop {
            let tx = self
                .workers
                .entry(key.clone())
                .or_insert_with(|| self.spawn_worker(key.clone()))
                .clone();
            match tx.send(msg) {
                Ok(()) => return,
                // The worker exited between lookup and send; start a new one.
                Err(mpsc::error::SendError(back)) => {
                    self.workers.remove_if(&key, |_, w| w.same_channel(&tx));
                    msg = back;
                },
            }
        }
    }

    fn spawn_worker(&self, key: ConversationKey) -> mpsc::UnboundedSender<NormalizedMessage> {
        let (tx, mut rx) = mpsc::unbounded_channel::<NormalizedMessage>();
        let state = Arc::clone(&self.state);
        let workers = Arc::clone(&self.workers);
        let me = tx.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    msg = rx.recv() => msg,
                    () = tokio::time::sleep(WORKER_IDLE) => None,
                    () = state.draining.cancelled() => None,
                };
                let Some(msg) = next else {
                    break;
                };
                let report = state
                    .tracker
                    .track_future(state.dispatch(msg, Delivery::Channel))
                    .await;
                debug!(
                    channel = %key.0,
                    peer = %key.1,
                    ok = report.succeeded().count(),
                    failed = report.failed().count(),
                    "inbound dispatched"
                );
            }
            workers.remove_if(&key, |_, w| w.same_channel(&me));
        });
        tx
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::{executor::testing::Script, state::testing::gateway},
        clawgate_config::schema::{AgentConfig, BindingConfig, BindingMatch, SandboxMode},
        clawgate_protocol::error_codes,
        clawgate_routing::Peer,
    };

    fn agent(id: &str) -> AgentConfig {
        AgentConfig {
            id: id.into(),
            ..Default::default()
        }
    }

    fn message(peer: Peer, body: &str) -> NormalizedMessage {
        NormalizedMessage {
            channel: "memory".into(),
            account_id: "default".into(),
            sender_id: peer.id.clone(),
            peer,
            body: body.into(),
            attachments: Vec::new(),
            timestamp: 1,
        }
    }

    fn broadcast_config(strategy: BroadcastStrategy) -> ClawgateConfig {
        let mut cfg = ClawgateConfig::default();
        cfg.agents.list = vec![agent("main"), agent("a"), agent("b")];
        cfg.broadcast.strategy = strategy;
        cfg.broadcast
            .groups
            .insert("room".into(), vec!["a".into(), "b".into()]);
        cfg
    }

    #[tokio::test]
    async fn single_turn_replies_through_the_channel() {
        let gw = gateway(ClawgateConfig::default()).await;
        let report = gw
            .state
            .dispatch(message(Peer::direct("u1"), "hello"), Delivery::Channel)
            .await;

        assert_eq!(report.kind, DispatchKind::Single);
        assert_eq!(report.results.len(), 1);
        let outcome = &report.results[0];
        assert!(outcome.ok, "{outcome:?}");
        assert_eq!(outcome.reply.as_deref(), Some("main: hello"));

        let sent = gw.state.channels.memory("memory").unwrap().take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, "main: hello");

        let key = SessionKey::parse(&outcome.session_key).unwrap();
        let history = gw.state.sessions.history(&key).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].sender_id.as_deref(), Some("u1"));
        assert_eq!(history[1].model.as_deref(), Some("scripted/echo"));
    }

    #[tokio::test]
    async fn second_turn_sees_prior_history() {
        let gw = gateway(ClawgateConfig::default()).await;
        for body in ["one", "two"] {
            gw.state
                .dispatch(message(Peer::direct("u1"), body), Delivery::Caller)
                .await;
        }
        let calls = gw.executor.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].history, 0);
        assert_eq!(calls[1].history, 2);
        assert_eq!(calls[1].session_id, calls[0].session_id);
    }

    #[tokio::test]
    async fn sequential_broadcast_survives_a_failing_agent() {
        let gw = gateway(broadcast_config(BroadcastStrategy::Sequential)).await;
        gw.executor.script("a", Script::Fail("boom".into()));

        let report = gw
            .state
            .dispatch(message(Peer::group("room"), "hi all"), Delivery::Channel)
            .await;
        assert_eq!(report.kind, DispatchKind::Broadcast);
        assert_eq!(report.strategy, Some(BroadcastStrategy::Sequential));

        let by_agent: Vec<_> = report
            .results
            .iter()
            .map(|r| (r.agent_id.as_str(), r.ok))
            .collect();
        assert_eq!(by_agent, vec![("a", false), ("b", true)]);
        assert_eq!(
            report.results[0].error.as_ref().unwrap().code,
            error_codes::AGENT_ERROR
        );

        let order: Vec<_> = gw.executor.calls().into_iter().map(|c| c.agent_id).collect();
        assert_eq!(order, vec!["a", "b"]);

        // Each agent has its own session.
        assert_ne!(report.results[0].session_key, report.results[1].session_key);
        let sent = gw.state.channels.memory("memory").unwrap().take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, "b: hi all");
    }

    #[tokio::test]
    async fn parallel_broadcast_shares_one_context_snapshot() {
        let gw = gateway(broadcast_config(BroadcastStrategy::Parallel)).await;
        gw.state
            .dispatch(message(Peer::group("room"), "first"), Delivery::Caller)
            .await;
        let report = gw
            .state
            .dispatch(message(Peer::group("room"), "second"), Delivery::Caller)
            .await;
        assert_eq!(report.succeeded().count(), 2);

        let calls = gw.executor.calls();
        let latest: Vec<_> = calls.iter().filter(|c| c.prompt == "second").collect();
        assert_eq!(latest.len(), 2);
        for call in latest {
            assert_eq!(call.context, 2);
            assert!(call.system_prompt.as_deref().unwrap().contains("[room] first"));
        }
    }

    #[tokio::test]
    async fn rejected_messages_never_reach_an_agent() {
        let gw = gateway(ClawgateConfig::default()).await;
        let mut msg = message(Peer::direct("u1"), "hello");
        msg.channel = "nowhere".into();
        let report = gw.state.dispatch(msg, Delivery::Channel).await;
        assert_eq!(report.kind, DispatchKind::Rejected);
        assert!(matches!(report.rejection, Some(Rejection::UnknownChannel { .. })));
        assert!(gw.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn first_matching_binding_wins() {
        let mut cfg = ClawgateConfig::default();
        cfg.agents.list = vec![agent("main"), agent("a"), agent("b")];
        for id in ["a", "b"] {
            cfg.bindings.push(BindingConfig {
                agent_id: id.into(),
                matcher: BindingMatch {
                    channel: "memory".into(),
                    ..Default::default()
                },
            });
        }
        let gw = gateway(cfg).await;
        let report = gw
            .state
            .dispatch(message(Peer::direct("u1"), "x"), Delivery::Caller)
            .await;
        assert_eq!(report.results[0].agent_id, "a");
    }

    #[tokio::test]
    async fn reset_trigger_recycles_without_a_model_call() {
        let gw = gateway(ClawgateConfig::default()).await;
        let first = gw
            .state
            .dispatch(message(Peer::direct("u1"), "hello"), Delivery::Channel)
            .await;
        let old_id = first.results[0].session_id.clone().unwrap();
        gw.state.channels.memory("memory").unwrap().take_sent();

        let reset = gw
            .state
            .dispatch(message(Peer::direct("u1"), "/new"), Delivery::Channel)
            .await;
        let outcome = &reset.results[0];
        assert!(outcome.reset);
        assert_ne!(outcome.session_id.as_deref(), Some(old_id.as_str()));
        assert_eq!(gw.executor.calls().len(), 1);

        let sent = gw.state.channels.memory("memory").unwrap().take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, RESET_ACK);
    }

    #[tokio::test]
    async fn sandboxed_agents_get_a_context() {
        let mut cfg = ClawgateConfig::default();
        cfg.sandbox.mode = SandboxMode::All;
        let gw = gateway(cfg).await;
        let report = gw
            .state
            .dispatch(message(Peer::direct("u1"), "hello"), Delivery::Caller)
            .await;
        assert!(report.results[0].ok, "{:?}", report.results[0]);
        assert!(report.results[0].sandbox.is_some());
        let call = &gw.executor.calls()[0];
        assert_eq!(call.sandbox, report.results[0].sandbox);
        assert!(call.tools.iter().any(|t| t == "exec"));
        assert_eq!(gw.state.sandbox.list().await.len(), 1);
    }

    #[tokio::test]
    async fn reset_during_a_turn_keeps_the_reply_in_the_old_session() {
        let gw = gateway(ClawgateConfig::default()).await;
        gw.executor
            .script("main", Script::Delay(Duration::from_millis(200)));
        let key = SessionKey::main("main");

        let state = Arc::clone(&gw.state);
        let turn_key = key.clone();
        let turn = tokio::spawn(async move { state.run_direct(&turn_key, "slow", None).await });
        for _ in 0..100 {
            if gw.state.turns.is_active(&key) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let fresh = gw.state.reset_session(&key, "manual").await.unwrap().unwrap();

        let outcome = turn.await.unwrap();
        assert!(outcome.ok, "{outcome:?}");
        let old_id = outcome.session_id.unwrap();
        assert_ne!(old_id, fresh.session_id);

        assert!(gw.state.sessions.history(&key).await.unwrap().is_empty());
        let old = gw.state.sessions.history_of(&key, &old_id).await.unwrap();
        assert_eq!(old.len(), 2);
        assert_eq!(old[1].content, "main: slow");
    }

    #[tokio::test]
    async fn direct_turn_on_unknown_agent_is_not_found() {
        let gw = gateway(ClawgateConfig::default()).await;
        let outcome = gw
            .state
            .run_direct(&SessionKey::main("ghost"), "hi", None)
            .await;
        assert!(!outcome.ok);
        assert_eq!(outcome.error.unwrap().code, error_codes::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_reports_timeout_and_keeps_session_usable() {
        let mut cfg = ClawgateConfig::default();
        cfg.gateway.turn_timeout_ms = 1_000;
        let gw = gateway(cfg).await;
        gw.executor.script("main", Script::Hang);

        let key = SessionKey::main("main");
        let outcome = gw.state.run_direct(&key, "hi", None).await;
        assert_eq!(outcome.error.unwrap().code, error_codes::TIMEOUT);
        assert!(!gw.state.turns.is_active(&key));

        gw.executor.script("main", Script::Echo);
        let outcome = gw.state.run_direct(&key, "again", None).await;
        assert!(outcome.ok);
    }

    #[tokio::test]
    async fn pump_preserves_per_conversation_order() {
        let mut gw = gateway(ClawgateConfig::default()).await;
        gw.executor
            .script("main", Script::Delay(Duration::from_millis(5)));
        let mem = gw.state.channels.memory("memory").unwrap();
        let inbound = std::mem::replace(&mut gw.inbound, mpsc::channel(1).1);
        tokio::spawn(InboundPump::new(Arc::clone(&gw.state)).run(inbound));

        for i in 0..5 {
            mem.inject(message(Peer::direct("u1"), &format!("m{i}")))
                .await
                .unwrap();
        }
        for _ in 0..200 {
            if mem.sent().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let replies: Vec<_> = mem.take_sent().into_iter().map(|r| r.content).collect();
        assert_eq!(replies, vec!["main: m0", "main: m1", "main: m2", "main: m3", "main: m4"]);
        gw.state.draining.cancel();
    }
}
