use std::sync::Arc;

use {
    clawgate_config::{
        ClawgateConfig,
        schema::BroadcastStrategy,
    },
    clawgate_sessions::SessionKey,
    serde::Serialize,
    tracing::debug,
};

use crate::{
    bindings::{MatchedBy, resolve_agent},
    gating::{Rejection, check},
    message::NormalizedMessage,
};

/// One agent a message is delivered to, with its isolated session key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTarget {
    pub agent_id: String,
    pub session_key: SessionKey,
    pub matched_by: MatchedBy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RouteDecision {
    Rejected {
        #[serde(flatten)]
        rejection: Rejection,
    },
    Single {
        target: RouteTarget,
    },
    Broadcast {
        strategy: BroadcastStrategy,
        targets: Vec<RouteTarget>,
    },
}

impl RouteDecision {
    pub fn targets(&self) -> &[RouteTarget] {
        match self {
            Self::Rejected { .. } => &[],
            Self::Single { target } => std::slice::from_ref(target),
            Self::Broadcast { targets, .. } => targets,
        }
    }
}

/// Stateless router over one config snapshot. Rebuilt on routing reloads.
#[derive(Clone)]
pub struct Router {
    config: Arc<ClawgateConfig>,
}

impl Router {
    pub fn new(config: Arc<ClawgateConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClawgateConfig {
        &self.config
    }

    fn key_for(&self, agent_id: &str, msg: &NormalizedMessage) -> SessionKey {
        SessionKey::for_peer(
            agent_id,
            self.config.session.dm_scope,
            &msg.channel,
            &msg.account_id,
            msg.peer.kind,
            &msg.peer.id,
        )
    }

    /// Gate, then broadcast groups, then bindings in order, then the default agent.
    pub fn route(&self, msg: &NormalizedMessage) -> RouteDecision {
        if let Err(rejection) = check(&self.config.channels, msg) {
            debug!(channel = %msg.channel, peer = %msg.peer.id, %rejection, "inbound rejected");
            return RouteDecision::Rejected { rejection };
        }

        if let Some(agents) = self.config.broadcast.groups.get(&msg.peer.id) {
            let targets = agents
                .iter()
                .map(|agent_id| RouteTarget {
                    agent_id: agent_id.clone(),
                    session_key: self.key_for(agent_id, msg),
                    matched_by: MatchedBy::Broadcast,
                })
                .collect();
            return RouteDecision::Broadcast {
                strategy: self.config.broadcast.strategy,
                targets,
            };
        }

        let (agent_id, matched_by) =
            resolve_agent(&self.config.bindings, self.config.agents.default_agent_id(), msg);
        RouteDecision::Single {
            target: RouteTarget {
                agent_id: agent_id.to_string(),
                session_key: self.key_for(agent_id, msg),
                matched_by,
            },
        }
    }

    pub fn is_reset_trigger(&self, body: &str) -> bool {
        let body = body.trim();
        self.config
            .session
            .reset_triggers
            .iter()
            .any(|t| t.eq_ignore_ascii_case(body))
    }
}
