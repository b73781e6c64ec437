use serde::{Deserialize, Serialize};

pub use clawgate_config::schema::{DmScope, PeerKind};

/// Session key: `agent:<agentId>:<channel-scope>`.
///
/// Direct messages collapse according to [`DmScope`]; group and channel
/// peers always get their own key. Keys are lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(pub String);

impl SessionKey {
    pub fn main(agent_id: &str) -> Self {
        Self(format!("agent:{agent_id}:main").to_lowercase())
    }

    pub fn for_peer(
        agent_id: &str,
        dm_scope: DmScope,
        channel: &str,
        account_id: &str,
        peer_kind: PeerKind,
        peer_id: &str,
    ) -> Self {
        let raw = match (peer_kind, dm_scope) {
            (PeerKind::Direct, DmScope::Main) => format!("agent:{agent_id}:main"),
            (PeerKind::Direct, DmScope::PerPeer) => format!("agent:{agent_id}:dm:{peer_id}"),
            (PeerKind::Direct, DmScope::PerChannelPeer) => {
                format!("agent:{agent_id}:{channel}:dm:{peer_id}")
            },
            (PeerKind::Direct, DmScope::PerAccountChannelPeer) => {
                format!("agent:{agent_id}:{channel}:{account_id}:dm:{peer_id}")
            },
            (PeerKind::Group, _) => format!("agent:{agent_id}:{channel}:group:{peer_id}"),
            (PeerKind::Channel, _) => format!("agent:{agent_id}:{channel}:channel:{peer_id}"),
        };
        Self(raw.to_lowercase())
    }

    /// Key for a subagent spawned from a parent turn.
    pub fn subagent(agent_id: &str, label: &str) -> Self {
        Self(format!("agent:{agent_id}:subagent:{label}").to_lowercase())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let key = Self(raw.trim().to_lowercase());
        key.agent_id()?;
        Some(key)
    }

    pub fn agent_id(&self) -> Option<&str> {
        let rest = self.0.strip_prefix("agent:")?;
        let (agent, scope) = rest.split_once(':')?;
        (!agent.is_empty() && !scope.is_empty()).then_some(agent)
    }

    pub fn is_main(&self) -> bool {
        self.0.ends_with(":main") && self.0.matches(':').count() == 2
    }

    pub fn is_subagent(&self) -> bool {
        self.0.contains(":subagent:")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
