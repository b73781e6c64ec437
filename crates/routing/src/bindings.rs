use {clawgate_config::schema::BindingConfig, serde::Serialize};

use crate::message::NormalizedMessage;

/// How the agent for a message was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "by", rename_all = "lowercase")]
pub enum MatchedBy {
    Binding { index: usize },
    Broadcast,
    Default,
}

pub fn matches(binding: &BindingConfig, msg: &NormalizedMessage) -> bool {
    let m = &binding.matcher;
    if !m.channel.eq_ignore_ascii_case(&msg.channel) {
        return false;
    }
    if let Some(account) = &m.account_id
        && account != "*"
        && !account.eq_ignore_ascii_case(&msg.account_id)
    {
        return false;
    }
    if let Some(peer) = &m.peer
        && (peer.kind != msg.peer.kind || !peer.id.eq_ignore_ascii_case(&msg.peer.id))
    {
        return false;
    }
    true
}

/// First binding (in list order) whose predicate matches, else the default agent.
pub fn resolve_agent<'a>(
    bindings: &'a [BindingConfig],
    default_agent: &'a str,
    msg: &NormalizedMessage,
) -> (&'a str, MatchedBy) {
    bindings
        .iter()
        .enumerate()
        .find(|(_, b)| matches(b, msg))
        .map(|(index, b)| (b.agent_id.as_str(), MatchedBy::Binding { index }))
        .unwrap_or((default_agent, MatchedBy::Default))
}
