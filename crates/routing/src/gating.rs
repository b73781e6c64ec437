use std::collections::BTreeMap;

use {
    clawgate_config::schema::{ChannelConfig, MEMORY_CHANNEL},
    serde::Serialize,
};

use crate::message::{NormalizedMessage, PeerKind};

/// Why an inbound message never reached an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    #[error("channel '{channel}' is not configured")]
    UnknownChannel { channel: String },
    #[error("channel '{channel}' is disabled")]
    ChannelDisabled { channel: String },
    #[error("sender '{sender}' is not on the allow list")]
    SenderNotAllowed { sender: String },
    #[error("group message without a mention")]
    MentionRequired,
}

/// Channel allow-list and activation rules, checked before any routing.
pub fn check(
    channels: &BTreeMap<String, ChannelConfig>,
    msg: &NormalizedMessage,
) -> Result<(), Rejection> {
    let implicit;
    let cfg = match channels.get(&msg.channel) {
        Some(cfg) => cfg,
        None if msg.channel == MEMORY_CHANNEL => {
            implicit = ChannelConfig::default();
            &implicit
        },
        None => {
            return Err(Rejection::UnknownChannel {
                channel: msg.channel.clone(),
            });
        },
    };
    if !cfg.enabled {
        return Err(Rejection::ChannelDisabled {
            channel: msg.channel.clone(),
        });
    }
    if !cfg.allow_from.is_empty()
        && !cfg
            .allow_from
            .iter()
            .any(|a| a == "*" || a.eq_ignore_ascii_case(&msg.sender_id))
    {
        return Err(Rejection::SenderNotAllowed {
            sender: msg.sender_id.clone(),
        });
    }
    if msg.peer.kind != PeerKind::Direct && cfg.require_mention && !mentions(cfg, &msg.body) {
        return Err(Rejection::MentionRequired);
    }
    Ok(())
}

fn mentions(cfg: &ChannelConfig, body: &str) -> bool {
    let body = body.to_lowercase();
    cfg.mention_patterns
        .iter()
        .any(|p| !p.is_empty() && body.contains(&p.to_lowercase()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, crate::message::Peer, rstest::rstest};

    fn msg(peer: Peer, sender: &str, body: &str) -> NormalizedMessage {
        NormalizedMessage {
            channel: "slack".into(),
            account_id: "default".into(),
            peer,
            sender_id: sender.into(),
            body: body.into(),
            attachments: Vec::new(),
            timestamp: 0,
        }
    }

    fn channels(cfg: ChannelConfig) -> BTreeMap<String, ChannelConfig> {
        BTreeMap::from([("slack".to_string(), cfg)])
    }

    #[test]
    fn unknown_and_disabled_channels_reject() {
        let m = msg(Peer::direct("u"), "u", "hi");
        assert!(matches!(
            check(&BTreeMap::new(), &m),
            Err(Rejection::UnknownChannel { .. })
        ));
        let disabled = channels(ChannelConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(matches!(check(&disabled, &m), Err(Rejection::ChannelDisabled { .. })));
    }

    #[test]
    fn memory_channel_is_implicit_unless_overridden() {
        let mut m = msg(Peer::direct("u"), "u", "hi");
        m.channel = MEMORY_CHANNEL.into();
        assert!(check(&BTreeMap::new(), &m).is_ok());
        let off = BTreeMap::from([(MEMORY_CHANNEL.to_string(), ChannelConfig {
            enabled: false,
            ..Default::default()
        })]);
        assert!(matches!(check(&off, &m), Err(Rejection::ChannelDisabled { .. })));
    }

    #[test]
    fn allow_list_filters_senders() {
        let cfg = channels(ChannelConfig {
            allow_from: vec!["alice".into()],
            ..Default::default()
        });
        assert!(check(&cfg, &msg(Peer::direct("a"), "Alice", "hi")).is_ok());
        assert_eq!(
            check(&cfg, &msg(Peer::direct("b"), "bob", "hi")),
            Err(Rejection::SenderNotAllowed {
                sender: "bob".into()
            })
        );
    }

    #[rstest]
    #[case::group_without_mention(Peer::group("g"), "hello all", false)]
    #[case::group_with_mention(Peer::group("g"), "hey @claw", true)]
    #[case::direct_never_needs_one(Peer::direct("u"), "no mention", true)]
    fn groups_need_mention_when_required(
        #[case] peer: Peer,
        #[case] body: &str,
        #[case] accepted: bool,
    ) {
        let cfg = channels(ChannelConfig {
            require_mention: true,
            mention_patterns: vec!["@Claw".into()],
            ..Default::default()
        });
        let result = check(&cfg, &msg(peer, "u", body));
        if accepted {
            assert!(result.is_ok());
        } else {
            assert_eq!(result, Err(Rejection::MentionRequired));
        }
    }
}
