use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
};

use {
    clawgate_config::schema::{ChannelConfig, ChannelKind, MEMORY_CHANNEL},
    clawgate_routing::Peer,
    tracing::{info, warn},
};

use crate::{
    adapter::{ChannelAdapter, ChannelError, ChannelStatus, InboundSink},
    memory::MemoryChannel,
    webhook::WebhookChannel,
};

#[derive(Clone)]
pub enum AnyChannel {
    Memory(Arc<MemoryChannel>),
    Webhook(Arc<WebhookChannel>),
}

impl AnyChannel {
    pub fn adapter(&self) -> &dyn ChannelAdapter {
        match self {
            Self::Memory(c) => c.as_ref(),
            Self::Webhook(c) => c.as_ref(),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.adapter().kind()
    }
}

struct Entry {
    channel: AnyChannel,
    enabled: bool,
    outbound_url: Option<String>,
}

/// Live channel adapters keyed by configured name.
pub struct ChannelRegistry {
    client: reqwest::Client,
    sink: InboundSink,
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl ChannelRegistry {
    pub fn new(sink: InboundSink) -> Self {
        Self {
            client: reqwest::Client::new(),
            sink,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    fn build(&self, name: &str, cfg: &ChannelConfig) -> AnyChannel {
        match cfg.kind {
            ChannelKind::Memory => AnyChannel::Memory(Arc::new(MemoryChannel::new(name))),
            ChannelKind::Webhook => AnyChannel::Webhook(Arc::new(WebhookChannel::new(
                name,
                cfg.outbound_url.clone().unwrap_or_default(),
                self.client.clone(),
            ))),
        }
    }

    /// Reconcile adapters with config. Unchanged adapters are kept as-is so
    /// their queued state survives; new ones are started against the sink.
    pub async fn apply_config(&self, channels: &BTreeMap<String, ChannelConfig>) -> Result<(), ChannelError> {
        let mut wanted: BTreeMap<String, ChannelConfig> = channels.clone();
        wanted.entry(MEMORY_CHANNEL.to_string()).or_default();

        let mut started = Vec::new();
        {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            entries.retain(|name, _| wanted.contains_key(name));
            for (name, cfg) in &wanted {
                let reuse = entries.get(name).is_some_and(|e| {
                    e.channel.kind() == cfg.kind && e.outbound_url == cfg.outbound_url
                });
                if reuse {
                    if let Some(e) = entries.get_mut(name) {
                        e.enabled = cfg.enabled;
                    }
                    continue;
                }
                let channel = self.build(name, cfg);
                started.push(channel.clone());
                entries.insert(name.clone(), Entry {
                    channel,
                    enabled: cfg.enabled,
                    outbound_url: cfg.outbound_url.clone(),
                });
            }
        }
        for channel in started {
            let adapter = channel.adapter();
            adapter.start(self.sink.clone()).await?;
            info!(channel = adapter.name(), kind = ?adapter.kind(), "channel started");
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<AnyChannel> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|e| e.channel.clone())
    }

    pub fn memory(&self, name: &str) -> Option<Arc<MemoryChannel>> {
        match self.get(name)? {
            AnyChannel::Memory(c) => Some(c),
            AnyChannel::Webhook(_) => None,
        }
    }

    pub fn webhook(&self, name: &str) -> Option<Arc<WebhookChannel>> {
        match self.get(name)? {
            AnyChannel::Webhook(c) => Some(c),
            AnyChannel::Memory(_) => None,
        }
    }

    pub fn list(&self) -> Vec<ChannelStatus> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, e)| ChannelStatus {
                name: name.clone(),
                kind: e.channel.kind(),
                enabled: e.enabled,
            })
            .collect()
    }

    pub async fn send(&self, channel: &str, peer: &Peer, content: &str) -> Result<(), ChannelError> {
        let (adapter, enabled) = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            let e = entries
                .get(channel)
                .ok_or_else(|| ChannelError::UnknownChannel(channel.to_string()))?;
            (e.channel.clone(), e.enabled)
        };
        if !enabled {
            return Err(ChannelError::Disabled(channel.to_string()));
        }
        adapter.adapter().send_outbound(peer, content).await.inspect_err(|e| {
            warn!(channel, error = %e, "outbound delivery failed");
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, clawgate_routing::NormalizedMessage};

    fn webhook(url: &str) -> ChannelConfig {
        ChannelConfig {
            kind: ChannelKind::Webhook,
            outbound_url: Some(url.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn memory_channel_always_present_and_started() {
        let (sink, mut rx) = InboundSink::channel(4);
        let reg = ChannelRegistry::new(sink);
        reg.apply_config(&BTreeMap::new()).await.unwrap();

        let mem = reg.memory(MEMORY_CHANNEL).unwrap();
        mem.inject(NormalizedMessage {
            channel: String::new(),
            account_id: "default".into(),
            peer: Peer::direct("u"),
            sender_id: "u".into(),
            body: "ping".into(),
            attachments: Vec::new(),
            timestamp: 1,
        })
        .await
        .unwrap();
        assert_eq!(rx.recv().await.unwrap().channel, "memory");

        reg.send("memory", &Peer::direct("u"), "pong").await.unwrap();
        assert_eq!(mem.sent()[0].content, "pong");
    }

    #[tokio::test]
    async fn reconcile_keeps_unchanged_and_rebuilds_changed() {
        let (sink, _rx) = InboundSink::channel(4);
        let reg = ChannelRegistry::new(sink);
        let mut cfg = BTreeMap::from([("hooks".to_string(), webhook("http://127.0.0.1:9/a"))]);
        reg.apply_config(&cfg).await.unwrap();
        let before = reg.webhook("hooks").unwrap();
        let mem_before = reg.memory("memory").unwrap();

        cfg.get_mut("hooks").unwrap().enabled = false;
        reg.apply_config(&cfg).await.unwrap();
        assert!(Arc::ptr_eq(&before, &reg.webhook("hooks").unwrap()));
        assert!(Arc::ptr_eq(&mem_before, &reg.memory("memory").unwrap()));
        assert!(matches!(
            reg.send("hooks", &Peer::direct("u"), "x").await,
            Err(ChannelError::Disabled(_))
        ));

        cfg.insert("hooks".into(), webhook("http://127.0.0.1:9/b"));
        reg.apply_config(&cfg).await.unwrap();
        assert!(!Arc::ptr_eq(&before, &reg.webhook("hooks").unwrap()));

        cfg.clear();
        reg.apply_config(&cfg).await.unwrap();
        let names: Vec<_> = reg.list().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["memory"]);
        assert!(matches!(
            reg.send("hooks", &Peer::direct("u"), "x").await,
            Err(ChannelError::UnknownChannel(_))
        ));
    }
}
