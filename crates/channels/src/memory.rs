use std::sync::{Mutex, PoisonError};

use {
    async_trait::async_trait,
    clawgate_config::schema::ChannelKind,
    clawgate_routing::{NormalizedMessage, Peer},
    serde::Serialize,
    tracing::debug,
};

use crate::adapter::{ChannelAdapter, ChannelError, InboundSink};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundRecord {
    pub peer: Peer,
    pub content: String,
}

/// In-process channel: records what the gateway sends, accepts injected inbound messages.
#[derive(Default)]
pub struct MemoryChannel {
    name: String,
    outbox: Mutex<Vec<OutboundRecord>>,
    sink: Mutex<Option<InboundSink>>,
}

impl MemoryChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Push a message as if it arrived on the wire. The channel name is forced to this one.
    pub async fn inject(&self, mut msg: NormalizedMessage) -> Result<(), ChannelError> {
        msg.channel = self.name.clone();
        let sink = self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ChannelError::SinkClosed)?;
        sink.deliver(msg).await
    }

    pub fn sent(&self) -> Vec<OutboundRecord> {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take_sent(&self) -> Vec<OutboundRecord> {
        std::mem::take(&mut *self.outbox.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl ChannelAdapter for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Memory
    }

    async fn start(&self, sink: InboundSink) -> Result<(), ChannelError> {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
        Ok(())
    }

    async fn send_outbound(&self, peer: &Peer, content: &str) -> Result<(), ChannelError> {
        debug!(channel = %self.name, peer = %peer.id, len = content.len(), "memory outbound");
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(OutboundRecord {
                peer: peer.clone(),
                content: content.to_string(),
            });
        Ok(())
    }
}
