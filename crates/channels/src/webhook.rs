use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use {
    async_trait::async_trait,
    clawgate_config::schema::ChannelKind,
    clawgate_routing::{NormalizedMessage, Peer},
    serde_json::json,
    tracing::{debug, warn},
};

use crate::adapter::{ChannelAdapter, ChannelError, InboundSink};

const SEND_TIMEOUT: Duration = Duration::from_secs(15);

/// Generic HTTP channel. Inbound arrives through the gateway's
/// `/channels/<name>/inbound` route; replies are POSTed to `outbound_url`.
pub struct WebhookChannel {
    name: String,
    outbound_url: String,
    client: reqwest::Client,
    sink: Mutex<Option<InboundSink>>,
}

impl WebhookChannel {
    pub fn new(name: impl Into<String>, outbound_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            outbound_url: outbound_url.into(),
            client,
            sink: Mutex::new(None),
        }
    }

    /// Hand a message received by the HTTP route to the gateway.
    pub async fn receive(&self, mut msg: NormalizedMessage) -> Result<(), ChannelError> {
        msg.channel = self.name.clone();
        let sink = self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ChannelError::SinkClosed)?;
        sink.deliver(msg).await
    }
}

#[async_trait]
impl ChannelAdapter for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn start(&self, sink: InboundSink) -> Result<(), ChannelError> {
        *self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
        Ok(())
    }

    async fn send_outbound(&self, peer: &Peer, content: &str) -> Result<(), ChannelError> {
        let body = json!({ "channel": self.name, "peer": peer, "content": content });
        let err = |message: String| ChannelError::Send {
            channel: self.name.clone(),
            message,
        };
        let resp = self
            .client
            .post(&self.outbound_url)
            .timeout(SEND_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| err(e.to_string()))?;
        if !resp.status().is_success() {
            warn!(channel = %self.name, status = %resp.status(), "webhook outbound rejected");
            return Err(err(format!("HTTP {}", resp.status())));
        }
        debug!(channel = %self.name, peer = %peer.id, "webhook outbound delivered");
        Ok(())
    }
}
