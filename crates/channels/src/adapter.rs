use {
    async_trait::async_trait,
    clawgate_config::schema::ChannelKind,
    clawgate_routing::{NormalizedMessage, Peer},
    serde::Serialize,
    tokio::sync::mpsc,
};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),
    #[error("channel '{0}' is disabled")]
    Disabled(String),
    #[error("channel '{channel}' failed to send: {message}")]
    Send { channel: String, message: String },
    #[error("inbound queue closed")]
    SinkClosed,
}

/// Where adapters push normalized inbound messages.
#[derive(Debug, Clone)]
pub struct InboundSink {
    tx: mpsc::Sender<NormalizedMessage>,
}

impl InboundSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<NormalizedMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn deliver(&self, msg: NormalizedMessage) -> Result<(), ChannelError> {
        self.tx.send(msg).await.map_err(|_| ChannelError::SinkClosed)
    }
}

/// One messaging surface. Adapters own their wire protocol and authentication;
/// the gateway only sees normalized messages in and `(peer, content)` out.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ChannelKind;

    /// Begin pushing inbound messages into `sink`.
    async fn start(&self, sink: InboundSink) -> Result<(), ChannelError>;

    async fn send_outbound(&self, peer: &Peer, content: &str) -> Result<(), ChannelError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub name: String,
    pub kind: ChannelKind,
    pub enabled: bool,
}
