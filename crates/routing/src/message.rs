use serde::{Deserialize, Serialize};

pub use clawgate_config::schema::PeerKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub kind: PeerKind,
    pub id: String,
}

impl Peer {
    pub fn direct(id: impl Into<String>) -> Self {
        Self {
            kind: PeerKind::Direct,
            id: id.into(),
        }
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self {
            kind: PeerKind::Group,
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// An inbound message as every channel adapter hands it to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedMessage {
    pub channel: String,
    #[serde(default = "default_account")]
    pub account_id: String,
    pub peer: Peer,
    pub sender_id: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: u64,
}

fn default_account() -> String {
    "default".into()
}
