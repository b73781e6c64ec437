use std::{
    collections::BTreeMap,
    fmt,
    path::Path,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use {
    clawgate_config::{ClawgateConfig, schema::ProviderEntry},
    clawgate_tools::sandbox::SandboxRunner,
    serde::{Deserialize, Serialize},
    tokio_util::sync::CancellationToken,
};

use crate::{
    auth_profiles::{Credential, FailureReason, classify_failure},
    cli_backend::{CliBackend, CliSessionTable, resolve_backends},
    http::{HttpProvider, default_base_url},
};

/// A `provider/model` reference. A bare name is a provider with its default model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl ModelRef {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('/') {
            Some((provider, model)) => Self {
                provider: provider.trim().to_string(),
                model: model.trim().to_string(),
            },
            None => Self {
                provider: raw.trim().to_string(),
                model: String::new(),
            },
        }
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.model.is_empty() {
            f.write_str(&self.provider)
        } else {
            write!(f, "{}/{}", self.provider, self.model)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Everything a backend needs for one completion.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub session_key: String,
    /// Gateway session id; a change means the conversation was recycled.
    pub session_id: String,
    pub system_prompt: Option<String>,
    /// Prior transcript, oldest first, excluding `prompt`.
    pub messages: Vec<ChatMessage>,
    pub prompt: String,
    /// Gateway tools the turn may use. `None` leaves the backend's defaults.
    pub tools: Option<Vec<String>>,
    /// Where process-backed providers run. `None` runs them on the host.
    pub sandbox: Option<SandboxRunner>,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelReply {
    pub text: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Failed,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    pub status: Option<u16>,
    pub message: String,
    pub kind: ProviderErrorKind,
}

impl ProviderError {
    pub fn failed(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            kind: ProviderErrorKind::Failed,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            status: None,
            message: format!("timed out after {after:?}"),
            kind: ProviderErrorKind::Timeout,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: None,
            message: "cancelled".into(),
            kind: ProviderErrorKind::Cancelled,
        }
    }

    pub fn reason(&self) -> FailureReason {
        match self.kind {
            ProviderErrorKind::Timeout => FailureReason::Timeout,
            _ => classify_failure(self.status, &self.message),
        }
    }
}

/// Closed set of ways to reach a model.
#[derive(Clone)]
pub enum ModelBackend {
    Http(Arc<HttpProvider>),
    Cli(Arc<CliBackend>),
}

impl ModelBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Cli(_) => "cli",
        }
    }

    /// CLI backends carry their own login; only HTTP providers rotate profiles.
    pub fn uses_profiles(&self) -> bool {
        matches!(self, Self::Http(_))
    }

    pub async fn complete(
        &self,
        model: &str,
        credential: Option<&Credential>,
        req: &ModelRequest,
    ) -> Result<ModelReply, ProviderError> {
        match self {
            Self::Http(p) => p.complete(model, credential, req).await,
            Self::Cli(b) => b.complete(model, req).await.map_err(ProviderError::from),
        }
    }
}

/// Provider name → backend, rebuilt on config changes.
///
/// CLI conversation state lives in a shared table so it survives rebuilds,
/// and on disk so it survives restarts.
pub struct ModelRegistry {
    client: reqwest::Client,
    cli_sessions: Arc<CliSessionTable>,
    /// `None` marks a provider disabled in config.
    backends: RwLock<BTreeMap<String, Option<ModelBackend>>>,
}

impl ModelRegistry {
    pub fn new(config: &ClawgateConfig) -> Self {
        Self::with_cli_sessions(config, CliSessionTable::default())
    }

    /// Registry whose CLI session ids persist under `state_dir`.
    pub fn persistent(config: &ClawgateConfig, state_dir: &Path) -> Self {
        Self::with_cli_sessions(config, CliSessionTable::persistent(state_dir))
    }

    fn with_cli_sessions(config: &ClawgateConfig, cli_sessions: CliSessionTable) -> Self {
        let registry = Self {
            client: reqwest::Client::new(),
            cli_sessions: Arc::new(cli_sessions),
            backends: RwLock::new(BTreeMap::new()),
        };
        registry.apply_config(config);
        registry
    }

    pub fn apply_config(&self, config: &ClawgateConfig) {
        let mut next = BTreeMap::new();
        for (name, entry) in &config.models.providers {
            let backend = entry.enabled.then(|| {
                ModelBackend::Http(Arc::new(HttpProvider::new(self.client.clone(), name, entry)))
            });
            next.insert(name.clone(), backend);
        }
        for (name, template) in resolve_backends(&config.cli_backends) {
            let backend = CliBackend::new(name.clone(), template, Arc::clone(&self.cli_sessions));
            next.insert(name, Some(ModelBackend::Cli(Arc::new(backend))));
        }
        *self
            .backends
            .write()
            .unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Configured backends first, then well-known HTTP providers with defaults.
    pub fn resolve(&self, provider: &str) -> Option<ModelBackend> {
        if let Some(configured) = self
            .backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider)
        {
            return configured.clone();
        }
        default_base_url(provider).map(|_| {
            let entry = ProviderEntry::default();
            ModelBackend::Http(Arc::new(HttpProvider::new(self.client.clone(), provider, &entry)))
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, b)| b.is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Forget CLI conversation state for a session key.
    pub async fn forget_session(&self, session_key: &str) {
        self.cli_sessions.forget(session_key).await;
    }
}
