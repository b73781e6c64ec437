use std::{path::Path, time::Duration};

use {
    anyhow::{Result, bail},
    clap::Subcommand,
    clawgate_config::{ClawgateConfig, state_dir},
    clawgate_sessions::{SessionKey, SessionRegistry, TranscriptMessage},
};

use crate::load_snapshot;

#[derive(Subcommand)]
pub enum SessionAction {
    /// List sessions, most recently active first.
    List {
        /// Only sessions of this agent.
        #[arg(long)]
        agent: Option<String>,
    },
    /// Print a session's transcript.
    History {
        /// Session key, e.g. `agent:main:main`.
        key: String,
        /// Read an earlier session id under the key instead of the live one.
        #[arg(long)]
        session_id: Option<String>,
        /// Only the last N messages.
        #[arg(long)]
        limit: Option<usize>,
    },
}

pub async fn handle_sessions(action: SessionAction, config: Option<&Path>) -> Result<()> {
    let cfg = load_snapshot(config)?;
    let registry = open(&cfg);
    match action {
        SessionAction::List { agent } => {
            let entries = registry.list(agent.as_deref()).await?;
            if entries.is_empty() {
                println!("No sessions.");
                return Ok(());
            }
            println!("{:<40} {:<38} {:>6}", "KEY", "SESSION", "MSGS");
            for e in entries {
                println!("{:<40} {:<38} {:>6}", e.key, e.session_id, e.message_count);
            }
            Ok(())
        },
        SessionAction::History {
            key,
            session_id,
            limit,
        } => {
            let Some(key) = SessionKey::parse(&key) else {
                bail!("invalid session key: {key}");
            };
            let messages = match session_id {
                Some(id) => registry.history_of(&key, &id).await?,
                None => registry.history(&key).await?,
            };
            for m in tail(messages, limit) {
                println!("{}", serde_json::to_string(&m)?);
            }
            Ok(())
        },
    }
}

fn open(cfg: &ClawgateConfig) -> SessionRegistry {
    SessionRegistry::new(
        &state_dir(cfg),
        Duration::from_secs(cfg.session.idle_minutes.saturating_mul(60)),
    )
}

fn tail(mut messages: Vec<TranscriptMessage>, limit: Option<usize>) -> Vec<TranscriptMessage> {
    if let Some(n) = limit
        && messages.len() > n
    {
        messages.drain(..messages.len() - n);
    }
    messages
}
