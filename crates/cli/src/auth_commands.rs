use std::{path::Path, sync::Arc};

use {
    anyhow::{Result, bail},
    clap::{Args, Subcommand},
    clawgate_agents::{AuthProfile, AuthProfileRegistry, AuthProfileStore, Credential},
    clawgate_config::{ClawgateConfig, state_dir},
    secrecy::Secret,
};

use crate::load_snapshot;

#[derive(Subcommand)]
pub enum AuthAction {
    /// List auth profiles and their rotation state.
    List {
        #[command(flatten)]
        agent: AgentArg,
    },
    /// Add or replace a profile.
    Add {
        #[command(flatten)]
        agent: AgentArg,
        /// Profile id, conventionally `<provider>:<label>`.
        id: String,
        /// Provider the credential belongs to (e.g. "openai").
        #[arg(long)]
        provider: String,
        /// API key credential.
        #[arg(long, conflicts_with = "token", required_unless_present = "token")]
        api_key: Option<String>,
        /// Static bearer token credential.
        #[arg(long)]
        token: Option<String>,
    },
    /// Remove a profile.
    Remove {
        #[command(flatten)]
        agent: AgentArg,
        id: String,
    },
}

#[derive(Args)]
pub struct AgentArg {
    /// Agent whose profile store to use (defaults to the default agent).
    #[arg(long)]
    agent: Option<String>,
}

pub async fn handle_auth(action: AuthAction, config: Option<&Path>) -> Result<()> {
    let cfg = load_snapshot(config)?;
    match action {
        AuthAction::List { agent } => list(&*open(&cfg, agent).await?).await,
        AuthAction::Add {
            agent,
            id,
            provider,
            api_key,
            token,
        } => {
            let credential = match (api_key, token) {
                (Some(key), _) => Credential::api_key(key),
                (None, Some(token)) => Credential::Token {
                    token: Secret::new(token),
                },
                (None, None) => bail!("one of --api-key or --token is required"),
            };
            let store = open(&cfg, agent).await?;
            store
                .upsert(AuthProfile::new(id.clone(), provider, credential))
                .await?;
            println!("Saved profile {id}");
            Ok(())
        },
        AuthAction::Remove { agent, id } => {
            open(&cfg, agent).await?.remove(&id).await?;
            println!("Removed profile {id}");
            Ok(())
        },
    }
}

async fn open(cfg: &ClawgateConfig, agent: AgentArg) -> Result<Arc<AuthProfileStore>> {
    let agent = agent
        .agent
        .unwrap_or_else(|| cfg.agents.default_agent_id().to_string());
    if !cfg.agents.contains(&agent) {
        bail!("unknown agent: {agent}");
    }
    let registry = AuthProfileRegistry::new(
        state_dir(cfg),
        cfg.auth.cooldowns.clone(),
        cfg.auth.order.clone(),
        cfg.models.clone(),
    );
    Ok(registry.for_agent(&agent).await?)
}

async fn list(store: &AuthProfileStore) -> Result<()> {
    let profiles = store.list().await;
    if profiles.is_empty() {
        println!("No auth profiles.");
        return Ok(());
    }
    println!("{:<28} {:<12} {:<8} {:>8}  STATE", "ID", "PROVIDER", "KIND", "FAILURES");
    let now = clawgate_sessions::metadata::now_ms();
    for p in &profiles {
        let state = match (p.disabled_until, p.cooldown_until) {
            (Some(until), _) if until > now => format!("disabled {}s", (until - now) / 1000),
            (_, Some(until)) if until > now => format!("cooldown {}s", (until - now) / 1000),
            _ if p.ephemeral => "ready (from config)".to_string(),
            _ => "ready".to_string(),
        };
        println!(
            "{:<28} {:<12} {:<8} {:>8}  {}",
            p.id, p.provider, p.kind, p.failure_count, state
        );
    }
    let order = store.order().await;
    for (provider, ids) in &order {
        println!("order[{provider}]: {}", ids.join(", "));
    }
    Ok(())
}
