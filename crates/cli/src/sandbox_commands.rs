use std::path::{Path, PathBuf};

use {
    anyhow::{Result, bail},
    clap::Subcommand,
    clawgate_config::{expand_home, state_dir},
    clawgate_sessions::SessionKey,
    clawgate_tools::sandbox::{self, SandboxOrchestrator},
};

use crate::load_snapshot;

#[derive(Subcommand)]
pub enum SandboxAction {
    /// Explain whether a session runs sandboxed and which tools it gets.
    Explain {
        /// Agent id (defaults to the default agent).
        #[arg(long)]
        agent: Option<String>,
        /// Session key (defaults to the agent's main session).
        #[arg(long)]
        session: Option<String>,
        /// Treat the session as a subagent run.
        #[arg(long, default_value_t = false)]
        subagent: bool,
    },
    /// Resolve a path against a sandbox root the way file tools do.
    Resolve {
        path: String,
        /// Sandbox root.
        #[arg(long)]
        root: PathBuf,
        /// Directory relative paths start from (defaults to the root).
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Extra directory the path may fall under. Repeatable.
        #[arg(long = "allow")]
        allowed: Vec<PathBuf>,
    },
}

pub async fn handle_sandbox(action: SandboxAction, config: Option<&Path>) -> Result<()> {
    match action {
        SandboxAction::Explain {
            agent,
            session,
            subagent,
        } => explain(config, agent, session, subagent).await,
        SandboxAction::Resolve {
            path,
            root,
            cwd,
            allowed,
        } => resolve(&path, &root, cwd.as_deref(), &allowed),
    }
}

async fn explain(
    config: Option<&Path>,
    agent: Option<String>,
    session: Option<String>,
    subagent: bool,
) -> Result<()> {
    let cfg = load_snapshot(config)?;
    let agent = agent.unwrap_or_else(|| cfg.agents.default_agent_id().to_string());
    if !cfg.agents.contains(&agent) {
        bail!("unknown agent: {agent}");
    }
    let key = match session {
        Some(raw) => match SessionKey::parse(&raw) {
            Some(key) => key,
            None => bail!("invalid session key: {raw}"),
        },
        None => SessionKey::main(&agent),
    };

    let workspace_root = cfg
        .sandbox
        .workspace_root
        .as_deref()
        .map(expand_home)
        .unwrap_or_else(|| state_dir(&cfg).join("sandboxes"));
    let backend = sandbox::create_backend(&cfg.sandbox);
    let orchestrator = SandboxOrchestrator::new(&cfg.sandbox, workspace_root, backend);
    let explanation = orchestrator
        .explain(
            &cfg,
            &agent,
            key.as_str(),
            key.is_main(),
            subagent || key.is_subagent(),
        )
        .await;

    println!("{}", serde_json::to_string_pretty(&explanation)?);
    Ok(())
}

fn resolve(raw: &str, root: &Path, cwd: Option<&Path>, allowed: &[PathBuf]) -> Result<()> {
    let root = expand_home(root);
    let cwd = cwd.map(expand_home).unwrap_or_else(|| root.clone());
    let allowed: Vec<PathBuf> = allowed.iter().map(|p| expand_home(p)).collect();
    let resolved = sandbox::check_sandbox_path(raw, &cwd, &root, &allowed)?;
    println!("{}", serde_json::to_string_pretty(&resolved)?);
    Ok(())
}
