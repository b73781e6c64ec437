use std::path::{Path, PathBuf};

use {
    anyhow::{Context, Result},
    clap::Subcommand,
    clawgate_config::{
        ClawgateConfig, ReloadDecision, decide, load_config, plan_reload, resolve_config_path,
        validate,
    },
    clawgate_gateway::methods::redact,
};

use crate::load_snapshot;

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Load and validate the config; list every issue found.
    Validate,
    /// Print the effective config (secrets masked), or one dotted key of it.
    Get { key: Option<String> },
    /// Show how the gateway would react to switching from PREV to NEXT.
    Plan { prev: PathBuf, next: PathBuf },
}

pub async fn handle_config(action: ConfigAction, config: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Validate => validate_cmd(config),
        ConfigAction::Get { key } => get(config, key.as_deref()),
        ConfigAction::Plan { prev, next } => plan(&prev, &next),
    }
}

fn validate_cmd(config: Option<&Path>) -> Result<()> {
    let Some(path) = resolve_config_path(config) else {
        println!("No config file found; defaults are valid.");
        return Ok(());
    };
    let cfg = load_config(&path)?;
    if let Err(e) = validate(&cfg) {
        for issue in e.issues() {
            eprintln!("  {issue}");
        }
        return Err(e.into());
    }
    println!("{} is valid.", path.display());
    Ok(())
}

fn get(config: Option<&Path>, key: Option<&str>) -> Result<()> {
    let cfg = load_snapshot(config)?;
    let value = serde_json::to_value(redact(&cfg))?;
    let value = match key.filter(|k| !k.is_empty()) {
        Some(key) => value
            .pointer(&format!("/{}", key.replace('.', "/")))
            .cloned()
            .with_context(|| format!("no config value at {key}"))?,
        None => value,
    };
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn plan(prev: &Path, next: &Path) -> Result<()> {
    let before = load_config(prev)?;
    let after = load_config(next)?;
    validate(&after)?;
    println!("{}", serde_json::to_string_pretty(&plan_report(&before, &after))?);
    Ok(())
}

fn plan_report(before: &ClawgateConfig, after: &ClawgateConfig) -> serde_json::Value {
    let plan = plan_reload(before, after);
    let decision = match decide(after.gateway.reload.mode, plan.clone()) {
        ReloadDecision::Ignore => "ignore",
        ReloadDecision::Hot(_) => "hot",
        ReloadDecision::Restart(_) => "restart",
    };
    serde_json::json!({ "plan": plan, "decision": decision })
}
