//! Turns reload plans from the config store into subsystem refreshes.

use {
    clawgate_config::{
        ConfigError, HotAction, ReloadDecision, ReloadOutcome, ReloadPlan, decide,
    },
    serde::Serialize,
    tracing::{debug, info, warn},
};

use crate::{
    events::GatewayEvent,
    state::{GatewayState, idle_window},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadStep {
    /// Nothing to do under the current reload mode.
    Ignored,
    /// Hot actions ran; the gateway keeps serving.
    Applied,
    /// The listener must be re-bound with the new config.
    Restart,
    /// The candidate was invalid and the previous config stays active.
    Rejected,
}

/// Handle one debounced reload cycle.
pub async fn handle_outcome(state: &GatewayState, outcome: ReloadOutcome) -> ReloadStep {
    match outcome {
        ReloadOutcome::Applied(plan) => apply_plan(state, plan).await,
        ReloadOutcome::Rejected(err) => {
            reject(state, &err);
            ReloadStep::Rejected
        },
    }
}

/// Publish `config.invalid` for a candidate that failed to load or validate.
pub fn reject(state: &GatewayState, err: &ConfigError) {
    warn!(error = %err, "config rejected, previous config stays active");
    state.events.publish(GatewayEvent::ConfigInvalid {
        message: err.to_string(),
        issues: err.issues().iter().map(ToString::to_string).collect(),
    });
}

/// Act on a plan the store has already swapped in.
pub async fn apply_plan(state: &GatewayState, plan: ReloadPlan) -> ReloadStep {
    let mode = state.config.snapshot().gateway.reload.mode;
    match decide(mode, plan) {
        ReloadDecision::Ignore => {
            debug!(?mode, "reload plan ignored");
            ReloadStep::Ignored
        },
        ReloadDecision::Hot(plan) => {
            run_hot_actions(state, &plan).await;
            state.events.publish(GatewayEvent::ConfigReloaded {
                hot_paths: plan.hot_paths.iter().cloned().collect(),
                actions: action_names(&plan),
                restart: false,
            });
            ReloadStep::Applied
        },
        ReloadDecision::Restart(plan) => {
            info!(paths = ?plan.restart_paths, "config change needs a gateway restart");
            state.events.publish(GatewayEvent::ConfigReloaded {
                hot_paths: plan.hot_paths.iter().cloned().collect(),
                actions: action_names(&plan),
                restart: true,
            });
            state.restart.cancel();
            ReloadStep::Restart
        },
    }
}

fn action_names(plan: &ReloadPlan) -> Vec<String> {
    plan.hot_actions
        .iter()
        .map(|a| {
            serde_json::to_value(a)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| format!("{a:?}"))
        })
        .collect()
}

/// Refresh every subsystem the plan names. The router is always rebuilt
/// since it reads the whole snapshot.
pub async fn run_hot_actions(state: &GatewayState, plan: &ReloadPlan) {
    let cfg = state.refresh_router();
    let mut models_refreshed = false;

    for action in &plan.hot_actions {
        match action {
            HotAction::ReloadRouting => state.context.set_window(cfg.routing.context_window),
            HotAction::ReloadSessions => state.sessions.set_idle(idle_window(&cfg)),
            HotAction::ReloadAuth | HotAction::ReloadModels => {
                if models_refreshed {
                    continue;
                }
                models_refreshed = true;
                state.models.apply_config(&cfg);
                state
                    .profiles
                    .apply_config(
                        cfg.auth.cooldowns.clone(),
                        cfg.auth.order.clone(),
                        cfg.models.clone(),
                    )
                    .await;
            },
            HotAction::ReloadSandbox => state.sandbox.apply_config(&cfg.sandbox),
            HotAction::ReloadTools => debug!("tool policy is resolved per turn"),
            HotAction::ReloadLogging => match &state.log_level_hook {
                Some(hook) => {
                    if let Err(e) = hook(&cfg.logging.level) {
                        warn!(level = %cfg.logging.level, error = %e, "log level not applied");
                    }
                },
                None => debug!("no log level hook installed"),
            },
            HotAction::ReloadChannels => {
                if let Err(e) = state.channels.apply_config(&cfg.channels).await {
                    warn!(error = %e, "channel reload failed");
                }
            },
            HotAction::ReloadProcess => state.processes.apply_config(&cfg.process),
        }
        debug!(?action, "hot action applied");
    }
    info!(actions = plan.hot_actions.len(), "config hot-applied");
}
