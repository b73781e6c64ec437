//! Configuration loading, validation, and live-reload classification.
//!
//! Config files are discovered as `clawgate.{json5,json,toml,yaml}` in the
//! working directory or `~/.config/clawgate/`. `${ENV}` placeholders are
//! substituted before parsing.

pub mod diff;
pub mod env_subst;
pub mod error;
pub mod loader;
pub mod reload;
pub mod schema;
pub mod store;
pub mod validate;
pub mod watcher;

pub use {
    error::{ConfigError, ConfigIssue},
    loader::{
        config_dir, expand_home, home_dir, load_config, resolve_config_path, save_config,
        state_dir,
    },
    reload::{DEFAULT_RULES, HotAction, ReloadDecision, ReloadKind, ReloadPlan, classify, decide, plan_reload},
    schema::ClawgateConfig,
    store::{ConfigSource, ConfigStore, FileSource},
    validate::validate,
    watcher::{ConfigWatcher, ReloadCoordinator, ReloadOutcome},
};
