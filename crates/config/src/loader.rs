use std::{
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use tracing::debug;

use crate::{env_subst::substitute_env, error::ConfigError, schema::ClawgateConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "clawgate.json5",
    "clawgate.json",
    "clawgate.toml",
    "clawgate.yaml",
    "clawgate.yml",
];

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "CLAWGATE_CONFIG";

/// Environment variable overriding the state directory.
pub const STATE_DIR_ENV: &str = "CLAWGATE_STATE_DIR";

/// Override for the config directory, set via `set_config_dir()`.
static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Set a custom config directory. When set, discovery only looks there.
pub fn set_config_dir(path: PathBuf) {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(path);
}

pub fn clear_config_dir() {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = None;
}

fn config_dir_override() -> Option<PathBuf> {
    CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<ClawgateConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Resolve which file to load: explicit path, `CLAWGATE_CONFIG`, then discovery.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }
    if let Ok(p) = std::env::var(CONFIG_PATH_ENV)
        && !p.is_empty()
    {
        return Some(PathBuf::from(p));
    }
    find_config_file()
}

/// Find the first config file in standard locations.
///
/// Search order:
/// 1. `./clawgate.{json5,json,toml,yaml,yml}` (project-local)
/// 2. `~/.config/clawgate/clawgate.{…}` (user-global)
fn find_config_file() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return first_existing(&dir);
    }
    first_existing(Path::new(".")).or_else(|| config_dir().and_then(|d| first_existing(&d)))
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the config directory: override, or `~/.config/clawgate/`.
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return Some(dir);
    }
    home_dir().map(|h| h.join(".config").join("clawgate"))
}

/// Returns the state directory: config value, `CLAWGATE_STATE_DIR`, or `~/.clawgate/`.
pub fn state_dir(config: &ClawgateConfig) -> PathBuf {
    if let Some(dir) = &config.gateway.state_dir {
        return expand_home(dir);
    }
    if let Ok(dir) = std::env::var(STATE_DIR_ENV)
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    home_dir()
        .map(|h| h.join(".clawgate"))
        .unwrap_or_else(|| PathBuf::from(".clawgate"))
}

pub fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// Serialize a config in the format implied by `path` and write it atomically.
pub fn save_config(config: &ClawgateConfig, path: &Path) -> Result<(), ConfigError> {
    let rendered = render_config(config, path)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, rendered)
        .and_then(|()| std::fs::rename(&tmp, path))
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(path = %path.display(), "saved config");
    Ok(())
}

fn extension(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or("json5")
}

fn render_config(config: &ClawgateConfig, path: &Path) -> Result<String, ConfigError> {
    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };
    match extension(path) {
        "json5" | "json" => serde_json::to_string_pretty(config).map_err(|e| parse_err(e.to_string())),
        "toml" => toml::to_string_pretty(config).map_err(|e| parse_err(e.to_string())),
        "yaml" | "yml" => serde_yaml::to_string(config).map_err(|e| parse_err(e.to_string())),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

/// Parse raw config text. JSON files go through `json5` so comments and
/// trailing commas are tolerated.
pub fn parse_config(raw: &str, path: &Path) -> Result<ClawgateConfig, ConfigError> {
    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };
    match extension(path) {
        "json5" | "json" => json5::from_str(raw).map_err(|e| parse_err(e.to_string())),
        "toml" => toml::from_str(raw).map_err(|e| parse_err(e.to_string())),
        "yaml" | "yml" => serde_yaml::from_str(raw).map_err(|e| parse_err(e.to_string())),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn json5_tolerates_comments_and_trailing_commas() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clawgate.json5");
        std::fs::write(
            &path,
            "{\n  // local dev\n  gateway: { port: 19001, },\n  agents: { list: [{ id: 'home' },], },\n}\n",
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.gateway.port, 19001);
        assert_eq!(cfg.agents.list[0].id, "home");
    }

    #[test]
    fn toml_and_yaml_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("clawgate.toml");
        std::fs::write(&toml_path, "[gateway]\nport = 19002\n").unwrap();
        assert_eq!(load_config(&toml_path).unwrap().gateway.port, 19002);

        let yaml_path = dir.path().join("clawgate.yaml");
        std::fs::write(&yaml_path, "session:\n  idleMinutes: 5\n").unwrap();
        assert_eq!(load_config(&yaml_path).unwrap().session.idle_minutes, 5);
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clawgate.ini");
        std::fs::write(&path, "x=1").unwrap();
        assert!(matches!(
            load_config(&path),
            Err(ConfigError::UnsupportedFormat(ext)) if ext == "ini"
        ));
    }

    #[test]
    fn missing_file_reports_io_error() {
        let err = load_config(Path::new("/nonexistent/clawgate.json5")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn save_then_load_preserves_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("clawgate.json");
        let mut cfg = ClawgateConfig::default();
        cfg.session.idle_minutes = 42;
        save_config(&cfg, &path).unwrap();
        assert_eq!(load_config(&path).unwrap(), cfg);
    }

    #[test]
    fn explicit_path_wins_resolution() {
        let p = Path::new("/tmp/explicit.json5");
        assert_eq!(resolve_config_path(Some(p)), Some(p.to_path_buf()));
    }

    #[test]
    fn state_dir_prefers_config_value() {
        let mut cfg = ClawgateConfig::default();
        cfg.gateway.state_dir = Some(PathBuf::from("/var/lib/clawgate"));
        assert_eq!(state_dir(&cfg), PathBuf::from("/var/lib/clawgate"));
    }
}
