use std::{
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
};

use tracing::{info, warn};

use crate::{
    error::ConfigError,
    loader::{load_config, save_config},
    reload::{ReloadPlan, plan_reload},
    schema::ClawgateConfig,
    validate::validate,
};

/// Where a fresh config comes from when the store reloads.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<ClawgateConfig, ConfigError>;

    fn path(&self) -> Option<&Path> {
        None
    }
}

pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigSource for FileSource {
    fn load(&self) -> Result<ClawgateConfig, ConfigError> {
        load_config(&self.path)
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Holds the active config snapshot.
///
/// Every replacement runs validate → diff → classify; an invalid candidate
/// leaves the previous snapshot in place.
pub struct ConfigStore {
    current: RwLock<Arc<ClawgateConfig>>,
    source: Option<Arc<dyn ConfigSource>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl ConfigStore {
    pub fn new(initial: ClawgateConfig, source: Option<Arc<dyn ConfigSource>>) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            source,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Load and validate from `source`, failing on any error.
    pub fn open(source: Arc<dyn ConfigSource>) -> Result<Self, ConfigError> {
        let initial = source.load()?;
        validate(&initial)?;
        Ok(Self::new(initial, Some(source)))
    }

    pub fn snapshot(&self) -> Arc<ClawgateConfig> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn path(&self) -> Option<&Path> {
        self.source.as_deref().and_then(|s| s.path())
    }

    pub fn source(&self) -> Option<Arc<dyn ConfigSource>> {
        self.source.clone()
    }

    /// Compute the plan `next` would produce without applying it.
    pub fn preview(&self, next: &ClawgateConfig) -> Result<ReloadPlan, ConfigError> {
        validate(next)?;
        Ok(plan_reload(&self.snapshot(), next))
    }

    /// Swap in `next` if it validates; returns the plan it implies.
    pub fn apply(&self, next: ClawgateConfig) -> Result<ReloadPlan, ConfigError> {
        if let Err(e) = validate(&next) {
            warn!(error = %e, "rejected config, keeping previous");
            return Err(e);
        }
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let plan = plan_reload(&guard, &next);
        if !plan.changed_paths().is_empty() {
            *guard = Arc::new(next);
        }
        Ok(plan)
    }

    /// Re-read the source and apply it. Loading runs on the blocking pool.
    pub async fn reload(&self) -> Result<ReloadPlan, ConfigError> {
        let Some(source) = self.source.clone() else {
            return Ok(ReloadPlan::default());
        };
        let loaded = tokio::task::spawn_blocking(move || source.load())
            .await
            .map_err(|e| ConfigError::Parse {
                path: PathBuf::new(),
                message: format!("config load task failed: {e}"),
            })??;
        self.apply(loaded)
    }

    /// Validate, persist to the backing file, then apply.
    pub async fn write(&self, next: ClawgateConfig) -> Result<ReloadPlan, ConfigError> {
        let _guard = self.write_lock.lock().await;
        validate(&next)?;
        let path = self.path().ok_or(ConfigError::NoPath)?;
        save_config(&next, path)?;
        info!(path = %path.display(), "config written");
        self.apply(next)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn invalid_candidate_keeps_previous_snapshot() {
        let store = ConfigStore::new(ClawgateConfig::default(), None);
        let mut bad = ClawgateConfig::default();
        bad.gateway.port = 0;

        assert!(matches!(store.apply(bad), Err(ConfigError::Invalid(_))));
        assert_eq!(*store.snapshot(), ClawgateConfig::default());
    }

    #[test]
    fn apply_swaps_snapshot_and_reports_plan() {
        let store = ConfigStore::new(ClawgateConfig::default(), None);
        let mut next = ClawgateConfig::default();
        next.session.idle_minutes = 3;

        let plan = store.apply(next).unwrap();
        assert!(!plan.restart_gateway);
        assert!(plan.hot_paths.contains("session.idleMinutes"));
        assert_eq!(store.snapshot().session.idle_minutes, 3);

        let again = store.apply((*store.snapshot()).clone()).unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn write_persists_and_reload_sees_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clawgate.json5");
        std::fs::write(&path, "{}").unwrap();
        let store = ConfigStore::open(Arc::new(FileSource::new(&path))).unwrap();

        let mut next = (*store.snapshot()).clone();
        next.gateway.port = 19999;
        let plan = store.write(next).await.unwrap();
        assert!(plan.restart_gateway);

        assert!(store.reload().await.unwrap().is_empty());
        assert_eq!(load_config(&path).unwrap().gateway.port, 19999);
    }

    #[tokio::test]
    async fn write_without_backing_file_fails() {
        let store = ConfigStore::new(ClawgateConfig::default(), None);
        assert!(matches!(
            store.write(ClawgateConfig::default()).await,
            Err(ConfigError::NoPath)
        ));
    }
}
