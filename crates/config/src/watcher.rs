//! Config file watching and debounced reload decisions.
//!
//! `ConfigWatcher` turns filesystem notifications into bare "changed"
//! signals; `ReloadCoordinator` coalesces bursts of those signals into one
//! load → validate → diff → classify cycle per quiet period.

use std::{path::Path, sync::Arc, time::Duration};

use {
    notify_debouncer_full::{
        DebounceEventResult, Debouncer, RecommendedCache, new_debouncer,
        notify::{RecommendedWatcher, RecursiveMode},
    },
    tokio::{sync::mpsc, time::Instant},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{error::ConfigError, reload::ReloadPlan, schema::ReloadMode, store::ConfigStore};

/// Filesystem-level coalescing before a signal reaches the coordinator.
const FS_DEBOUNCE: Duration = Duration::from_millis(100);

pub struct ConfigWatcher {
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

impl ConfigWatcher {
    /// Watch the directory holding `path` and signal on events touching it.
    ///
    /// The parent directory is watched because editors often replace the
    /// file by rename, which would orphan a watch on the file itself.
    pub fn start(path: &Path) -> notify_debouncer_full::notify::Result<(Self, mpsc::UnboundedReceiver<()>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let target = path.file_name().map(ToOwned::to_owned);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();

        let mut debouncer = new_debouncer(FS_DEBOUNCE, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let touched = events.iter().any(|event| {
                        event
                            .paths
                            .iter()
                            .any(|p| p.file_name().map(ToOwned::to_owned) == target)
                    });
                    if touched {
                        debug!("config file changed on disk");
                        let _ = tx.send(());
                    }
                },
                Err(errors) => {
                    for e in errors {
                        warn!(error = %e, "config watcher error");
                    }
                },
            }
        })?;
        debouncer.watch(&dir, RecursiveMode::NonRecursive)?;
        info!(path = %path.display(), "watching config file");

        Ok((Self {
            _debouncer: debouncer,
        }, rx))
    }
}

/// Result of one debounced reload cycle.
#[derive(Debug)]
pub enum ReloadOutcome {
    Applied(ReloadPlan),
    Rejected(ConfigError),
}

pub struct ReloadCoordinator {
    store: Arc<ConfigStore>,
}

impl ReloadCoordinator {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    fn debounce(&self) -> Duration {
        Duration::from_millis(self.store.snapshot().gateway.reload.debounce_ms)
    }

    /// Run until `cancel` fires or the change stream ends.
    ///
    /// Each change signal pushes the deadline out by the configured debounce
    /// window; the reload runs once the window elapses without new signals.
    /// Non-empty plans and rejections are sent to `outcomes`.
    pub async fn run(
        self,
        mut changes: mpsc::UnboundedReceiver<()>,
        outcomes: mpsc::UnboundedSender<ReloadOutcome>,
        cancel: CancellationToken,
    ) {
        let mut deadline: Option<Instant> = None;
        loop {
            let sleep = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                () = cancel.cancelled() => break,
                signal = changes.recv() => {
                    if signal.is_none() {
                        break;
                    }
                    if self.store.snapshot().gateway.reload.mode == ReloadMode::Off {
                        debug!("config reload disabled, ignoring change");
                        continue;
                    }
                    deadline = Some(Instant::now() + self.debounce());
                },
                () = sleep => {
                    deadline = None;
                    let outcome = match self.store.reload().await {
                        Ok(plan) if plan.is_empty() => {
                            debug!(noop = plan.noop_paths.len(), "config change needs no action");
                            continue;
                        },
                        Ok(plan) => {
                            info!(
                                restart = plan.restart_gateway,
                                hot = plan.hot_paths.len(),
                                "config reload planned"
                            );
                            ReloadOutcome::Applied(plan)
                        },
                        Err(e) => {
                            warn!(error = %e, "config reload rejected");
                            ReloadOutcome::Rejected(e)
                        },
                    };
                    if outcomes.send(outcome).is_err() {
                        break;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{schema::ClawgateConfig, store::ConfigSource};

    struct MemorySource(Mutex<ClawgateConfig>);

    impl ConfigSource for MemorySource {
        fn load(&self) -> Result<ClawgateConfig, ConfigError> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    fn setup(
        debounce_ms: u64,
    ) -> (
        Arc<MemorySource>,
        Arc<ConfigStore>,
        mpsc::UnboundedSender<()>,
        mpsc::UnboundedReceiver<ReloadOutcome>,
        CancellationToken,
    ) {
        let mut initial = ClawgateConfig::default();
        initial.gateway.reload.debounce_ms = debounce_ms;
        let source = Arc::new(MemorySource(Mutex::new(initial.clone())));
        let store = Arc::new(ConfigStore::new(initial, Some(source.clone())));
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(ReloadCoordinator::new(Arc::clone(&store)).run(change_rx, out_tx, cancel.clone()));
        (source, store, change_tx, out_rx, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_writes_yields_single_restart_after_debounce() {
        let (source, store, changes, mut outcomes, cancel) = setup(5000);
        let start = Instant::now();

        source.0.lock().unwrap().meta.last_touched_at = Some("t1".into());
        changes.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;

        source.0.lock().unwrap().gateway.port = 20001;
        changes.send(()).unwrap();

        let outcome = outcomes.recv().await.unwrap();
        let elapsed = start.elapsed();
        let ReloadOutcome::Applied(plan) = outcome else {
            panic!("expected applied plan");
        };
        assert!(plan.restart_gateway);
        assert!(plan.restart_paths.contains("gateway.port"));
        assert!(plan.noop_paths.contains("meta.lastTouchedAt"));
        assert!(elapsed >= Duration::from_millis(6000));
        assert!(elapsed < Duration::from_millis(6100));
        assert_eq!(store.snapshot().gateway.port, 20001);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(outcomes.try_recv().is_err());
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn noop_only_change_emits_nothing() {
        let (source, _store, changes, mut outcomes, cancel) = setup(300);
        source.0.lock().unwrap().meta.last_touched_version = Some("2".into());
        changes.send(()).unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(outcomes.try_recv().is_err());
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_edit_is_rejected_and_previous_kept() {
        let (source, store, changes, mut outcomes, cancel) = setup(300);
        source.0.lock().unwrap().gateway.port = 0;
        changes.send(()).unwrap();

        let outcome = outcomes.recv().await.unwrap();
        assert!(matches!(outcome, ReloadOutcome::Rejected(ConfigError::Invalid(_))));
        assert_eq!(store.snapshot().gateway.port, crate::schema::DEFAULT_PORT);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn reload_mode_off_ignores_changes() {
        let mut initial = ClawgateConfig::default();
        initial.gateway.reload.mode = ReloadMode::Off;
        let source = Arc::new(MemorySource(Mutex::new(initial.clone())));
        let store = Arc::new(ConfigStore::new(initial, Some(source.clone())));
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(ReloadCoordinator::new(Arc::clone(&store)).run(change_rx, out_tx, cancel.clone()));

        source.0.lock().unwrap().gateway.port = 20002;
        change_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(out_rx.try_recv().is_err());
        assert_eq!(store.snapshot().gateway.port, crate::schema::DEFAULT_PORT);
        cancel.cancel();
    }

    #[tokio::test]
    async fn file_watcher_signals_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clawgate.json5");
        std::fs::write(&path, "{}").unwrap();
        let (_watcher, mut rx) = ConfigWatcher::start(&path).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(&path, "{ gateway: { port: 19003 } }").unwrap();

        let got = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await;
        assert!(matches!(got, Ok(Some(()))));
    }
}
