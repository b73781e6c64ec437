use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    anyhow::{Context, Result, anyhow},
    dashmap::DashMap,
    serde::Serialize,
    tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard},
    tracing::{debug, info},
};

use crate::{
    key::SessionKey,
    metadata::{SessionEntry, SessionMetadata, now_ms, write_index},
    store::{TranscriptMessage, TranscriptStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Absent,
    Active,
    /// Past the inactivity window; the next resolve mints a new session id.
    Idle,
}

/// Result of fetch-or-create for one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSession {
    pub key: SessionKey,
    pub agent_id: String,
    pub session_id: String,
    pub created: bool,
    /// Session id retired by this resolve, if the key was recycled.
    pub recycled_from: Option<String>,
}

/// Per-key serialization points.
#[derive(Default)]
struct KeySlot {
    /// Held for a whole agent turn. Tokio mutexes queue waiters FIFO.
    turn: Arc<Mutex<()>>,
    /// Held for a single transcript append.
    write: Mutex<()>,
}

/// One agent's index, loaded on first use. The lock orders its writes.
type IndexSlot = Arc<Mutex<Option<SessionMetadata>>>;
type IndexGuard = OwnedMappedMutexGuard<Option<SessionMetadata>, SessionMetadata>;

/// Owns every session under `<stateDir>/agents/<agentId>/sessions/`.
pub struct SessionRegistry {
    agents_dir: PathBuf,
    idle_ms: AtomicU64,
    slots: DashMap<String, Arc<KeySlot>>,
    indexes: DashMap<String, IndexSlot>,
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl SessionRegistry {
    pub fn new(state_dir: &Path, idle: Duration) -> Self {
        Self {
            agents_dir: state_dir.join("agents"),
            idle_ms: AtomicU64::new(idle.as_millis() as u64),
            slots: DashMap::new(),
            indexes: DashMap::new(),
        }
    }

    pub fn set_idle(&self, idle: Duration) {
        self.idle_ms.store(idle.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms.load(Ordering::Relaxed))
    }

    fn sessions_dir(&self, agent_id: &str) -> PathBuf {
        self.agents_dir.join(sanitize(agent_id)).join("sessions")
    }

    fn transcripts(&self, agent_id: &str) -> TranscriptStore {
        TranscriptStore::new(self.sessions_dir(agent_id))
    }

    fn slot(&self, key: &SessionKey) -> Arc<KeySlot> {
        Arc::clone(self.slots.entry(key.0.clone()).or_default().value())
    }

    fn agent_of(key: &SessionKey) -> Result<String> {
        key.agent_id()
            .map(str::to_string)
            .with_context(|| format!("malformed session key: {key}"))
    }

    /// Lock the index of `agent_id`, loading it off the runtime on first use.
    async fn index(&self, agent_id: &str) -> Result<IndexGuard> {
        let slot = Arc::clone(self.indexes.entry(agent_id.to_string()).or_default().value());
        let mut guard = slot.lock_owned().await;
        if guard.is_none() {
            let path = self.sessions_dir(agent_id).join("sessions.json");
            let meta = tokio::task::spawn_blocking(move || SessionMetadata::load(path))
                .await
                .context("session index load task failed")??;
            *guard = Some(meta);
        }
        OwnedMutexGuard::try_map(guard, Option::as_mut)
            .map_err(|_| anyhow!("session index for {agent_id} vanished while loading"))
    }

    async fn persist(index: &SessionMetadata) -> Result<()> {
        let path = index.path().to_path_buf();
        let data = index.encode()?;
        tokio::task::spawn_blocking(move || write_index(&path, &data))
            .await
            .context("session index write task failed")?
    }

    fn is_idle(&self, entry: &SessionEntry, now: u64) -> bool {
        now.saturating_sub(entry.updated_at) > self.idle_ms.load(Ordering::Relaxed)
    }

    /// Fetch-or-create the live session for `key`.
    pub async fn resolve(&self, key: &SessionKey) -> Result<ResolvedSession> {
        self.resolve_at(key, now_ms()).await
    }

    /// Like [`resolve`](Self::resolve) with an explicit clock.
    pub async fn resolve_at(&self, key: &SessionKey, now: u64) -> Result<ResolvedSession> {
        let agent_id = Self::agent_of(key)?;
        let mut index = self.index(&agent_id).await?;

        let existing = index.get(&key.0).cloned();
        let (entry, created, recycled_from) = match existing {
            None => {
                let entry = index.insert_new(&key.0, &agent_id, now).clone();
                info!(session_key = %key, session_id = %entry.session_id, "session created");
                (entry, true, None)
            },
            Some(existing) if self.is_idle(&existing, now) => {
                let old = existing.session_id;
                let entry = index
                    .recycle(&key.0, now, "idle")
                    .context("session entry vanished during recycle")?
                    .clone();
                info!(session_key = %key, old = %old, new = %entry.session_id, "idle session recycled");
                (entry, false, Some(old))
            },
            Some(existing) => (existing, false, None),
        };
        if created || recycled_from.is_some() {
            Self::persist(&index).await?;
        }

        Ok(ResolvedSession {
            key: key.clone(),
            agent_id,
            session_id: entry.session_id,
            created,
            recycled_from,
        })
    }

    pub async fn state(&self, key: &SessionKey) -> Result<SessionState> {
        self.state_at(key, now_ms()).await
    }

    pub async fn state_at(&self, key: &SessionKey, now: u64) -> Result<SessionState> {
        let agent_id = Self::agent_of(key)?;
        let index = self.index(&agent_id).await?;
        Ok(match index.get(&key.0) {
            None => SessionState::Absent,
            Some(e) if self.is_idle(e, now) => SessionState::Idle,
            Some(_) => SessionState::Active,
        })
    }

    /// Wait for exclusive use of `key` for one agent turn.
    ///
    /// Concurrent turns on the same key queue in arrival order; different
    /// keys never block each other.
    pub async fn begin_turn(&self, key: &SessionKey) -> OwnedMutexGuard<()> {
        let slot = self.slot(key);
        debug!(session_key = %key, "waiting for session turn");
        Arc::clone(&slot.turn).lock_owned().await
    }

    /// Append to the live transcript of `key`, creating the session if needed.
    pub async fn append(&self, key: &SessionKey, message: TranscriptMessage) -> Result<()> {
        let slot = self.slot(key);
        let _write = slot.write.lock().await;

        let resolved = self.resolve(key).await?;
        self.write_message(key, &resolved.agent_id, &resolved.session_id, message)
            .await
    }

    /// Append to one specific transcript under `key`, normally the one a turn
    /// resolved when it started. The index only counts the message while
    /// `session_id` is still the live transcript.
    pub async fn append_to(
        &self,
        key: &SessionKey,
        session_id: &str,
        message: TranscriptMessage,
    ) -> Result<()> {
        let agent_id = Self::agent_of(key)?;
        let slot = self.slot(key);
        let _write = slot.write.lock().await;
        self.write_message(key, &agent_id, session_id, message).await
    }

    async fn write_message(
        &self,
        key: &SessionKey,
        agent_id: &str,
        session_id: &str,
        message: TranscriptMessage,
    ) -> Result<()> {
        let store = self.transcripts(agent_id);
        let id = session_id.to_string();
        tokio::task::spawn_blocking(move || store.append(&id, &message))
            .await
            .context("transcript append task failed")??;

        let mut index = self.index(agent_id).await?;
        if index.touch_session(&key.0, session_id, now_ms()) {
            Self::persist(&index).await
        } else {
            debug!(session_key = %key, session_id, "message kept on a retired session");
            Ok(())
        }
    }

    /// Messages of the live session, in append order.
    pub async fn history(&self, key: &SessionKey) -> Result<Vec<TranscriptMessage>> {
        let Some(entry) = self.entry(key).await? else {
            return Ok(Vec::new());
        };
        self.history_of(key, &entry.session_id).await
    }

    /// Messages of any session id ever used under `key`.
    pub async fn history_of(
        &self,
        key: &SessionKey,
        session_id: &str,
    ) -> Result<Vec<TranscriptMessage>> {
        let store = self.transcripts(&Self::agent_of(key)?);
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || store.read(&session_id))
            .await
            .context("transcript read task failed")?
    }

    pub async fn entry(&self, key: &SessionKey) -> Result<Option<SessionEntry>> {
        let agent_id = Self::agent_of(key)?;
        Ok(self.index(&agent_id).await?.get(&key.0).cloned())
    }

    /// Force a new session id under `key`. Returns the updated entry, or
    /// `None` when the key has never been used.
    pub async fn reset(&self, key: &SessionKey, reason: &str) -> Result<Option<SessionEntry>> {
        let agent_id = Self::agent_of(key)?;
        let mut index = self.index(&agent_id).await?;
        let Some(entry) = index.recycle(&key.0, now_ms(), reason).cloned() else {
            return Ok(None);
        };
        Self::persist(&index).await?;
        info!(session_key = %key, session_id = %entry.session_id, reason, "session reset");
        Ok(Some(entry))
    }

    /// Every session on disk, optionally limited to one agent.
    pub async fn list(&self, agent_id: Option<&str>) -> Result<Vec<SessionEntry>> {
        let agents: Vec<String> = match agent_id {
            Some(id) => vec![id.to_string()],
            None => self.known_agents().await?,
        };
        let mut out = Vec::new();
        for agent in agents {
            out.extend(self.index(&agent).await?.list());
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.key.cmp(&b.key)));
        Ok(out)
    }

    async fn known_agents(&self) -> Result<Vec<String>> {
        let mut rd = match tokio::fs::read_dir(&self.agents_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut agents = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let index = entry.path().join("sessions").join("sessions.json");
            if tokio::fs::try_exists(&index).await.unwrap_or(false) {
                agents.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        agents.sort();
        Ok(agents)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::key::{DmScope, PeerKind};

    fn registry(dir: &Path) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(dir, Duration::from_secs(60 * 60)))
    }

    #[tokio::test]
    async fn resolve_creates_once_then_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let key = SessionKey::main("home");

        assert_eq!(reg.state(&key).await.unwrap(), SessionState::Absent);
        let first = reg.resolve(&key).await.unwrap();
        assert!(first.created);
        let second = reg.resolve(&key).await.unwrap();
        assert!(!second.created);
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(reg.state(&key).await.unwrap(), SessionState::Active);
    }

    #[tokio::test]
    async fn idle_expiry_recycles_and_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let key = SessionKey::main("home");

        reg.append(&key, TranscriptMessage::user("hello", 1)).await.unwrap();
        let old = reg.entry(&key).await.unwrap().unwrap();

        let later = now_ms() + 2 * 60 * 60 * 1000;
        assert_eq!(reg.state_at(&key, later).await.unwrap(), SessionState::Idle);
        let fresh = reg.resolve_at(&key, later).await.unwrap();
        assert_eq!(fresh.recycled_from.as_deref(), Some(old.session_id.as_str()));
        assert_ne!(fresh.session_id, old.session_id);

        let kept = reg.history_of(&key, &old.session_id).await.unwrap();
        assert_eq!(kept.len(), 1);
        let entry = reg.entry(&key).await.unwrap().unwrap();
        assert_eq!(entry.previous_session_ids, vec![old.session_id]);
    }

    #[tokio::test]
    async fn reset_forces_new_session() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let key = SessionKey::main("home");
        assert!(reg.reset(&key, "manual").await.unwrap().is_none());

        reg.append(&key, TranscriptMessage::user("a", 1)).await.unwrap();
        let before = reg.entry(&key).await.unwrap().unwrap().session_id;
        let after = reg.reset(&key, "manual").await.unwrap().unwrap();
        assert_ne!(after.session_id, before);
        assert!(reg.history(&key).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_keep_per_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let keys: Vec<_> = (0..4)
            .map(|i| {
                SessionKey::for_peer(
                    "home",
                    DmScope::Main,
                    "memory",
                    "default",
                    PeerKind::Group,
                    &format!("g{i}"),
                )
            })
            .collect();

        let mut tasks = Vec::new();
        for key in keys.clone() {
            let reg = Arc::clone(&reg);
            tasks.push(tokio::spawn(async move {
                for n in 0..20u64 {
                    reg.append(&key, TranscriptMessage::user(n.to_string(), n))
                        .await
                        .unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        for key in &keys {
            let got: Vec<u64> = reg
                .history(key)
                .await
                .unwrap()
                .iter()
                .map(|m| m.content.parse().unwrap())
                .collect();
            assert_eq!(got, (0..20).collect::<Vec<_>>());
            assert_eq!(reg.entry(key).await.unwrap().unwrap().message_count, 20);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn turns_on_one_key_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let key = SessionKey::main("home");
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let (reg, key, active, max_seen) =
                (Arc::clone(&reg), key.clone(), Arc::clone(&active), Arc::clone(&max_seen));
            tasks.push(tokio::spawn(async move {
                let _turn = reg.begin_turn(&key).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn list_spans_agents_and_reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let reg = registry(dir.path());
            reg.resolve(&SessionKey::main("a")).await.unwrap();
            reg.resolve(&SessionKey::main("b")).await.unwrap();
        }
        let reg = registry(dir.path());
        let all = reg.list(None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(reg.list(Some("a")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn late_appends_stay_with_the_session_they_started_in() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let key = SessionKey::main("home");
        let started = reg.resolve(&key).await.unwrap().session_id;
        reg.append_to(&key, &started, TranscriptMessage::user("question", 1))
            .await
            .unwrap();

        let fresh = reg.reset(&key, "manual").await.unwrap().unwrap();
        reg.append_to(&key, &started, TranscriptMessage::assistant("late answer", 2))
            .await
            .unwrap();

        assert!(reg.history(&key).await.unwrap().is_empty());
        assert_eq!(reg.history_of(&key, &started).await.unwrap().len(), 2);
        let entry = reg.entry(&key).await.unwrap().unwrap();
        assert_eq!(entry.session_id, fresh.session_id);
        assert_eq!(entry.message_count, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn agents_do_not_share_an_index_lock() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.resolve(&SessionKey::main("a")).await.unwrap();

        // Hold agent a's index; agent b must still make progress.
        let held = reg.index("a").await.unwrap();
        let other = tokio::time::timeout(
            Duration::from_secs(5),
            reg.append(&SessionKey::main("b"), TranscriptMessage::user("hi", 1)),
        )
        .await;
        assert!(other.is_ok_and(|r| r.is_ok()));
        drop(held);
        assert_eq!(reg.list(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn malformed_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        assert!(reg.resolve(&SessionKey("bogus".into())).await.is_err());
    }
}
