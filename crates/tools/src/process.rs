//! Background process registry.
//!
//! Every spawned process is owned by the session key that started it. Live
//! and finished processes are tracked in separate maps; output is kept in a
//! per-stream ring that drops the oldest bytes once the cap is reached.

use std::{
    collections::VecDeque,
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    dashmap::DashMap,
    serde::Serialize,
    tokio::{
        io::{AsyncRead, AsyncReadExt},
        process::Command,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

pub const KILL_SIGNAL: &str = "SIGKILL";

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process not found: {0}")]
    NotFound(String),
    #[error("process {0} is not running")]
    NotRunning(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Exited,
    Killed,
    Failed,
}

/// Snapshot of one process session as reported to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub id: String,
    pub command: String,
    pub owner_session_key: String,
    pub cwd: Option<PathBuf>,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    /// Bytes dropped from the front of stdout/stderr because of the cap.
    pub truncated_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessLog {
    pub id: String,
    pub status: ProcessStatus,
    pub stdout: String,
    pub stderr: String,
    pub truncated_bytes: u64,
}

struct OutputRing {
    bytes: VecDeque<u8>,
    dropped: u64,
}

impl OutputRing {
    fn new() -> Self {
        Self {
            bytes: VecDeque::new(),
            dropped: 0,
        }
    }

    fn push(&mut self, chunk: &[u8], cap: usize) {
        self.bytes.extend(chunk);
        if self.bytes.len() > cap {
            let excess = self.bytes.len() - cap;
            self.bytes.drain(..excess);
            self.dropped += excess as u64;
        }
    }

    fn text(&self, tail_lines: Option<usize>) -> String {
        let (front, back) = self.bytes.as_slices();
        let mut raw = Vec::with_capacity(self.bytes.len());
        raw.extend_from_slice(front);
        raw.extend_from_slice(back);
        let text = String::from_utf8_lossy(&raw).into_owned();
        match tail_lines {
            Some(n) => {
                let lines: Vec<&str> = text.lines().collect();
                lines[lines.len().saturating_sub(n)..].join("\n")
            },
            None => text,
        }
    }
}

struct ProcessEntry {
    info: Mutex<ProcessInfo>,
    stdout: Mutex<OutputRing>,
    stderr: Mutex<OutputRing>,
    cancel: CancellationToken,
}

impl ProcessEntry {
    fn snapshot(&self) -> ProcessInfo {
        let mut info = self
            .info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        info.truncated_bytes = lock(&self.stdout).dropped + lock(&self.stderr).dropped;
        info
    }

    fn finish(&self, status: ProcessStatus, exit_code: Option<i32>, signal: Option<&str>) {
        let mut info = self.info.lock().unwrap_or_else(PoisonError::into_inner);
        info.status = status;
        info.exit_code = exit_code;
        info.signal = signal.map(str::to_string);
        info.ended_at = Some(now_ms());
    }
}

struct Inner {
    live: DashMap<String, Arc<ProcessEntry>>,
    finished: DashMap<String, Arc<ProcessEntry>>,
    max_output_bytes: AtomicUsize,
    finished_ttl_ms: AtomicU64,
}

impl Inner {
    /// Move `id` from live to finished. `None` if it was not live.
    fn retire(&self, id: &str) -> Option<Arc<ProcessEntry>> {
        let (_, entry) = self.live.remove(id)?;
        self.finished.insert(id.to_string(), Arc::clone(&entry));
        Some(entry)
    }
}

/// Registry of background processes keyed by process id.
#[derive(Clone)]
pub struct ProcessRegistry {
    inner: Arc<Inner>,
}

impl ProcessRegistry {
    pub fn new(max_output_bytes: usize, finished_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                live: DashMap::new(),
                finished: DashMap::new(),
                max_output_bytes: AtomicUsize::new(max_output_bytes.max(1)),
                finished_ttl_ms: AtomicU64::new(finished_ttl.as_millis() as u64),
            }),
        }
    }

    pub fn from_config(cfg: &clawgate_config::schema::ProcessConfig) -> Self {
        Self::new(
            cfg.max_output_bytes,
            Duration::from_secs(cfg.finished_ttl_minutes.saturating_mul(60)),
        )
    }

    pub fn apply_config(&self, cfg: &clawgate_config::schema::ProcessConfig) {
        self.inner
            .max_output_bytes
            .store(cfg.max_output_bytes.max(1), Ordering::Relaxed);
        self.inner
            .finished_ttl_ms
            .store(cfg.finished_ttl_minutes.saturating_mul(60_000), Ordering::Relaxed);
    }

    /// Spawn `command` through `sh -c` on the host on behalf of `session_key`.
    pub fn spawn(
        &self,
        command: &str,
        session_key: &str,
        cwd: Option<PathBuf>,
    ) -> Result<ProcessInfo, ProcessError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        if let Some(ref dir) = cwd {
            cmd.current_dir(dir);
        }
        self.spawn_prepared(cmd, command, session_key, cwd)
    }

    /// Track an already prepared command, e.g. one aimed at a sandbox
    /// context. `command` and `cwd` are what gets reported.
    pub fn spawn_prepared(
        &self,
        mut cmd: Command,
        command: &str,
        session_key: &str,
        cwd: Option<PathBuf>,
    ) -> Result<ProcessInfo, ProcessError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let id = self.fresh_id();
        let entry = Arc::new(ProcessEntry {
            info: Mutex::new(ProcessInfo {
                id: id.clone(),
                command: command.to_string(),
                owner_session_key: session_key.to_string(),
                cwd,
                pid: child.id(),
                status: ProcessStatus::Running,
                exit_code: None,
                signal: None,
                started_at: now_ms(),
                ended_at: None,
                truncated_bytes: 0,
            }),
            stdout: Mutex::new(OutputRing::new()),
            stderr: Mutex::new(OutputRing::new()),
            cancel: CancellationToken::new(),
        });
        self.inner.live.insert(id.clone(), Arc::clone(&entry));
        info!(id, session_key, command, "process spawned");

        let readers = [
            child
                .stdout
                .take()
                .map(|out| self.pump(out, Arc::clone(&entry), Stream::Stdout)),
            child
                .stderr
                .take()
                .map(|err| self.pump(err, Arc::clone(&entry), Stream::Stderr)),
        ];

        let inner = Arc::clone(&self.inner);
        let waiter_entry = Arc::clone(&entry);
        let waiter_id = id.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => Some(status),
                () = waiter_entry.cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(id = %waiter_id, error = %e, "failed to kill process");
                    }
                    None
                },
            };
            for reader in readers.into_iter().flatten() {
                let _ = reader.await;
            }
            let Some(status) = outcome else {
                return;
            };
            if let Some(entry) = inner.retire(&waiter_id) {
                match status {
                    Ok(status) => {
                        entry.finish(ProcessStatus::Exited, status.code(), None);
                        debug!(id = %waiter_id, code = ?status.code(), "process exited");
                    },
                    Err(e) => {
                        entry.finish(ProcessStatus::Failed, None, None);
                        warn!(id = %waiter_id, error = %e, "process wait failed");
                    },
                }
            }
        });

        Ok(entry.snapshot())
    }

    fn fresh_id(&self) -> String {
        loop {
            let id = format!("proc-{}", uuid::Uuid::new_v4().simple());
            if !self.inner.live.contains_key(&id) && !self.inner.finished.contains_key(&id) {
                return id;
            }
        }
    }

    fn pump<R>(
        &self,
        mut reader: R,
        entry: Arc<ProcessEntry>,
        stream: Stream,
    ) -> tokio::task::JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let cap = inner.max_output_bytes.load(Ordering::Relaxed);
                        let ring = match stream {
                            Stream::Stdout => &entry.stdout,
                            Stream::Stderr => &entry.stderr,
                        };
                        lock(ring).push(&buf[..n], cap);
                    },
                }
            }
        })
    }

    /// Live and finished processes, oldest first.
    pub fn list(&self) -> Vec<ProcessInfo> {
        let mut out: Vec<ProcessInfo> = self
            .inner
            .live
            .iter()
            .chain(self.inner.finished.iter())
            .map(|e| e.value().snapshot())
            .collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        out
    }

    pub fn list_for_session(&self, session_key: &str) -> Vec<ProcessInfo> {
        self.list()
            .into_iter()
            .filter(|p| p.owner_session_key == session_key)
            .collect()
    }

    fn find(&self, id: &str) -> Option<Arc<ProcessEntry>> {
        self.inner
            .live
            .get(id)
            .or_else(|| self.inner.finished.get(id))
            .map(|e| Arc::clone(e.value()))
    }

    pub fn get(&self, id: &str) -> Option<ProcessInfo> {
        self.find(id).map(|e| e.snapshot())
    }

    /// Buffered output, optionally limited to the last `tail` lines per stream.
    pub fn log(&self, id: &str, tail: Option<usize>) -> Result<ProcessLog, ProcessError> {
        let entry = self
            .find(id)
            .ok_or_else(|| ProcessError::NotFound(id.to_string()))?;
        let info = entry.snapshot();
        Ok(ProcessLog {
            id: info.id,
            status: info.status,
            stdout: lock(&entry.stdout).text(tail),
            stderr: lock(&entry.stderr).text(tail),
            truncated_bytes: info.truncated_bytes,
        })
    }

    /// Kill a live process. It moves to finished immediately with the signal recorded.
    pub fn kill(&self, id: &str) -> Result<ProcessInfo, ProcessError> {
        let Some(entry) = self.inner.retire(id) else {
            return if self.inner.finished.contains_key(id) {
                Err(ProcessError::NotRunning(id.to_string()))
            } else {
                Err(ProcessError::NotFound(id.to_string()))
            };
        };
        entry.finish(ProcessStatus::Killed, None, Some(KILL_SIGNAL));
        entry.cancel.cancel();
        info!(id, "process killed");
        Ok(entry.snapshot())
    }

    /// Kill every live process owned by `session_key`.
    pub fn kill_session(&self, session_key: &str) -> Vec<String> {
        let owned: Vec<String> = self
            .inner
            .live
            .iter()
            .filter(|e| {
                e.value()
                    .info
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .owner_session_key
                    == session_key
            })
            .map(|e| e.key().clone())
            .collect();
        owned
            .into_iter()
            .filter(|id| self.kill(id).is_ok())
            .collect()
    }

    pub fn kill_all(&self) -> usize {
        let ids: Vec<String> = self.inner.live.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.kill(id).is_ok()).count()
    }

    pub fn live_count(&self) -> usize {
        self.inner.live.len()
    }

    /// Drop finished sessions whose end time is older than the TTL.
    pub fn sweep(&self) -> usize {
        self.sweep_at(now_ms())
    }

    pub fn sweep_at(&self, now: u64) -> usize {
        let ttl = self.inner.finished_ttl_ms.load(Ordering::Relaxed);
        let before = self.inner.finished.len();
        self.inner.finished.retain(|_, entry| {
            let ended = entry
                .info
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .ended_at
                .unwrap_or(now);
            now.saturating_sub(ended) < ttl
        });
        let removed = before.saturating_sub(self.inner.finished.len());
        if removed > 0 {
            debug!(removed, "swept finished processes");
        }
        removed
    }

    pub async fn sweep_loop(self, every: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep();
                },
                () = cancel.cancelled() => break,
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn lock(ring: &Mutex<OutputRing>) -> MutexGuard<'_, OutputRing> {
    ring.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
