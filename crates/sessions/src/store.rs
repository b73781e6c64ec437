use std::{
    fs::{self, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use {
    anyhow::{Context, Result},
    serde::{Deserialize, Serialize},
    tracing::warn,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One line of a session transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Model that produced an assistant message, as `provider/model`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl TranscriptMessage {
    pub fn user(content: impl Into<String>, timestamp: u64) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp,
            sender_id: None,
            channel: None,
            model: None,
        }
    }

    pub fn assistant(content: impl Into<String>, timestamp: u64) -> Self {
        Self {
            role: Role::Assistant,
            ..Self::user(content, timestamp)
        }
    }
}

/// Append-only JSONL transcripts, one file per session id.
///
/// Appends take an exclusive `fd-lock` on the file so a second process
/// touching the same state directory cannot interleave partial lines.
#[derive(Debug, Clone)]
pub struct TranscriptStore {
    dir: PathBuf,
}

impl TranscriptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.jsonl"))
    }

    pub fn append(&self, session_id: &str, message: &TranscriptMessage) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.path_for(session_id);
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        let mut lock = fd_lock::RwLock::new(file);
        let mut guard = lock.write()?;
        guard.write_all(line.as_bytes())?;
        guard.flush()?;
        Ok(())
    }

    pub fn read(&self, session_id: &str) -> Result<Vec<TranscriptMessage>> {
        read_jsonl(&self.path_for(session_id))
    }
}

fn read_jsonl(path: &Path) -> Result<Vec<TranscriptMessage>> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("opening {}", path.display())),
    };
    let mut out = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(msg) => out.push(msg),
            Err(e) => warn!(path = %path.display(), line = n + 1, error = %e, "skipping bad transcript line"),
        }
    }
    Ok(out)
}
