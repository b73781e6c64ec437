use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use {
    anyhow::{Context, Result},
    serde::{Deserialize, Serialize},
    tracing::warn,
};

/// A single session entry in the metadata index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub key: String,
    pub agent_id: String,
    /// Id of the live transcript. Changes when the key is recycled.
    pub session_id: String,
    pub created_at: u64,
    pub updated_at: u64,
    pub message_count: u32,
    /// Earlier transcripts under this key, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous_session_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reset_reason: Option<String>,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// JSON file-backed index mapping session key → SessionEntry.
pub struct SessionMetadata {
    path: PathBuf,
    entries: HashMap<String, SessionEntry>,
}

impl SessionMetadata {
    /// Load metadata from disk, or create an empty index.
    pub fn load(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            let data = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&data).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "corrupt session index, starting empty");
                HashMap::new()
            })
        } else {
            HashMap::new()
        };
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialized form of the index, ready for [`write_index`].
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.entries)?)
    }

    /// Persist metadata to disk via temp file + rename.
    pub fn save(&self) -> Result<()> {
        write_index(&self.path, &self.encode()?)
    }

    pub fn get(&self, key: &str) -> Option<&SessionEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut SessionEntry> {
        self.entries.get_mut(key)
    }

    /// Create a fresh entry for `key`, replacing nothing.
    pub fn insert_new(&mut self, key: &str, agent_id: &str, now: u64) -> &SessionEntry {
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| SessionEntry {
                key: key.to_string(),
                agent_id: agent_id.to_string(),
                session_id: uuid::Uuid::new_v4().to_string(),
                created_at: now,
                updated_at: now,
                message_count: 0,
                previous_session_ids: Vec::new(),
                last_reset_reason: None,
            })
    }

    /// Start a new transcript under an existing key. History stays on disk.
    pub fn recycle(&mut self, key: &str, now: u64, reason: &str) -> Option<&SessionEntry> {
        let entry = self.entries.get_mut(key)?;
        let old = std::mem::replace(&mut entry.session_id, uuid::Uuid::new_v4().to_string());
        entry.previous_session_ids.push(old);
        entry.created_at = now;
        entry.updated_at = now;
        entry.message_count = 0;
        entry.last_reset_reason = Some(reason.to_string());
        Some(&*entry)
    }

    pub fn touch(&mut self, key: &str, now: u64) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.message_count = entry.message_count.saturating_add(1);
            entry.updated_at = now;
        }
    }

    /// [`Self::touch`], but only while `session_id` is still the live
    /// transcript. Returns whether the entry was touched.
    pub fn touch_session(&mut self, key: &str, session_id: &str, now: u64) -> bool {
        match self.entries.get(key) {
            Some(entry) if entry.session_id == session_id => {
                self.touch(key, now);
                true
            },
            _ => false,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<SessionEntry> {
        self.entries.remove(key)
    }

    /// All entries, most recently updated first.
    pub fn list(&self) -> Vec<SessionEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.key.cmp(&b.key)));
        entries
    }
}

/// Write `data` to `path` through a temp file + rename.
pub fn write_index(path: &Path, data: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}
