use std::path::{Path, PathBuf};

use {
    clawgate_config::schema::WorkspaceAccess,
    serde::Serialize,
    tracing::debug,
};

use super::path::{ResolvedPath, SandboxPathError, check_sandbox_path, normalize};

#[derive(Debug, thiserror::Error)]
pub enum SandboxFsError {
    #[error(transparent)]
    Path(#[from] SandboxPathError),
    #[error("'{}' is read-only inside the sandbox", .0.display())]
    ReadOnly(PathBuf),
    #[error("{op} '{}': {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SandboxFsError {
    /// True for containment failures, as opposed to plain I/O errors.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            Self::Path(
                SandboxPathError::PathEscape { .. } | SandboxPathError::SymlinkNotAllowed(_)
            ) | Self::ReadOnly(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// File access confined to one sandbox workspace.
///
/// The workspace is always read-write. Extra `allowed` host paths follow
/// `access`: hidden for `none`, read-only for `ro`.
#[derive(Debug, Clone)]
pub struct SandboxFs {
    root: PathBuf,
    cwd: PathBuf,
    allowed: Vec<PathBuf>,
    access: WorkspaceAccess,
}

impl SandboxFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            cwd: root.clone(),
            root,
            allowed: Vec::new(),
            access: WorkspaceAccess::None,
        }
    }

    pub fn with_allowed(mut self, allowed: Vec<PathBuf>, access: WorkspaceAccess) -> Self {
        self.allowed = allowed;
        self.access = access;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check(&self, raw: &str, write: bool) -> Result<ResolvedPath, SandboxFsError> {
        let allowed: &[PathBuf] = match self.access {
            WorkspaceAccess::None => &[],
            WorkspaceAccess::Ro | WorkspaceAccess::Rw => &self.allowed,
        };
        let resolved = check_sandbox_path(raw, &self.cwd, &self.root, allowed)?;
        if write && self.access != WorkspaceAccess::Rw && !resolved.resolved.starts_with(&self.root) {
            return Err(SandboxFsError::ReadOnly(resolved.resolved));
        }
        debug!(path = %resolved.resolved.display(), write, "sandbox fs access");
        Ok(resolved)
    }

    /// Resolve `raw` for reading without touching it.
    pub fn locate(&self, raw: &str) -> Result<ResolvedPath, SandboxFsError> {
        self.check(raw, false)
    }

    pub async fn read(&self, raw: &str) -> Result<String, SandboxFsError> {
        let r = self.check(raw, false)?;
        tokio::fs::read_to_string(&r.resolved)
            .await
            .map_err(|source| io_err("read", &r.resolved, source))
    }

    pub async fn write(&self, raw: &str, contents: &str) -> Result<PathBuf, SandboxFsError> {
        let r = self.check(raw, true)?;
        if let Some(parent) = r.resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| io_err("create", parent, source))?;
        }
        // Parents may have been swapped for links while we created them.
        let r = self.check(raw, true)?;
        tokio::fs::write(&r.resolved, contents)
            .await
            .map_err(|source| io_err("write", &r.resolved, source))?;
        Ok(r.resolved)
    }

    pub async fn list(&self, raw: &str) -> Result<Vec<DirEntryInfo>, SandboxFsError> {
        let r = self.check(raw, false)?;
        let mut dir = tokio::fs::read_dir(&r.resolved)
            .await
            .map_err(|source| io_err("list", &r.resolved, source))?;
        let mut out = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|source| io_err("list", &r.resolved, source))?
        {
            let meta = entry
                .metadata()
                .await
                .map_err(|source| io_err("stat", &entry.path(), source))?;
            out.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: meta.is_dir(),
                size: meta.len(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub async fn remove(&self, raw: &str) -> Result<(), SandboxFsError> {
        let r = self.check(raw, true)?;
        if r.resolved == normalize(&self.root) {
            return Err(SandboxFsError::ReadOnly(r.resolved));
        }
        let meta = tokio::fs::symlink_metadata(&r.resolved)
            .await
            .map_err(|source| io_err("remove", &r.resolved, source))?;
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&r.resolved).await
        } else {
            tokio::fs::remove_file(&r.resolved).await
        };
        result.map_err(|source| io_err("remove", &r.resolved, source))
    }
}

fn io_err(op: &'static str, path: &Path, source: std::io::Error) -> SandboxFsError {
    SandboxFsError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_list_remove_inside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SandboxFs::new(dir.path());

        fs.write("notes/today.md", "hello").await.unwrap();
        assert_eq!(fs.read("notes/today.md").await.unwrap(), "hello");

        let entries = fs.list("notes").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "today.md");

        fs.remove("notes").await.unwrap();
        assert!(!dir.path().join("notes").exists());
    }

    #[tokio::test]
    async fn escape_is_a_violation() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SandboxFs::new(dir.path().join("ws"));
        let err = fs.read("../../etc/passwd").await.unwrap_err();
        assert!(err.is_violation());
        let err = fs.remove(".").await.unwrap_err();
        assert!(err.is_violation());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_checked_on_every_access() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), "s").unwrap();
        let fs = SandboxFs::new(dir.path());

        fs.write("plain", "ok").await.unwrap();
        // A link planted after the sandbox was set up is still caught.
        std::os::unix::fs::symlink(outside.path(), dir.path().join("planted")).unwrap();
        let err = fs.read("planted/secret").await.unwrap_err();
        assert!(matches!(err, SandboxFsError::Path(SandboxPathError::SymlinkNotAllowed(_))));
    }

    #[tokio::test]
    async fn allowed_paths_follow_access_mode() {
        let dir = tempfile::tempdir().unwrap();
        let extra = tempfile::tempdir().unwrap();
        std::fs::write(extra.path().join("data.txt"), "d").unwrap();
        let raw = extra.path().join("data.txt").display().to_string();

        let hidden = SandboxFs::new(dir.path());
        assert!(hidden.with_allowed(vec![extra.path().into()], WorkspaceAccess::None).read(&raw).await.is_err());

        let ro = SandboxFs::new(dir.path()).with_allowed(vec![extra.path().into()], WorkspaceAccess::Ro);
        assert_eq!(ro.read(&raw).await.unwrap(), "d");
        assert!(matches!(ro.write(&raw, "x").await, Err(SandboxFsError::ReadOnly(_))));

        let rw = SandboxFs::new(dir.path()).with_allowed(vec![extra.path().into()], WorkspaceAccess::Rw);
        rw.write(&raw, "x").await.unwrap();
    }
}
