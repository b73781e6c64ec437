//! Containment checks for sandboxed file access.
//!
//! Resolution is two-step: a lexical containment test against the sandbox
//! root and the allow-list, then a physical walk that refuses any symbolic
//! link below the winning base.

use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum SandboxPathError {
    #[error("path '{}' escapes the sandbox root '{}'", path.display(), root.display())]
    PathEscape { path: PathBuf, root: PathBuf },
    #[error("symbolic link not allowed in sandboxed path: '{}'", .0.display())]
    SymlinkNotAllowed(PathBuf),
    #[error("failed to inspect '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPath {
    pub resolved: PathBuf,
    /// `resolved` relative to `base`.
    pub relative: PathBuf,
    pub base: PathBuf,
}

/// Fold `.` and `..` without touching the filesystem. `..` never climbs past `/`.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {},
            Component::ParentDir => {
                if !out.pop() && !path.has_root() {
                    out.push("..");
                }
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn expand_tilde(raw: &str) -> PathBuf {
    if raw == "~" {
        return clawgate_config::home_dir().unwrap_or_else(|| PathBuf::from(raw));
    }
    if let Some(rest) = raw.strip_prefix("~/")
        && let Some(home) = clawgate_config::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(raw)
}

/// Resolve `raw` against `cwd` and require it to land under `root` or an
/// `allowed` entry. The longest matching base wins.
pub fn resolve_sandbox_path(
    raw: &str,
    cwd: &Path,
    root: &Path,
    allowed: &[PathBuf],
) -> Result<ResolvedPath, SandboxPathError> {
    let expanded = expand_tilde(raw);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    };
    let resolved = normalize(&absolute);

    let base = std::iter::once(root)
        .chain(allowed.iter().map(PathBuf::as_path))
        .map(normalize)
        .filter(|base| base.is_absolute() && resolved.starts_with(base))
        .max_by_key(|base| base.components().count())
        .ok_or_else(|| SandboxPathError::PathEscape {
            path: resolved.clone(),
            root: root.to_path_buf(),
        })?;

    let relative = resolved
        .strip_prefix(&base)
        .map(Path::to_path_buf)
        .unwrap_or_default();
    Ok(ResolvedPath {
        resolved,
        relative,
        base,
    })
}

/// Walk every segment below `base` and fail on the first symbolic link.
///
/// Segments that do not exist yet end the walk; they cannot be links.
pub fn assert_no_symlink(path: &ResolvedPath) -> Result<(), SandboxPathError> {
    let mut current = path.base.clone();
    for component in path.relative.components() {
        current.push(component);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(SandboxPathError::SymlinkNotAllowed(current));
            },
            Ok(_) => {},
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(SandboxPathError::Io {
                    path: current,
                    source,
                });
            },
        }
    }
    Ok(())
}

/// Both checks, as every sandboxed access runs them.
pub fn check_sandbox_path(
    raw: &str,
    cwd: &Path,
    root: &Path,
    allowed: &[PathBuf],
) -> Result<ResolvedPath, SandboxPathError> {
    let resolved = resolve_sandbox_path(raw, cwd, root, allowed)?;
    assert_no_symlink(&resolved)?;
    Ok(resolved)
}
