//! Sandboxed execution contexts.
//!
//! Contexts are keyed by scope (`session`, `agent` or `shared`), created
//! lazily, reused while fresh, and swept by a periodic prune loop. File
//! access inside a context goes through [`fs::SandboxFs`], which re-checks
//! containment and symlinks on every call.

pub mod backend;
pub mod fs;
pub mod orchestrator;
pub mod path;

pub use {
    backend::{DockerBackend, HostBackend, SandboxBackend, create_backend, sanitize_key},
    fs::{SandboxFs, SandboxFsError},
    orchestrator::{
        SandboxContext, SandboxExplanation, SandboxOrchestrator, SandboxRunner, SandboxSettings,
        scope_key,
    },
    path::{ResolvedPath, SandboxPathError, assert_no_symlink, check_sandbox_path, resolve_sandbox_path},
};
