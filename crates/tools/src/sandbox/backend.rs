use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use {
    anyhow::{Context, Result, bail},
    async_trait::async_trait,
    clawgate_config::schema::{SandboxBackendKind, SandboxConfig, WorkspaceAccess},
    tokio::process::Command,
    tracing::{info, warn},
};

use crate::exec::{ExecOpts, ExecResult, run_command};

/// Where the container sees the per-context workspace.
pub const CONTAINER_WORKDIR: &str = "/workspace";

/// Execution backend for sandbox contexts.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Start (or adopt) the execution handle for `key`. Returns the handle.
    async fn create(&self, key: &str, workspace: &Path) -> Result<String>;

    /// Prepare `program args` to run inside the context.
    ///
    /// `opts.working_dir` is relative to the workspace (absolute paths are
    /// taken as given) and `opts.env` is set for the program, not the
    /// launcher. Run the result with [`ExecOpts::prepared`].
    fn command(
        &self,
        handle: &str,
        workspace: &Path,
        program: &str,
        args: &[String],
        opts: &ExecOpts,
    ) -> Command;

    async fn exec(
        &self,
        handle: &str,
        workspace: &Path,
        command: &str,
        opts: &ExecOpts,
    ) -> Result<ExecResult> {
        let args = ["-c".to_string(), command.to_string()];
        let cmd = self.command(handle, workspace, "sh", &args, opts);
        Ok(run_command(cmd, &opts.prepared()).await?)
    }

    async fn destroy(&self, handle: &str) -> Result<()>;
}

/// One long-lived container per context.
pub struct DockerBackend {
    config: SandboxConfig,
}

impl DockerBackend {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn container_name(&self, key: &str) -> String {
        format!("{}-{}", self.config.container_prefix, key)
    }

    fn resource_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let limits = &self.config.resources;
        if let Some(ref mem) = limits.memory_limit {
            args.extend(["--memory".to_string(), mem.clone()]);
        }
        if let Some(cpu) = limits.cpu_quota {
            args.extend(["--cpus".to_string(), cpu.to_string()]);
        }
        if let Some(pids) = limits.pids_max {
            args.extend(["--pids-limit".to_string(), pids.to_string()]);
        }
        args
    }

    fn mount_args(&self, workspace: &Path) -> Vec<String> {
        let mut args = vec![
            "-v".to_string(),
            format!("{}:{CONTAINER_WORKDIR}:rw", workspace.display()),
        ];
        let suffix = match self.config.workspace_access {
            WorkspaceAccess::None => return args,
            WorkspaceAccess::Ro => "ro",
            WorkspaceAccess::Rw => "rw",
        };
        for path in &self.config.allowed_paths {
            let p = path.display();
            args.extend(["-v".to_string(), format!("{p}:{p}:{suffix}")]);
        }
        args
    }

    pub fn run_args(&self, name: &str, workspace: &Path) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            "-w".to_string(),
            CONTAINER_WORKDIR.to_string(),
        ];
        if self.config.no_network {
            args.push("--network=none".to_string());
        }
        args.extend(self.resource_args());
        args.extend(self.mount_args(workspace));
        args.push(self.config.image.clone());
        args.extend(["sleep".to_string(), "infinity".to_string()]);
        args
    }

    async fn is_running(name: &str) -> bool {
        Command::new("docker")
            .args(["inspect", "--format", "{{.State.Running}}", name])
            .output()
            .await
            .is_ok_and(|o| String::from_utf8_lossy(&o.stdout).trim() == "true")
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn backend_name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, key: &str, workspace: &Path) -> Result<String> {
        let name = self.container_name(key);
        if Self::is_running(&name).await {
            return Ok(name);
        }
        // A stopped container with the same name blocks `docker run`.
        let _ = Command::new("docker")
            .args(["rm", "-f", &name])
            .output()
            .await;

        let output = Command::new("docker")
            .args(self.run_args(&name, workspace))
            .output()
            .await
            .context("failed to run docker")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("docker run failed: {}", stderr.trim());
        }
        info!(container = %name, image = %self.config.image, "sandbox container started");
        Ok(name)
    }

    fn command(
        &self,
        handle: &str,
        _workspace: &Path,
        program: &str,
        args: &[String],
        opts: &ExecOpts,
    ) -> Command {
        let dir = opts
            .working_dir
            .as_ref()
            .map_or_else(|| PathBuf::from(CONTAINER_WORKDIR), |d| Path::new(CONTAINER_WORKDIR).join(d));
        let mut cmd = Command::new("docker");
        cmd.arg("exec");
        if opts.stdin.is_some() {
            cmd.arg("-i");
        }
        cmd.args(["-w", &dir.display().to_string()]);
        for (k, v) in &opts.env {
            cmd.args(["-e", &format!("{k}={v}")]);
        }
        cmd.arg(handle).arg(program).args(args);
        cmd
    }

    async fn destroy(&self, handle: &str) -> Result<()> {
        let output = Command::new("docker")
            .args(["rm", "-f", handle])
            .output()
            .await
            .context("failed to run docker")?;
        if !output.status.success() {
            warn!(container = handle, stderr = %String::from_utf8_lossy(&output.stderr).trim(), "docker rm failed");
        }
        Ok(())
    }
}

/// Workspace directory only; commands run on the host with it as cwd.
pub struct HostBackend;

#[async_trait]
impl SandboxBackend for HostBackend {
    fn backend_name(&self) -> &'static str {
        "host"
    }

    async fn create(&self, _key: &str, workspace: &Path) -> Result<String> {
        tokio::fs::create_dir_all(workspace)
            .await
            .with_context(|| format!("failed to create workspace {}", workspace.display()))?;
        Ok(workspace.display().to_string())
    }

    fn command(
        &self,
        _handle: &str,
        workspace: &Path,
        program: &str,
        args: &[String],
        opts: &ExecOpts,
    ) -> Command {
        let dir = opts
            .working_dir
            .as_ref()
            .map_or_else(|| workspace.to_path_buf(), |d| workspace.join(d));
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(dir);
        cmd.envs(opts.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd
    }

    async fn destroy(&self, _handle: &str) -> Result<()> {
        Ok(())
    }
}

/// Pick the backend for `config.backend`. `auto` prefers a usable docker.
pub fn create_backend(config: &SandboxConfig) -> Arc<dyn SandboxBackend> {
    match config.backend {
        SandboxBackendKind::Docker => Arc::new(DockerBackend::new(config.clone())),
        SandboxBackendKind::Host => Arc::new(HostBackend),
        SandboxBackendKind::Auto => {
            if is_docker_usable() {
                info!("sandbox backend: docker");
                Arc::new(DockerBackend::new(config.clone()))
            } else {
                warn!("no usable container runtime found; sandboxes run on the host");
                Arc::new(HostBackend)
            }
        },
    }
}

fn is_docker_usable() -> bool {
    if which::which("docker").is_err() {
        return false;
    }
    std::process::Command::new("docker")
        .args(["info", "--format", "{{.ServerVersion}}"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

/// Replace anything outside `[A-Za-z0-9._-]` so a scope key can name a
/// container and a directory.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

pub fn workspace_for(root: &Path, key: &str) -> PathBuf {
    root.join(sanitize_key(key))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, clawgate_config::schema::ResourceLimits};

    fn docker(access: WorkspaceAccess) -> DockerBackend {
        DockerBackend::new(SandboxConfig {
            workspace_access: access,
            allowed_paths: vec![PathBuf::from("/srv/data")],
            resources: ResourceLimits {
                memory_limit: Some("512M".into()),
                cpu_quota: Some(1.5),
                pids_max: Some(64),
            },
            ..Default::default()
        })
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize_key("agent:main:slack:group:C1"), "agent-main-slack-group-C1");
        assert_eq!(sanitize_key("a/b c"), "a-b-c");
    }

    #[test]
    fn docker_run_args_carry_limits_and_mounts() {
        let backend = docker(WorkspaceAccess::Ro);
        let args = backend.run_args("clawgate-sbx-k", Path::new("/state/sandboxes/k"));
        let joined = args.join(" ");
        assert!(joined.starts_with("run -d --name clawgate-sbx-k -w /workspace --network=none"));
        assert!(joined.contains("--memory 512M --cpus 1.5 --pids-limit 64"));
        assert!(joined.contains("-v /state/sandboxes/k:/workspace:rw"));
        assert!(joined.contains("-v /srv/data:/srv/data:ro"));
        assert!(joined.ends_with("ubuntu:25.10 sleep infinity"));
    }

    #[test]
    fn allowed_paths_are_not_mounted_without_access() {
        let args = docker(WorkspaceAccess::None).run_args("n", Path::new("/w"));
        assert!(!args.iter().any(|a| a.contains("/srv/data")));
    }

    #[tokio::test]
    async fn host_backend_runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("ctx");
        let handle = HostBackend.create("ctx", &ws).await.unwrap();
        assert!(ws.is_dir());
        let out = HostBackend
            .exec(&handle, &ws, "touch marker && ls", &ExecOpts::default())
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "marker");
    }

    #[test]
    fn docker_command_targets_the_container_workspace() {
        let backend = docker(WorkspaceAccess::Rw);
        let opts = ExecOpts {
            working_dir: Some(PathBuf::from("src")),
            env: vec![("A".into(), "1".into())],
            stdin: Some("hi".into()),
            ..Default::default()
        };
        let cmd = backend.command("box", Path::new("/host/ws"), "claude", &["-p".into()], &opts);
        let inner = cmd.as_std();
        assert_eq!(inner.get_program(), "docker");
        let args: Vec<_> = inner.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["exec", "-i", "-w", "/workspace/src", "-e", "A=1", "box", "claude", "-p"]);
        assert!(inner.get_current_dir().is_none());
    }

    #[tokio::test]
    async fn host_command_runs_program_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("ctx");
        let handle = HostBackend.create("ctx", &ws).await.unwrap();
        let opts = ExecOpts {
            env: vec![("GREETING".into(), "hey".into())],
            ..Default::default()
        };
        let cmd = HostBackend.command(
            &handle,
            &ws,
            "sh",
            &["-c".into(), "echo $GREETING; pwd".into()],
            &opts,
        );
        let out = run_command(cmd, &opts.prepared()).await.unwrap();
        let mut lines = out.stdout.lines();
        assert_eq!(lines.next(), Some("hey"));
        let pwd = PathBuf::from(lines.next().unwrap());
        assert_eq!(pwd.canonicalize().unwrap(), ws.canonicalize().unwrap());
    }

    #[test]
    fn explicit_host_backend_is_selected() {
        let cfg = SandboxConfig {
            backend: SandboxBackendKind::Host,
            ..Default::default()
        };
        assert_eq!(create_backend(&cfg).backend_name(), "host");
    }
}
