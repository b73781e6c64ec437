//! External coding CLIs (Claude Code, Codex, …) driven as model providers.
//!
//! A [`CliBackendConfig`] template describes how to build the argv for a
//! first turn and for a resumed one, and how to read the reply and the CLI's
//! own session id from stdout. At most one process runs per session key.
//! A sandboxed turn runs the CLI inside its sandbox context.

use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    clawgate_config::schema::{
        CliBackendConfig, CliInputMode, CliOutputMode, CliSessionMode, SystemPromptWhen,
    },
    clawgate_tools::{
        exec::{ExecError, ExecOpts, run_command},
        policy::KNOWN_TOOLS,
    },
    dashmap::DashMap,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tokio::{
        process::Command,
        sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard},
    },
    tracing::{debug, info, warn},
};

use crate::{
    auth_profiles::write_private,
    model::{ModelReply, ModelRequest, ProviderError},
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
const MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;
const TEXT_FIELDS: &[&str] = &["result", "text", "message", "content", "response"];
const SESSION_PLACEHOLDER: &str = "{sessionId}";
pub const CLI_SESSIONS_FILE: &str = "cli-sessions.json";

#[derive(Debug, thiserror::Error)]
pub enum CliBackendError {
    #[error("failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{command}' exited with {code}: {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },
    #[error("'{command}' reported an error: {message}")]
    Reported { command: String, message: String },
    #[error("could not parse output: {0}")]
    Parse(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(std::io::Error),
}

impl From<CliBackendError> for ProviderError {
    fn from(e: CliBackendError) -> Self {
        match e {
            CliBackendError::Timeout(d) => Self::timeout(d),
            CliBackendError::Cancelled => Self::cancelled(),
            other => Self::failed(None, other.to_string()),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Templates available without configuration.
pub fn builtin_backends() -> BTreeMap<String, CliBackendConfig> {
    let claude = CliBackendConfig {
        command: "claude".into(),
        args: strings(&["-p", "--output-format", "json"]),
        resume_args: Some(strings(&["-p", "--output-format", "json", "--resume", SESSION_PLACEHOLDER])),
        output: CliOutputMode::Json,
        input: CliInputMode::Arg,
        model_arg: Some("--model".into()),
        model_aliases: BTreeMap::from([
            ("opus".into(), "opus".into()),
            ("sonnet".into(), "sonnet".into()),
            ("haiku".into(), "haiku".into()),
        ]),
        session_arg: Some("--session-id".into()),
        session_mode: CliSessionMode::Always,
        session_id_fields: strings(&["session_id", "sessionId"]),
        system_prompt_arg: Some("--append-system-prompt".into()),
        system_prompt_when: SystemPromptWhen::First,
        env: BTreeMap::new(),
        clear_env: strings(&["ANTHROPIC_API_KEY"]),
        timeout_ms: None,
        deny_tools_arg: Some("--disallowedTools".into()),
        tool_names: BTreeMap::from([
            ("read".into(), "Read".into()),
            ("write".into(), "Write".into()),
            ("edit".into(), "Edit".into()),
            ("exec".into(), "Bash".into()),
        ]),
    };
    let codex = CliBackendConfig {
        command: "codex".into(),
        args: strings(&["exec", "--json", "--color", "never", "--skip-git-repo-check"]),
        resume_args: Some(strings(&[
            "exec",
            "resume",
            SESSION_PLACEHOLDER,
            "--json",
            "--color",
            "never",
            "--skip-git-repo-check",
        ])),
        output: CliOutputMode::Jsonl,
        input: CliInputMode::Arg,
        model_arg: Some("--model".into()),
        model_aliases: BTreeMap::new(),
        session_arg: None,
        session_mode: CliSessionMode::Existing,
        session_id_fields: strings(&["thread_id", "session_id"]),
        system_prompt_arg: None,
        system_prompt_when: SystemPromptWhen::Never,
        env: BTreeMap::new(),
        clear_env: Vec::new(),
        timeout_ms: None,
        deny_tools_arg: None,
        tool_names: BTreeMap::new(),
    };
    BTreeMap::from([("claude-cli".into(), claude), ("codex-cli".into(), codex)])
}

/// Built-ins overlaid with configured templates; a configured name replaces the built-in.
pub fn resolve_backends(configured: &BTreeMap<String, CliBackendConfig>) -> BTreeMap<String, CliBackendConfig> {
    let mut all = builtin_backends();
    for (name, cfg) in configured {
        all.insert(name.clone(), cfg.clone());
    }
    all
}

// ── Output parsing ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub text: String,
    pub session_id: Option<String>,
    /// Set when the CLI flagged the result as an error (`is_error: true`).
    pub error: bool,
}

fn text_of(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(|i| i.get("text").and_then(Value::as_str).map(str::to_string))
                .collect();
            (!parts.is_empty()).then(|| parts.join(""))
        },
        Value::Object(_) => v
            .get("text")
            .or_else(|| v.get("content"))
            .and_then(text_of),
        _ => None,
    }
}

/// Reply text from one JSON object, probing `item` for event-style output.
fn extract_text(v: &Value) -> Option<String> {
    TEXT_FIELDS
        .iter()
        .find_map(|f| v.get(*f).and_then(text_of))
        .or_else(|| {
            v.get("item")
                .filter(|item| item.get("type").and_then(Value::as_str) != Some("reasoning"))
                .and_then(extract_text)
        })
}

fn extract_session_id(v: &Value, fields: &[String]) -> Option<String> {
    fields
        .iter()
        .find_map(|f| v.get(f.as_str()).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Parse CLI stdout according to its output mode.
pub fn parse_output(
    mode: CliOutputMode,
    stdout: &str,
    session_fields: &[String],
) -> Result<ParsedOutput, CliBackendError> {
    match mode {
        CliOutputMode::Text => Ok(ParsedOutput {
            text: stdout.trim().to_string(),
            ..Default::default()
        }),
        CliOutputMode::Json => {
            let trimmed = stdout.trim();
            // Some CLIs print log lines first; fall back to the last line that parses.
            let value = serde_json::from_str::<Value>(trimmed)
                .ok()
                .or_else(|| {
                    trimmed
                        .lines()
                        .rev()
                        .find_map(|l| serde_json::from_str::<Value>(l.trim()).ok())
                })
                .filter(Value::is_object)
                .ok_or_else(|| CliBackendError::Parse("expected a JSON object".into()))?;
            Ok(ParsedOutput {
                text: extract_text(&value).unwrap_or_default(),
                session_id: extract_session_id(&value, session_fields),
                error: value.get("is_error").and_then(Value::as_bool).unwrap_or(false),
            })
        },
        CliOutputMode::Jsonl => {
            let mut out = ParsedOutput::default();
            let mut parts = Vec::new();
            let mut parsed_any = false;
            for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
                let Ok(value) = serde_json::from_str::<Value>(line) else {
                    continue;
                };
                parsed_any = true;
                if out.session_id.is_none() {
                    out.session_id = extract_session_id(&value, session_fields);
                }
                if let Some(text) = extract_text(&value) {
                    parts.push(text);
                }
            }
            if !parsed_any && !stdout.trim().is_empty() {
                return Err(CliBackendError::Parse("no JSON lines in output".into()));
            }
            out.text = parts.join("\n");
            Ok(out)
        },
    }
}

// ── Session state ────────────────────────────────────────────────────────────

/// One CLI conversation, as kept in memory and on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliSessionState {
    /// Gateway session id the CLI session belongs to.
    gateway_session_id: Option<String>,
    cli_session_id: Option<String>,
}

/// Session key → backend → state, one file per agent.
type CliSessionFile = BTreeMap<String, BTreeMap<String, CliSessionState>>;
type FileSlot = Arc<Mutex<Option<CliSessionFile>>>;

fn agent_of(session_key: &str) -> Option<&str> {
    session_key
        .strip_prefix("agent:")
        .and_then(|rest| rest.split(':').next())
        .filter(|id| !id.is_empty() && !id.contains(['/', '\\']) && *id != "..")
}

/// Per-(backend, session key) conversation state. The mutex doubles as the
/// single-flight guard for that session.
///
/// A persistent table mirrors every change to
/// `<stateDir>/agents/<agentId>/cli-sessions.json`.
#[derive(Default)]
pub struct CliSessionTable {
    agents_dir: Option<PathBuf>,
    entries: DashMap<(String, String), Arc<Mutex<CliSessionState>>>,
    files: DashMap<String, FileSlot>,
}

impl CliSessionTable {
    pub fn persistent(state_dir: &Path) -> Self {
        Self {
            agents_dir: Some(state_dir.join("agents")),
            ..Default::default()
        }
    }

    fn path_for(&self, agent_id: &str) -> Option<PathBuf> {
        self.agents_dir
            .as_ref()
            .map(|dir| dir.join(agent_id).join(CLI_SESSIONS_FILE))
    }

    async fn slot(&self, backend: &str, session_key: &str) -> Arc<Mutex<CliSessionState>> {
        let id = (backend.to_string(), session_key.to_string());
        if let Some(slot) = self.entries.get(&id) {
            return Arc::clone(slot.value());
        }
        let seed = self.stored(backend, session_key).await;
        Arc::clone(
            self.entries
                .entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(seed)))
                .value(),
        )
    }

    /// Lock an agent's file, reading it from disk on first use.
    async fn file(&self, agent_id: &str) -> OwnedMappedMutexGuard<Option<CliSessionFile>, CliSessionFile> {
        let slot = Arc::clone(self.files.entry(agent_id.to_string()).or_default().value());
        let mut guard = slot.lock_owned().await;
        if guard.is_none() {
            *guard = Some(match self.path_for(agent_id) {
                Some(path) => load_file(path).await,
                None => CliSessionFile::new(),
            });
        }
        OwnedMutexGuard::map(guard, |file| file.get_or_insert_with(CliSessionFile::new))
    }

    async fn stored(&self, backend: &str, session_key: &str) -> CliSessionState {
        let Some(agent_id) = agent_of(session_key) else {
            return CliSessionState::default();
        };
        self.file(agent_id)
            .await
            .get(session_key)
            .and_then(|backends| backends.get(backend))
            .cloned()
            .unwrap_or_default()
    }

    async fn store(&self, backend: &str, session_key: &str, state: &CliSessionState) {
        let Some(agent_id) = agent_of(session_key) else {
            return;
        };
        let mut file = self.file(agent_id).await;
        file.entry(session_key.to_string())
            .or_default()
            .insert(backend.to_string(), state.clone());
        self.write(agent_id, &file).await;
    }

    async fn write(&self, agent_id: &str, file: &CliSessionFile) {
        let Some(path) = self.path_for(agent_id) else {
            return;
        };
        let data = match serde_json::to_vec_pretty(file) {
            Ok(data) => data,
            Err(e) => {
                warn!(agent_id, error = %e, "failed to encode CLI sessions");
                return;
            },
        };
        match tokio::task::spawn_blocking(move || write_private(&path, &data)).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => warn!(agent_id, error = %e, "failed to persist CLI sessions"),
            Err(e) => warn!(agent_id, error = %e, "CLI session write task failed"),
        }
    }

    pub async fn forget(&self, session_key: &str) {
        self.entries.retain(|(_, key), _| key != session_key);
        let Some(agent_id) = agent_of(session_key) else {
            return;
        };
        let mut file = self.file(agent_id).await;
        if file.remove(session_key).is_some() {
            self.write(agent_id, &file).await;
        }
    }

    pub fn cli_session_id(&self, backend: &str, session_key: &str) -> Option<String> {
        let slot = self.entries.get(&(backend.to_string(), session_key.to_string()))?;
        let state = slot.value().try_lock().ok()?;
        state.cli_session_id.clone()
    }
}

async fn load_file(path: PathBuf) -> CliSessionFile {
    let read = {
        let path = path.clone();
        tokio::task::spawn_blocking(move || std::fs::read_to_string(path)).await
    };
    let raw = match read {
        Ok(Ok(raw)) => raw,
        Ok(Err(e)) if e.kind() == ErrorKind::NotFound => return CliSessionFile::new(),
        Ok(Err(e)) => {
            warn!(path = %path.display(), error = %e, "failed to read CLI sessions");
            return CliSessionFile::new();
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "CLI session read task failed");
            return CliSessionFile::new();
        },
    };
    serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "corrupt CLI sessions file, starting empty");
        CliSessionFile::new()
    })
}

// ── Invocation ───────────────────────────────────────────────────────────────

/// A fully resolved command line.
#[derive(Debug, Clone, PartialEq)]
pub struct CliInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    /// The session id passed to the CLI, if any.
    pub session_id: Option<String>,
}

pub struct CliBackend {
    name: String,
    cfg: CliBackendConfig,
    sessions: Arc<CliSessionTable>,
}

impl CliBackend {
    pub fn new(name: String, cfg: CliBackendConfig, sessions: Arc<CliSessionTable>) -> Self {
        Self { name, cfg, sessions }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build argv for one turn. `known` is the CLI session id from earlier
    /// turns; `allowed_tools`, when set, is the turn's tool policy.
    pub fn build_invocation(
        &self,
        model: &str,
        system_prompt: Option<&str>,
        prompt: &str,
        known: Option<&str>,
        allowed_tools: Option<&[String]>,
    ) -> CliInvocation {
        let cfg = &self.cfg;
        let mut session_id = None;
        let mut args = match (known, &cfg.resume_args) {
            (Some(id), Some(resume)) if cfg.session_mode != CliSessionMode::None => {
                session_id = Some(id.to_string());
                resume.iter().map(|a| a.replace(SESSION_PLACEHOLDER, id)).collect()
            },
            _ => cfg.args.clone(),
        };

        if session_id.is_none()
            && let Some(flag) = &cfg.session_arg
        {
            let id = match (cfg.session_mode, known) {
                (CliSessionMode::Always, Some(id)) => Some(id.to_string()),
                (CliSessionMode::Always, None) => Some(uuid::Uuid::new_v4().to_string()),
                (CliSessionMode::Existing, Some(id)) => Some(id.to_string()),
                _ => None,
            };
            if let Some(id) = id {
                args.push(flag.clone());
                args.push(id.clone());
                session_id = Some(id);
            }
        }

        if let Some(flag) = &cfg.model_arg
            && !model.is_empty()
        {
            let resolved = cfg.model_aliases.get(model).map_or(model, String::as_str);
            args.push(flag.clone());
            args.push(resolved.to_string());
        }

        let inject = match cfg.system_prompt_when {
            SystemPromptWhen::Always => true,
            SystemPromptWhen::First => known.is_none(),
            SystemPromptWhen::Never => false,
        };
        if inject
            && let (Some(flag), Some(system)) = (&cfg.system_prompt_arg, system_prompt.filter(|s| !s.is_empty()))
        {
            args.push(flag.clone());
            args.push(system.to_string());
        }

        if let (Some(flag), Some(allowed)) = (&cfg.deny_tools_arg, allowed_tools) {
            let denied = self.denied_tools(allowed);
            if !denied.is_empty() {
                args.push(flag.clone());
                args.push(denied.join(","));
            }
        }

        let stdin = match cfg.input {
            CliInputMode::Arg => {
                args.push(prompt.to_string());
                None
            },
            CliInputMode::Stdin => Some(prompt.to_string()),
        };

        CliInvocation {
            program: cfg.command.clone(),
            args,
            stdin,
            session_id,
        }
    }

    /// The CLI's names for every known tool outside `allowed`.
    fn denied_tools(&self, allowed: &[String]) -> Vec<String> {
        KNOWN_TOOLS
            .iter()
            .filter(|tool| !allowed.iter().any(|a| a == *tool))
            .filter_map(|tool| self.cfg.tool_names.get(*tool).cloned())
            .collect()
    }

    pub async fn complete(&self, model: &str, req: &ModelRequest) -> Result<ModelReply, CliBackendError> {
        let slot = self.sessions.slot(&self.name, &req.session_key).await;
        let mut state = slot.lock().await;

        if state.gateway_session_id.as_deref() != Some(req.session_id.as_str()) {
            if state.cli_session_id.is_some() {
                debug!(backend = %self.name, session_key = %req.session_key, "gateway session recycled; starting a new CLI session");
            }
            state.gateway_session_id = Some(req.session_id.clone());
            state.cli_session_id = None;
        }

        let inv = self.build_invocation(
            model,
            req.system_prompt.as_deref(),
            &req.prompt,
            state.cli_session_id.as_deref(),
            req.tools.as_deref(),
        );

        let timeout = self
            .cfg
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT)
            .min(req.timeout);
        let opts = ExecOpts {
            timeout,
            max_output_bytes: MAX_OUTPUT_BYTES,
            working_dir: None,
            env: self.cfg.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            stdin: inv.stdin.clone(),
            cancel: Some(req.cancel.clone()),
        };
        let (mut cmd, opts) = match &req.sandbox {
            Some(runner) => (runner.command(&inv.program, &inv.args, &opts), opts.prepared()),
            None => {
                let mut cmd = Command::new(&inv.program);
                cmd.args(&inv.args);
                (cmd, opts)
            },
        };
        for var in self.cfg.clear_env.iter().filter(|v| !self.cfg.env.contains_key(*v)) {
            cmd.env_remove(var);
        }

        info!(
            backend = %self.name,
            session_key = %req.session_key,
            resumed = state.cli_session_id.is_some(),
            sandbox = req.sandbox.as_ref().map(|r| r.scope_key()),
            "running CLI backend"
        );
        let out = run_command(cmd, &opts).await.map_err(|e| match e {
            ExecError::Spawn { program, source } => CliBackendError::Spawn {
                command: program,
                source,
            },
            ExecError::Timeout(d) => CliBackendError::Timeout(d),
            ExecError::Cancelled => CliBackendError::Cancelled,
            ExecError::Io(e) => CliBackendError::Io(e),
        })?;

        if out.exit_code != 0 {
            warn!(backend = %self.name, code = out.exit_code, "CLI backend failed");
            let stderr = if out.stderr.trim().is_empty() {
                out.stdout.trim().to_string()
            } else {
                out.stderr.trim().to_string()
            };
            return Err(CliBackendError::Exit {
                command: self.cfg.command.clone(),
                code: out.exit_code,
                stderr,
            });
        }

        let parsed = parse_output(self.cfg.output, &out.stdout, &self.cfg.session_id_fields)?;
        if parsed.error {
            return Err(CliBackendError::Reported {
                command: self.cfg.command.clone(),
                message: parsed.text,
            });
        }
        if self.cfg.session_mode != CliSessionMode::None {
            state.cli_session_id = parsed.session_id.or(inv.session_id);
            self.sessions.store(&self.name, &req.session_key, &state).await;
        }

        Ok(ModelReply {
            text: parsed.text,
            model: if model.is_empty() {
                self.name.clone()
            } else {
                format!("{}/{model}", self.name)
            },
            profile_id: None,
            usage: None,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        clawgate_tools::sandbox::{HostBackend, SandboxContext, SandboxRunner},
        rstest::rstest,
        tokio_util::sync::CancellationToken,
    };

    fn backend(name: &str, cfg: CliBackendConfig) -> CliBackend {
        CliBackend::new(name.into(), cfg, Arc::new(CliSessionTable::default()))
    }

    fn builtin(name: &str) -> CliBackend {
        backend(name, builtin_backends().remove(name).unwrap())
    }

    fn request(session_id: &str, prompt: &str) -> ModelRequest {
        ModelRequest {
            session_key: "agent:main:main".into(),
            session_id: session_id.into(),
            system_prompt: Some("sys".into()),
            messages: Vec::new(),
            prompt: prompt.into(),
            tools: None,
            sandbox: None,
            timeout: Duration::from_secs(10),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn claude_first_turn_mints_session_and_injects_prompt() {
        let b = builtin("claude-cli");
        let inv = b.build_invocation("opus", Some("be terse"), "hi", None, None);
        let id = inv.session_id.clone().unwrap();
        assert_eq!(inv.program, "claude");
        assert_eq!(inv.args, vec![
            "-p",
            "--output-format",
            "json",
            "--session-id",
            id.as_str(),
            "--model",
            "opus",
            "--append-system-prompt",
            "be terse",
            "hi",
        ]);
    }

    #[test]
    fn claude_resume_uses_resume_args_without_system_prompt() {
        let b = builtin("claude-cli");
        let inv = b.build_invocation("", Some("be terse"), "again", Some("abc"), None);
        assert_eq!(inv.args, vec!["-p", "--output-format", "json", "--resume", "abc", "again"]);
        assert_eq!(inv.session_id.as_deref(), Some("abc"));
    }

    #[test]
    fn denied_tools_are_passed_under_the_cli_names() {
        let b = builtin("claude-cli");
        let allowed = vec!["read".to_string(), "process".to_string()];
        let inv = b.build_invocation("", None, "hi", None, Some(allowed.as_slice()));
        let at = inv.args.iter().position(|a| a == "--disallowedTools").unwrap();
        assert_eq!(inv.args[at + 1], "Write,Edit,Bash");
        assert_eq!(inv.args.last().map(String::as_str), Some("hi"));

        let everything: Vec<String> = KNOWN_TOOLS.iter().map(|t| t.to_string()).collect();
        let open = b.build_invocation("", None, "hi", None, Some(everything.as_slice()));
        assert!(!open.args.contains(&"--disallowedTools".to_string()));

        let codex = builtin("codex-cli").build_invocation("", None, "hi", None, Some(&[] as &[String]));
        assert!(!codex.args.iter().any(|a| a.contains("Bash")));
    }

    #[test]
    fn codex_only_passes_session_once_known() {
        let b = builtin("codex-cli");
        let first = b.build_invocation("gpt-5", Some("sys"), "go", None, None);
        assert!(first.session_id.is_none());
        assert_eq!(first.args[0], "exec");
        assert!(!first.args.contains(&"resume".to_string()));
        assert!(!first.args.contains(&"sys".to_string()));

        let next = b.build_invocation("gpt-5", None, "go", Some("th_1"), None);
        assert_eq!(&next.args[..3], &["exec", "resume", "th_1"]);
    }

    #[test]
    fn stdin_input_and_aliases() {
        let b = backend("custom", CliBackendConfig {
            command: "my-llm".into(),
            input: CliInputMode::Stdin,
            model_arg: Some("-m".into()),
            model_aliases: BTreeMap::from([("fast".into(), "my-llm-mini-2".into())]),
            session_mode: CliSessionMode::None,
            ..Default::default()
        });
        let inv = b.build_invocation("fast", None, "prompt text", Some("ignored"), None);
        assert_eq!(inv.args, vec!["-m", "my-llm-mini-2"]);
        assert_eq!(inv.stdin.as_deref(), Some("prompt text"));
        assert!(inv.session_id.is_none());
    }

    #[test]
    fn configured_template_overrides_builtin() {
        let configured = BTreeMap::from([("claude-cli".to_string(), CliBackendConfig {
            command: "/opt/claude".into(),
            ..Default::default()
        })]);
        let all = resolve_backends(&configured);
        assert_eq!(all["claude-cli"].command, "/opt/claude");
        assert_eq!(all["codex-cli"].command, "codex");
    }

    #[rstest]
    #[case(r#"{"result":"done","session_id":"s-1"}"#, "done", Some("s-1"))]
    #[case("log line\n{\"text\":\"hi\",\"sessionId\":\"s-2\"}", "hi", Some("s-2"))]
    #[case(r#"{"content":[{"type":"text","text":"a"},{"type":"text","text":"b"}]}"#, "ab", None)]
    fn json_output(#[case] stdout: &str, #[case] text: &str, #[case] session: Option<&str>) {
        let fields = strings(&["session_id", "sessionId"]);
        let parsed = parse_output(CliOutputMode::Json, stdout, &fields).unwrap();
        assert_eq!(parsed.text, text);
        assert_eq!(parsed.session_id.as_deref(), session);
    }

    #[test]
    fn jsonl_output_joins_text_and_takes_first_session() {
        let stdout = concat!(
            "{\"type\":\"thread.started\",\"thread_id\":\"th_9\"}\n",
            "{\"type\":\"item.completed\",\"item\":{\"type\":\"agent_message\",\"text\":\"one\"}}\n",
            "not json\n",
            "{\"type\":\"item.completed\",\"item\":{\"type\":\"agent_message\",\"text\":\"two\"}}\n",
            "{\"type\":\"turn.completed\"}\n",
        );
        let parsed = parse_output(CliOutputMode::Jsonl, stdout, &strings(&["thread_id"])).unwrap();
        assert_eq!(parsed.text, "one\ntwo");
        assert_eq!(parsed.session_id.as_deref(), Some("th_9"));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            parse_output(CliOutputMode::Json, "nope", &[]),
            Err(CliBackendError::Parse(_))
        ));
        let text = parse_output(CliOutputMode::Text, "  plain \n", &[]).unwrap();
        assert_eq!(text.text, "plain");
    }

    fn sh_backend(script: &str) -> CliBackend {
        backend("sh-cli", CliBackendConfig {
            command: "sh".into(),
            args: vec!["-c".into(), script.into(), "sh".into()],
            resume_args: Some(vec![
                "-c".into(),
                script.into(),
                "sh".into(),
                format!("resume={SESSION_PLACEHOLDER}"),
            ]),
            output: CliOutputMode::Json,
            session_mode: CliSessionMode::Existing,
            session_id_fields: strings(&["session_id"]),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn session_continuity_and_reset_on_recycle() {
        // Echo the first argument back so the test can see resume args.
        let b = sh_backend(r#"printf '{"result":"%s","session_id":"cli-1"}' "$1""#);
        let first = b.complete("", &request("s1", "hello")).await.unwrap();
        assert_eq!(first.text, "hello");
        assert_eq!(b.sessions.cli_session_id("sh-cli", "agent:main:main").as_deref(), Some("cli-1"));

        let second = b.complete("", &request("s1", "again")).await.unwrap();
        assert_eq!(second.text, "resume=cli-1");

        let recycled = b.complete("", &request("s2", "fresh")).await.unwrap();
        assert_eq!(recycled.text, "fresh");
    }

    #[tokio::test]
    async fn cli_sessions_survive_a_table_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"printf '{"result":"%s","session_id":"cli-1"}' "$1""#;
        let persistent = |cfg: CliBackendConfig| {
            CliBackend::new(
                "sh-cli".into(),
                cfg,
                Arc::new(CliSessionTable::persistent(dir.path())),
            )
        };
        let template = sh_backend(script).cfg;

        let first = persistent(template.clone());
        first.complete("", &request("s1", "hello")).await.unwrap();
        assert!(dir.path().join("agents/main").join(CLI_SESSIONS_FILE).is_file());

        // A restart or config rebuild starts from an empty in-memory table.
        let rebuilt = persistent(template.clone());
        let resumed = rebuilt.complete("", &request("s1", "again")).await.unwrap();
        assert_eq!(resumed.text, "resume=cli-1");

        rebuilt.sessions.forget("agent:main:main").await;
        let after_reset = persistent(template);
        let fresh = after_reset.complete("", &request("s1", "new")).await.unwrap();
        assert_eq!(fresh.text, "new");
    }

    #[tokio::test]
    async fn sandboxed_turns_run_inside_the_context() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("ctx");
        std::fs::create_dir_all(&workspace).unwrap();
        let runner = SandboxRunner::new(
            SandboxContext {
                scope_key: "agent:main:main".into(),
                backend: "host".into(),
                handle: workspace.display().to_string(),
                workspace: workspace.clone(),
                created_at: 0,
                last_used_at: 0,
            },
            Arc::new(HostBackend),
        );
        let b = backend("pwd-cli", CliBackendConfig {
            command: "sh".into(),
            args: vec!["-c".into(), "pwd".into()],
            output: CliOutputMode::Text,
            session_mode: CliSessionMode::None,
            ..Default::default()
        });

        let mut req = request("s1", "where");
        req.sandbox = Some(runner);
        let reply = b.complete("", &req).await.unwrap();
        assert_eq!(
            PathBuf::from(reply.text).canonicalize().unwrap(),
            workspace.canonicalize().unwrap()
        );

        let host = b.complete("", &request("s1", "where")).await.unwrap();
        assert_ne!(PathBuf::from(host.text), workspace);
    }

    #[test]
    fn only_well_formed_agent_keys_are_persisted() {
        assert_eq!(agent_of("agent:main:dm:u1"), Some("main"));
        assert_eq!(agent_of("agent::main"), None);
        assert_eq!(agent_of("agent:..:main"), None);
        assert_eq!(agent_of("bogus"), None);
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let b = sh_backend("echo 'rate limit exceeded' >&2; exit 3");
        let err = b.complete("", &request("s1", "x")).await.unwrap_err();
        match &err {
            CliBackendError::Exit { code, stderr, .. } => {
                assert_eq!(*code, 3);
                assert_eq!(stderr, "rate limit exceeded");
            },
            other => panic!("unexpected {other:?}"),
        }
        let pe = ProviderError::from(err);
        assert_eq!(pe.reason(), crate::auth_profiles::FailureReason::RateLimit);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let b = backend("ghost", CliBackendConfig {
            command: "clawgate-definitely-missing-binary".into(),
            ..Default::default()
        });
        let err = b.complete("", &request("s1", "x")).await.unwrap_err();
        assert!(matches!(err, CliBackendError::Spawn { .. }));
    }

    #[tokio::test]
    async fn one_process_per_session_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("running");
        // Fails if another invocation is already inside the critical section.
        let script = format!(
            "if [ -e '{m}' ]; then echo overlap >&2; exit 9; fi; touch '{m}'; sleep 0.2; rm '{m}'; printf '{{\"result\":\"ok\"}}'",
            m = marker.display()
        );
        let b = Arc::new(sh_backend(&script));
        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let b = Arc::clone(&b);
                tokio::spawn(async move { b.complete("", &request("s1", "x")).await })
            })
            .collect();
        for t in tasks {
            assert_eq!(t.await.unwrap().unwrap().text, "ok");
        }
    }
}
